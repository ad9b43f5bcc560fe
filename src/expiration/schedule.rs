//! Wake schedule ordered by time.

use crate::lease::LeaseId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap};

/// At most one wake time per lease
#[derive(Debug, Default)]
pub struct Schedule {
    queue: BTreeSet<(DateTime<Utc>, LeaseId)>,
    wake_times: HashMap<LeaseId, DateTime<Utc>>,
}

impl Schedule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `id` at `at`, replacing any earlier entry
    pub fn insert(&mut self, id: LeaseId, at: DateTime<Utc>) {
        if let Some(previous) = self.wake_times.insert(id.clone(), at) {
            self.queue.remove(&(previous, id.clone()));
        }
        self.queue.insert((at, id));
    }

    pub fn remove(&mut self, id: &LeaseId) -> bool {
        match self.wake_times.remove(id) {
            Some(at) => self.queue.remove(&(at, id.clone())),
            None => false,
        }
    }

    /// Remove and return every lease due at or before `now`, earliest first
    pub fn take_due(&mut self, now: DateTime<Utc>) -> Vec<LeaseId> {
        let mut due = Vec::new();
        while let Some((at, _)) = self.queue.first() {
            if *at > now {
                break;
            }
            if let Some((_, id)) = self.queue.pop_first() {
                self.wake_times.remove(&id);
                due.push(id);
            }
        }
        due
    }

    pub fn wake_time(&self, id: &LeaseId) -> Option<DateTime<Utc>> {
        self.wake_times.get(id).copied()
    }

    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.queue.first().map(|(at, _)| *at)
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.wake_times.clear();
    }

    pub fn len(&self) -> usize {
        self.wake_times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wake_times.is_empty()
    }
}
