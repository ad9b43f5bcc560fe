//! Entity and group lookup.

use super::{Entity, Group};
use crate::errors::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;

/// Source of identity records. A missing record is not an error.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>>;

    async fn groups_for_entity(&self, entity_id: &str) -> Result<Vec<Group>>;
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entities: DashMap<String, Entity>,
    groups: DashMap<String, (Group, HashSet<String>)>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_entity(&self, entity: Entity) {
        self.entities.insert(entity.id.clone(), entity);
    }

    /// Store a group with its member entity ids
    pub fn upsert_group<I, S>(&self, group: Group, members: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let members = members.into_iter().map(Into::into).collect();
        self.groups.insert(group.id.clone(), (group, members));
    }

    pub fn remove_entity(&self, entity_id: &str) -> bool {
        let removed = self.entities.remove(entity_id).is_some();
        for mut entry in self.groups.iter_mut() {
            entry.value_mut().1.remove(entity_id);
        }
        removed
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn entity(&self, entity_id: &str) -> Result<Option<Entity>> {
        Ok(self.entities.get(entity_id).map(|e| e.clone()))
    }

    async fn groups_for_entity(&self, entity_id: &str) -> Result<Vec<Group>> {
        if !self.entities.contains_key(entity_id) {
            return Ok(Vec::new());
        }
        let mut groups: Vec<Group> = self
            .groups
            .iter()
            .filter(|entry| entry.value().1.contains(entity_id))
            .map(|entry| entry.value().0.clone())
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }
}
