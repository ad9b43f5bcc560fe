//! Physical key/value storage behind the lease store.
//!
//! The store treats this as an opaque, authenticated collaborator; encryption
//! at rest happens below this interface.

use crate::errors::{Result, WardenError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[async_trait]
pub trait Storage: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys starting with `prefix`, in order
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// Storage held in process memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    fail_writes: AtomicBool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every put and delete fail until switched off again
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(WardenError::storage("storage is read-only"));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.check_writable()?;
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_writable()?;
        self.entries.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        Ok(entries.range(prefix.to_string()..).map(|(k, _)| k).take_while(|k| k.starts_with(prefix)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_prefix_listing() {
        let storage = MemoryStorage::new();
        for key in ["lease/a/1", "lease/b/2", "leases", "other/x"] {
            storage.put(key, b"v".to_vec()).await.unwrap();
        }
        assert_eq!(storage.list("lease/").await.unwrap(), vec!["lease/a/1", "lease/b/2"]);
        assert_eq!(storage.list("").await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fail_writes() {
        let storage = MemoryStorage::new();
        storage.set_fail_writes(true);
        assert!(matches!(storage.put("k", vec![]).await, Err(WardenError::Storage { .. })));
        storage.set_fail_writes(false);
        storage.put("k", vec![1]).await.unwrap();
        storage.delete("k").await.unwrap();
        storage.delete("k").await.unwrap();
        assert!(storage.get("k").await.unwrap().is_none());
    }
}
