//! Connections opened by a backend, owned by that backend.
//!
//! Each producer keeps its own registry and clears it on close, so nothing
//! outlives the backend that created it.

use crate::errors::Result;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    connections: DashMap<String, Arc<C>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self { connections: DashMap::new() }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection registered under `name`, opening it with `open`
    /// when there is none
    pub fn create<F>(&self, name: &str, open: F) -> Result<Arc<C>>
    where
        F: FnOnce() -> Result<C>,
    {
        match self.connections.entry(name.to_string()) {
            Entry::Occupied(existing) => Ok(existing.get().clone()),
            Entry::Vacant(slot) => {
                let connection = Arc::new(open()?);
                debug!(connection = %name, "Registered connection");
                slot.insert(connection.clone());
                Ok(connection)
            }
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<C>> {
        self.connections.get(name).map(|c| c.clone())
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<C>> {
        self.connections.remove(name).map(|(_, c)| c)
    }

    /// Drop every connection, returning how many there were
    pub fn clear(&self) -> usize {
        let count = self.connections.len();
        self.connections.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WardenError;

    #[test]
    fn test_create_is_get_or_open() {
        let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
        let first = registry.create("primary", || Ok("conn-1".to_string())).unwrap();
        let second = registry.create("primary", || Ok("conn-2".to_string())).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_failed_open_registers_nothing() {
        let registry: ConnectionRegistry<String> = ConnectionRegistry::new();
        let result = registry.create("primary", || Err(WardenError::backend("refused")));
        assert!(result.is_err());
        assert!(registry.lookup("primary").is_none());
    }

    #[test]
    fn test_unregister_and_clear() {
        let registry: ConnectionRegistry<u32> = ConnectionRegistry::new();
        registry.create("a", || Ok(1)).unwrap();
        registry.create("b", || Ok(2)).unwrap();

        assert_eq!(registry.unregister("a").map(|c| *c), Some(1));
        assert!(registry.unregister("a").is_none());
        assert_eq!(registry.clear(), 1);
        assert!(registry.is_empty());
    }
}
