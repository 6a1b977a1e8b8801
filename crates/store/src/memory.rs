//! In-memory reference backend.

use crate::kv::{KVStore, Result};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

/// `BTreeMap`-backed [`KVStore`].
///
/// The reference backend for tests and single-process embeddings. The
/// map itself is the committed state, so `commit` is a no-op; restart
/// determinism tests use [`MemoryKVStore::snapshot`] and
/// [`MemoryKVStore::restore`] to simulate a stop/start cycle.
#[derive(Debug, Default)]
pub struct MemoryKVStore {
    map: RwLock<BTreeMap<String, String>>,
}

impl MemoryKVStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of the entire mapping.
    pub fn snapshot(&self) -> BTreeMap<String, String> {
        self.map.read().clone()
    }

    /// Replaces the entire mapping.
    pub fn restore(&self, map: BTreeMap<String, String>) {
        *self.map.write() = map;
    }

    /// Number of keys currently present.
    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    /// True when no keys are present.
    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl KVStore for MemoryKVStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.map.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.map.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.map.write().remove(key);
        Ok(())
    }

    fn get_next_key(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .map
            .read()
            .range::<str, _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::{first_keys_with_prefix, keys_with_prefix};

    #[test]
    fn test_basic_operations() {
        let store = MemoryKVStore::new();
        assert!(store.get("a").unwrap().is_none());
        store.set("a", "1").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        store.set("a", "2").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("2"));
        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        // Deleting an absent key is fine.
        store.delete("a").unwrap();
    }

    #[test]
    fn test_get_required() {
        let store = MemoryKVStore::new();
        store.set("present", "x").unwrap();
        assert_eq!(store.get_required("present").unwrap(), "x");
        assert!(store.get_required("absent").is_err());
    }

    #[test]
    fn test_next_key_is_strictly_greater() {
        let store = MemoryKVStore::new();
        for key in ["a", "b", "b.1", "c"] {
            store.set(key, "").unwrap();
        }
        assert_eq!(store.get_next_key("").unwrap().as_deref(), Some("a"));
        assert_eq!(store.get_next_key("a").unwrap().as_deref(), Some("b"));
        assert_eq!(store.get_next_key("b").unwrap().as_deref(), Some("b.1"));
        assert_eq!(store.get_next_key("b.0").unwrap().as_deref(), Some("b.1"));
        assert!(store.get_next_key("c").unwrap().is_none());
    }

    #[test]
    fn test_prefix_sweep() {
        let store = MemoryKVStore::new();
        for key in ["v1.vs.a", "v1.vs.b", "v1.vs", "v10.vs.a", "v2.vs.a"] {
            store.set(key, "").unwrap();
        }
        assert_eq!(
            keys_with_prefix(&store, "v1.vs").unwrap(),
            vec!["v1.vs", "v1.vs.a", "v1.vs.b"]
        );
        assert_eq!(
            first_keys_with_prefix(&store, "v1.vs", 2).unwrap(),
            vec!["v1.vs", "v1.vs.a"]
        );
        assert!(keys_with_prefix(&store, "v3.").unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let store = MemoryKVStore::new();
        store.set("k", "v").unwrap();
        let snap = store.snapshot();
        store.set("k", "changed").unwrap();
        store.set("extra", "x").unwrap();
        store.restore(snap);
        assert_eq!(store.get("k").unwrap().as_deref(), Some("v"));
        assert!(store.get("extra").unwrap().is_none());
    }
}
