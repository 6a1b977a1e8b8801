//! Single-key typed projections: stored values and counters.

use crate::kv::{KVStore, Result, StoreError};

/// One store key with an optional read-through cache.
///
/// A cached value serves reads from memory after the first load until
/// [`StoredValue::invalidate`] is called; a raw value re-reads the
/// store on every access. Writes go through to the store either way.
#[derive(Debug)]
pub struct StoredValue {
    key: String,
    cached: bool,
    // Outer None: nothing loaded. Inner Option: key present or absent.
    cache: Option<Option<String>>,
}

impl StoredValue {
    /// Opens a cached value at `key`, installing `default` if the key
    /// is absent.
    pub fn cached(store: &dyn KVStore, key: impl Into<String>, default: Option<&str>) -> Result<Self> {
        Self::open(store, key.into(), default, true)
    }

    /// Opens a raw (uncached) value at `key`, installing `default` if
    /// the key is absent.
    pub fn raw(store: &dyn KVStore, key: impl Into<String>, default: Option<&str>) -> Result<Self> {
        Self::open(store, key.into(), default, false)
    }

    fn open(store: &dyn KVStore, key: String, default: Option<&str>, cached: bool) -> Result<Self> {
        if let Some(default) = default {
            if store.get(&key)?.is_none() {
                store.set(&key, default)?;
            }
        }
        Ok(StoredValue {
            key,
            cached,
            cache: None,
        })
    }

    /// The key this value lives at.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Reads the value.
    pub fn get(&mut self, store: &dyn KVStore) -> Result<Option<String>> {
        if self.cached {
            if let Some(known) = &self.cache {
                return Ok(known.clone());
            }
        }
        let value = store.get(&self.key)?;
        if self.cached {
            self.cache = Some(value.clone());
        }
        Ok(value)
    }

    /// Reads the value, failing if the key is absent.
    pub fn get_required(&mut self, store: &dyn KVStore) -> Result<String> {
        self.get(store)?.ok_or_else(|| StoreError::MissingKey {
            key: self.key.clone(),
        })
    }

    /// Writes the value.
    pub fn set(&mut self, store: &dyn KVStore, value: &str) -> Result<()> {
        store.set(&self.key, value)?;
        if self.cached {
            self.cache = Some(Some(value.to_string()));
        }
        Ok(())
    }

    /// Deletes the key.
    pub fn delete(&mut self, store: &dyn KVStore) -> Result<()> {
        store.delete(&self.key)?;
        if self.cached {
            self.cache = Some(None);
        }
        Ok(())
    }

    /// Drops any cached copy so the next read hits the store.
    pub fn invalidate(&mut self) {
        self.cache = None;
    }
}

/// A monotonically non-decreasing integer stored as its decimal string.
#[derive(Debug)]
pub struct StoredCounter {
    value: StoredValue,
}

impl StoredCounter {
    /// Opens the counter at `key`, installing `initial` if absent.
    pub fn open(store: &dyn KVStore, key: impl Into<String>, initial: u64) -> Result<Self> {
        let value = StoredValue::cached(store, key, Some(&initial.to_string()))?;
        Ok(StoredCounter { value })
    }

    /// Reads the current counter value.
    pub fn get(&mut self, store: &dyn KVStore) -> Result<u64> {
        let text = self.value.get_required(store)?;
        text.parse()
            .map_err(|_| StoreError::corrupt(self.value.key(), format!("not a counter: {text:?}")))
    }

    /// Increments the counter and returns the prior value.
    pub fn inc(&mut self, store: &dyn KVStore) -> Result<u64> {
        let prior = self.get(store)?;
        self.value.set(store, &(prior + 1).to_string())?;
        Ok(prior)
    }
}

/// Reads a decimal counter directly from a key, without a handle.
pub fn read_counter(store: &dyn KVStore, key: &str) -> Result<u64> {
    let text = store.get_required(key)?;
    text.parse()
        .map_err(|_| StoreError::corrupt(key, format!("not a counter: {text:?}")))
}

/// Increments a decimal counter at `key`, installing `initial` first if
/// the key is absent; returns the prior value.
pub fn inc_counter(store: &dyn KVStore, key: &str, initial: u64) -> Result<u64> {
    let prior = match store.get(key)? {
        Some(text) => text
            .parse()
            .map_err(|_| StoreError::corrupt(key, format!("not a counter: {text:?}")))?,
        None => initial,
    };
    store.set(key, &(prior + 1).to_string())?;
    Ok(prior)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKVStore;

    #[test]
    fn test_default_installed_only_when_absent() {
        let store = MemoryKVStore::new();
        store.set("k", "kept").unwrap();
        let mut existing = StoredValue::cached(&store, "k", Some("default")).unwrap();
        assert_eq!(existing.get(&store).unwrap().as_deref(), Some("kept"));
        let mut fresh = StoredValue::cached(&store, "k2", Some("default")).unwrap();
        assert_eq!(fresh.get(&store).unwrap().as_deref(), Some("default"));
    }

    #[test]
    fn test_cached_value_serves_reads_until_invalidated() {
        let store = MemoryKVStore::new();
        let mut value = StoredValue::cached(&store, "k", Some("a")).unwrap();
        assert_eq!(value.get(&store).unwrap().as_deref(), Some("a"));
        // Out-of-band write is invisible until invalidation.
        store.set("k", "b").unwrap();
        assert_eq!(value.get(&store).unwrap().as_deref(), Some("a"));
        value.invalidate();
        assert_eq!(value.get(&store).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_raw_value_always_rereads() {
        let store = MemoryKVStore::new();
        let mut value = StoredValue::raw(&store, "k", Some("a")).unwrap();
        assert_eq!(value.get(&store).unwrap().as_deref(), Some("a"));
        store.set("k", "b").unwrap();
        assert_eq!(value.get(&store).unwrap().as_deref(), Some("b"));
    }

    #[test]
    fn test_counter_inc_returns_prior() {
        let store = MemoryKVStore::new();
        let mut counter = StoredCounter::open(&store, "nextObjectId", 1).unwrap();
        assert_eq!(counter.inc(&store).unwrap(), 1);
        assert_eq!(counter.inc(&store).unwrap(), 2);
        assert_eq!(counter.get(&store).unwrap(), 3);
        assert_eq!(store.get("nextObjectId").unwrap().as_deref(), Some("3"));
    }

    #[test]
    fn test_bare_counter_helpers() {
        let store = MemoryKVStore::new();
        assert_eq!(inc_counter(&store, "e.nextObjectId.v1", 1).unwrap(), 1);
        assert_eq!(inc_counter(&store, "e.nextObjectId.v1", 1).unwrap(), 2);
        assert_eq!(read_counter(&store, "e.nextObjectId.v1").unwrap(), 3);
    }
}
