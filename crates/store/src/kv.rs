//! Untyped key/value storage interface.
//!
//! The whole kernel state is one flat string-to-string mapping. The
//! embedding database supplies the mapping and its transaction
//! boundary; everything above this trait is a typed projection.

use thiserror::Error;

/// Errors surfaced by the storage layer.
///
/// These are never swallowed: a failing store aborts the crank so the
/// embedding database can roll the transaction back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A key that must exist was absent.
    #[error("required key missing: {key}")]
    MissingKey {
        /// The absent key
        key: String,
    },

    /// A stored value failed to parse as its expected shape.
    #[error("corrupt value at {key}: {message}")]
    Corrupt {
        /// The key holding the bad value
        key: String,
        /// What was wrong with it
        message: String,
    },

    /// An operation addressed a queue that has been deleted.
    #[error("queue {name} has been deleted")]
    QueueDeleted {
        /// The queue's name
        name: String,
    },

    /// The backing database reported a failure.
    #[error("storage backend error: {message}")]
    Backend {
        /// Backend-specific description
        message: String,
    },
}

impl StoreError {
    /// Builds a `Corrupt` error for `key`.
    pub fn corrupt(key: impl Into<String>, message: impl Into<String>) -> Self {
        StoreError::Corrupt {
            key: key.into(),
            message: message.into(),
        }
    }
}

/// Result alias for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// A flat, ordered string-to-string store.
///
/// Keys iterate in lexical order via [`KVStore::get_next_key`]. All
/// mutations between two [`KVStore::commit`] calls belong to one crank
/// and must be applied atomically by the embedding database.
pub trait KVStore: Send + Sync {
    /// Reads the value at `key`, if any.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Reads the value at `key`, failing if it is absent.
    fn get_required(&self, key: &str) -> Result<String> {
        self.get(key)?.ok_or_else(|| StoreError::MissingKey {
            key: key.to_string(),
        })
    }

    /// Writes `value` at `key`, replacing any previous value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn delete(&self, key: &str) -> Result<()>;

    /// Returns the smallest key strictly greater than `key`.
    ///
    /// The argument does not need to be a present key; this is the seek
    /// primitive for prefix sweeps.
    fn get_next_key(&self, key: &str) -> Result<Option<String>>;

    /// Marks the current crank's mutations as a complete transaction.
    fn commit(&self) -> Result<()>;
}

/// Collects every key starting with `prefix`, in lexical order.
///
/// Keys sharing a prefix are contiguous in lexical order, so the sweep
/// seeks to the prefix and walks forward until the prefix no longer
/// matches.
pub fn keys_with_prefix(store: &dyn KVStore, prefix: &str) -> Result<Vec<String>> {
    first_keys_with_prefix(store, prefix, usize::MAX)
}

/// Collects at most `limit` keys starting with `prefix`, in lexical order.
pub fn first_keys_with_prefix(
    store: &dyn KVStore,
    prefix: &str,
    limit: usize,
) -> Result<Vec<String>> {
    let mut keys = Vec::new();
    if limit == 0 {
        return Ok(keys);
    }
    if store.get(prefix)?.is_some() {
        keys.push(prefix.to_string());
    }
    let mut cursor = prefix.to_string();
    while keys.len() < limit {
        match store.get_next_key(&cursor)? {
            Some(next) if next.starts_with(prefix) => {
                keys.push(next.clone());
                cursor = next;
            }
            _ => break,
        }
    }
    Ok(keys)
}
