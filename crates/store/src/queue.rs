//! Persistent FIFO queues.
//!
//! A queue named `n` keeps its bounds at `queue.n.head` / `queue.n.tail`
//! and its entries at `queue.n.<pos>`. `head` is the next position to
//! write, `tail` the next to read; `head - tail` is the length, and
//! positions between the two are contiguous.

use crate::kv::{KVStore, Result, StoreError};

/// Handle to one persistent queue.
#[derive(Debug, Clone)]
pub struct StoredQueue {
    name: String,
}

impl StoredQueue {
    /// Opens the queue named `name`, creating empty bounds if it has
    /// never existed.
    pub fn open(store: &dyn KVStore, name: impl Into<String>) -> Result<Self> {
        let queue = StoredQueue { name: name.into() };
        if store.get(&queue.head_key())?.is_none() {
            store.set(&queue.head_key(), "1")?;
            store.set(&queue.tail_key(), "1")?;
        }
        Ok(queue)
    }

    /// Handle to an existing queue without touching the store.
    ///
    /// Used when the caller knows the queue was opened earlier (or wants
    /// enqueue to fail on a deleted queue).
    pub fn attach(name: impl Into<String>) -> Self {
        StoredQueue { name: name.into() }
    }

    /// The queue's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn head_key(&self) -> String {
        format!("queue.{}.head", self.name)
    }

    fn tail_key(&self) -> String {
        format!("queue.{}.tail", self.name)
    }

    fn entry_key(&self, pos: u64) -> String {
        format!("queue.{}.{}", self.name, pos)
    }

    fn read_bound(&self, store: &dyn KVStore, key: &str) -> Result<Option<u64>> {
        match store.get(key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|_| StoreError::corrupt(key, format!("not a queue bound: {text:?}"))),
        }
    }

    /// Appends `item` at the head. Fails if the queue has been deleted.
    pub fn enqueue(&self, store: &dyn KVStore, item: &str) -> Result<()> {
        let head = self
            .read_bound(store, &self.head_key())?
            .ok_or_else(|| StoreError::QueueDeleted {
                name: self.name.clone(),
            })?;
        store.set(&self.entry_key(head), item)?;
        store.set(&self.head_key(), &(head + 1).to_string())?;
        Ok(())
    }

    /// Removes and returns the item at the tail, if any.
    pub fn dequeue(&self, store: &dyn KVStore) -> Result<Option<String>> {
        let head = match self.read_bound(store, &self.head_key())? {
            Some(head) => head,
            None => return Ok(None),
        };
        let tail = self
            .read_bound(store, &self.tail_key())?
            .ok_or_else(|| StoreError::corrupt(self.tail_key(), "tail missing"))?;
        if tail >= head {
            return Ok(None);
        }
        let key = self.entry_key(tail);
        let item = store.get_required(&key)?;
        store.delete(&key)?;
        store.set(&self.tail_key(), &(tail + 1).to_string())?;
        Ok(Some(item))
    }

    /// Current number of queued items. A deleted queue has length 0.
    pub fn length(&self, store: &dyn KVStore) -> Result<u64> {
        let head = match self.read_bound(store, &self.head_key())? {
            Some(head) => head,
            None => return Ok(0),
        };
        let tail = self
            .read_bound(store, &self.tail_key())?
            .ok_or_else(|| StoreError::corrupt(self.tail_key(), "tail missing"))?;
        Ok(head.saturating_sub(tail))
    }

    /// Deletes the queue: all remaining entries and both bounds.
    ///
    /// After deletion, `enqueue` fails until the queue is re-opened.
    pub fn delete(&self, store: &dyn KVStore) -> Result<()> {
        if let (Some(head), Some(tail)) = (
            self.read_bound(store, &self.head_key())?,
            self.read_bound(store, &self.tail_key())?,
        ) {
            for pos in tail..head {
                store.delete(&self.entry_key(pos))?;
            }
        }
        store.delete(&self.head_key())?;
        store.delete(&self.tail_key())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKVStore;

    #[test]
    fn test_fifo_order() {
        let store = MemoryKVStore::new();
        let queue = StoredQueue::open(&store, "run").unwrap();
        queue.enqueue(&store, "a").unwrap();
        queue.enqueue(&store, "b").unwrap();
        queue.enqueue(&store, "c").unwrap();
        assert_eq!(queue.length(&store).unwrap(), 3);
        assert_eq!(queue.dequeue(&store).unwrap().as_deref(), Some("a"));
        assert_eq!(queue.dequeue(&store).unwrap().as_deref(), Some("b"));
        queue.enqueue(&store, "d").unwrap();
        assert_eq!(queue.dequeue(&store).unwrap().as_deref(), Some("c"));
        assert_eq!(queue.dequeue(&store).unwrap().as_deref(), Some("d"));
        assert!(queue.dequeue(&store).unwrap().is_none());
        assert_eq!(queue.length(&store).unwrap(), 0);
    }

    #[test]
    fn test_length_matches_bounds() {
        let store = MemoryKVStore::new();
        let queue = StoredQueue::open(&store, "q").unwrap();
        for i in 0..5 {
            queue.enqueue(&store, &i.to_string()).unwrap();
        }
        assert_eq!(store.get("queue.q.head").unwrap().as_deref(), Some("6"));
        assert_eq!(store.get("queue.q.tail").unwrap().as_deref(), Some("1"));
        assert_eq!(queue.length(&store).unwrap(), 5);
    }

    #[test]
    fn test_reopen_preserves_entries() {
        let store = MemoryKVStore::new();
        let queue = StoredQueue::open(&store, "q").unwrap();
        queue.enqueue(&store, "persisted").unwrap();
        // A fresh handle over the same store sees the same queue.
        let reopened = StoredQueue::open(&store, "q").unwrap();
        assert_eq!(reopened.length(&store).unwrap(), 1);
        assert_eq!(
            reopened.dequeue(&store).unwrap().as_deref(),
            Some("persisted")
        );
    }

    #[test]
    fn test_enqueue_into_deleted_queue_fails() {
        let store = MemoryKVStore::new();
        let queue = StoredQueue::open(&store, "q").unwrap();
        queue.enqueue(&store, "x").unwrap();
        queue.delete(&store).unwrap();
        assert!(store.get("queue.q.1").unwrap().is_none());
        assert!(matches!(
            queue.enqueue(&store, "y"),
            Err(StoreError::QueueDeleted { .. })
        ));
        assert_eq!(queue.length(&store).unwrap(), 0);
        assert!(queue.dequeue(&store).unwrap().is_none());
    }
}
