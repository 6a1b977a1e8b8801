//! # ocap-store
//!
//! Persistent state for the ocap kernel: an untyped ordered string KV
//! interface, an in-memory reference backend, and the typed projections
//! (stored values, counters, queues, and the kernel schema) the kernel
//! builds its state out of.

pub mod kernel_store;
pub mod kv;
pub mod memory;
pub mod queue;
pub mod values;

pub use kernel_store::KernelStore;
pub use kv::{first_keys_with_prefix, keys_with_prefix, KVStore, Result, StoreError};
pub use memory::MemoryKVStore;
pub use queue::StoredQueue;
pub use values::{inc_counter, read_counter, StoredCounter, StoredValue};
