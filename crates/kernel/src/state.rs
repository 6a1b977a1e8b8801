// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// state.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! Mutable kernel state: the persistent store plus the crank-scoped
//! RAM bookkeeping (maybe-free set, promise waiters, pending exits).
//!
//! Reference-count conventions, applied symmetrically everywhere:
//!
//! * A promise's single refcount counts: each c-list entry naming it,
//!   each queue item holding it (target, result or arg slot), each
//!   message queued on it, each subscriber, each resolution-value slot
//!   and each pin.
//! * An object's reachable count counts: importing c-list entries whose
//!   reachable flag is set, queue items holding it, and pins. Its
//!   recognizable count additionally counts importing entries whose
//!   flag is clear. The owner's own c-list entry counts nothing.

use ocap_core::{KPromiseId, KRef, Resolution, VatId};
use ocap_store::{KernelStore, StoreError};
use std::collections::{BTreeSet, HashMap};
use tokio::sync::oneshot;
use tracing::debug;

/// The kernel's entire mutable state.
pub struct KernelState {
    /// Typed views over the persistent KV mapping.
    pub(crate) store: KernelStore,
    /// Krefs whose refcounts changed during the current crank.
    pub(crate) maybe_free: BTreeSet<KRef>,
    /// Kernel-internal waiters fired synchronously at resolution.
    pub(crate) waiters: HashMap<KPromiseId, Vec<oneshot::Sender<Resolution>>>,
    /// Vats that asked to exit during the current delivery.
    pub(crate) pending_exits: Vec<VatId>,
}

impl KernelState {
    /// Wraps an opened kernel store.
    pub fn new(store: KernelStore) -> Self {
        KernelState {
            store,
            maybe_free: BTreeSet::new(),
            waiters: HashMap::new(),
            pending_exits: Vec::new(),
        }
    }

    /// The underlying typed store.
    pub fn store(&mut self) -> &mut KernelStore {
        &mut self.store
    }

    /// Remembers that `kref`'s counts changed and it may be free.
    pub(crate) fn note_maybe_free(&mut self, kref: KRef) {
        self.maybe_free.insert(kref);
    }

    /// Takes one ref on `kref` for the queue-slot class (an item on a
    /// queue names it).
    pub(crate) fn inc_slot_ref(&mut self, kref: KRef) -> Result<(), StoreError> {
        match kref {
            KRef::Promise(kpid) => {
                self.store.inc_promise_refcount(kpid)?;
            }
            KRef::Object(_) => {
                self.adjust_object_counts(kref, 1, 1)?;
            }
        }
        Ok(())
    }

    /// Releases a queue-slot ref on `kref`.
    pub(crate) fn dec_slot_ref(&mut self, kref: KRef) -> Result<(), StoreError> {
        match kref {
            KRef::Promise(kpid) => {
                self.store.dec_promise_refcount(kpid)?;
            }
            KRef::Object(_) => {
                self.adjust_object_counts(kref, -1, -1)?;
            }
        }
        self.note_maybe_free(kref);
        Ok(())
    }

    /// Applies a signed delta to an object's counts.
    ///
    /// Underflow is state corruption and kills the crank. A missing
    /// object record is tolerated on decrements (the object may already
    /// have been deleted by cascade) and fatal on increments.
    pub(crate) fn adjust_object_counts(
        &mut self,
        kref: KRef,
        d_reachable: i64,
        d_recognizable: i64,
    ) -> Result<(), StoreError> {
        let koid = match kref.as_object() {
            Some(koid) => koid,
            None => return Ok(()),
        };
        let counts = match self.store.object_refcounts(koid)? {
            Some(counts) => counts,
            None if d_reachable <= 0 && d_recognizable <= 0 => return Ok(()),
            None => {
                return Err(StoreError::corrupt(
                    format!("{koid}.refCount"),
                    "incrementing counts of a deleted object",
                ))
            }
        };
        let apply = |count: u64, delta: i64| -> Result<u64, StoreError> {
            if delta >= 0 {
                Ok(count + delta as u64)
            } else {
                count.checked_sub((-delta) as u64).ok_or_else(|| {
                    StoreError::corrupt(format!("{koid}.refCount"), "refcount underflow")
                })
            }
        };
        let next = (
            apply(counts.0, d_reachable)?,
            apply(counts.1, d_recognizable)?,
        );
        debug_assert!(next.0 <= next.1, "reachable must not exceed recognizable");
        self.store.set_object_refcounts(koid, next)?;
        if d_reachable < 0 || d_recognizable < 0 {
            self.note_maybe_free(kref);
        }
        Ok(())
    }

    /// Registers a kernel-internal waiter for `kpid`.
    pub(crate) fn add_waiter(&mut self, kpid: KPromiseId, sender: oneshot::Sender<Resolution>) {
        self.waiters.entry(kpid).or_default().push(sender);
    }

    /// Fires every waiter registered for `kpid`, synchronously.
    pub(crate) fn fire_waiters(&mut self, kpid: KPromiseId, resolution: &Resolution) {
        if let Some(waiters) = self.waiters.remove(&kpid) {
            debug!(%kpid, count = waiters.len(), "firing kernel waiters");
            for waiter in waiters {
                // A dropped receiver just means nobody is listening.
                let _ = waiter.send(resolution.clone());
            }
        }
    }

    /// Drops every registered waiter, rejecting their receivers.
    pub(crate) fn drop_all_waiters(&mut self) {
        self.waiters.clear();
    }
}
