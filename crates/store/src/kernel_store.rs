// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// kernel_store.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! Typed access to the kernel's persistent state.
//!
//! One [`KernelStore`] owns the flat KV mapping and exposes each logical
//! table of the schema: allocators, object and promise records, c-list
//! entries, GC bookkeeping sets, vat configs and the per-vat substores.
//! The crank loop is the only writer.

use crate::kv::{first_keys_with_prefix, keys_with_prefix, KVStore, Result, StoreError};
use crate::queue::StoredQueue;
use crate::values::{inc_counter, StoredCounter, StoredValue};
use ocap_core::{
    CapData, EndpointId, ERef, GcAction, KObjectId, KPromiseId, KRef, Message, PromiseState,
    RemoteId, RunQueueItem, VatId,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

/// Name of the main run queue.
const RUN_QUEUE: &str = "run";

/// Prefix byte marking a reachable c-list entry.
const REACHABLE: u8 = b'R';
/// Prefix byte marking an unreachable c-list entry.
const UNREACHABLE: u8 = b'_';

/// Typed views over the kernel's flat KV store.
pub struct KernelStore {
    kv: Arc<dyn KVStore>,
    run_queue: StoredQueue,
    next_vat_id: StoredCounter,
    next_remote_id: StoredCounter,
    next_object_id: StoredCounter,
    next_promise_id: StoredCounter,
    gc_actions: StoredValue,
    reap_queue: StoredValue,
    terminated_vats: StoredValue,
    pinned_objects: StoredValue,
}

impl KernelStore {
    /// Opens the kernel state in `kv`, installing first-start defaults
    /// (allocation counters at 1, empty queues and sets) for any table
    /// that has never existed.
    pub fn open(kv: Arc<dyn KVStore>) -> Result<Self> {
        let run_queue = StoredQueue::open(kv.as_ref(), RUN_QUEUE)?;
        let next_vat_id = StoredCounter::open(kv.as_ref(), "nextVatId", 1)?;
        let next_remote_id = StoredCounter::open(kv.as_ref(), "nextRemoteId", 1)?;
        let next_object_id = StoredCounter::open(kv.as_ref(), "nextObjectId", 1)?;
        let next_promise_id = StoredCounter::open(kv.as_ref(), "nextPromiseId", 1)?;
        let gc_actions = StoredValue::cached(kv.as_ref(), "gcActions", Some("[]"))?;
        let reap_queue = StoredValue::cached(kv.as_ref(), "reapQueue", Some("[]"))?;
        let terminated_vats = StoredValue::cached(kv.as_ref(), "terminatedVats", Some("[]"))?;
        let pinned_objects = StoredValue::cached(kv.as_ref(), "pinnedObjects", Some(""))?;
        Ok(KernelStore {
            kv,
            run_queue,
            next_vat_id,
            next_remote_id,
            next_object_id,
            next_promise_id,
            gc_actions,
            reap_queue,
            terminated_vats,
            pinned_objects,
        })
    }

    /// Raw access to the underlying mapping.
    pub fn kv(&self) -> &dyn KVStore {
        self.kv.as_ref()
    }

    /// Commits the current crank's mutations.
    pub fn commit(&self) -> Result<()> {
        self.kv.commit()
    }

    /// Administrative reset: wipes every key and reinstalls first-start
    /// defaults.
    pub fn reset(&mut self) -> Result<()> {
        let mut cursor = String::new();
        while let Some(key) = self.kv.get_next_key(&cursor)? {
            self.kv.delete(&key)?;
            cursor = key;
        }
        self.run_queue = StoredQueue::open(self.kv.as_ref(), RUN_QUEUE)?;
        self.next_vat_id = StoredCounter::open(self.kv.as_ref(), "nextVatId", 1)?;
        self.next_remote_id = StoredCounter::open(self.kv.as_ref(), "nextRemoteId", 1)?;
        self.next_object_id = StoredCounter::open(self.kv.as_ref(), "nextObjectId", 1)?;
        self.next_promise_id = StoredCounter::open(self.kv.as_ref(), "nextPromiseId", 1)?;
        self.gc_actions = StoredValue::cached(self.kv.as_ref(), "gcActions", Some("[]"))?;
        self.reap_queue = StoredValue::cached(self.kv.as_ref(), "reapQueue", Some("[]"))?;
        self.terminated_vats = StoredValue::cached(self.kv.as_ref(), "terminatedVats", Some("[]"))?;
        self.pinned_objects = StoredValue::cached(self.kv.as_ref(), "pinnedObjects", Some(""))?;
        Ok(())
    }

    // === run queue ===

    /// Appends one work item to the run queue.
    pub fn run_enqueue(&mut self, item: &RunQueueItem) -> Result<()> {
        let json = serde_json::to_string(item)
            .map_err(|e| StoreError::corrupt("queue.run", e.to_string()))?;
        debug!(item = %json, "run queue enqueue");
        self.run_queue.enqueue(self.kv.as_ref(), &json)
    }

    /// Removes and returns the next work item, if any.
    pub fn run_dequeue(&mut self) -> Result<Option<RunQueueItem>> {
        match self.run_queue.dequeue(self.kv.as_ref())? {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| StoreError::corrupt("queue.run", e.to_string())),
        }
    }

    /// Number of items waiting on the run queue.
    pub fn run_queue_length(&mut self) -> Result<u64> {
        self.run_queue.length(self.kv.as_ref())
    }

    // === allocators ===

    /// Allocates the next vat id.
    pub fn alloc_vat_id(&mut self) -> Result<VatId> {
        Ok(VatId::new(self.next_vat_id.inc(self.kv.as_ref())?))
    }

    /// Allocates the next remote id.
    pub fn alloc_remote_id(&mut self) -> Result<RemoteId> {
        Ok(RemoteId::new(self.next_remote_id.inc(self.kv.as_ref())?))
    }

    /// Allocates the next kernel object id.
    pub fn alloc_object_id(&mut self) -> Result<KObjectId> {
        Ok(KObjectId::new(self.next_object_id.inc(self.kv.as_ref())?))
    }

    /// Allocates the next kernel promise id.
    pub fn alloc_promise_id(&mut self) -> Result<KPromiseId> {
        Ok(KPromiseId::new(self.next_promise_id.inc(self.kv.as_ref())?))
    }

    /// Allocates the next imported-object index for `endpoint`.
    pub fn alloc_endpoint_object_index(&mut self, endpoint: EndpointId) -> Result<u64> {
        inc_counter(self.kv.as_ref(), &format!("e.nextObjectId.{endpoint}"), 1)
    }

    /// Allocates the next imported-promise index for `endpoint`.
    pub fn alloc_endpoint_promise_index(&mut self, endpoint: EndpointId) -> Result<u64> {
        inc_counter(self.kv.as_ref(), &format!("e.nextPromiseId.{endpoint}"), 1)
    }

    // === kernel objects ===

    /// Creates a kernel object owned by `owner`, with zero refcounts.
    pub fn add_object(&mut self, owner: EndpointId) -> Result<KObjectId> {
        let koid = self.alloc_object_id()?;
        self.kv.set(&format!("{koid}.owner"), &owner.to_string())?;
        self.kv.set(&format!("{koid}.refCount"), "0,0")?;
        Ok(koid)
    }

    /// Owner endpoint of `koid`, if the object exists.
    pub fn object_owner(&self, koid: KObjectId) -> Result<Option<EndpointId>> {
        let key = format!("{koid}.owner");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// The `(reachable, recognizable)` counts of `koid`, if it exists.
    pub fn object_refcounts(&self, koid: KObjectId) -> Result<Option<(u64, u64)>> {
        let key = format!("{koid}.refCount");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => {
                let (reachable, recognizable) = text
                    .split_once(',')
                    .ok_or_else(|| StoreError::corrupt(&key, format!("bad refcount {text:?}")))?;
                let reachable = reachable
                    .parse()
                    .map_err(|_| StoreError::corrupt(&key, format!("bad refcount {text:?}")))?;
                let recognizable = recognizable
                    .parse()
                    .map_err(|_| StoreError::corrupt(&key, format!("bad refcount {text:?}")))?;
                Ok(Some((reachable, recognizable)))
            }
        }
    }

    /// Writes the `(reachable, recognizable)` counts of `koid`.
    pub fn set_object_refcounts(&mut self, koid: KObjectId, counts: (u64, u64)) -> Result<()> {
        self.kv.set(
            &format!("{koid}.refCount"),
            &format!("{},{}", counts.0, counts.1),
        )
    }

    /// Deletes the object record for `koid`.
    pub fn delete_object(&mut self, koid: KObjectId) -> Result<()> {
        debug!(%koid, "deleting kernel object");
        self.kv.delete(&format!("{koid}.owner"))?;
        self.kv.delete(&format!("{koid}.refCount"))
    }

    // === kernel promises ===

    /// Creates an unresolved kernel promise with `decider`, zero
    /// refcount, no subscribers and an empty message queue.
    pub fn add_promise(&mut self, decider: Option<EndpointId>) -> Result<KPromiseId> {
        let kpid = self.alloc_promise_id()?;
        self.kv.set(&format!("{kpid}.state"), "unresolved")?;
        self.kv.set(&format!("{kpid}.refCount"), "0")?;
        self.kv.set(&format!("{kpid}.subscribers"), "[]")?;
        if let Some(decider) = decider {
            self.kv
                .set(&format!("{kpid}.decider"), &decider.to_string())?;
        }
        StoredQueue::open(self.kv.as_ref(), kpid.to_string())?;
        Ok(kpid)
    }

    /// State of `kpid`, if the promise exists.
    pub fn promise_state(&self, kpid: KPromiseId) -> Result<Option<PromiseState>> {
        let key = format!("{kpid}.state");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Decider of `kpid`, if one is set.
    pub fn promise_decider(&self, kpid: KPromiseId) -> Result<Option<EndpointId>> {
        let key = format!("{kpid}.decider");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Sets or clears the decider of `kpid`.
    pub fn set_promise_decider(&mut self, kpid: KPromiseId, decider: Option<EndpointId>) -> Result<()> {
        let key = format!("{kpid}.decider");
        match decider {
            Some(decider) => self.kv.set(&key, &decider.to_string()),
            None => self.kv.delete(&key),
        }
    }

    /// Subscribers of `kpid`, in stored (string-sorted) order.
    pub fn promise_subscribers(&self, kpid: KPromiseId) -> Result<Vec<EndpointId>> {
        let key = format!("{kpid}.subscribers");
        match self.kv.get(&key)? {
            None => Ok(Vec::new()),
            Some(json) => serde_json::from_str(&json)
                .map_err(|e: serde_json::Error| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Adds `endpoint` to the subscribers of `kpid`.
    ///
    /// Returns false when the endpoint was already subscribed.
    pub fn add_promise_subscriber(
        &mut self,
        kpid: KPromiseId,
        endpoint: EndpointId,
    ) -> Result<bool> {
        let mut subscribers = self.promise_subscribers(kpid)?;
        if subscribers.contains(&endpoint) {
            return Ok(false);
        }
        subscribers.push(endpoint);
        subscribers.sort_by_key(|s| s.to_string());
        let json = serde_json::to_string(&subscribers)
            .map_err(|e| StoreError::corrupt(format!("{kpid}.subscribers"), e.to_string()))?;
        self.kv.set(&format!("{kpid}.subscribers"), &json)?;
        Ok(true)
    }

    /// Resolution value of `kpid`, present only once resolved.
    pub fn promise_value(&self, kpid: KPromiseId) -> Result<Option<CapData>> {
        let key = format!("{kpid}.value");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e: serde_json::Error| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Transitions `kpid` to its terminal state, clearing decider and
    /// subscribers and writing the value.
    pub fn mark_promise_resolved(
        &mut self,
        kpid: KPromiseId,
        rejected: bool,
        value: &CapData,
    ) -> Result<()> {
        let state = if rejected { "rejected" } else { "fulfilled" };
        self.kv.set(&format!("{kpid}.state"), state)?;
        let json = serde_json::to_string(value)
            .map_err(|e| StoreError::corrupt(format!("{kpid}.value"), e.to_string()))?;
        self.kv.set(&format!("{kpid}.value"), &json)?;
        self.kv.delete(&format!("{kpid}.decider"))?;
        self.kv.delete(&format!("{kpid}.subscribers"))
    }

    /// Current refcount of `kpid`.
    pub fn promise_refcount(&self, kpid: KPromiseId) -> Result<u64> {
        let key = format!("{kpid}.refCount");
        let text = self.kv.get_required(&key)?;
        text.parse()
            .map_err(|_| StoreError::corrupt(key, format!("bad refcount {text:?}")))
    }

    /// Increments the refcount of `kpid`, returning the new value.
    pub fn inc_promise_refcount(&mut self, kpid: KPromiseId) -> Result<u64> {
        let count = self.promise_refcount(kpid)? + 1;
        self.kv
            .set(&format!("{kpid}.refCount"), &count.to_string())?;
        Ok(count)
    }

    /// Decrements the refcount of `kpid`, returning the new value.
    pub fn dec_promise_refcount(&mut self, kpid: KPromiseId) -> Result<u64> {
        let prior = self.promise_refcount(kpid)?;
        if prior == 0 {
            return Err(StoreError::corrupt(
                format!("{kpid}.refCount"),
                "refcount underflow",
            ));
        }
        let count = prior - 1;
        self.kv
            .set(&format!("{kpid}.refCount"), &count.to_string())?;
        Ok(count)
    }

    /// Appends a pipelined message to the promise's queue.
    pub fn enqueue_promise_message(&mut self, kpid: KPromiseId, message: &Message) -> Result<()> {
        let queue = StoredQueue::attach(kpid.to_string());
        let json = serde_json::to_string(message)
            .map_err(|e| StoreError::corrupt(format!("queue.{kpid}"), e.to_string()))?;
        queue.enqueue(self.kv.as_ref(), &json)
    }

    /// Drains every queued message of `kpid`, in FIFO order.
    pub fn drain_promise_messages(&mut self, kpid: KPromiseId) -> Result<Vec<Message>> {
        let queue = StoredQueue::attach(kpid.to_string());
        let mut messages = Vec::new();
        while let Some(json) = queue.dequeue(self.kv.as_ref())? {
            let message = serde_json::from_str(&json)
                .map_err(|e| StoreError::corrupt(format!("queue.{kpid}"), e.to_string()))?;
            messages.push(message);
        }
        Ok(messages)
    }

    /// Deletes every record of `kpid`, including its message queue.
    pub fn delete_promise(&mut self, kpid: KPromiseId) -> Result<()> {
        debug!(%kpid, "deleting kernel promise");
        StoredQueue::attach(kpid.to_string()).delete(self.kv.as_ref())?;
        for field in ["state", "decider", "subscribers", "value", "refCount"] {
            self.kv.delete(&format!("{kpid}.{field}"))?;
        }
        Ok(())
    }

    // === c-lists ===

    /// Looks up the eref (and its reachable flag) that `endpoint` knows
    /// `kref` by.
    pub fn clist_entry_by_kref(
        &self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<Option<(ERef, bool)>> {
        let key = format!("clk.{endpoint}.{kref}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => {
                let (flag, eref_text) = match text.as_bytes().first() {
                    Some(&REACHABLE) => (true, &text[1..]),
                    Some(&UNREACHABLE) => (false, &text[1..]),
                    _ => {
                        return Err(StoreError::corrupt(
                            key,
                            format!("bad c-list encoding {text:?}"),
                        ))
                    }
                };
                let eref = eref_text
                    .parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string()))?;
                Ok(Some((eref, flag)))
            }
        }
    }

    /// Looks up the kref behind `endpoint`'s `eref`.
    pub fn clist_entry_by_eref(&self, endpoint: EndpointId, eref: ERef) -> Result<Option<KRef>> {
        let key = format!("cle.{endpoint}.{eref}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Installs both directions of a c-list entry.
    pub fn add_clist_entry(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        eref: ERef,
        reachable: bool,
    ) -> Result<()> {
        let flag = if reachable { REACHABLE } else { UNREACHABLE } as char;
        self.kv
            .set(&format!("clk.{endpoint}.{kref}"), &format!("{flag}{eref}"))?;
        self.kv
            .set(&format!("cle.{endpoint}.{eref}"), &kref.to_string())
    }

    /// Rewrites the reachable flag on an existing entry.
    pub fn set_clist_reachable(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        reachable: bool,
    ) -> Result<()> {
        let (eref, _) = self.clist_entry_by_kref(endpoint, kref)?.ok_or_else(|| {
            StoreError::MissingKey {
                key: format!("clk.{endpoint}.{kref}"),
            }
        })?;
        self.add_clist_entry(endpoint, kref, eref, reachable)
    }

    /// Removes both directions of the entry for `kref`, if present.
    ///
    /// Returns the removed eref.
    pub fn forget_clist_entry(&mut self, endpoint: EndpointId, kref: KRef) -> Result<Option<ERef>> {
        match self.clist_entry_by_kref(endpoint, kref)? {
            None => Ok(None),
            Some((eref, _)) => {
                self.kv.delete(&format!("clk.{endpoint}.{kref}"))?;
                self.kv.delete(&format!("cle.{endpoint}.{eref}"))?;
                Ok(Some(eref))
            }
        }
    }

    /// Up to `limit` krefs present in `endpoint`'s c-list.
    pub fn clist_krefs(&self, endpoint: EndpointId, limit: usize) -> Result<Vec<KRef>> {
        let prefix = format!("clk.{endpoint}.");
        let keys = first_keys_with_prefix(self.kv.as_ref(), &prefix, limit)?;
        keys.iter()
            .map(|key| {
                key[prefix.len()..]
                    .parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string()))
            })
            .collect()
    }

    /// True when any endpoint's c-list still names `kref`.
    pub fn kref_in_any_clist(&self, kref: KRef) -> Result<bool> {
        Ok(!self.clist_holders_of(kref)?.is_empty())
    }

    /// Every endpoint whose c-list names `kref`, in id order.
    ///
    /// clk keys embed the endpoint between fixed dots, so this scans
    /// the table; it only runs on the GC path for objects whose counts
    /// hit zero or whose owner is gone.
    pub fn clist_holders_of(&self, kref: KRef) -> Result<Vec<EndpointId>> {
        let keys = keys_with_prefix(self.kv.as_ref(), "clk.")?;
        let suffix = format!(".{kref}");
        let mut holders = Vec::new();
        for key in keys {
            if let Some(middle) = key
                .strip_prefix("clk.")
                .and_then(|rest| rest.strip_suffix(&suffix))
            {
                let endpoint = middle
                    .parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt(&key, e.to_string()))?;
                holders.push(endpoint);
            }
        }
        holders.sort();
        Ok(holders)
    }

    /// Deletes only the owner record of `koid`, leaving its refcounts.
    ///
    /// Used when a terminated vat abandons its exports: importers still
    /// hold recognizable refs that the GC engine retires afterwards.
    pub fn delete_object_owner(&mut self, koid: KObjectId) -> Result<()> {
        self.kv.delete(&format!("{koid}.owner"))
    }

    /// Deletes the per-endpoint allocation counters of `endpoint`.
    pub fn delete_endpoint_counters(&mut self, endpoint: EndpointId) -> Result<()> {
        self.kv.delete(&format!("e.nextObjectId.{endpoint}"))?;
        self.kv.delete(&format!("e.nextPromiseId.{endpoint}"))
    }

    // === GC bookkeeping ===

    /// The persistent set of pending GC actions.
    pub fn gc_actions(&mut self) -> Result<BTreeSet<GcAction>> {
        let json = self.gc_actions.get_required(self.kv.as_ref())?;
        let texts: Vec<String> = serde_json::from_str(&json)
            .map_err(|e| StoreError::corrupt("gcActions", e.to_string()))?;
        texts
            .iter()
            .map(|text| {
                text.parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt("gcActions", e.to_string()))
            })
            .collect()
    }

    /// Replaces the persistent set of pending GC actions.
    pub fn set_gc_actions(&mut self, actions: &BTreeSet<GcAction>) -> Result<()> {
        let mut texts: Vec<String> = actions.iter().map(|a| a.to_string()).collect();
        texts.sort();
        let json = serde_json::to_string(&texts)
            .map_err(|e| StoreError::corrupt("gcActions", e.to_string()))?;
        self.gc_actions.set(self.kv.as_ref(), &json)
    }

    /// The FIFO reap queue.
    pub fn reap_queue(&mut self) -> Result<Vec<EndpointId>> {
        let json = self.reap_queue.get_required(self.kv.as_ref())?;
        serde_json::from_str(&json).map_err(|e| StoreError::corrupt("reapQueue", e.to_string()))
    }

    fn write_reap_queue(&mut self, queue: &[EndpointId]) -> Result<()> {
        let json = serde_json::to_string(queue)
            .map_err(|e| StoreError::corrupt("reapQueue", e.to_string()))?;
        self.reap_queue.set(self.kv.as_ref(), &json)
    }

    /// Appends `endpoint` to the reap queue unless already queued.
    pub fn push_reap(&mut self, endpoint: EndpointId) -> Result<()> {
        let mut queue = self.reap_queue()?;
        if !queue.contains(&endpoint) {
            queue.push(endpoint);
            self.write_reap_queue(&queue)?;
        }
        Ok(())
    }

    /// Removes and returns the next endpoint due for a reap.
    pub fn pop_reap(&mut self) -> Result<Option<EndpointId>> {
        let mut queue = self.reap_queue()?;
        if queue.is_empty() {
            return Ok(None);
        }
        let next = queue.remove(0);
        self.write_reap_queue(&queue)?;
        Ok(Some(next))
    }

    /// Vats whose cleanup sweep has not finished.
    pub fn terminated_vats(&mut self) -> Result<Vec<VatId>> {
        let json = self.terminated_vats.get_required(self.kv.as_ref())?;
        serde_json::from_str(&json)
            .map_err(|e| StoreError::corrupt("terminatedVats", e.to_string()))
    }

    fn write_terminated_vats(&mut self, vats: &[VatId]) -> Result<()> {
        let json = serde_json::to_string(vats)
            .map_err(|e| StoreError::corrupt("terminatedVats", e.to_string()))?;
        self.terminated_vats.set(self.kv.as_ref(), &json)
    }

    /// Marks `vat` as terminated and awaiting cleanup.
    pub fn add_terminated_vat(&mut self, vat: VatId) -> Result<()> {
        let mut vats = self.terminated_vats()?;
        if !vats.contains(&vat) {
            vats.push(vat);
            self.write_terminated_vats(&vats)?;
        }
        Ok(())
    }

    /// Removes `vat` from the terminated list once cleanup completes.
    pub fn remove_terminated_vat(&mut self, vat: VatId) -> Result<()> {
        let mut vats = self.terminated_vats()?;
        vats.retain(|v| *v != vat);
        self.write_terminated_vats(&vats)
    }

    /// The set of pinned (GC-root) krefs.
    pub fn pinned_objects(&mut self) -> Result<BTreeSet<KRef>> {
        let text = self.pinned_objects.get_required(self.kv.as_ref())?;
        if text.is_empty() {
            return Ok(BTreeSet::new());
        }
        text.split(',')
            .map(|part| {
                part.parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt("pinnedObjects", e.to_string()))
            })
            .collect()
    }

    /// Replaces the set of pinned krefs.
    pub fn set_pinned_objects(&mut self, pinned: &BTreeSet<KRef>) -> Result<()> {
        let mut texts: Vec<String> = pinned.iter().map(|k| k.to_string()).collect();
        texts.sort();
        self.pinned_objects.set(self.kv.as_ref(), &texts.join(","))
    }

    // === remote peers and ocap URL exports ===

    /// The remote id registered for `peer`, if any.
    pub fn remote_id_for_peer(&self, peer: &str) -> Result<Option<RemoteId>> {
        let key = format!("remoteId.{peer}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// The peer behind a remote id, if registered.
    pub fn peer_for_remote(&self, remote: RemoteId) -> Result<Option<String>> {
        self.kv.get(&format!("remotePeer.{remote}"))
    }

    /// Registers `peer` under a fresh remote id.
    pub fn add_remote(&mut self, peer: &str) -> Result<RemoteId> {
        let remote = self.alloc_remote_id()?;
        self.kv
            .set(&format!("remoteId.{peer}"), &remote.to_string())?;
        self.kv.set(&format!("remotePeer.{remote}"), peer)?;
        Ok(remote)
    }

    /// Every registered peer, in remote-id order.
    pub fn remote_peers(&self) -> Result<Vec<(RemoteId, String)>> {
        let prefix = "remotePeer.";
        let keys = keys_with_prefix(self.kv.as_ref(), prefix)?;
        let mut peers = Vec::with_capacity(keys.len());
        for key in keys {
            let remote: RemoteId = key[prefix.len()..]
                .parse()
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(&key, e.to_string()))?;
            peers.push((remote, self.kv.get_required(&key)?));
        }
        peers.sort_by_key(|(remote, _)| *remote);
        Ok(peers)
    }

    /// The kref behind a locally issued ocap URL oid.
    pub fn ocap_url_kref(&self, oid: &str) -> Result<Option<KRef>> {
        let key = format!("ocapUrl.{oid}");
        match self.kv.get(&key)? {
            None => Ok(None),
            Some(text) => text
                .parse()
                .map(Some)
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string())),
        }
    }

    /// Returns `kref`'s issued oid, minting one on first issue.
    pub fn ocap_oid_for_kref(&mut self, kref: KRef) -> Result<String> {
        let reverse_key = format!("ocapOid.{kref}");
        if let Some(oid) = self.kv.get(&reverse_key)? {
            return Ok(oid);
        }
        let oid = format!("o{}", inc_counter(self.kv.as_ref(), "nextOcapUrlId", 1)?);
        self.kv.set(&format!("ocapUrl.{oid}"), &kref.to_string())?;
        self.kv.set(&reverse_key, &oid)?;
        Ok(oid)
    }

    // === vat configuration and substores ===

    /// Stored configuration of `vat`, as JSON text.
    pub fn vat_config(&self, vat: VatId) -> Result<Option<String>> {
        self.kv.get(&format!("vatConfig.{vat}"))
    }

    /// Writes the configuration of `vat`.
    pub fn set_vat_config(&mut self, vat: VatId, json: &str) -> Result<()> {
        self.kv.set(&format!("vatConfig.{vat}"), json)
    }

    /// Deletes the configuration of `vat`.
    pub fn delete_vat_config(&mut self, vat: VatId) -> Result<()> {
        self.kv.delete(&format!("vatConfig.{vat}"))
    }

    /// Every vat with a stored configuration, in id order.
    pub fn configured_vats(&self) -> Result<Vec<VatId>> {
        let prefix = "vatConfig.";
        let keys = keys_with_prefix(self.kv.as_ref(), prefix)?;
        let mut vats: Vec<VatId> = keys
            .iter()
            .map(|key| {
                key[prefix.len()..]
                    .parse()
                    .map_err(|e: ocap_core::CoreError| StoreError::corrupt(key, e.to_string()))
            })
            .collect::<Result<_>>()?;
        vats.sort();
        Ok(vats)
    }

    /// Reads from `vat`'s private substore.
    pub fn vatstore_get(&self, vat: VatId, key: &str) -> Result<Option<String>> {
        self.kv.get(&format!("{vat}.vs.{key}"))
    }

    /// Writes into `vat`'s private substore.
    pub fn vatstore_set(&mut self, vat: VatId, key: &str, value: &str) -> Result<()> {
        self.kv.set(&format!("{vat}.vs.{key}"), value)
    }

    /// Deletes from `vat`'s private substore.
    pub fn vatstore_delete(&mut self, vat: VatId, key: &str) -> Result<()> {
        self.kv.delete(&format!("{vat}.vs.{key}"))
    }

    /// The next substore key after `key`, in the vat's own key space.
    pub fn vatstore_get_next_key(&self, vat: VatId, key: &str) -> Result<Option<String>> {
        let prefix = format!("{vat}.vs.");
        let full = format!("{prefix}{key}");
        match self.kv.get_next_key(&full)? {
            Some(next) if next.starts_with(&prefix) => Ok(Some(next[prefix.len()..].to_string())),
            _ => Ok(None),
        }
    }

    /// Deletes up to `limit` keys under `<vat>.`; returns how many went.
    pub fn sweep_vat_keys(&mut self, vat: VatId, limit: usize) -> Result<usize> {
        let prefix = format!("{vat}.");
        let keys = first_keys_with_prefix(self.kv.as_ref(), &prefix, limit)?;
        for key in &keys {
            self.kv.delete(key)?;
        }
        Ok(keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKVStore;
    use ocap_core::GcActionType;

    fn store() -> KernelStore {
        KernelStore::open(Arc::new(MemoryKVStore::new())).unwrap()
    }

    #[test]
    fn test_first_start_defaults() {
        let mut ks = store();
        assert_eq!(ks.run_queue_length().unwrap(), 0);
        assert_eq!(ks.kv().get("nextVatId").unwrap().as_deref(), Some("1"));
        assert_eq!(ks.alloc_vat_id().unwrap(), VatId::new(1));
        assert_eq!(ks.alloc_vat_id().unwrap(), VatId::new(2));
        assert_eq!(ks.alloc_object_id().unwrap(), KObjectId::new(1));
        assert_eq!(ks.alloc_promise_id().unwrap(), KPromiseId::new(1));
    }

    #[test]
    fn test_object_records() {
        let mut ks = store();
        let owner = EndpointId::Vat(VatId::new(2));
        let koid = ks.add_object(owner).unwrap();
        assert_eq!(ks.object_owner(koid).unwrap(), Some(owner));
        assert_eq!(ks.object_refcounts(koid).unwrap(), Some((0, 0)));
        ks.set_object_refcounts(koid, (1, 2)).unwrap();
        assert_eq!(ks.object_refcounts(koid).unwrap(), Some((1, 2)));
        ks.delete_object(koid).unwrap();
        assert_eq!(ks.object_owner(koid).unwrap(), None);
        assert_eq!(ks.object_refcounts(koid).unwrap(), None);
    }

    #[test]
    fn test_promise_records() {
        let mut ks = store();
        let decider = EndpointId::Vat(VatId::new(1));
        let kpid = ks.add_promise(Some(decider)).unwrap();
        assert_eq!(
            ks.promise_state(kpid).unwrap(),
            Some(PromiseState::Unresolved)
        );
        assert_eq!(ks.promise_decider(kpid).unwrap(), Some(decider));
        assert_eq!(ks.promise_refcount(kpid).unwrap(), 0);

        let subscriber = EndpointId::Vat(VatId::new(3));
        assert!(ks.add_promise_subscriber(kpid, subscriber).unwrap());
        assert!(!ks.add_promise_subscriber(kpid, subscriber).unwrap());
        assert_eq!(ks.promise_subscribers(kpid).unwrap(), vec![subscriber]);

        let value = CapData::plain("42");
        ks.mark_promise_resolved(kpid, false, &value).unwrap();
        assert_eq!(
            ks.promise_state(kpid).unwrap(),
            Some(PromiseState::Fulfilled)
        );
        assert_eq!(ks.promise_value(kpid).unwrap(), Some(value));
        assert_eq!(ks.promise_decider(kpid).unwrap(), None);
        assert!(ks.promise_subscribers(kpid).unwrap().is_empty());
    }

    #[test]
    fn test_promise_refcount_underflow_is_corrupt() {
        let mut ks = store();
        let kpid = ks.add_promise(None).unwrap();
        assert_eq!(ks.inc_promise_refcount(kpid).unwrap(), 1);
        assert_eq!(ks.dec_promise_refcount(kpid).unwrap(), 0);
        assert!(ks.dec_promise_refcount(kpid).is_err());
    }

    #[test]
    fn test_promise_message_queue_fifo() {
        let mut ks = store();
        let kpid = ks.add_promise(None).unwrap();
        let m1 = Message::new("a", CapData::plain("[]"), None);
        let m2 = Message::new("b", CapData::plain("[]"), None);
        ks.enqueue_promise_message(kpid, &m1).unwrap();
        ks.enqueue_promise_message(kpid, &m2).unwrap();
        assert_eq!(ks.drain_promise_messages(kpid).unwrap(), vec![m1, m2]);
        assert!(ks.drain_promise_messages(kpid).unwrap().is_empty());
    }

    #[test]
    fn test_delete_promise_removes_all_keys() {
        let mut ks = store();
        let kpid = ks
            .add_promise(Some(EndpointId::Vat(VatId::new(1))))
            .unwrap();
        ks.enqueue_promise_message(kpid, &Message::new("m", CapData::plain("[]"), None))
            .unwrap();
        ks.delete_promise(kpid).unwrap();
        let leftover = keys_with_prefix(ks.kv(), &kpid.to_string()).unwrap();
        assert!(leftover.is_empty(), "leftover keys: {leftover:?}");
        let queue_leftover = keys_with_prefix(ks.kv(), &format!("queue.{kpid}")).unwrap();
        assert!(queue_leftover.is_empty());
    }

    #[test]
    fn test_clist_entries() {
        let mut ks = store();
        let endpoint = EndpointId::Vat(VatId::new(1));
        let kref: KRef = "ko7".parse().unwrap();
        let eref: ERef = "o-3".parse().unwrap();
        ks.add_clist_entry(endpoint, kref, eref, true).unwrap();
        assert_eq!(
            ks.clist_entry_by_kref(endpoint, kref).unwrap(),
            Some((eref, true))
        );
        assert_eq!(ks.clist_entry_by_eref(endpoint, eref).unwrap(), Some(kref));
        assert_eq!(
            ks.kv().get("clk.v1.ko7").unwrap().as_deref(),
            Some("Ro-3")
        );

        ks.set_clist_reachable(endpoint, kref, false).unwrap();
        assert_eq!(
            ks.clist_entry_by_kref(endpoint, kref).unwrap(),
            Some((eref, false))
        );
        assert_eq!(
            ks.kv().get("clk.v1.ko7").unwrap().as_deref(),
            Some("_o-3")
        );

        assert!(ks.kref_in_any_clist(kref).unwrap());
        assert_eq!(ks.forget_clist_entry(endpoint, kref).unwrap(), Some(eref));
        assert_eq!(ks.clist_entry_by_kref(endpoint, kref).unwrap(), None);
        assert_eq!(ks.clist_entry_by_eref(endpoint, eref).unwrap(), None);
        assert!(!ks.kref_in_any_clist(kref).unwrap());
    }

    #[test]
    fn test_gc_action_set_round_trip() {
        let mut ks = store();
        let mut actions = BTreeSet::new();
        actions.insert(GcAction {
            endpoint: EndpointId::Vat(VatId::new(2)),
            action: GcActionType::DropExport,
            kref: "ko9".parse().unwrap(),
        });
        actions.insert(GcAction {
            endpoint: EndpointId::Vat(VatId::new(1)),
            action: GcActionType::RetireImport,
            kref: "ko9".parse().unwrap(),
        });
        ks.set_gc_actions(&actions).unwrap();
        assert_eq!(ks.gc_actions().unwrap(), actions);
        let raw = ks.kv().get("gcActions").unwrap().unwrap();
        assert_eq!(
            raw,
            "[\"v1 retireImport ko9\",\"v2 dropExport ko9\"]"
        );
    }

    #[test]
    fn test_reap_queue_fifo_with_dedupe() {
        let mut ks = store();
        let v4 = EndpointId::Vat(VatId::new(4));
        let v2 = EndpointId::Vat(VatId::new(2));
        ks.push_reap(v4).unwrap();
        ks.push_reap(v2).unwrap();
        ks.push_reap(v4).unwrap();
        assert_eq!(ks.pop_reap().unwrap(), Some(v4));
        assert_eq!(ks.pop_reap().unwrap(), Some(v2));
        assert_eq!(ks.pop_reap().unwrap(), None);
    }

    #[test]
    fn test_pinned_objects_encoding() {
        let mut ks = store();
        let mut pinned = BTreeSet::new();
        pinned.insert("ko12".parse::<KRef>().unwrap());
        pinned.insert("ko3".parse::<KRef>().unwrap());
        ks.set_pinned_objects(&pinned).unwrap();
        assert_eq!(
            ks.kv().get("pinnedObjects").unwrap().as_deref(),
            Some("ko12,ko3")
        );
        assert_eq!(ks.pinned_objects().unwrap(), pinned);
        ks.set_pinned_objects(&BTreeSet::new()).unwrap();
        assert!(ks.pinned_objects().unwrap().is_empty());
    }

    #[test]
    fn test_vatstore_is_scoped_per_vat() {
        let mut ks = store();
        let v1 = VatId::new(1);
        let v2 = VatId::new(2);
        ks.vatstore_set(v1, "alpha", "1").unwrap();
        ks.vatstore_set(v1, "beta", "2").unwrap();
        ks.vatstore_set(v2, "alpha", "other").unwrap();
        assert_eq!(ks.vatstore_get(v1, "alpha").unwrap().as_deref(), Some("1"));
        assert_eq!(
            ks.vatstore_get_next_key(v1, "alpha").unwrap().as_deref(),
            Some("beta")
        );
        assert_eq!(ks.vatstore_get_next_key(v1, "beta").unwrap(), None);
        ks.vatstore_delete(v1, "alpha").unwrap();
        assert_eq!(ks.vatstore_get(v1, "alpha").unwrap(), None);
        assert_eq!(
            ks.vatstore_get(v2, "alpha").unwrap().as_deref(),
            Some("other")
        );
    }

    #[test]
    fn test_sweep_vat_keys_budgeted() {
        let mut ks = store();
        let v1 = VatId::new(1);
        for i in 0..5 {
            ks.vatstore_set(v1, &format!("k{i}"), "x").unwrap();
        }
        assert_eq!(ks.sweep_vat_keys(v1, 3).unwrap(), 3);
        assert_eq!(ks.sweep_vat_keys(v1, 3).unwrap(), 2);
        assert_eq!(ks.sweep_vat_keys(v1, 3).unwrap(), 0);
    }

    #[test]
    fn test_reset_restores_first_start_state() {
        let mut ks = store();
        ks.add_object(EndpointId::Vat(VatId::new(1))).unwrap();
        ks.run_enqueue(&RunQueueItem::BringOutYourDead {
            endpoint: EndpointId::Vat(VatId::new(1)),
        })
        .unwrap();
        ks.reset().unwrap();
        assert_eq!(ks.run_queue_length().unwrap(), 0);
        assert_eq!(ks.alloc_object_id().unwrap(), KObjectId::new(1));
        assert!(ks.gc_actions().unwrap().is_empty());
    }

    #[test]
    fn test_configured_vats_sorted() {
        let mut ks = store();
        ks.set_vat_config(VatId::new(2), "{}").unwrap();
        ks.set_vat_config(VatId::new(10), "{}").unwrap();
        ks.set_vat_config(VatId::new(1), "{}").unwrap();
        assert_eq!(
            ks.configured_vats().unwrap(),
            vec![VatId::new(1), VatId::new(2), VatId::new(10)]
        );
    }
}
