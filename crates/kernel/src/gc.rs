// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// gc.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! The garbage collection engine.
//!
//! At the end of every crank the maybe-free set is mined: objects whose
//! reachable count hit zero produce `dropExport` actions for their
//! exporter, fully unreferenced objects produce `retireExport`, orphans
//! (owner gone) produce `retireImport` for each holder, and resolved
//! promises with no refs are deleted outright. Actions persist in the
//! `gcActions` set and are re-validated against live state immediately
//! before dispatch, grouped into one batched work item per
//! (endpoint, action type).

use crate::error::CrankResult;
use crate::state::KernelState;
use ocap_core::{
    CapData, EndpointId, GcAction, GcActionType, KRef, PromiseState, RunQueueItem, VatId,
};
use ocap_store::StoreError;
use tracing::{debug, info};

/// Budget for one terminated-vat cleanup step: c-list entries handled
/// or substore keys swept per crank.
pub const CLEANUP_BUDGET: usize = 64;

/// Rejection value used when a vat dies with obligations outstanding.
fn vat_terminated_failure() -> CapData {
    CapData::plain("\"vat terminated\"")
}

impl KernelState {
    /// Mines the maybe-free set into GC actions and deletions.
    ///
    /// Runs at the end of every crank; deletions cascade through the
    /// worklist (a deleted promise releases its value slots, which may
    /// free further krefs within the same harvest).
    pub fn harvest_refcounts(&mut self) -> Result<(), StoreError> {
        let pinned = self.store.pinned_objects()?;
        let mut emitted: Vec<GcAction> = Vec::new();
        while let Some(kref) = self.maybe_free.pop_first() {
            match kref {
                KRef::Object(koid) => {
                    let (reachable, recognizable) = match self.store.object_refcounts(koid)? {
                        Some(counts) => counts,
                        None => continue,
                    };
                    if pinned.contains(&kref) {
                        continue;
                    }
                    match self.store.object_owner(koid)? {
                        Some(owner) => {
                            if reachable == 0 && recognizable == 0 {
                                if self.store.clist_entry_by_kref(owner, kref)?.is_some() {
                                    emitted.push(GcAction {
                                        endpoint: owner,
                                        action: GcActionType::RetireExport,
                                        kref,
                                    });
                                } else {
                                    // Nobody can recognise it and the
                                    // exporter already forgot it.
                                    self.store.delete_object(koid)?;
                                }
                            } else if reachable == 0 {
                                if let Some((_, true)) =
                                    self.store.clist_entry_by_kref(owner, kref)?
                                {
                                    emitted.push(GcAction {
                                        endpoint: owner,
                                        action: GcActionType::DropExport,
                                        kref,
                                    });
                                }
                            }
                        }
                        None => {
                            // Orphaned export: its vat is gone. Retire
                            // the remaining holders, then the record.
                            let holders = self.store.clist_holders_of(kref)?;
                            if holders.is_empty() {
                                self.store.delete_object(koid)?;
                            } else {
                                for holder in holders {
                                    emitted.push(GcAction {
                                        endpoint: holder,
                                        action: GcActionType::RetireImport,
                                        kref,
                                    });
                                }
                            }
                        }
                    }
                }
                KRef::Promise(kpid) => {
                    match self.store.promise_state(kpid)? {
                        None | Some(PromiseState::Unresolved) => continue,
                        Some(_) => {}
                    }
                    if self.store.promise_refcount(kpid)? > 0 {
                        continue;
                    }
                    let value = self.store.promise_value(kpid)?;
                    self.store.delete_promise(kpid)?;
                    if let Some(value) = value {
                        for slot in &value.slots {
                            let slot_kref: KRef = slot.parse().map_err(
                                |e: ocap_core::CoreError| {
                                    StoreError::corrupt("resolution", e.to_string())
                                },
                            )?;
                            self.dec_slot_ref(slot_kref)?;
                        }
                    }
                }
            }
        }
        if !emitted.is_empty() {
            debug!(count = emitted.len(), "emitting gc actions");
            let mut actions = self.store.gc_actions()?;
            actions.extend(emitted);
            self.store.set_gc_actions(&actions)?;
        }
        Ok(())
    }

    /// Picks the next batch of GC work, if any action survives
    /// re-validation.
    ///
    /// Actions are grouped by (endpoint, type), visited in endpoint
    /// order with drops before export retirements before import
    /// retirements; stale actions are discarded. Every visited action
    /// leaves the stored set whether it was dispatched or not.
    pub fn next_gc_action_item(&mut self) -> Result<Option<RunQueueItem>, StoreError> {
        let mut actions = self.store.gc_actions()?;
        if actions.is_empty() {
            return Ok(None);
        }
        while let Some(first) = actions.iter().next().copied() {
            let group: Vec<GcAction> = actions
                .iter()
                .filter(|a| a.endpoint == first.endpoint && a.action == first.action)
                .copied()
                .collect();
            for action in &group {
                actions.remove(action);
            }
            let mut krefs = Vec::new();
            for action in &group {
                if self.gc_action_still_valid(action)? {
                    krefs.push(action.kref);
                } else {
                    debug!(action = %action, "discarding stale gc action");
                }
            }
            if !krefs.is_empty() {
                self.store.set_gc_actions(&actions)?;
                let endpoint = first.endpoint;
                let item = match first.action {
                    GcActionType::DropExport => RunQueueItem::DropExports { endpoint, krefs },
                    GcActionType::RetireExport => RunQueueItem::RetireExports { endpoint, krefs },
                    GcActionType::RetireImport => RunQueueItem::RetireImports { endpoint, krefs },
                };
                return Ok(Some(item));
            }
        }
        self.store.set_gc_actions(&actions)?;
        Ok(None)
    }

    /// Re-checks whether current state still warrants `action`.
    fn gc_action_still_valid(&mut self, action: &GcAction) -> Result<bool, StoreError> {
        let kref = action.kref;
        match action.action {
            GcActionType::DropExport => {
                let koid = match kref.as_object() {
                    Some(koid) => koid,
                    None => return Ok(false),
                };
                let reachable = match self.store.object_refcounts(koid)? {
                    Some((reachable, _)) => reachable,
                    None => return Ok(false),
                };
                if reachable > 0 {
                    return Ok(false);
                }
                match self.store.clist_entry_by_kref(action.endpoint, kref)? {
                    Some((_, flag)) => Ok(flag),
                    None => Ok(false),
                }
            }
            GcActionType::RetireExport => {
                let koid = match kref.as_object() {
                    Some(koid) => koid,
                    None => return Ok(false),
                };
                match self.store.object_refcounts(koid)? {
                    Some((0, 0)) => {}
                    _ => return Ok(false),
                }
                Ok(self
                    .store
                    .clist_entry_by_kref(action.endpoint, kref)?
                    .is_some())
            }
            GcActionType::RetireImport => Ok(self
                .store
                .clist_entry_by_kref(action.endpoint, kref)?
                .is_some()),
        }
    }

    /// Queues `endpoint` for a cooperative GC poll.
    pub fn schedule_reap(&mut self, endpoint: EndpointId) -> Result<(), StoreError> {
        self.store.push_reap(endpoint)
    }

    /// Takes the next due reap, if any.
    pub fn next_reap_item(&mut self) -> Result<Option<RunQueueItem>, StoreError> {
        Ok(self
            .store
            .pop_reap()?
            .map(|endpoint| RunQueueItem::BringOutYourDead { endpoint }))
    }

    /// Pins `kref` as a GC root. Returns false when already pinned.
    pub fn pin_object(&mut self, kref: KRef) -> Result<bool, StoreError> {
        let mut pinned = self.store.pinned_objects()?;
        if !pinned.insert(kref) {
            return Ok(false);
        }
        self.store.set_pinned_objects(&pinned)?;
        self.inc_slot_ref(kref)?;
        Ok(true)
    }

    /// Releases a pin taken by [`KernelState::pin_object`].
    pub fn unpin_object(&mut self, kref: KRef) -> Result<bool, StoreError> {
        let mut pinned = self.store.pinned_objects()?;
        if !pinned.remove(&kref) {
            return Ok(false);
        }
        self.store.set_pinned_objects(&pinned)?;
        self.dec_slot_ref(kref)?;
        Ok(true)
    }

    /// Marks `vat` as terminated: queued work addressed to it is
    /// discarded (send results are rejected), pending GC actions and
    /// reaps for it are dropped, and the background cleanup sweep takes
    /// over from the next crank.
    pub fn mark_vat_terminated(&mut self, vat: VatId) -> Result<(), StoreError> {
        let endpoint = EndpointId::Vat(vat);
        info!(%vat, "marking vat terminated");
        self.store.add_terminated_vat(vat)?;

        let length = self.store.run_queue_length()?;
        for _ in 0..length {
            let item = match self.store.run_dequeue()? {
                Some(item) => item,
                None => break,
            };
            if self.item_addresses_endpoint(&item, endpoint)? {
                self.discard_item(item)?;
            } else {
                self.store.run_enqueue(&item)?;
            }
        }

        let mut actions = self.store.gc_actions()?;
        let before = actions.len();
        actions.retain(|a| a.endpoint != endpoint);
        if actions.len() != before {
            self.store.set_gc_actions(&actions)?;
        }

        if self.store.reap_queue()?.contains(&endpoint) {
            let mut kept = Vec::new();
            while let Some(next) = self.store.pop_reap()? {
                if next != endpoint {
                    kept.push(next);
                }
            }
            for survivor in kept {
                self.store.push_reap(survivor)?;
            }
        }
        Ok(())
    }

    fn item_addresses_endpoint(
        &mut self,
        item: &RunQueueItem,
        endpoint: EndpointId,
    ) -> Result<bool, StoreError> {
        Ok(match item {
            RunQueueItem::Send { target, .. } => match target.as_object() {
                Some(koid) => self.store.object_owner(koid)? == Some(endpoint),
                // Sends to promises stay queued; the promise itself is
                // rejected when the dead decider's c-list is swept.
                None => false,
            },
            RunQueueItem::Notify { endpoint: e, .. }
            | RunQueueItem::DropExports { endpoint: e, .. }
            | RunQueueItem::RetireExports { endpoint: e, .. }
            | RunQueueItem::RetireImports { endpoint: e, .. }
            | RunQueueItem::BringOutYourDead { endpoint: e } => *e == endpoint,
        })
    }

    /// Drops a queue item addressed to a dead endpoint, rejecting any
    /// result promise it carried.
    fn discard_item(&mut self, item: RunQueueItem) -> Result<(), StoreError> {
        if let RunQueueItem::Send { message, .. } = &item {
            if let Some(result) = message.result {
                self.resolve_promise_internal(result, true, vat_terminated_failure())?;
            }
        }
        self.release_item_refs(&item)
    }

    /// Runs one budgeted step of the terminated-vat sweep.
    ///
    /// Returns true when a step did work; the vat leaves the terminated
    /// list only when its c-list, key prefix, config and counters are
    /// all gone.
    pub fn terminated_cleanup_step(&mut self, budget: usize) -> CrankResult<bool> {
        let vat = match self.store.terminated_vats()?.first() {
            Some(vat) => *vat,
            None => return Ok(false),
        };
        let endpoint = EndpointId::Vat(vat);

        let krefs = self.store.clist_krefs(endpoint, budget)?;
        if !krefs.is_empty() {
            for kref in krefs {
                match kref {
                    KRef::Object(koid) => {
                        let owned = self.store.object_owner(koid)? == Some(endpoint);
                        self.forget_kref(endpoint, kref)?;
                        if owned {
                            // Orphan the export; the harvest retires the
                            // remaining importers.
                            self.store.delete_object_owner(koid)?;
                            self.note_maybe_free(kref);
                        }
                    }
                    KRef::Promise(kpid) => {
                        if self.store.promise_state(kpid)? == Some(PromiseState::Unresolved)
                            && self.store.promise_decider(kpid)? == Some(endpoint)
                        {
                            self.resolve_promise_internal(
                                kpid,
                                true,
                                vat_terminated_failure(),
                            )?;
                        }
                        self.forget_kref(endpoint, kref)?;
                    }
                }
            }
            return Ok(true);
        }

        if self.store.sweep_vat_keys(vat, budget)? > 0 {
            return Ok(true);
        }

        self.store.delete_vat_config(vat)?;
        self.store.delete_endpoint_counters(endpoint)?;
        self.store.remove_terminated_vat(vat)?;
        info!(%vat, "terminated vat cleanup complete");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_core::Message;
    use ocap_store::{keys_with_prefix, KernelStore, MemoryKVStore};
    use std::collections::BTreeSet;
    use std::sync::Arc;

    fn state() -> KernelState {
        KernelState::new(KernelStore::open(Arc::new(MemoryKVStore::new())).unwrap())
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    /// Exports an object from `owner` and imports it into each endpoint
    /// of `importers`.
    fn shared_object(
        state: &mut KernelState,
        owner: EndpointId,
        importers: &[EndpointId],
    ) -> KRef {
        let kref = state
            .translate_ref_e_to_k(owner, "o+1".parse().unwrap())
            .unwrap();
        for importer in importers {
            state
                .translate_ref_k_to_e(*importer, kref, true, true)
                .unwrap();
        }
        kref
    }

    #[test]
    fn test_drop_cascade_emits_single_drop_export() {
        let mut state = state();
        let (v1, v2, v3) = (vat(1), vat(2), vat(3));
        let kref = shared_object(&mut state, v2, &[v1, v3]);
        let koid = kref.as_object().unwrap();

        // First importer drops: still reachable via the other.
        state.clear_reachable_flag(v1, kref).unwrap();
        state.harvest_refcounts().unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((1, 2)));
        assert!(state.store.gc_actions().unwrap().is_empty());

        // Second importer drops: one dropExport to the owner.
        state.clear_reachable_flag(v3, kref).unwrap();
        state.harvest_refcounts().unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 2)));
        let actions = state.store.gc_actions().unwrap();
        assert_eq!(actions.len(), 1);
        let action = actions.iter().next().unwrap();
        assert_eq!(action.endpoint, v2);
        assert_eq!(action.action, GcActionType::DropExport);
        assert_eq!(action.kref, kref);

        // The action batches into one DropExports item for the owner.
        let item = state.next_gc_action_item().unwrap().unwrap();
        assert_eq!(
            item,
            RunQueueItem::DropExports {
                endpoint: v2,
                krefs: vec![kref]
            }
        );
        assert!(state.store.gc_actions().unwrap().is_empty());
    }

    #[test]
    fn test_stale_drop_export_is_discarded() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = shared_object(&mut state, v2, &[v1]);
        state.clear_reachable_flag(v1, kref).unwrap();
        state.harvest_refcounts().unwrap();
        assert_eq!(state.store.gc_actions().unwrap().len(), 1);

        // The object becomes reachable again before dispatch.
        state.translate_ref_k_to_e(v1, kref, true, true).unwrap();
        assert_eq!(state.next_gc_action_item().unwrap(), None);
        assert!(state.store.gc_actions().unwrap().is_empty());
    }

    #[test]
    fn test_retire_export_when_fully_unreferenced() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = shared_object(&mut state, v2, &[v1]);
        state.forget_kref(v1, kref).unwrap();
        state.harvest_refcounts().unwrap();
        let actions = state.store.gc_actions().unwrap();
        assert_eq!(actions.len(), 1);
        assert_eq!(
            actions.iter().next().unwrap().action,
            GcActionType::RetireExport
        );
        let item = state.next_gc_action_item().unwrap().unwrap();
        assert_eq!(
            item,
            RunQueueItem::RetireExports {
                endpoint: v2,
                krefs: vec![kref]
            }
        );
    }

    #[test]
    fn test_group_priority_drop_before_retire() {
        let mut state = state();
        let v2 = vat(2);
        let mut actions = BTreeSet::new();
        let dropped = shared_object(&mut state, v2, &[vat(1)]);
        state.clear_reachable_flag(vat(1), dropped).unwrap();
        actions.insert(GcAction {
            endpoint: v2,
            action: GcActionType::RetireImport,
            kref: dropped,
        });
        actions.insert(GcAction {
            endpoint: v2,
            action: GcActionType::DropExport,
            kref: dropped,
        });
        state.store.set_gc_actions(&actions).unwrap();
        let item = state.next_gc_action_item().unwrap().unwrap();
        assert!(matches!(item, RunQueueItem::DropExports { .. }));
    }

    #[test]
    fn test_resolved_promise_deleted_at_zero_refs() {
        let mut state = state();
        let v2 = vat(2);
        let kpid = state.store.add_promise(Some(v2)).unwrap();
        let koid = state.store.add_object(v2).unwrap();
        state
            .resolve_promise_internal(
                kpid,
                false,
                CapData::new("{}", vec![KRef::Object(koid).to_string()]),
            )
            .unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((1, 1)));
        state.note_maybe_free(KRef::Promise(kpid));
        state.harvest_refcounts().unwrap();
        // The promise is gone and its value slot ref cascaded away.
        assert_eq!(state.store.promise_state(kpid).unwrap(), None);
        assert_eq!(state.store.object_refcounts(koid).unwrap(), None);
    }

    #[test]
    fn test_unresolved_promise_survives_zero_refs() {
        let mut state = state();
        let kpid = state.store.add_promise(Some(vat(2))).unwrap();
        state.note_maybe_free(KRef::Promise(kpid));
        state.harvest_refcounts().unwrap();
        assert_eq!(
            state.store.promise_state(kpid).unwrap(),
            Some(PromiseState::Unresolved)
        );
    }

    #[test]
    fn test_pinned_object_never_collected() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = shared_object(&mut state, v2, &[v1]);
        assert!(state.pin_object(kref).unwrap());
        assert!(!state.pin_object(kref).unwrap());
        state.clear_reachable_flag(v1, kref).unwrap();
        state.harvest_refcounts().unwrap();
        assert!(state.store.gc_actions().unwrap().is_empty());
        assert!(state.unpin_object(kref).unwrap());
        state.harvest_refcounts().unwrap();
        assert_eq!(state.store.gc_actions().unwrap().len(), 1);
    }

    #[test]
    fn test_reap_queue_order() {
        let mut state = state();
        state.schedule_reap(vat(4)).unwrap();
        state.schedule_reap(vat(2)).unwrap();
        assert_eq!(
            state.next_reap_item().unwrap(),
            Some(RunQueueItem::BringOutYourDead { endpoint: vat(4) })
        );
        assert_eq!(
            state.next_reap_item().unwrap(),
            Some(RunQueueItem::BringOutYourDead { endpoint: vat(2) })
        );
        assert_eq!(state.next_reap_item().unwrap(), None);
    }

    #[test]
    fn test_mark_terminated_purges_queued_work() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let doomed = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        let survivor_owner = state
            .translate_ref_e_to_k(v1, "o+1".parse().unwrap())
            .unwrap();
        let result = state.store.add_promise(None).unwrap();
        state
            .enqueue_run(RunQueueItem::Send {
                target: doomed,
                message: Message::new("m", CapData::plain("[]"), Some(result)),
            })
            .unwrap();
        state
            .enqueue_run(RunQueueItem::Send {
                target: survivor_owner,
                message: Message::new("m", CapData::plain("[]"), None),
            })
            .unwrap();
        state.schedule_reap(v2).unwrap();

        state.mark_vat_terminated(VatId::new(2)).unwrap();
        // The send to the dead vat is gone, its result rejected.
        assert_eq!(state.store.run_queue_length().unwrap(), 1);
        assert_eq!(
            state.store.promise_state(result).unwrap(),
            Some(PromiseState::Rejected)
        );
        assert_eq!(state.next_reap_item().unwrap(), None);
        assert_eq!(state.store.terminated_vats().unwrap(), vec![VatId::new(2)]);
    }

    #[test]
    fn test_cleanup_sweep_is_budgeted_and_complete() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        // v2 exports an object imported by v1, imports one of v1's, and
        // decides a promise v1 subscribed to.
        let export = shared_object(&mut state, v2, &[v1]);
        let import = state
            .translate_ref_e_to_k(v1, "o+9".parse().unwrap())
            .unwrap();
        state.translate_ref_k_to_e(v2, import, true, true).unwrap();
        let kpid = state
            .translate_ref_e_to_k(v2, "p+1".parse().unwrap())
            .unwrap()
            .as_promise()
            .unwrap();
        state.subscribe(v1, kpid).unwrap();
        state.store.vatstore_set(VatId::new(2), "note", "x").unwrap();
        state.store.set_vat_config(VatId::new(2), "{}").unwrap();

        state.mark_vat_terminated(VatId::new(2)).unwrap();
        while state.terminated_cleanup_step(CLEANUP_BUDGET).unwrap() {
            state.harvest_refcounts().unwrap();
        }

        // No key of the dead vat survives, in any table.
        assert!(state.store.terminated_vats().unwrap().is_empty());
        assert!(keys_with_prefix(state.store.kv(), "v2.").unwrap().is_empty());
        assert!(keys_with_prefix(state.store.kv(), "clk.v2.")
            .unwrap()
            .is_empty());
        assert!(keys_with_prefix(state.store.kv(), "cle.v2.")
            .unwrap()
            .is_empty());
        assert_eq!(state.store.vat_config(VatId::new(2)).unwrap(), None);
        assert_eq!(
            state.store.kv().get("e.nextObjectId.v2").unwrap(),
            None
        );

        // v1's own export lost its only importer: retireExport first
        // (type priority), then the orphaned import is retired.
        assert!(state.has_clist_entry(v1, import).unwrap());
        assert_eq!(
            state.next_gc_action_item().unwrap(),
            Some(RunQueueItem::RetireExports {
                endpoint: v1,
                krefs: vec![import]
            })
        );
        assert_eq!(
            state.next_gc_action_item().unwrap(),
            Some(RunQueueItem::RetireImports {
                endpoint: v1,
                krefs: vec![export]
            })
        );
        // The promise it decided was rejected; v1 got a notify.
        let notify = state.store.run_dequeue().unwrap();
        assert_eq!(
            notify,
            Some(RunQueueItem::Notify {
                endpoint: v1,
                kpid
            })
        );
        assert_eq!(
            state.store.promise_state(kpid).unwrap(),
            Some(PromiseState::Rejected)
        );
    }
}
