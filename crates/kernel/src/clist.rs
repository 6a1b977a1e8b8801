// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// clist.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! The reference translation layer.
//!
//! Each endpoint sees only its own eref namespace; the kernel sees one
//! shared kref namespace. Translation walks the endpoint's c-list in
//! either direction, allocating on first contact:
//!
//! * E→K: an unknown export (`o+`/`p+`) mints a fresh kernel object or
//!   promise owned/decided by the endpoint. An unknown import is an
//!   invalid syscall; only the kernel allocates imports.
//! * K→E: an unknown kref mints a fresh import (`o-`/`p-`) from the
//!   endpoint's allocation counter; a promise whose decider is the
//!   receiving endpoint renders as an export (`p+`). First-contact
//!   object imports take one reachable and one recognizable ref.

use crate::error::{CrankResult, VatFatalError};
use crate::state::KernelState;
use crate::worker::VatMessage;
use ocap_core::{CapData, EndpointId, ERef, KRef, Message, RefDir, RefKind};
use ocap_store::StoreError;
use tracing::trace;

impl KernelState {
    /// Translates an endpoint ref into kernel space, as when receiving
    /// a syscall from that endpoint.
    pub fn translate_ref_e_to_k(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> CrankResult<KRef> {
        if let Some(kref) = self.store.clist_entry_by_eref(endpoint, eref)? {
            if eref.kind() == RefKind::Object {
                let (_, reachable) = self
                    .store
                    .clist_entry_by_kref(endpoint, kref)?
                    .ok_or_else(|| StoreError::corrupt(format!("cle.{endpoint}.{eref}"), "one-way c-list entry"))?;
                if !reachable {
                    match eref.dir() {
                        // Using an import after dropping it is a protocol
                        // violation.
                        RefDir::Import => {
                            return Err(VatFatalError::invalid_syscall(format!(
                                "{endpoint} used dropped import {eref}"
                            ))
                            .into())
                        }
                        // Re-mentioning an export revives it.
                        RefDir::Export => {
                            self.store.set_clist_reachable(endpoint, kref, true)?;
                        }
                    }
                }
            }
            return Ok(kref);
        }
        if eref.dir() == RefDir::Import {
            return Err(VatFatalError::invalid_syscall(format!(
                "{endpoint} referenced unknown import {eref}"
            ))
            .into());
        }
        // First export from this endpoint: mint the kernel-side identity.
        let kref = match eref.kind() {
            RefKind::Object => KRef::Object(self.store.add_object(endpoint)?),
            RefKind::Promise => KRef::Promise(self.store.add_promise(Some(endpoint))?),
        };
        self.store.add_clist_entry(endpoint, kref, eref, true)?;
        if let KRef::Promise(kpid) = kref {
            self.store.inc_promise_refcount(kpid)?;
        }
        trace!(%endpoint, %eref, %kref, "allocated export");
        Ok(kref)
    }

    /// Translates a kernel ref into an endpoint's namespace, as when
    /// delivering into that endpoint.
    ///
    /// With `alloc_if_missing`, a missing entry is allocated; otherwise
    /// `None` is returned. `make_reachable` marks the entry reachable,
    /// which sends and notifies require.
    pub fn translate_ref_k_to_e(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
        alloc_if_missing: bool,
        make_reachable: bool,
    ) -> CrankResult<Option<ERef>> {
        if let Some((eref, reachable)) = self.store.clist_entry_by_kref(endpoint, kref)? {
            if make_reachable && !reachable && eref.kind() == RefKind::Object {
                self.store.set_clist_reachable(endpoint, kref, true)?;
                if eref.dir() == RefDir::Import {
                    self.adjust_object_counts(kref, 1, 0)?;
                }
            }
            return Ok(Some(eref));
        }
        if !alloc_if_missing {
            return Ok(None);
        }
        let eref = match kref {
            KRef::Object(_) => {
                let index = self.store.alloc_endpoint_object_index(endpoint)?;
                let eref = ERef::object(RefDir::Import, index);
                self.store
                    .add_clist_entry(endpoint, kref, eref, make_reachable)?;
                // First contact takes one recognizable ref, plus one
                // reachable ref when the entry starts reachable.
                self.adjust_object_counts(kref, if make_reachable { 1 } else { 0 }, 1)?;
                eref
            }
            KRef::Promise(kpid) => {
                let dir = if self.store.promise_decider(kpid)? == Some(endpoint) {
                    RefDir::Export
                } else {
                    RefDir::Import
                };
                let index = self.store.alloc_endpoint_promise_index(endpoint)?;
                let eref = ERef::promise(dir, index);
                self.store
                    .add_clist_entry(endpoint, kref, eref, make_reachable)?;
                self.store.inc_promise_refcount(kpid)?;
                eref
            }
        };
        trace!(%endpoint, %kref, %eref, "allocated import");
        Ok(Some(eref))
    }

    /// K→E translation that always allocates; the entry is guaranteed
    /// to exist afterwards.
    pub fn import_ref_k_to_e(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> CrankResult<ERef> {
        match self.translate_ref_k_to_e(endpoint, kref, true, true)? {
            Some(eref) => Ok(eref),
            None => Err(StoreError::corrupt(
                format!("clk.{endpoint}.{kref}"),
                "allocation produced no entry",
            )
            .into()),
        }
    }

    /// Translates every slot of a capdata value E→K.
    pub fn translate_capdata_e_to_k(
        &mut self,
        endpoint: EndpointId,
        data: &CapData,
    ) -> CrankResult<CapData> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for slot in &data.slots {
            let eref: ERef = slot.parse().map_err(|_| {
                VatFatalError::invalid_syscall(format!("{endpoint} sent bad slot {slot:?}"))
            })?;
            slots.push(self.translate_ref_e_to_k(endpoint, eref)?.to_string());
        }
        Ok(CapData::new(data.body.clone(), slots))
    }

    /// Translates every slot of a capdata value K→E, allocating imports
    /// and making them reachable.
    pub fn translate_capdata_k_to_e(
        &mut self,
        endpoint: EndpointId,
        data: &CapData,
    ) -> CrankResult<CapData> {
        let mut slots = Vec::with_capacity(data.slots.len());
        for slot in &data.slots {
            let kref: KRef = slot
                .parse()
                .map_err(|e: ocap_core::CoreError| StoreError::corrupt("capdata", e.to_string()))?;
            slots.push(self.import_ref_k_to_e(endpoint, kref)?.to_string());
        }
        Ok(CapData::new(data.body.clone(), slots))
    }

    /// Translates a syscall message body E→K: args slots and the result
    /// promise. The target is translated separately by the caller.
    pub fn translate_message_e_to_k(
        &mut self,
        endpoint: EndpointId,
        message: &VatMessage,
    ) -> CrankResult<Message> {
        let args = self.translate_capdata_e_to_k(endpoint, &message.args)?;
        let result = match message.result {
            None => None,
            Some(eref) => {
                if eref.kind() != RefKind::Promise {
                    return Err(VatFatalError::invalid_syscall(format!(
                        "{endpoint} used non-promise result {eref}"
                    ))
                    .into());
                }
                let kref = self.translate_ref_e_to_k(endpoint, eref)?;
                let kpid = kref.as_promise().ok_or_else(|| {
                    StoreError::corrupt(
                        format!("cle.{endpoint}.{eref}"),
                        "promise eref mapped to object",
                    )
                })?;
                match self.store.promise_state(kpid)? {
                    Some(ocap_core::PromiseState::Unresolved) => {}
                    _ => {
                        return Err(VatFatalError::invalid_syscall(format!(
                            "{endpoint} used settled promise {eref} as result"
                        ))
                        .into())
                    }
                }
                if self.store.promise_decider(kpid)? != Some(endpoint) {
                    return Err(VatFatalError::invalid_syscall(format!(
                        "{endpoint} does not hold the result promise {eref}"
                    ))
                    .into());
                }
                Some(kpid)
            }
        };
        Ok(Message {
            method: message.method.clone(),
            args,
            result,
        })
    }

    /// Translates a kernel message K→E for delivery into an endpoint.
    pub fn translate_message_k_to_e(
        &mut self,
        endpoint: EndpointId,
        message: &Message,
    ) -> CrankResult<VatMessage> {
        let args = self.translate_capdata_k_to_e(endpoint, &message.args)?;
        let result = match message.result {
            None => None,
            Some(kpid) => Some(self.import_ref_k_to_e(endpoint, KRef::Promise(kpid))?),
        };
        Ok(VatMessage {
            method: message.method.clone(),
            args,
            result,
        })
    }

    /// Reads the reachable flag of `endpoint`'s entry for `kref`.
    pub fn get_reachable_flag(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<Option<bool>, StoreError> {
        Ok(self
            .store
            .clist_entry_by_kref(endpoint, kref)?
            .map(|(_, reachable)| reachable))
    }

    /// Clears the reachable flag on `endpoint`'s entry for `kref`.
    ///
    /// For an importing entry this releases one reachable ref; at zero
    /// the object lands in the maybe-free set. A missing or already
    /// clear entry is a no-op.
    pub fn clear_reachable_flag(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<(), StoreError> {
        if let Some((eref, true)) = self.store.clist_entry_by_kref(endpoint, kref)? {
            self.store.set_clist_reachable(endpoint, kref, false)?;
            if eref.kind() == RefKind::Object && eref.dir() == RefDir::Import {
                self.adjust_object_counts(kref, -1, 0)?;
            }
        }
        Ok(())
    }

    /// Removes the entry for `kref` in both directions, releasing the
    /// refs the entry held.
    pub fn forget_kref(&mut self, endpoint: EndpointId, kref: KRef) -> Result<(), StoreError> {
        let entry = self.store.clist_entry_by_kref(endpoint, kref)?;
        let (eref, reachable) = match entry {
            Some(entry) => entry,
            None => return Ok(()),
        };
        self.store.forget_clist_entry(endpoint, kref)?;
        match kref {
            KRef::Object(_) => {
                if eref.dir() == RefDir::Import {
                    self.adjust_object_counts(kref, if reachable { -1 } else { 0 }, -1)?;
                }
            }
            KRef::Promise(kpid) => {
                self.store.dec_promise_refcount(kpid)?;
            }
        }
        self.note_maybe_free(kref);
        Ok(())
    }

    /// Removes the entry for `eref` in both directions.
    pub fn forget_eref(&mut self, endpoint: EndpointId, eref: ERef) -> Result<(), StoreError> {
        if let Some(kref) = self.store.clist_entry_by_eref(endpoint, eref)? {
            self.forget_kref(endpoint, kref)?;
        }
        Ok(())
    }

    /// True when `endpoint`'s c-list has an entry for `kref`.
    pub fn has_clist_entry(
        &mut self,
        endpoint: EndpointId,
        kref: KRef,
    ) -> Result<bool, StoreError> {
        Ok(self.store.clist_entry_by_kref(endpoint, kref)?.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocap_core::VatId;
    use ocap_store::{KernelStore, MemoryKVStore};
    use std::sync::Arc;

    fn state() -> KernelState {
        KernelState::new(KernelStore::open(Arc::new(MemoryKVStore::new())).unwrap())
    }

    fn vat(n: u64) -> EndpointId {
        EndpointId::Vat(VatId::new(n))
    }

    #[test]
    fn test_export_allocates_kernel_object() {
        let mut state = state();
        let v1 = vat(1);
        let eref: ERef = "o+3".parse().unwrap();
        let kref = state.translate_ref_e_to_k(v1, eref).unwrap();
        assert!(kref.is_object());
        let koid = kref.as_object().unwrap();
        assert_eq!(state.store.object_owner(koid).unwrap(), Some(v1));
        // The exporter's own entry takes no refs.
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 0)));
        // Same eref translates to the same kref.
        assert_eq!(state.translate_ref_e_to_k(v1, eref).unwrap(), kref);
    }

    #[test]
    fn test_export_allocates_kernel_promise_with_decider() {
        let mut state = state();
        let v1 = vat(1);
        let eref: ERef = "p+2".parse().unwrap();
        let kref = state.translate_ref_e_to_k(v1, eref).unwrap();
        let kpid = kref.as_promise().unwrap();
        assert_eq!(state.store.promise_decider(kpid).unwrap(), Some(v1));
        // The exporter's c-list entry holds one ref.
        assert_eq!(state.store.promise_refcount(kpid).unwrap(), 1);
    }

    #[test]
    fn test_unknown_import_is_vat_fatal() {
        let mut state = state();
        let result = state.translate_ref_e_to_k(vat(1), "o-9".parse().unwrap());
        assert!(matches!(
            result,
            Err(crate::error::CrankError::VatFatal(
                VatFatalError::InvalidSyscall { .. }
            ))
        ));
    }

    #[test]
    fn test_import_allocation_counts_and_round_trip() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        // v2 exports an object, then it is delivered into v1.
        let kref = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        let eref = state
            .translate_ref_k_to_e(v1, kref, true, true)
            .unwrap()
            .unwrap();
        assert_eq!(eref.to_string(), "o-1");
        let koid = kref.as_object().unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((1, 1)));
        // Ref-round-trip property.
        assert_eq!(state.translate_ref_e_to_k(v1, eref).unwrap(), kref);
        assert_eq!(
            state.translate_ref_k_to_e(v1, kref, false, false).unwrap(),
            Some(eref)
        );
        // A second importer allocates independently.
        let v3 = vat(3);
        let eref3 = state
            .translate_ref_k_to_e(v3, kref, true, true)
            .unwrap()
            .unwrap();
        assert_eq!(eref3.to_string(), "o-1");
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((2, 2)));
    }

    #[test]
    fn test_promise_import_direction_follows_decider() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = state
            .translate_ref_e_to_k(v1, "p+5".parse().unwrap())
            .unwrap();
        // v2 is not the decider: import direction.
        let eref = state
            .translate_ref_k_to_e(v2, kref, true, true)
            .unwrap()
            .unwrap();
        assert_eq!(eref.to_string(), "p-1");
        // A promise decided by the receiver renders as an export.
        let kpid = state.store.add_promise(Some(v2)).unwrap();
        let eref = state
            .translate_ref_k_to_e(v2, KRef::Promise(kpid), true, true)
            .unwrap()
            .unwrap();
        assert_eq!(eref.to_string(), "p+2");
    }

    #[test]
    fn test_missing_entry_without_alloc_returns_none() {
        let mut state = state();
        let kref = state
            .translate_ref_e_to_k(vat(1), "o+1".parse().unwrap())
            .unwrap();
        assert_eq!(
            state.translate_ref_k_to_e(vat(2), kref, false, false).unwrap(),
            None
        );
    }

    #[test]
    fn test_clear_reachable_decrements_and_marks_maybe_free() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        state.translate_ref_k_to_e(v1, kref, true, true).unwrap();
        let koid = kref.as_object().unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((1, 1)));

        state.clear_reachable_flag(v1, kref).unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 1)));
        assert_eq!(state.get_reachable_flag(v1, kref).unwrap(), Some(false));
        assert!(state.maybe_free.contains(&kref));
        // Clearing again is a no-op.
        state.clear_reachable_flag(v1, kref).unwrap();
        assert_eq!(state.store.object_refcounts(koid).unwrap(), Some((0, 1)));
    }

    #[test]
    fn test_using_dropped_import_is_vat_fatal() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        let eref = state
            .translate_ref_k_to_e(v1, kref, true, true)
            .unwrap()
            .unwrap();
        state.clear_reachable_flag(v1, kref).unwrap();
        assert!(matches!(
            state.translate_ref_e_to_k(v1, eref),
            Err(crate::error::CrankError::VatFatal(
                VatFatalError::InvalidSyscall { .. }
            ))
        ));
    }

    #[test]
    fn test_redelivery_restores_reachability() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        state.translate_ref_k_to_e(v1, kref, true, true).unwrap();
        state.clear_reachable_flag(v1, kref).unwrap();
        // Delivering the object again revives the existing entry.
        let eref = state
            .translate_ref_k_to_e(v1, kref, true, true)
            .unwrap()
            .unwrap();
        assert_eq!(eref.to_string(), "o-1");
        assert_eq!(
            state
                .store
                .object_refcounts(kref.as_object().unwrap())
                .unwrap(),
            Some((1, 1))
        );
    }

    #[test]
    fn test_forget_kref_releases_entry_refs() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let kref = state
            .translate_ref_e_to_k(v2, "o+1".parse().unwrap())
            .unwrap();
        let eref = state
            .translate_ref_k_to_e(v1, kref, true, true)
            .unwrap()
            .unwrap();
        state.forget_kref(v1, kref).unwrap();
        assert!(!state.has_clist_entry(v1, kref).unwrap());
        assert_eq!(state.store.clist_entry_by_eref(v1, eref).unwrap(), None);
        assert_eq!(
            state
                .store
                .object_refcounts(kref.as_object().unwrap())
                .unwrap(),
            Some((0, 0))
        );
        // The exporter's entry releases nothing.
        state.forget_kref(v2, kref).unwrap();
        assert_eq!(
            state
                .store
                .object_refcounts(kref.as_object().unwrap())
                .unwrap(),
            Some((0, 0))
        );
    }

    #[test]
    fn test_message_translation_round_trip() {
        let mut state = state();
        let (v1, v2) = (vat(1), vat(2));
        let message = VatMessage {
            method: "foo".into(),
            args: CapData::new("[\"x\"]", vec!["o+7".into()]),
            result: Some("p+2".parse().unwrap()),
        };
        let kernel_message = state.translate_message_e_to_k(v1, &message).unwrap();
        assert_eq!(kernel_message.method, "foo");
        assert_eq!(kernel_message.args.slots, vec!["ko1".to_string()]);
        let kpid = kernel_message.result.unwrap();
        assert_eq!(state.store.promise_decider(kpid).unwrap(), Some(v1));

        let delivered = state.translate_message_k_to_e(v2, &kernel_message).unwrap();
        assert_eq!(delivered.args.slots, vec!["o-1".to_string()]);
        assert_eq!(delivered.result.unwrap().to_string(), "p-1");
    }
}
