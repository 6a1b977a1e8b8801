// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// vat.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! Vat lifecycle and the syscall dispatcher.
//!
//! A [`VatHandle`] owns one worker channel. Deliveries are correlated
//! requests; while a delivery is in flight the worker may issue
//! syscalls, which are applied to kernel state in arrival order before
//! the delivery acknowledgement is accepted.
//!
//! The syscall operations themselves are endpoint-generic
//! [`KernelState`] methods, because a remote peer's inbound messages
//! are routed through the same code with the peer as the endpoint.

use crate::config::VatConfig;
use crate::error::{CrankResult, VatFatalError};
use crate::state::KernelState;
use crate::worker::{
    KernelToVat, VatCommand, VatConnection, VatDelivery, VatMessage, VatResolution, VatSyscall,
    VatToKernel, VatWorker, WireResult,
};
use ocap_core::{EndpointId, ERef, KRef, RefDir, RefKind, Resolution, RunQueueItem, VatId};
use tracing::{debug, info, warn};

/// Outcome of one syscall, as reported back to the worker.
pub(crate) enum SyscallOutcome {
    /// The syscall succeeded, optionally with a value.
    Value(Option<String>),
    /// The syscall was refused but the vat lives on.
    Refused(String),
}

/// One live vat and its worker channel.
pub struct VatHandle {
    vat_id: VatId,
    conn: Box<dyn VatConnection>,
    next_request: u64,
}

impl VatHandle {
    /// Launches a worker for `vat_id` and runs the boot handshake:
    /// supervisor init, liveness ping, CapTP bootstrap.
    pub async fn launch(
        worker: &dyn VatWorker,
        state: &mut KernelState,
        vat_id: VatId,
        config: &VatConfig,
    ) -> CrankResult<Self> {
        let conn = worker
            .launch(vat_id, config)
            .await
            .map_err(|e| VatFatalError::StreamRead { message: e.message })?;
        let mut handle = VatHandle {
            vat_id,
            conn,
            next_request: 1,
        };
        handle
            .call(
                state,
                VatCommand::InitSupervisor {
                    config: config.clone(),
                },
            )
            .await?;
        let pong = handle.call(state, VatCommand::Ping).await?;
        if pong != "pong" {
            return Err(VatFatalError::StreamRead {
                message: format!("bad ping reply: {pong:?}"),
            }
            .into());
        }
        handle.call(state, VatCommand::CaptpInit).await?;
        info!(vat = %vat_id, name = %config.name, "vat launched");
        Ok(handle)
    }

    /// The vat this handle drives.
    pub fn vat_id(&self) -> VatId {
        self.vat_id
    }

    /// Injects one delivery and awaits its acknowledgement.
    pub async fn deliver(
        &mut self,
        state: &mut KernelState,
        delivery: VatDelivery,
    ) -> CrankResult<()> {
        self.call(state, VatCommand::Deliver(delivery)).await?;
        Ok(())
    }

    /// Sends one correlated request and pumps the channel until its
    /// reply arrives, servicing interleaved syscalls.
    async fn call(&mut self, state: &mut KernelState, command: VatCommand) -> CrankResult<String> {
        let id = format!("{}:{}", self.vat_id, self.next_request);
        self.next_request += 1;
        self.conn
            .send(KernelToVat::Request {
                id: id.clone(),
                command,
            })
            .await
            .map_err(|e| VatFatalError::StreamRead { message: e.message })?;
        loop {
            let message = self
                .conn
                .recv()
                .await
                .map_err(|e| VatFatalError::StreamRead { message: e.message })?;
            match message {
                VatToKernel::Reply { id: reply_id, result } if reply_id == id => {
                    return result.into_result().map_err(|message| {
                        VatFatalError::StreamRead {
                            message: format!("vat rejected {id}: {message}"),
                        }
                        .into()
                    });
                }
                VatToKernel::Reply { id: reply_id, .. } => {
                    warn!(vat = %self.vat_id, %reply_id, "dropping uncorrelated reply");
                }
                VatToKernel::Syscall { id: syscall_id, syscall } => {
                    let outcome = handle_syscall(state, self.vat_id, syscall)?;
                    let result = match outcome {
                        SyscallOutcome::Value(value) => WireResult::Ok(value),
                        SyscallOutcome::Refused(message) => WireResult::Err(message),
                    };
                    self.conn
                        .send(KernelToVat::SyscallReply {
                            id: syscall_id,
                            result,
                        })
                        .await
                        .map_err(|e| VatFatalError::StreamRead { message: e.message })?;
                }
            }
        }
    }
}

/// Applies one vat syscall, translating E→K at the boundary.
pub(crate) fn handle_syscall(
    state: &mut KernelState,
    vat_id: VatId,
    syscall: VatSyscall,
) -> CrankResult<SyscallOutcome> {
    let endpoint = EndpointId::Vat(vat_id);
    match syscall {
        VatSyscall::Send { target, message } => {
            state.syscall_send(endpoint, target, &message)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::Subscribe { eref } => {
            state.syscall_subscribe(endpoint, eref)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::Resolve { resolutions } => {
            state.syscall_resolve(endpoint, &resolutions)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::DropImports { erefs } => {
            state.syscall_drop_imports(endpoint, &erefs)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::RetireImports { erefs } => {
            state.syscall_retire_imports(endpoint, &erefs)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::RetireExports { erefs } => {
            state.syscall_retire_exports(endpoint, &erefs)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::AbandonExports { erefs } => {
            state.syscall_abandon_exports(endpoint, &erefs)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::VatstoreGet { key } => {
            let value = state.store().vatstore_get(vat_id, &key)?;
            Ok(SyscallOutcome::Value(value))
        }
        VatSyscall::VatstoreSet { key, value } => {
            state.store().vatstore_set(vat_id, &key, &value)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::VatstoreDelete { key } => {
            state.store().vatstore_delete(vat_id, &key)?;
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::VatstoreGetNextKey { key } => {
            let next = state.store().vatstore_get_next_key(vat_id, &key)?;
            Ok(SyscallOutcome::Value(next))
        }
        VatSyscall::Exit { is_failure, .. } => {
            info!(vat = %vat_id, is_failure, "vat requested exit");
            state.pending_exits.push(vat_id);
            Ok(SyscallOutcome::Value(None))
        }
        VatSyscall::CallNow { target, method } => {
            warn!(vat = %vat_id, %target, %method, "callNow refused");
            Ok(SyscallOutcome::Refused(
                "callNow not supported: the kernel exposes no devices".into(),
            ))
        }
    }
}

impl KernelState {
    /// Validates and enqueues a send from `endpoint`.
    pub(crate) fn syscall_send(
        &mut self,
        endpoint: EndpointId,
        target: ERef,
        message: &VatMessage,
    ) -> CrankResult<()> {
        let target_kref = self.translate_ref_e_to_k(endpoint, target)?;
        let kernel_message = self.translate_message_e_to_k(endpoint, message)?;
        debug!(%endpoint, %target_kref, method = %kernel_message.method, "syscall send");
        self.enqueue_run(RunQueueItem::Send {
            target: target_kref,
            message: kernel_message,
        })?;
        Ok(())
    }

    /// Subscribes `endpoint` to a promise it can reach.
    pub(crate) fn syscall_subscribe(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> CrankResult<()> {
        if eref.kind() != RefKind::Promise {
            return Err(VatFatalError::invalid_syscall(format!(
                "{endpoint} subscribed to non-promise {eref}"
            ))
            .into());
        }
        let kref = self.translate_ref_e_to_k(endpoint, eref)?;
        let kpid = kref.as_promise().ok_or_else(|| {
            ocap_store::StoreError::corrupt(
                format!("cle.{endpoint}.{eref}"),
                "promise eref mapped to object",
            )
        })?;
        self.subscribe(endpoint, kpid)
    }

    /// Applies a resolve batch from `endpoint`, then retires the
    /// resolver's own c-list entries for the settled promises.
    pub(crate) fn syscall_resolve(
        &mut self,
        endpoint: EndpointId,
        resolutions: &[VatResolution],
    ) -> CrankResult<()> {
        let mut kernel_resolutions: Vec<Resolution> = Vec::with_capacity(resolutions.len());
        for resolution in resolutions {
            if resolution.target.kind() != RefKind::Promise {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} resolved non-promise {}",
                    resolution.target
                ))
                .into());
            }
            let kref = self.translate_ref_e_to_k(endpoint, resolution.target)?;
            let kpid = kref.as_promise().ok_or_else(|| {
                ocap_store::StoreError::corrupt(
                    format!("cle.{endpoint}.{}", resolution.target),
                    "promise eref mapped to object",
                )
            })?;
            let value = self.translate_capdata_e_to_k(endpoint, &resolution.value)?;
            kernel_resolutions.push(Resolution {
                kpid,
                rejected: resolution.rejected,
                value,
            });
        }
        self.resolve_promises(endpoint, &kernel_resolutions)?;
        for resolution in &kernel_resolutions {
            self.forget_kref(endpoint, KRef::Promise(resolution.kpid))?;
        }
        Ok(())
    }

    fn require_entry(
        &mut self,
        endpoint: EndpointId,
        eref: ERef,
    ) -> CrankResult<KRef> {
        self.store
            .clist_entry_by_eref(endpoint, eref)?
            .ok_or_else(|| {
                VatFatalError::invalid_syscall(format!(
                    "{endpoint} named unknown ref {eref}"
                ))
                .into()
            })
    }

    /// Clears reachability on imported objects.
    pub(crate) fn syscall_drop_imports(
        &mut self,
        endpoint: EndpointId,
        erefs: &[ERef],
    ) -> CrankResult<()> {
        for &eref in erefs {
            if eref.kind() != RefKind::Object || eref.dir() != RefDir::Import {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} dropped non-import {eref}"
                ))
                .into());
            }
            let kref = self.require_entry(endpoint, eref)?;
            self.clear_reachable_flag(endpoint, kref)?;
        }
        Ok(())
    }

    /// Forgets imported objects that were already dropped.
    pub(crate) fn syscall_retire_imports(
        &mut self,
        endpoint: EndpointId,
        erefs: &[ERef],
    ) -> CrankResult<()> {
        for &eref in erefs {
            if eref.kind() != RefKind::Object || eref.dir() != RefDir::Import {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} retired non-import {eref}"
                ))
                .into());
            }
            let kref = self.require_entry(endpoint, eref)?;
            if self.get_reachable_flag(endpoint, kref)? == Some(true) {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} retired still-reachable import {eref}"
                ))
                .into());
            }
            self.forget_kref(endpoint, kref)?;
        }
        Ok(())
    }

    /// Forgets exports whose dropExport the endpoint has acknowledged.
    pub(crate) fn syscall_retire_exports(
        &mut self,
        endpoint: EndpointId,
        erefs: &[ERef],
    ) -> CrankResult<()> {
        for &eref in erefs {
            if eref.dir() != RefDir::Export || eref.kind() != RefKind::Object {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} retired non-export {eref}"
                ))
                .into());
            }
            let kref = self.require_entry(endpoint, eref)?;
            if self.get_reachable_flag(endpoint, kref)? == Some(true) {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} retired still-reachable export {eref}"
                ))
                .into());
            }
            self.forget_kref(endpoint, kref)?;
        }
        Ok(())
    }

    /// Forgets exports unconditionally, orphaning the objects.
    pub(crate) fn syscall_abandon_exports(
        &mut self,
        endpoint: EndpointId,
        erefs: &[ERef],
    ) -> CrankResult<()> {
        for &eref in erefs {
            if eref.dir() != RefDir::Export {
                return Err(VatFatalError::invalid_syscall(format!(
                    "{endpoint} abandoned non-export {eref}"
                ))
                .into());
            }
            if let Some(kref) = self.store.clist_entry_by_eref(endpoint, eref)? {
                self.forget_kref(endpoint, kref)?;
                if let Some(koid) = kref.as_object() {
                    if self.store.object_owner(koid)? == Some(endpoint) {
                        self.store.delete_object_owner(koid)?;
                        self.note_maybe_free(kref);
                    }
                }
            }
        }
        Ok(())
    }

}
