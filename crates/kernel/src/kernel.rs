// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// kernel.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! The kernel facade and its crank loop.
//!
//! One [`Kernel`] owns the whole state and runs one crank at a time:
//! pick the next work item (pending GC actions first, then due reaps,
//! then the run-queue head), deliver it to the owning endpoint, harvest
//! the maybe-free set, commit. External inputs (inbound peer traffic,
//! embedder sends) serialise onto the kernel's single-reader input
//! channel and are drained between cranks.

use crate::config::{KernelConfig, VatConfig};
use crate::endpoint::EndpointHandle;
use crate::error::{CrankError, KernelError, Result};
use crate::gc::CLEANUP_BUDGET;
use crate::remote::{RemoteComms, RemoteHandle};
use crate::state::KernelState;
use crate::url::OcapUrl;
use crate::vat::VatHandle;
use crate::worker::{VatMessage, VatResolution, VatWorker};
use ocap_core::{
    CapData, EndpointId, ERef, KPromiseId, KRef, Message, PromiseState, RefDir, RemoteId,
    Resolution, RunQueueItem, VatId,
};
use ocap_store::{KernelStore, KVStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// How long a remote URL redemption may stay outstanding.
pub const REDEEM_TIMEOUT: Duration = Duration::from_secs(30);

/// External events funnelled into the crank loop.
#[derive(Debug)]
pub enum KernelInput {
    /// An inbound record from a peer kernel.
    RemoteMessage {
        /// The sending peer's wire identity.
        peer: String,
        /// The JSON record.
        json: String,
    },
}

/// Requests the kernel to stop after the current crank.
#[derive(Clone)]
pub struct KernelAbort {
    flag: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl KernelAbort {
    /// Signals the abort. Idempotent.
    pub fn abort(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// An outstanding remote URL redemption.
pub struct RedemptionTicket {
    peer: String,
    receiver: oneshot::Receiver<Result<KRef>>,
}

impl RedemptionTicket {
    /// Awaits the peer's answer, bounded by [`REDEEM_TIMEOUT`].
    pub async fn wait(self) -> Result<KRef> {
        match timeout(REDEEM_TIMEOUT, self.receiver).await {
            Err(_) => Err(KernelError::RemoteRedeemTimeout { peer: self.peer }),
            Ok(Err(_)) => Err(KernelError::Aborted),
            Ok(Ok(result)) => result,
        }
    }

    /// A ticket that is already settled, for local redemptions.
    fn settled(peer: String, result: Result<KRef>) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        RedemptionTicket { peer, receiver }
    }
}

struct PendingRedemption {
    peer: String,
    sender: oneshot::Sender<Result<KRef>>,
}

/// A point-in-time summary of kernel state.
#[derive(Clone, Debug, Default, serde::Serialize)]
pub struct KernelStatus {
    /// Live vats and their names.
    pub vats: Vec<(VatId, String)>,
    /// Registered remote peers.
    pub remotes: Vec<(RemoteId, String)>,
    /// Items waiting on the run queue.
    pub run_queue_length: u64,
    /// Pending GC actions.
    pub gc_action_count: usize,
    /// Endpoints queued for a reap.
    pub reap_queue_length: usize,
    /// Vats whose cleanup sweep is still running.
    pub terminated_vats: Vec<VatId>,
}

/// The ocap kernel.
pub struct Kernel {
    state: KernelState,
    endpoints: HashMap<EndpointId, EndpointHandle>,
    vat_names: HashMap<String, VatId>,
    worker: Arc<dyn VatWorker>,
    comms: Arc<dyn RemoteComms>,
    config: KernelConfig,
    input_tx: mpsc::UnboundedSender<KernelInput>,
    input_rx: mpsc::UnboundedReceiver<KernelInput>,
    wakeup: Arc<Notify>,
    abort_flag: Arc<AtomicBool>,
    abort_notify: Arc<Notify>,
    pending_redemptions: HashMap<String, PendingRedemption>,
    next_reply_key: u64,
}

impl Kernel {
    /// Opens kernel state in `kv` and registers previously known peers.
    /// Call [`Kernel::init`] next to launch vats.
    pub fn new(
        kv: Arc<dyn KVStore>,
        worker: Arc<dyn VatWorker>,
        comms: Arc<dyn RemoteComms>,
        config: KernelConfig,
    ) -> Result<Self> {
        let store = KernelStore::open(kv)?;
        let state = KernelState::new(store);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let mut kernel = Kernel {
            state,
            endpoints: HashMap::new(),
            vat_names: HashMap::new(),
            worker,
            comms,
            config,
            input_tx,
            input_rx,
            wakeup: Arc::new(Notify::new()),
            abort_flag: Arc::new(AtomicBool::new(false)),
            abort_notify: Arc::new(Notify::new()),
            pending_redemptions: HashMap::new(),
            next_reply_key: 1,
        };
        for (remote_id, peer) in kernel.state.store.remote_peers()? {
            kernel.endpoints.insert(
                EndpointId::Remote(remote_id),
                EndpointHandle::Remote(RemoteHandle::new(remote_id, peer, kernel.comms.clone())),
            );
        }
        Ok(kernel)
    }

    /// Launches vats: the configured initial set on first start, or the
    /// persisted set after a restart.
    pub async fn init(&mut self) -> Result<()> {
        let configured = self.state.store.configured_vats()?;
        if configured.is_empty() {
            for config in self.config.vats.clone() {
                self.launch_vat(config).await?;
            }
        } else {
            for vat in configured {
                let json = self.state.store.vat_config(vat)?.ok_or(
                    ocap_store::StoreError::MissingKey {
                        key: format!("vatConfig.{vat}"),
                    },
                )?;
                let config: VatConfig = serde_json::from_str(&json).map_err(|e| {
                    ocap_store::StoreError::corrupt(format!("vatConfig.{vat}"), e.to_string())
                })?;
                self.relaunch_vat(vat, config).await?;
            }
        }
        Ok(())
    }

    /// A handle that stops the crank loop.
    pub fn abort_handle(&self) -> KernelAbort {
        KernelAbort {
            flag: self.abort_flag.clone(),
            notify: self.abort_notify.clone(),
        }
    }

    /// Sender for external inputs (inbound peer traffic).
    pub fn input_sender(&self) -> mpsc::UnboundedSender<KernelInput> {
        self.input_tx.clone()
    }

    // === vat management ===

    /// Launches a new vat and returns its id and root object.
    pub async fn launch_vat(&mut self, config: VatConfig) -> Result<(VatId, KRef)> {
        if self.vat_names.contains_key(&config.name) {
            return Err(KernelError::VatAlreadyExists {
                name: config.name.clone(),
            });
        }
        let vat = self.state.store.alloc_vat_id()?;
        let json = serde_json::to_string(&config).map_err(|e| {
            ocap_store::StoreError::corrupt(format!("vatConfig.{vat}"), e.to_string())
        })?;
        self.state.store.set_vat_config(vat, &json)?;
        let root = self.boot_vat(vat, config).await?;
        self.state.store.commit()?;
        Ok((vat, root))
    }

    async fn relaunch_vat(&mut self, vat: VatId, config: VatConfig) -> Result<()> {
        match self.boot_vat(vat, config).await {
            Ok(_) => Ok(()),
            Err(KernelError::VatLaunchFailed { .. }) => {
                // The cleanup sweep already owns the vat.
                Ok(())
            }
            Err(error) => Err(error),
        }
    }

    async fn boot_vat(&mut self, vat: VatId, config: VatConfig) -> Result<KRef> {
        let endpoint = EndpointId::Vat(vat);
        let handle =
            match VatHandle::launch(self.worker.as_ref(), &mut self.state, vat, &config).await {
                Ok(handle) => handle,
                Err(CrankError::Store(error)) => return Err(error.into()),
                Err(CrankError::VatFatal(error)) => {
                    warn!(%vat, %error, "vat failed to launch");
                    self.terminate_vat_internal(vat)?;
                    return Err(KernelError::VatLaunchFailed {
                        vat,
                        message: error.to_string(),
                    });
                }
            };
        self.vat_names.insert(config.name.clone(), vat);
        self.endpoints.insert(endpoint, EndpointHandle::Vat(handle));
        // The vat's root object is its export o+0.
        let root = self
            .state
            .translate_ref_e_to_k(endpoint, ERef::object(RefDir::Export, 0))
            .map_err(|e| match e {
                CrankError::Store(error) => KernelError::Store(error),
                CrankError::VatFatal(error) => KernelError::VatLaunchFailed {
                    vat,
                    message: error.to_string(),
                },
            })?;
        Ok(root)
    }

    /// Terminates a vat on the embedder's request.
    pub fn terminate_vat(&mut self, vat: VatId) -> Result<()> {
        let endpoint = EndpointId::Vat(vat);
        if !self.endpoints.contains_key(&endpoint)
            && self.state.store.vat_config(vat)?.is_none()
        {
            return Err(KernelError::VatNotFound { vat });
        }
        self.terminate_vat_internal(vat)?;
        Ok(())
    }

    fn terminate_vat_internal(&mut self, vat: VatId) -> Result<()> {
        self.state.mark_vat_terminated(vat)?;
        self.endpoints.remove(&EndpointId::Vat(vat));
        self.vat_names.retain(|_, v| *v != vat);
        self.wakeup.notify_one();
        Ok(())
    }

    /// The id of the live vat named `name`.
    pub fn vat_named(&self, name: &str) -> Option<VatId> {
        self.vat_names.get(name).copied()
    }

    // === embedder API ===

    /// Enqueues a send from the embedder; the returned promise resolves
    /// with the outcome.
    pub fn queue_send(
        &mut self,
        target: KRef,
        method: &str,
        args: CapData,
    ) -> Result<KPromiseId> {
        let known = match target {
            KRef::Object(koid) => self.state.store.object_owner(koid)?.is_some(),
            KRef::Promise(kpid) => self.state.store.promise_state(kpid)?.is_some(),
        };
        if !known {
            return Err(KernelError::UnknownKref { kref: target });
        }
        let kpid = self.state.store.add_promise(None)?;
        // The embedder holds the result externally, so the kernel pins
        // it; release_promise drops the pin when the caller is done.
        self.state.pin_object(KRef::Promise(kpid))?;
        self.state.enqueue_run(RunQueueItem::Send {
            target,
            message: Message::new(method, args, Some(kpid)),
        })?;
        self.state.store.commit()?;
        self.wakeup.notify_one();
        Ok(kpid)
    }

    /// Releases the kernel's pin on a promise handed out by
    /// [`Kernel::queue_send`], letting it be collected once unreferenced.
    ///
    /// Runs as its own mini-crank: the freed refs are harvested and the
    /// change committed immediately.
    pub fn release_promise(&mut self, kpid: KPromiseId) -> Result<bool> {
        let released = self.state.unpin_object(KRef::Promise(kpid))?;
        self.state.harvest_refcounts()?;
        self.state.store.commit()?;
        self.wakeup.notify_one();
        Ok(released)
    }

    /// Registers a kernel-internal waiter for `kpid`.
    ///
    /// A waiter on an already settled promise fires immediately.
    pub fn wait_for_resolution(
        &mut self,
        kpid: KPromiseId,
    ) -> Result<oneshot::Receiver<Resolution>> {
        let (sender, receiver) = oneshot::channel();
        match self.state.store.promise_state(kpid)? {
            None => return Err(KernelError::UnknownPromise { kpid }),
            Some(PromiseState::Unresolved) => self.state.add_waiter(kpid, sender),
            Some(state) => {
                let value = self.state.store.promise_value(kpid)?.unwrap_or_default();
                let _ = sender.send(Resolution {
                    kpid,
                    rejected: state == PromiseState::Rejected,
                    value,
                });
            }
        }
        Ok(receiver)
    }

    /// Pins `kref` as a GC root.
    pub fn pin_object(&mut self, kref: KRef) -> Result<bool> {
        let pinned = self.state.pin_object(kref)?;
        self.state.store.commit()?;
        Ok(pinned)
    }

    /// Releases a pin, harvesting whatever it freed.
    pub fn unpin_object(&mut self, kref: KRef) -> Result<bool> {
        let released = self.state.unpin_object(kref)?;
        self.state.harvest_refcounts()?;
        self.state.store.commit()?;
        self.wakeup.notify_one();
        Ok(released)
    }

    /// Queues a cooperative GC poll for `vat` ahead of user work.
    pub fn schedule_reap(&mut self, vat: VatId) -> Result<()> {
        self.state.schedule_reap(EndpointId::Vat(vat))?;
        self.state.store.commit()?;
        self.wakeup.notify_one();
        Ok(())
    }

    /// Summarises current kernel state.
    pub fn status(&mut self) -> Result<KernelStatus> {
        let mut vats: Vec<(VatId, String)> = self
            .vat_names
            .iter()
            .map(|(name, vat)| (*vat, name.clone()))
            .collect();
        vats.sort();
        Ok(KernelStatus {
            vats,
            remotes: self.state.store.remote_peers()?,
            run_queue_length: self.state.store.run_queue_length()?,
            gc_action_count: self.state.store.gc_actions()?.len(),
            reap_queue_length: self.state.store.reap_queue()?.len(),
            terminated_vats: self.state.store.terminated_vats()?,
        })
    }

    /// Administrative reset: drops every endpoint and wipes the store
    /// back to its first-start state.
    pub fn reset(&mut self) -> Result<()> {
        info!("kernel reset");
        self.endpoints.clear();
        self.vat_names.clear();
        self.state.drop_all_waiters();
        self.pending_redemptions.clear();
        self.state.store.reset()?;
        self.state.store.commit()?;
        Ok(())
    }

    // === ocap URLs ===

    fn self_peer(&self) -> Result<String> {
        self.config
            .self_peer
            .clone()
            .ok_or_else(|| KernelError::bad_ocap_url("no local peer identity"))
    }

    /// Issues an ocap URL naming `kref` at this kernel's peer identity.
    pub fn issue_ocap_url(&mut self, kref: KRef) -> Result<String> {
        let host = self.self_peer()?;
        let known = match kref {
            KRef::Object(koid) => self.state.store.object_owner(koid)?.is_some(),
            KRef::Promise(kpid) => self.state.store.promise_state(kpid)?.is_some(),
        };
        if !known {
            return Err(KernelError::UnknownKref { kref });
        }
        let oid = self.state.store.ocap_oid_for_kref(kref)?;
        Ok(OcapUrl::new(oid, host).to_string())
    }

    /// Redeems a URL that must name an object at this kernel.
    pub fn redeem_local_ocap_url(&mut self, url: &str) -> Result<KRef> {
        let parsed = OcapUrl::parse(url)?;
        if parsed.host != self.self_peer()? {
            return Err(KernelError::bad_ocap_url(
                "ocapURL from a host that's not me",
            ));
        }
        self.state
            .store
            .ocap_url_kref(&parsed.oid)?
            .ok_or_else(|| KernelError::bad_ocap_url("unknown ocapURL"))
    }

    /// Begins redeeming `url`: local URLs settle immediately, foreign
    /// ones ask the issuing peer and settle when its reply (or the
    /// timeout, or a give-up) arrives. The crank loop must be running
    /// for foreign redemptions to complete.
    pub async fn redeem_ocap_url(&mut self, url: &str) -> Result<RedemptionTicket> {
        let parsed = OcapUrl::parse(url)?;
        if Some(&parsed.host) == self.config.self_peer.as_ref() {
            let result = self.redeem_local_ocap_url(url);
            return Ok(RedemptionTicket::settled(parsed.host, result));
        }
        let remote_id = self.register_peer(&parsed.host)?;
        let reply_key = format!("rk{}", self.next_reply_key);
        self.next_reply_key += 1;
        let (sender, receiver) = oneshot::channel();
        self.pending_redemptions.insert(
            reply_key.clone(),
            PendingRedemption {
                peer: parsed.host.clone(),
                sender,
            },
        );
        if let Some(EndpointHandle::Remote(remote)) =
            self.endpoints.get(&EndpointId::Remote(remote_id))
        {
            remote
                .send_redeem_request(url, &reply_key)
                .await
                .map_err(|e| match e {
                    CrankError::Store(error) => KernelError::Store(error),
                    CrankError::VatFatal(error) => KernelError::RemoteRedeemFailed {
                        message: error.to_string(),
                    },
                })?;
        }
        Ok(RedemptionTicket {
            peer: parsed.host,
            receiver,
        })
    }

    /// Stops waiting on `peer`: every outstanding redemption against it
    /// is rejected.
    pub fn give_up_on_peer(&mut self, peer: &str) {
        let keys: Vec<String> = self
            .pending_redemptions
            .iter()
            .filter(|(_, pending)| pending.peer == peer)
            .map(|(key, _)| key.clone())
            .collect();
        for key in keys {
            if let Some(pending) = self.pending_redemptions.remove(&key) {
                let _ = pending.sender.send(Err(KernelError::RemoteGaveUp {
                    peer: peer.to_string(),
                }));
            }
        }
    }

    /// Registers `peer` as an endpoint, idempotently.
    pub fn register_peer(&mut self, peer: &str) -> Result<RemoteId> {
        let remote_id = match self.state.store.remote_id_for_peer(peer)? {
            Some(remote_id) => remote_id,
            None => self.state.store.add_remote(peer)?,
        };
        self.endpoints
            .entry(EndpointId::Remote(remote_id))
            .or_insert_with(|| {
                EndpointHandle::Remote(RemoteHandle::new(remote_id, peer, self.comms.clone()))
            });
        Ok(remote_id)
    }

    // === inbound peer traffic ===

    /// Routes one inbound record from `peer`.
    ///
    /// Malformed or invariant-violating input is logged and dropped; a
    /// peer cannot crash the kernel.
    pub async fn handle_remote_message(&mut self, peer: &str, json: &str) -> Result<()> {
        let remote_id = self.register_peer(peer)?;
        let endpoint = EndpointId::Remote(remote_id);
        let record: Value = match serde_json::from_str(json) {
            Ok(record) => record,
            Err(error) => {
                warn!(%peer, %error, "dropping unparseable remote record");
                return Ok(());
            }
        };
        let outcome = match record["method"].as_str() {
            Some("deliver") => self.handle_remote_deliver(endpoint, &record["params"]),
            Some("redeemURL") => {
                return self.handle_redeem_request(endpoint, &record["params"]).await
            }
            Some("redeemURLReply") => {
                self.handle_redeem_reply(endpoint, &record["params"]);
                Ok(())
            }
            other => {
                warn!(%peer, ?other, "dropping unknown remote method");
                Ok(())
            }
        };
        match outcome {
            Ok(()) => {
                self.state.store.commit()?;
                self.wakeup.notify_one();
                Ok(())
            }
            Err(CrankError::Store(error)) => Err(error.into()),
            Err(CrankError::VatFatal(error)) => {
                warn!(%peer, %error, "dropping invalid remote record");
                Ok(())
            }
        }
    }

    fn handle_remote_deliver(
        &mut self,
        endpoint: EndpointId,
        params: &Value,
    ) -> std::result::Result<(), CrankError> {
        let bad = |message: &str| {
            CrankError::VatFatal(crate::error::VatFatalError::invalid_syscall(message))
        };
        let kind = params[0].as_str().ok_or_else(|| bad("missing kind"))?;
        match kind {
            "message" => {
                let target = parse_wire_eref(&params[1]).ok_or_else(|| bad("bad target"))?;
                let message =
                    parse_wire_message(&params[2]).ok_or_else(|| bad("bad message"))?;
                self.state.syscall_send(endpoint, target, &message)
            }
            "notify" => {
                let entries = params[1].as_array().ok_or_else(|| bad("bad notify"))?;
                let mut resolutions = Vec::with_capacity(entries.len());
                for entry in entries {
                    resolutions
                        .push(parse_wire_resolution(entry).ok_or_else(|| bad("bad resolution"))?);
                }
                self.state.syscall_resolve(endpoint, &resolutions)
            }
            "dropExports" => {
                let erefs = parse_wire_erefs(&params[1]).ok_or_else(|| bad("bad erefs"))?;
                self.state.syscall_drop_imports(endpoint, &erefs)
            }
            "retireExports" => {
                let erefs = parse_wire_erefs(&params[1]).ok_or_else(|| bad("bad erefs"))?;
                self.state.syscall_retire_imports(endpoint, &erefs)
            }
            "retireImports" => {
                let erefs = parse_wire_erefs(&params[1]).ok_or_else(|| bad("bad erefs"))?;
                self.state.syscall_abandon_exports(endpoint, &erefs)
            }
            _ => Err(bad("unknown deliver kind")),
        }
    }

    async fn handle_redeem_request(
        &mut self,
        endpoint: EndpointId,
        params: &Value,
    ) -> Result<()> {
        let (url, reply_key) = match (params[0].as_str(), params[1].as_str()) {
            (Some(url), Some(reply_key)) => (url.to_string(), reply_key.to_string()),
            _ => {
                warn!("dropping malformed redeemURL request");
                return Ok(());
            }
        };
        let answer: Result<ERef> = match self.redeem_local_ocap_url(&url) {
            Ok(kref) => match self.state.import_ref_k_to_e(endpoint, kref) {
                Ok(eref) => Ok(eref),
                Err(CrankError::Store(error)) => return Err(error.into()),
                Err(CrankError::VatFatal(error)) => Err(KernelError::RemoteRedeemFailed {
                    message: error.to_string(),
                }),
            },
            Err(error) => Err(error),
        };
        if let Some(EndpointHandle::Remote(remote)) = self.endpoints.get(&endpoint) {
            let send_result = match &answer {
                Ok(eref) => {
                    remote
                        .send_redeem_reply(true, &reply_key, &eref.to_string())
                        .await
                }
                Err(error) => {
                    remote
                        .send_redeem_reply(false, &reply_key, &error.to_string())
                        .await
                }
            };
            if let Err(CrankError::Store(error)) = send_result {
                return Err(error.into());
            }
        }
        Ok(())
    }

    fn handle_redeem_reply(&mut self, endpoint: EndpointId, params: &Value) {
        let (success, reply_key) = match (params[0].as_bool(), params[1].as_str()) {
            (Some(success), Some(reply_key)) => (success, reply_key),
            _ => {
                warn!("dropping malformed redeemURLReply");
                return;
            }
        };
        let pending = match self.pending_redemptions.remove(reply_key) {
            Some(pending) => pending,
            None => {
                warn!(%reply_key, "dropping reply for unknown redemption");
                return;
            }
        };
        let result: Result<KRef> = if success {
            match parse_wire_eref(&params[2]) {
                Some(eref) => match self.state.translate_ref_e_to_k(endpoint, eref) {
                    Ok(kref) => Ok(kref),
                    Err(error) => Err(KernelError::RemoteRedeemFailed {
                        message: error.to_string(),
                    }),
                },
                None => Err(KernelError::RemoteRedeemFailed {
                    message: "malformed eref in reply".into(),
                }),
            }
        } else {
            Err(KernelError::RemoteRedeemFailed {
                message: params[2].as_str().unwrap_or("unknown error").to_string(),
            })
        };
        let _ = pending.sender.send(result);
    }

    // === the crank loop ===

    /// Runs cranks until aborted. Returns an error only on storage
    /// failure, which the embedding database must roll back.
    pub async fn run(&mut self) -> Result<()> {
        loop {
            while let Ok(input) = self.input_rx.try_recv() {
                self.handle_input(input).await?;
            }
            if self.abort_flag.load(Ordering::SeqCst) {
                self.shutdown();
                return Ok(());
            }
            if !self.crank().await? {
                let wakeup = self.wakeup.clone();
                let abort = self.abort_notify.clone();
                let input = tokio::select! {
                    _ = wakeup.notified() => None,
                    _ = abort.notified() => None,
                    input = self.input_rx.recv() => input,
                };
                if let Some(input) = input {
                    self.handle_input(input).await?;
                }
            }
        }
    }

    async fn handle_input(&mut self, input: KernelInput) -> Result<()> {
        match input {
            KernelInput::RemoteMessage { peer, json } => {
                self.handle_remote_message(&peer, &json).await
            }
        }
    }

    fn shutdown(&mut self) {
        info!("kernel aborted");
        self.state.drop_all_waiters();
        for (_, pending) in self.pending_redemptions.drain() {
            let _ = pending.sender.send(Err(KernelError::Aborted));
        }
    }

    /// Executes one crank: a terminated-vat cleanup step if due, then
    /// the highest-priority work item, then refcount harvest and
    /// commit. Returns false when there was nothing to do.
    pub async fn crank(&mut self) -> Result<bool> {
        let mut did_work = false;
        if !self.state.store.terminated_vats()?.is_empty() {
            did_work |= match self.state.terminated_cleanup_step(CLEANUP_BUDGET) {
                Ok(progressed) => progressed,
                Err(CrankError::Store(error)) => return Err(error.into()),
                Err(CrankError::VatFatal(error)) => {
                    warn!(%error, "cleanup step reported vat error");
                    true
                }
            };
        }
        let item = if let Some(item) = self.state.next_gc_action_item()? {
            Some(item)
        } else if let Some(item) = self.state.next_reap_item()? {
            Some(item)
        } else {
            self.state.store.run_dequeue()?
        };
        if let Some(item) = item {
            debug!(?item, "crank");
            self.deliver(item).await?;
            self.process_pending_exits()?;
            did_work = true;
        }
        if did_work {
            self.state.harvest_refcounts()?;
            self.state.store.commit()?;
        }
        Ok(did_work)
    }

    fn process_pending_exits(&mut self) -> Result<()> {
        let exits = std::mem::take(&mut self.state.pending_exits);
        for vat in exits {
            self.terminate_vat_internal(vat)?;
        }
        Ok(())
    }

    async fn deliver(&mut self, item: RunQueueItem) -> Result<()> {
        match item {
            RunQueueItem::Send { target, message } => self.deliver_send(target, message).await,
            RunQueueItem::Notify { endpoint, kpid } => self.deliver_notify(endpoint, kpid).await,
            RunQueueItem::DropExports { endpoint, krefs } => {
                self.deliver_drop_exports(endpoint, krefs).await
            }
            RunQueueItem::RetireExports { endpoint, krefs } => {
                self.deliver_retire_exports(endpoint, krefs).await
            }
            RunQueueItem::RetireImports { endpoint, krefs } => {
                self.deliver_retire_imports(endpoint, krefs).await
            }
            RunQueueItem::BringOutYourDead { endpoint } => {
                self.deliver_bring_out_your_dead(endpoint).await
            }
        }
    }

    /// Converts a per-endpoint delivery failure into vat termination
    /// (or a logged warning for remotes); storage failures bubble.
    fn absorb_crank_error(
        &mut self,
        endpoint: EndpointId,
        outcome: std::result::Result<(), CrankError>,
    ) -> Result<()> {
        match outcome {
            Ok(()) => Ok(()),
            Err(CrankError::Store(error)) => Err(error.into()),
            Err(CrankError::VatFatal(error)) => {
                warn!(%endpoint, %error, "delivery failed");
                if let EndpointId::Vat(vat) = endpoint {
                    self.terminate_vat_internal(vat)?;
                }
                Ok(())
            }
        }
    }

    async fn deliver_send(&mut self, target: KRef, message: Message) -> Result<()> {
        let item = RunQueueItem::Send {
            target,
            message: message.clone(),
        };
        // Release queue refs up front; translation re-anchors everything
        // the receiving endpoint keeps, and the harvest only inspects
        // final counts at end of crank.
        self.state.release_item_refs(&item)?;
        match target {
            KRef::Object(koid) => {
                let owner = match self.state.store.object_owner(koid)? {
                    Some(owner) if self.endpoints.contains_key(&owner) => owner,
                    _ => return self.reject_undeliverable(message.result),
                };
                let prepared: std::result::Result<(ERef, VatMessage), CrankError> = (|| {
                    let target_eref =
                        match self.state.translate_ref_k_to_e(owner, target, false, false)? {
                            Some(eref) => eref,
                            None => {
                                return Err(CrankError::VatFatal(
                                    crate::error::VatFatalError::invalid_syscall(format!(
                                        "owner {owner} has no entry for {target}"
                                    )),
                                ))
                            }
                        };
                    let vat_message = self.state.translate_message_k_to_e(owner, &message)?;
                    Ok((target_eref, vat_message))
                })();
                let (target_eref, vat_message) = match prepared {
                    Ok(prepared) => prepared,
                    Err(CrankError::Store(error)) => return Err(error.into()),
                    Err(CrankError::VatFatal(error)) => {
                        warn!(%owner, %error, "undeliverable send");
                        return self.reject_undeliverable(message.result);
                    }
                };
                // Whoever receives the message decides its result.
                if let Some(result) = message.result {
                    self.state.store.set_promise_decider(result, Some(owner))?;
                }
                let state = &mut self.state;
                let Some(handle) = self.endpoints.get_mut(&owner) else {
                    return Ok(());
                };
                let outcome = handle.deliver_message(state, target_eref, vat_message).await;
                self.absorb_crank_error(owner, outcome)
            }
            KRef::Promise(kpid) => match self.state.store.promise_state(kpid)? {
                None => self.reject_undeliverable(message.result),
                Some(PromiseState::Unresolved) => {
                    self.state.queue_message_on_promise(kpid, &message)?;
                    Ok(())
                }
                Some(resolved_state) => {
                    // Follow the settled promise to its resolution.
                    let value = self.state.store.promise_value(kpid)?.unwrap_or_default();
                    let rejected = resolved_state == PromiseState::Rejected;
                    if !rejected && value.slots.len() == 1 {
                        let new_target: KRef = value.slots[0].parse().map_err(
                            |e: ocap_core::CoreError| {
                                ocap_store::StoreError::corrupt("resolution", e.to_string())
                            },
                        )?;
                        self.state.enqueue_run(RunQueueItem::Send {
                            target: new_target,
                            message,
                        })?;
                        Ok(())
                    } else if let Some(result) = message.result {
                        self.state.resolve_promise_internal(result, true, value)?;
                        Ok(())
                    } else {
                        Ok(())
                    }
                }
            },
        }
    }

    fn reject_undeliverable(&mut self, result: Option<KPromiseId>) -> Result<()> {
        if let Some(result) = result {
            debug!(%result, "rejecting result of undeliverable send");
            self.state.resolve_promise_internal(
                result,
                true,
                CapData::plain("\"no such object\""),
            )?;
        }
        Ok(())
    }

    async fn deliver_notify(&mut self, endpoint: EndpointId, kpid: KPromiseId) -> Result<()> {
        let item = RunQueueItem::Notify { endpoint, kpid };
        self.state.release_item_refs(&item)?;
        let rejected = match self.state.store.promise_state(kpid)? {
            Some(PromiseState::Fulfilled) => false,
            Some(PromiseState::Rejected) => true,
            other => {
                warn!(%kpid, ?other, "dropping notify for unsettled promise");
                return Ok(());
            }
        };
        if !self.endpoints.contains_key(&endpoint) {
            return Ok(());
        }
        let prepared: std::result::Result<Option<VatResolution>, CrankError> = (|| {
            let target = match self.state.translate_ref_k_to_e(
                endpoint,
                KRef::Promise(kpid),
                false,
                false,
            )? {
                Some(eref) => eref,
                // The subscriber already forgot the promise.
                None => return Ok(None),
            };
            let value = self.state.store.promise_value(kpid)?.unwrap_or_default();
            let value = self.state.translate_capdata_k_to_e(endpoint, &value)?;
            Ok(Some(VatResolution {
                target,
                rejected,
                value,
            }))
        })();
        let resolution = match prepared {
            Ok(Some(resolution)) => resolution,
            Ok(None) => return Ok(()),
            Err(CrankError::Store(error)) => return Err(error.into()),
            Err(CrankError::VatFatal(error)) => {
                warn!(%endpoint, %error, "undeliverable notify");
                return Ok(());
            }
        };
        let state = &mut self.state;
        let Some(handle) = self.endpoints.get_mut(&endpoint) else {
            return Ok(());
        };
        let outcome = handle.deliver_notify(state, vec![resolution]).await;
        self.absorb_crank_error(endpoint, outcome)?;
        // A delivered notify retires the subscriber's promise entry.
        if self.endpoints.contains_key(&endpoint) {
            self.state.forget_kref(endpoint, KRef::Promise(kpid))?;
        }
        Ok(())
    }

    async fn deliver_drop_exports(
        &mut self,
        endpoint: EndpointId,
        krefs: Vec<KRef>,
    ) -> Result<()> {
        let mut erefs = Vec::with_capacity(krefs.len());
        for kref in krefs {
            if let Some((eref, _)) = self.state.store.clist_entry_by_kref(endpoint, kref)? {
                self.state.clear_reachable_flag(endpoint, kref)?;
                erefs.push(eref);
            }
        }
        if erefs.is_empty() || !self.endpoints.contains_key(&endpoint) {
            return Ok(());
        }
        let state = &mut self.state;
        let Some(handle) = self.endpoints.get_mut(&endpoint) else {
            return Ok(());
        };
        let outcome = handle.deliver_drop_exports(state, erefs).await;
        self.absorb_crank_error(endpoint, outcome)
    }

    async fn deliver_retire_exports(
        &mut self,
        endpoint: EndpointId,
        krefs: Vec<KRef>,
    ) -> Result<()> {
        let mut erefs = Vec::with_capacity(krefs.len());
        for kref in krefs {
            if let Some((eref, _)) = self.state.store.clist_entry_by_kref(endpoint, kref)? {
                self.state.forget_kref(endpoint, kref)?;
                if let Some(koid) = kref.as_object() {
                    self.state.store.delete_object(koid)?;
                }
                erefs.push(eref);
            }
        }
        if erefs.is_empty() || !self.endpoints.contains_key(&endpoint) {
            return Ok(());
        }
        let state = &mut self.state;
        let Some(handle) = self.endpoints.get_mut(&endpoint) else {
            return Ok(());
        };
        let outcome = handle.deliver_retire_exports(state, erefs).await;
        self.absorb_crank_error(endpoint, outcome)
    }

    async fn deliver_retire_imports(
        &mut self,
        endpoint: EndpointId,
        krefs: Vec<KRef>,
    ) -> Result<()> {
        let mut erefs = Vec::with_capacity(krefs.len());
        for kref in krefs {
            if let Some((eref, _)) = self.state.store.clist_entry_by_kref(endpoint, kref)? {
                self.state.forget_kref(endpoint, kref)?;
                erefs.push(eref);
            }
        }
        if erefs.is_empty() || !self.endpoints.contains_key(&endpoint) {
            return Ok(());
        }
        let state = &mut self.state;
        let Some(handle) = self.endpoints.get_mut(&endpoint) else {
            return Ok(());
        };
        let outcome = handle.deliver_retire_imports(state, erefs).await;
        self.absorb_crank_error(endpoint, outcome)
    }

    async fn deliver_bring_out_your_dead(&mut self, endpoint: EndpointId) -> Result<()> {
        if !self.endpoints.contains_key(&endpoint) {
            return Ok(());
        }
        let state = &mut self.state;
        let Some(handle) = self.endpoints.get_mut(&endpoint) else {
            return Ok(());
        };
        let outcome = handle.deliver_bring_out_your_dead(state).await;
        self.absorb_crank_error(endpoint, outcome)
    }

    /// Test and tooling access to kernel state.
    pub fn state_mut(&mut self) -> &mut KernelState {
        &mut self.state
    }
}

/// Parses an eref from the wire, flipping its direction: what the peer
/// exports, we import.
fn parse_wire_eref(value: &Value) -> Option<ERef> {
    value
        .as_str()
        .and_then(|text| text.parse::<ERef>().ok())
        .map(ERef::flipped)
}

fn parse_wire_erefs(value: &Value) -> Option<Vec<ERef>> {
    value
        .as_array()?
        .iter()
        .map(parse_wire_eref)
        .collect::<Option<Vec<_>>>()
}

fn parse_wire_capdata(value: &Value) -> Option<CapData> {
    let body = value["body"].as_str()?.to_string();
    let slots = value["slots"]
        .as_array()?
        .iter()
        .map(|slot| parse_wire_eref(slot).map(|eref| eref.to_string()))
        .collect::<Option<Vec<_>>>()?;
    Some(CapData { body, slots })
}

/// Parses a resolution entry from the wire, flipping its target's
/// direction: what the peer exports, we import.
fn parse_wire_resolution(value: &Value) -> Option<VatResolution> {
    let target = parse_wire_eref(&value["target"])?;
    let rejected = value["rejected"].as_bool()?;
    let value = parse_wire_capdata(&value["value"])?;
    Some(VatResolution {
        target,
        rejected,
        value,
    })
}

fn parse_wire_message(value: &Value) -> Option<VatMessage> {
    let method = value["method"].as_str()?.to_string();
    let args = parse_wire_capdata(&value["args"])?;
    let result = match &value["result"] {
        Value::Null => None,
        other => Some(parse_wire_eref(other)?),
    };
    Some(VatMessage {
        method,
        args,
        result,
    })
}
