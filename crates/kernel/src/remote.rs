// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// remote.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! The remote peer handle.
//!
//! A remote kernel is just another endpoint: it has a c-list, gets the
//! same six delivery kinds a vat gets, and its inbound traffic routes
//! through the same syscall operations. The wire carries JSON records
//! over the remote-comms collaborator, which owns identity and
//! encryption. Refs on the wire are written in the sender's c-list form
//! and direction-flipped by the receiver: what the peer exports, we
//! import.

use crate::error::CrankResult;
use crate::worker::{VatMessage, VatResolution};
use async_trait::async_trait;
use ocap_core::{ERef, RemoteId};
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Transport failure reported by the remote-comms collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("remote comms error: {message}")]
pub struct CommsError {
    /// Transport-level description.
    pub message: String,
}

impl CommsError {
    /// Builds a `CommsError` from anything displayable.
    pub fn new(message: impl Into<String>) -> Self {
        CommsError {
            message: message.into(),
        }
    }
}

/// The collaborator that moves JSON between peer kernels.
#[async_trait]
pub trait RemoteComms: Send + Sync {
    /// Ships one JSON record to `peer`.
    async fn send_remote_message(
        &self,
        peer: &str,
        json: &str,
    ) -> std::result::Result<(), CommsError>;
}

/// One registered peer kernel.
pub struct RemoteHandle {
    remote_id: RemoteId,
    peer_id: String,
    comms: Arc<dyn RemoteComms>,
}

impl RemoteHandle {
    /// Wraps a registered peer.
    pub fn new(remote_id: RemoteId, peer_id: impl Into<String>, comms: Arc<dyn RemoteComms>) -> Self {
        RemoteHandle {
            remote_id,
            peer_id: peer_id.into(),
            comms,
        }
    }

    /// The peer's endpoint id in this kernel.
    pub fn remote_id(&self) -> RemoteId {
        self.remote_id
    }

    /// The peer's wire identity.
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Ships one record; comms failures are logged, not fatal. The
    /// peer layer owns retry and give-up policy.
    pub(crate) async fn send(&self, record: serde_json::Value) -> CrankResult<()> {
        let text = record.to_string();
        debug!(peer = %self.peer_id, "sending remote record");
        if let Err(error) = self.comms.send_remote_message(&self.peer_id, &text).await {
            warn!(peer = %self.peer_id, %error, "remote send failed");
        }
        Ok(())
    }

    /// Delivers a message to an object or promise the peer hosts.
    pub async fn deliver_message(&self, target: ERef, message: &VatMessage) -> CrankResult<()> {
        self.send(json!({
            "method": "deliver",
            "params": ["message", target.to_string(), wire_message(message)],
        }))
        .await
    }

    /// Reports promise resolutions the peer subscribed to.
    pub async fn deliver_notify(&self, resolutions: &[VatResolution]) -> CrankResult<()> {
        let wire: Vec<serde_json::Value> = resolutions.iter().map(wire_resolution).collect();
        self.send(json!({
            "method": "deliver",
            "params": ["notify", wire],
        }))
        .await
    }

    /// Tells the peer its exports are unreachable here.
    pub async fn deliver_drop_exports(&self, erefs: &[ERef]) -> CrankResult<()> {
        self.deliver_gc("dropExports", erefs).await
    }

    /// Tells the peer its exports are unrecognizable here.
    pub async fn deliver_retire_exports(&self, erefs: &[ERef]) -> CrankResult<()> {
        self.deliver_gc("retireExports", erefs).await
    }

    /// Tells the peer our exports to it are gone.
    pub async fn deliver_retire_imports(&self, erefs: &[ERef]) -> CrankResult<()> {
        self.deliver_gc("retireImports", erefs).await
    }

    async fn deliver_gc(&self, kind: &str, erefs: &[ERef]) -> CrankResult<()> {
        let wire: Vec<String> = erefs.iter().map(ERef::to_string).collect();
        self.send(json!({
            "method": "deliver",
            "params": [kind, wire],
        }))
        .await
    }

    /// Asks the peer to redeem `url`, tagged with `reply_key`.
    pub async fn send_redeem_request(&self, url: &str, reply_key: &str) -> CrankResult<()> {
        self.send(json!({
            "method": "redeemURL",
            "params": [url, reply_key],
        }))
        .await
    }

    /// Answers a redemption request from the peer.
    pub async fn send_redeem_reply(
        &self,
        success: bool,
        reply_key: &str,
        result_or_error: &str,
    ) -> CrankResult<()> {
        self.send(json!({
            "method": "redeemURLReply",
            "params": [success, reply_key, result_or_error],
        }))
        .await
    }
}

/// Wire form of a message: erefs as strings.
fn wire_message(message: &VatMessage) -> serde_json::Value {
    json!({
        "method": message.method,
        "args": { "body": message.args.body, "slots": message.args.slots },
        "result": message.result.map(|r| r.to_string()),
    })
}

/// Wire form of one resolution.
fn wire_resolution(resolution: &VatResolution) -> serde_json::Value {
    json!({
        "target": resolution.target.to_string(),
        "rejected": resolution.rejected,
        "value": { "body": resolution.value.body, "slots": resolution.value.slots },
    })
}
