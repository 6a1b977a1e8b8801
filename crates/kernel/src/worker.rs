//! The worker channel contract.
//!
//! Each vat runs in a worker supplied by the embedder. The kernel and
//! the worker exchange typed messages over a bidirectional stream:
//! requests flow out with correlation ids of the form `<vatId>:<n>`,
//! and the worker answers with replies interleaved with syscalls. All
//! refs on this channel are endpoint refs in the vat's own namespace.

use async_trait::async_trait;
use ocap_core::{CapData, ERef, VatId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::VatConfig;

/// Transport failure on a worker channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("worker channel error: {message}")]
pub struct WorkerError {
    /// Transport-level description.
    pub message: String,
}

impl WorkerError {
    /// Builds a `WorkerError` from anything displayable.
    pub fn new(message: impl Into<String>) -> Self {
        WorkerError {
            message: message.into(),
        }
    }
}

/// One invocation as seen by a vat; slots and refs are erefs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatMessage {
    /// Method name.
    pub method: String,
    /// Arguments; slots are eref strings.
    pub args: CapData,
    /// Result promise the vat should resolve, if any.
    pub result: Option<ERef>,
}

/// One promise resolution as seen by a vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VatResolution {
    /// The promise being resolved, as the vat knows it.
    pub target: ERef,
    /// True for rejection.
    pub rejected: bool,
    /// Resolution value; slots are eref strings.
    pub value: CapData,
}

/// A delivery injected into a vat.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatDelivery {
    /// Run a message against one of the vat's objects or promises.
    Message {
        /// Target eref.
        target: ERef,
        /// The invocation.
        message: VatMessage,
    },
    /// Report promise resolutions the vat subscribed to.
    Notify {
        /// The resolutions, in subscription order.
        resolutions: Vec<VatResolution>,
    },
    /// The named exports are no longer reachable anywhere.
    DropExports {
        /// The affected erefs.
        erefs: Vec<ERef>,
    },
    /// The named exports are no longer recognizable anywhere.
    RetireExports {
        /// The affected erefs.
        erefs: Vec<ERef>,
    },
    /// The named imports were retired by their exporter.
    RetireImports {
        /// The affected erefs.
        erefs: Vec<ERef>,
    },
    /// Cooperative GC poll.
    BringOutYourDead,
}

/// A command the kernel sends to a worker.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "camelCase")]
pub enum VatCommand {
    /// Liveness probe; the worker answers `"pong"`.
    Ping,
    /// Boot the supervisor with the vat's configuration.
    InitSupervisor {
        /// The vat's configuration record.
        config: VatConfig,
    },
    /// CapTP-style bootstrap handshake.
    CaptpInit,
    /// Inject one delivery.
    Deliver(VatDelivery),
}

/// A syscall issued by a vat while it runs a delivery.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum VatSyscall {
    /// Eventual-send to a target the vat can reach.
    Send {
        /// Target eref.
        target: ERef,
        /// The invocation; slots and result are erefs.
        message: VatMessage,
    },
    /// Ask to be notified when a promise settles.
    Subscribe {
        /// The promise eref.
        eref: ERef,
    },
    /// Settle promises the vat decides.
    Resolve {
        /// The resolutions.
        resolutions: Vec<VatResolution>,
    },
    /// Drop reachability of imported objects.
    DropImports {
        /// The dropped erefs.
        erefs: Vec<ERef>,
    },
    /// Forget imported objects that are already unreachable.
    RetireImports {
        /// The retired erefs.
        erefs: Vec<ERef>,
    },
    /// Forget exports that are already unreachable.
    RetireExports {
        /// The retired erefs.
        erefs: Vec<ERef>,
    },
    /// Forget exports unconditionally.
    AbandonExports {
        /// The abandoned erefs.
        erefs: Vec<ERef>,
    },
    /// Read from the vat's private substore.
    VatstoreGet {
        /// Substore key.
        key: String,
    },
    /// Write into the vat's private substore.
    VatstoreSet {
        /// Substore key.
        key: String,
        /// Value to store.
        value: String,
    },
    /// Delete from the vat's private substore.
    VatstoreDelete {
        /// Substore key.
        key: String,
    },
    /// Next key after `key` in the vat's private substore.
    VatstoreGetNextKey {
        /// Substore key to seek from.
        key: String,
    },
    /// The vat asks to shut down.
    Exit {
        /// True when exiting due to a failure.
        is_failure: bool,
        /// Exit info, opaque to the kernel.
        info: CapData,
    },
    /// Synchronous device call; unsupported by this kernel.
    CallNow {
        /// Target eref.
        target: ERef,
        /// Method name.
        method: String,
    },
}

/// An outcome carried on the worker channel.
///
/// Errors propagate as rejected replies, so the failure text rides the
/// wire alongside successful values.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum WireResult<T> {
    /// The operation succeeded.
    Ok(T),
    /// The operation failed with this description.
    Err(String),
}

impl<T> WireResult<T> {
    /// Converts into a plain `Result`.
    pub fn into_result(self) -> std::result::Result<T, String> {
        match self {
            WireResult::Ok(value) => Ok(value),
            WireResult::Err(message) => Err(message),
        }
    }
}

/// Anything the kernel writes onto the worker channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum KernelToVat {
    /// A correlated command.
    Request {
        /// Correlation id, `<vatId>:<n>`.
        id: String,
        /// The command.
        command: VatCommand,
    },
    /// Answer to a correlated syscall.
    SyscallReply {
        /// The syscall's sequence number.
        id: u64,
        /// The outcome.
        result: WireResult<Option<String>>,
    },
}

/// Anything the worker writes onto the channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum VatToKernel {
    /// Answer to a correlated command.
    Reply {
        /// The request's correlation id.
        id: String,
        /// The outcome.
        result: WireResult<String>,
    },
    /// A syscall issued while a delivery runs.
    Syscall {
        /// Sequence number for the syscall's reply.
        id: u64,
        /// The syscall.
        syscall: VatSyscall,
    },
}

/// One live bidirectional channel to a vat worker.
#[async_trait]
pub trait VatConnection: Send {
    /// Writes one message to the worker.
    async fn send(&mut self, message: KernelToVat) -> std::result::Result<(), WorkerError>;

    /// Reads the next message from the worker.
    async fn recv(&mut self) -> std::result::Result<VatToKernel, WorkerError>;
}

/// The collaborator that launches workers.
#[async_trait]
pub trait VatWorker: Send + Sync {
    /// Starts a worker for `vat` and returns its channel.
    async fn launch(
        &self,
        vat: VatId,
        config: &VatConfig,
    ) -> std::result::Result<Box<dyn VatConnection>, WorkerError>;
}
