//! Error types for the kernel crate.
//!
//! Failures travel on three distinct channels and are never mixed:
//!
//! * [`KernelError`]: surfaced to the embedding caller.
//! * [`VatFatalError`]: caused by a misbehaving vat; the vat is
//!   terminated and the kernel continues.
//! * Storage failures: kernel-fatal; they abort the crank loop so the
//!   embedding database can roll the open transaction back.
//!
//! [`CrankError`] is the internal union the dispatch path uses to keep
//! the vat-fatal and kernel-fatal cases apart until the crank loop
//! decides who dies.

use ocap_core::{EndpointId, KPromiseId, KRef, VatId};
use ocap_store::StoreError;
use thiserror::Error;

/// Errors surfaced to the embedding caller.
#[derive(Error, Debug)]
pub enum KernelError {
    /// The named vat does not exist.
    #[error("vat not found: {vat}")]
    VatNotFound {
        /// The missing vat
        vat: VatId,
    },

    /// A vat with this name already exists.
    #[error("vat already exists: {name}")]
    VatAlreadyExists {
        /// The conflicting name
        name: String,
    },

    /// The named kernel promise does not exist.
    #[error("unknown kernel promise: {kpid}")]
    UnknownPromise {
        /// The missing promise
        kpid: KPromiseId,
    },

    /// The named kernel ref does not exist.
    #[error("unknown kernel ref: {kref}")]
    UnknownKref {
        /// The missing ref
        kref: KRef,
    },

    /// A vat's worker failed during launch; the vat was cleaned up.
    #[error("vat {vat} failed to launch: {message}")]
    VatLaunchFailed {
        /// The vat that failed
        vat: VatId,
        /// The failure description
        message: String,
    },

    /// An ocap URL could not be parsed or redeemed locally.
    #[error("{message}")]
    BadOcapUrl {
        /// One of the fixed rejection messages
        message: String,
    },

    /// The remote peer answered a redemption with an error.
    #[error("remote redemption failed: {message}")]
    RemoteRedeemFailed {
        /// The peer's error text
        message: String,
    },

    /// The kernel gave up on a peer; pending redemptions were rejected.
    #[error("gave up on remote peer {peer}")]
    RemoteGaveUp {
        /// The abandoned peer
        peer: String,
    },

    /// A redemption did not complete before its deadline.
    #[error("remote redemption timed out for peer {peer}")]
    RemoteRedeemTimeout {
        /// The unresponsive peer
        peer: String,
    },

    /// The kernel was aborted.
    #[error("kernel aborted")]
    Aborted,

    /// The persistent store failed; the crank cannot continue.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl KernelError {
    /// Builds a `BadOcapUrl` with one of the fixed rejection messages.
    pub fn bad_ocap_url(message: impl Into<String>) -> Self {
        KernelError::BadOcapUrl {
            message: message.into(),
        }
    }
}

/// Result alias for caller-facing kernel operations.
pub type Result<T> = std::result::Result<T, KernelError>;

/// Failures that kill the offending vat but leave the kernel running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VatFatalError {
    /// A resolve targeted a promise that is already settled.
    #[error("promise already resolved: {kpid}")]
    AlreadyResolved {
        /// The settled promise
        kpid: KPromiseId,
    },

    /// A resolve came from an endpoint that is not the decider.
    #[error("{endpoint} is not the decider of {kpid}")]
    NotDecider {
        /// The endpoint that tried to resolve
        endpoint: EndpointId,
        /// The promise it tried to resolve
        kpid: KPromiseId,
    },

    /// A syscall violated a kernel invariant.
    #[error("invalid syscall: {message}")]
    InvalidSyscall {
        /// What was wrong with it
        message: String,
    },

    /// The worker channel failed mid-stream.
    #[error("worker stream error: {message}")]
    StreamRead {
        /// Transport-level description
        message: String,
    },
}

impl VatFatalError {
    /// Builds an `InvalidSyscall` from anything displayable.
    pub fn invalid_syscall(message: impl Into<String>) -> Self {
        VatFatalError::InvalidSyscall {
            message: message.into(),
        }
    }
}

/// Internal union used while dispatching one delivery or syscall.
///
/// The crank loop terminates the offending vat on `VatFatal` and
/// crashes the kernel on `Store`.
#[derive(Error, Debug)]
pub enum CrankError {
    /// The current vat must be terminated.
    #[error(transparent)]
    VatFatal(#[from] VatFatalError),

    /// The store failed; the kernel must stop.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result alias for the dispatch path.
pub type CrankResult<T> = std::result::Result<T, CrankError>;
