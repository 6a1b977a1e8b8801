// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// lib.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! # ocap-kernel
//!
//! A persistent object-capability kernel: it hosts isolated vats in
//! embedder-supplied workers, brokers eventual-send invocations and
//! promise resolutions between them (and between peer kernels), tracks
//! distributed reference counts, and drives garbage collection, one
//! crank at a time, every crank a transaction.

pub mod clist;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gc;
pub mod kernel;
pub mod promise;
pub mod queue;
pub mod remote;
pub mod state;
pub mod url;
pub mod vat;
pub mod worker;

pub use config::{KernelConfig, VatConfig};
pub use endpoint::EndpointHandle;
pub use error::{CrankError, KernelError, Result, VatFatalError};
pub use gc::CLEANUP_BUDGET;
pub use kernel::{
    Kernel, KernelAbort, KernelInput, KernelStatus, RedemptionTicket, REDEEM_TIMEOUT,
};
pub use remote::{CommsError, RemoteComms, RemoteHandle};
pub use state::KernelState;
pub use url::OcapUrl;
pub use vat::VatHandle;
pub use worker::{
    KernelToVat, VatCommand, VatConnection, VatDelivery, VatMessage, VatResolution, VatSyscall,
    VatToKernel, VatWorker, WireResult, WorkerError,
};
