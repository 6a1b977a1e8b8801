// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// lib.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! # ocap-core
//!
//! Core types shared by the ocap kernel: identifiers with strict lexical
//! shapes, capability-bearing data, and the kernel's persisted work-item
//! types.

pub mod capdata;
pub mod error;
pub mod ids;
pub mod message;

pub use capdata::CapData;
pub use error::{CoreError, Result};
pub use ids::{EndpointId, ERef, KObjectId, KPromiseId, KRef, RefDir, RefKind, RemoteId, VatId};
pub use message::{
    GcAction, GcActionType, Message, PromiseState, Resolution, RunQueueItem,
};
