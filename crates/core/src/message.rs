// Copyright (C) 2024-2026 The Ocap Kernel Project.
//
// message.rs file belongs to the ocap-rs project and is free
// software distributed under the MIT software license, see the
// accompanying file LICENSE in the main directory of the
// repository for more details.
//
// Redistribution and use in source and binary forms with or without
// modifications are permitted.

//! Kernel-side message and work-item types.
//!
//! These are the items the kernel persists on its queues, so every type
//! here has a stable JSON encoding.

use crate::{CapData, CoreError, EndpointId, KPromiseId, KRef, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One eventual-send invocation, in kernel-ref space.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Method name to invoke on the target.
    pub method: String,
    /// Arguments; slots are kref strings.
    pub args: CapData,
    /// Promise to resolve with the outcome, if the sender wants one.
    pub result: Option<KPromiseId>,
}

impl Message {
    /// Creates a message.
    pub fn new(method: impl Into<String>, args: CapData, result: Option<KPromiseId>) -> Self {
        Message {
            method: method.into(),
            args,
            result,
        }
    }
}

/// The outcome a promise resolved to.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// The promise being resolved.
    pub kpid: KPromiseId,
    /// True for rejection, false for fulfillment.
    pub rejected: bool,
    /// Resolution value; slots are kref strings.
    pub value: CapData,
}

/// Lifecycle state of a kernel promise.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromiseState {
    /// Not yet resolved; has a decider, subscribers and queued messages.
    Unresolved,
    /// Resolved successfully.
    Fulfilled,
    /// Resolved with a failure.
    Rejected,
}

impl fmt::Display for PromiseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PromiseState::Unresolved => "unresolved",
            PromiseState::Fulfilled => "fulfilled",
            PromiseState::Rejected => "rejected",
        };
        f.write_str(text)
    }
}

impl FromStr for PromiseState {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "unresolved" => Ok(PromiseState::Unresolved),
            "fulfilled" => Ok(PromiseState::Fulfilled),
            "rejected" => Ok(PromiseState::Rejected),
            other => Err(CoreError::invalid_format(format!(
                "unknown promise state {other:?}"
            ))),
        }
    }
}

/// The kind of a pending GC action.
///
/// The declaration order is the dispatch priority: drops before export
/// retirements before import retirements.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum GcActionType {
    /// Tell the exporter the object is no longer reachable anywhere.
    DropExport,
    /// Tell the exporter the object is no longer recognizable anywhere.
    RetireExport,
    /// Tell an importer the object is gone.
    RetireImport,
}

impl GcActionType {
    /// All action types, in dispatch priority order.
    pub const ALL: [GcActionType; 3] = [
        GcActionType::DropExport,
        GcActionType::RetireExport,
        GcActionType::RetireImport,
    ];
}

impl fmt::Display for GcActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            GcActionType::DropExport => "dropExport",
            GcActionType::RetireExport => "retireExport",
            GcActionType::RetireImport => "retireImport",
        };
        f.write_str(text)
    }
}

impl FromStr for GcActionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "dropExport" => Ok(GcActionType::DropExport),
            "retireExport" => Ok(GcActionType::RetireExport),
            "retireImport" => Ok(GcActionType::RetireImport),
            other => Err(CoreError::invalid_format(format!(
                "unknown gc action type {other:?}"
            ))),
        }
    }
}

/// One pending GC action, persisted as `"<endpointId> <type> <kref>"`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GcAction {
    /// Endpoint the action must be delivered to.
    pub endpoint: EndpointId,
    /// What kind of action.
    pub action: GcActionType,
    /// The object the action concerns.
    pub kref: KRef,
}

impl fmt::Display for GcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.endpoint, self.action, self.kref)
    }
}

impl FromStr for GcAction {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(' ');
        let (endpoint, action, kref) = match (parts.next(), parts.next(), parts.next(), parts.next())
        {
            (Some(e), Some(a), Some(k), None) => (e, a, k),
            _ => {
                return Err(CoreError::invalid_format(format!(
                    "malformed gc action {s:?}"
                )))
            }
        };
        Ok(GcAction {
            endpoint: endpoint.parse()?,
            action: action.parse()?,
            kref: kref.parse()?,
        })
    }
}

/// One unit of kernel work, in queue order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RunQueueItem {
    /// Deliver a message to an object or promise.
    Send {
        /// Target kref.
        target: KRef,
        /// The invocation to deliver.
        message: Message,
    },
    /// Tell a subscriber about a promise resolution.
    Notify {
        /// Endpoint to notify.
        endpoint: EndpointId,
        /// The resolved promise.
        kpid: KPromiseId,
    },
    /// Batched dropExport actions for one endpoint.
    DropExports {
        /// Exporting endpoint.
        endpoint: EndpointId,
        /// Objects no longer reachable anywhere.
        krefs: Vec<KRef>,
    },
    /// Batched retireExport actions for one endpoint.
    RetireExports {
        /// Exporting endpoint.
        endpoint: EndpointId,
        /// Objects no longer recognizable anywhere.
        krefs: Vec<KRef>,
    },
    /// Batched retireImport actions for one endpoint.
    RetireImports {
        /// Importing endpoint.
        endpoint: EndpointId,
        /// Objects retired by their exporter.
        krefs: Vec<KRef>,
    },
    /// Cooperative GC poll inside one vat.
    BringOutYourDead {
        /// The vat to poll.
        endpoint: EndpointId,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{KObjectId, VatId};

    #[test]
    fn test_run_queue_item_json_round_trip() {
        let items = vec![
            RunQueueItem::Send {
                target: KRef::Object(KObjectId::new(7)),
                message: Message::new(
                    "foo",
                    CapData::plain("[]"),
                    Some(KPromiseId::new(4)),
                ),
            },
            RunQueueItem::Notify {
                endpoint: EndpointId::Vat(VatId::new(1)),
                kpid: KPromiseId::new(4),
            },
            RunQueueItem::DropExports {
                endpoint: EndpointId::Vat(VatId::new(2)),
                krefs: vec![KRef::Object(KObjectId::new(9))],
            },
            RunQueueItem::BringOutYourDead {
                endpoint: EndpointId::Vat(VatId::new(4)),
            },
        ];
        for item in items {
            let json = serde_json::to_string(&item).unwrap();
            let back: RunQueueItem = serde_json::from_str(&json).unwrap();
            assert_eq!(back, item);
        }
    }

    #[test]
    fn test_gc_action_string_form() {
        let action = GcAction {
            endpoint: EndpointId::Vat(VatId::new(2)),
            action: GcActionType::DropExport,
            kref: KRef::Object(KObjectId::new(9)),
        };
        assert_eq!(action.to_string(), "v2 dropExport ko9");
        assert_eq!("v2 dropExport ko9".parse::<GcAction>().unwrap(), action);
        assert!("v2 dropExport".parse::<GcAction>().is_err());
        assert!("v2 shred ko9".parse::<GcAction>().is_err());
    }

    #[test]
    fn test_gc_action_type_priority_order() {
        assert!(GcActionType::DropExport < GcActionType::RetireExport);
        assert!(GcActionType::RetireExport < GcActionType::RetireImport);
    }

    #[test]
    fn test_promise_state_round_trip() {
        for state in [
            PromiseState::Unresolved,
            PromiseState::Fulfilled,
            PromiseState::Rejected,
        ] {
            assert_eq!(state.to_string().parse::<PromiseState>().unwrap(), state);
        }
        assert!("pending".parse::<PromiseState>().is_err());
    }
}
