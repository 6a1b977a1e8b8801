//! Opaque capability-bearing data.

use serde::{Deserialize, Serialize};

/// Marshalled data with capability slots.
///
/// The kernel never interprets `body`; it only walks `slots`, whose
/// entries are refs. Which ref namespace the slots live in (kernel or
/// endpoint) depends on which side of the translation layer the value
/// sits on.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapData {
    /// Serialized body, opaque to the kernel.
    pub body: String,
    /// Refs embedded in the body, in order of appearance.
    pub slots: Vec<String>,
}

impl CapData {
    /// Creates a capdata value from its body and slots.
    pub fn new(body: impl Into<String>, slots: Vec<String>) -> Self {
        CapData {
            body: body.into(),
            slots,
        }
    }

    /// Creates a slotless capdata value.
    pub fn plain(body: impl Into<String>) -> Self {
        CapData {
            body: body.into(),
            slots: Vec::new(),
        }
    }
}
