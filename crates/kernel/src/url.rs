//! OCAP URL syntax.
//!
//! An ocap URL is a short opaque capability designator of the form
//! `ocap:<oid>@<peerId>(,<hint>)*`: an object id scoped to the peer
//! that exported it, plus optional transport hints.

use crate::error::{KernelError, Result};
use std::fmt;

/// A parsed ocap URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OcapUrl {
    /// Object id, opaque outside the issuing peer.
    pub oid: String,
    /// The peer that exported the object.
    pub host: String,
    /// Optional transport hints.
    pub hints: Vec<String>,
}

impl OcapUrl {
    /// Builds a hintless URL.
    pub fn new(oid: impl Into<String>, host: impl Into<String>) -> Self {
        OcapUrl {
            oid: oid.into(),
            host: host.into(),
            hints: Vec::new(),
        }
    }

    /// Parses the strict `ocap:<oid>@<host>(,<hint>)*` syntax.
    pub fn parse(text: &str) -> Result<Self> {
        if text.is_empty() || text.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(KernelError::bad_ocap_url("unparseable URL"));
        }
        let rest = text
            .strip_prefix("ocap:")
            .ok_or_else(|| KernelError::bad_ocap_url("not an ocap URL"))?;
        let mut segments = rest.split(',');
        let designator = segments.next().unwrap_or_default();
        let hints: Vec<String> = segments.map(str::to_string).collect();
        if hints.iter().any(String::is_empty) {
            return Err(KernelError::bad_ocap_url("bad ocap URL"));
        }
        let mut at_parts = designator.split('@');
        match (at_parts.next(), at_parts.next(), at_parts.next()) {
            (Some(oid), Some(host), None) if !oid.is_empty() && !host.is_empty() => Ok(OcapUrl {
                oid: oid.to_string(),
                host: host.to_string(),
                hints,
            }),
            _ => Err(KernelError::bad_ocap_url("bad ocap URL")),
        }
    }
}

impl fmt::Display for OcapUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ocap:{}@{}", self.oid, self.host)?;
        for hint in &self.hints {
            write!(f, ",{hint}")?;
        }
        Ok(())
    }
}
