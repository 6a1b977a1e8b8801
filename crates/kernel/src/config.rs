//! Kernel and vat configuration records.

use serde::{Deserialize, Serialize};

/// Configuration for one vat: what to run and with which knobs.
///
/// Persisted at `vatConfig.<vatId>` so the vat can be relaunched on
/// kernel restart.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct VatConfig {
    /// Human-meaningful name, unique among live vats.
    pub name: String,
    /// Source or bundle specifier handed to the worker.
    pub source: String,
    /// Worker options, opaque to the kernel.
    #[serde(default)]
    pub options: serde_json::Value,
    /// Startup parameters passed to the vat's first delivery.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
}

impl VatConfig {
    /// Creates a config with empty options and no parameters.
    pub fn new(name: impl Into<String>, source: impl Into<String>) -> Self {
        VatConfig {
            name: name.into(),
            source: source.into(),
            options: serde_json::Value::Null,
            parameters: None,
        }
    }
}

/// Whole-kernel configuration supplied by the embedder.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Vats launched on first start, in order.
    #[serde(default)]
    pub vats: Vec<VatConfig>,
    /// Our own peer id, used to issue and recognise local ocap URLs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_peer: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vat_config_json_round_trip() {
        let config = VatConfig {
            name: "alice".into(),
            source: "bundle:alice".into(),
            options: serde_json::json!({"managerType": "worker"}),
            parameters: Some(serde_json::json!({"greeting": "hi"})),
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: VatConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let config: VatConfig =
            serde_json::from_str(r#"{"name":"bob","source":"bundle:bob"}"#).unwrap();
        assert_eq!(config.options, serde_json::Value::Null);
        assert!(config.parameters.is_none());
    }
}
