//! NatsCluster CRD
//!
//! Declares a NATS cluster: desired peer count, image version, pause flag,
//! and placement constraints. The operator drives observed peer pods toward
//! this declaration.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(group = "nats.io", version = "v1", kind = "NatsCluster", namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Desired number of peers.
    pub size: i32,

    /// NATS server image tag (e.g. "0.9.2").
    pub version: String,

    /// Freezes reconciliation while set. The declaration can still be
    /// edited; changes take effect once unpaused.
    #[serde(default)]
    pub paused: bool,

    /// Requests spreading peers across nodes, one peer per node.
    #[serde(default)]
    pub anti_affinity: bool,

    /// Restricts the nodes peers may be scheduled on.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,
}

/// Violation of the declarative invariants of a cluster spec.
#[derive(Debug, Error)]
pub enum SpecError {
    #[error("cluster size must be at least 1, got {0}")]
    InvalidSize(i32),

    #[error("cluster version must not be empty")]
    EmptyVersion,
}

impl ClusterSpec {
    /// Checks the declarative invariants: `size >= 1` and a nonempty version.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.size < 1 {
            return Err(SpecError::InvalidSize(self.size));
        }
        if self.version.is_empty() {
            return Err(SpecError::EmptyVersion);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(size: i32, version: &str) -> ClusterSpec {
        ClusterSpec {
            size,
            version: version.to_string(),
            paused: false,
            anti_affinity: false,
            node_selector: BTreeMap::new(),
        }
    }

    #[test]
    fn validate_accepts_minimal_cluster() {
        assert!(spec(1, "0.9.2").validate().is_ok());
    }

    #[test]
    fn validate_rejects_zero_size() {
        assert!(matches!(
            spec(0, "0.9.2").validate(),
            Err(SpecError::InvalidSize(0))
        ));
    }

    #[test]
    fn validate_rejects_negative_size() {
        assert!(matches!(
            spec(-3, "0.9.2").validate(),
            Err(SpecError::InvalidSize(-3))
        ));
    }

    #[test]
    fn validate_rejects_empty_version() {
        assert!(matches!(
            spec(3, "").validate(),
            Err(SpecError::EmptyVersion)
        ));
    }

    #[test]
    fn deserializes_camel_case_fields_with_defaults() {
        let parsed: ClusterSpec = serde_json::from_value(serde_json::json!({
            "size": 3,
            "version": "0.9.2",
            "antiAffinity": true,
            "nodeSelector": {"disktype": "ssd"}
        }))
        .unwrap();

        assert_eq!(parsed.size, 3);
        assert_eq!(parsed.version, "0.9.2");
        assert!(!parsed.paused);
        assert!(parsed.anti_affinity);
        assert_eq!(parsed.node_selector.get("disktype").unwrap(), "ssd");
    }

    #[test]
    fn serializes_camel_case_and_skips_empty_selector() {
        let value = serde_json::to_value(spec(3, "0.9.2")).unwrap();
        assert_eq!(value["size"], 3);
        assert_eq!(value["antiAffinity"], false);
        assert!(value.get("nodeSelector").is_none());
    }
}
