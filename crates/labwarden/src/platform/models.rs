//! Lab platform diagnostics document.
//!
//! Only the parts labwarden reads are modelled. Every section is optional at
//! the serde level; deciding what is actually required is the snapshot
//! parser's job.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Node states that mean nothing is consuming compute.
pub const IDLE_NODE_STATES: [&str; 2] = ["DEFINED_ON_CORE", "STOPPED"];

/// State-duration counter that tracks how long a node has been booted.
pub const BOOTED_STATE: &str = "BOOTED";

/// Response of `GET /api/v0/diagnostics`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiagnosticsDocument {
    #[serde(default)]
    pub user_roles: Option<UserRoles>,
    #[serde(default)]
    pub user_list: Option<BTreeMap<String, UserEntry>>,
    #[serde(default)]
    pub labs: Option<BTreeMap<String, LabEntry>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserRoles {
    /// Platform user id to the ids of labs they own.
    #[serde(default)]
    pub labs_by_user: Option<BTreeMap<String, Vec<String>>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserEntry {
    #[serde(default)]
    pub username: Option<String>,
    /// Deployments put the owner's e-mail address here.
    #[serde(default)]
    pub fullname: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabEntry {
    #[serde(default)]
    pub created: Option<EpochSeconds>,
    #[serde(default)]
    pub nodes: Option<BTreeMap<String, NodeEntry>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeEntry {
    #[serde(default)]
    pub state: Option<String>,
    /// Seconds spent in each state, keyed by state name. Kept raw so a null
    /// or malformed counter only affects the node it belongs to.
    #[serde(default)]
    pub state_times: Option<BTreeMap<String, serde_json::Value>>,
}

impl NodeEntry {
    /// Whether the node is doing anything. A node without a state is treated
    /// as idle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state
            .as_deref()
            .is_some_and(|s| !IDLE_NODE_STATES.contains(&s))
    }

    /// Seconds spent booted, 0 when the platform did not report it.
    #[must_use]
    pub fn booted_secs(&self) -> u64 {
        self.state_times
            .as_ref()
            .and_then(|t| t.get(BOOTED_STATE))
            .and_then(serde_json::Value::as_f64)
            .filter(|s| s.is_finite() && *s > 0.0)
            .map_or(0, |s| s as u64)
    }
}

/// Lab creation time. Controllers have reported it both as a number and as a
/// numeric string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EpochSeconds {
    Integer(i64),
    Float(f64),
    Text(String),
}

impl EpochSeconds {
    #[must_use]
    pub fn as_secs(&self) -> Option<i64> {
        match self {
            Self::Integer(s) => Some(*s),
            Self::Float(s) if s.is_finite() => Some(*s as i64),
            Self::Float(_) => None,
            Self::Text(s) => {
                let s = s.trim();
                s.parse::<i64>()
                    .ok()
                    .or_else(|| s.parse::<f64>().ok().filter(|f| f.is_finite()).map(|f| f as i64))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_created_accepts_number_and_string() {
        let lab: LabEntry = serde_json::from_str(r#"{"created": 1700000000}"#).unwrap();
        assert_eq!(lab.created.unwrap().as_secs(), Some(1_700_000_000));

        let lab: LabEntry = serde_json::from_str(r#"{"created": "1700000000"}"#).unwrap();
        assert_eq!(lab.created.unwrap().as_secs(), Some(1_700_000_000));

        let lab: LabEntry = serde_json::from_str(r#"{"created": 1700000000.75}"#).unwrap();
        assert_eq!(lab.created.unwrap().as_secs(), Some(1_700_000_000));

        let lab: LabEntry = serde_json::from_str(r#"{"created": "yesterday"}"#).unwrap();
        assert_eq!(lab.created.unwrap().as_secs(), None);
    }

    #[test]
    fn test_node_activity() {
        let node: NodeEntry =
            serde_json::from_str(r#"{"state": "BOOTED", "state_times": {"BOOTED": 120.9}}"#)
                .unwrap();
        assert!(node.is_active());
        assert_eq!(node.booted_secs(), 120);

        let node: NodeEntry = serde_json::from_str(r#"{"state": "STOPPED"}"#).unwrap();
        assert!(!node.is_active());
        assert_eq!(node.booted_secs(), 0);

        let node: NodeEntry = serde_json::from_str("{}").unwrap();
        assert!(!node.is_active());
    }

    #[test]
    fn test_malformed_state_times_read_as_zero() {
        let node: NodeEntry = serde_json::from_str(
            r#"{"state": "BOOTED", "state_times": {"BOOTED": null, "STOPPED": "n/a"}}"#,
        )
        .unwrap();
        assert!(node.is_active());
        assert_eq!(node.booted_secs(), 0);

        let node: NodeEntry =
            serde_json::from_str(r#"{"state": "BOOTED", "state_times": {"BOOTED": "300"}}"#)
                .unwrap();
        assert_eq!(node.booted_secs(), 0);
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let doc: DiagnosticsDocument = serde_json::from_str(
            r#"{"computes": {}, "user_roles": {"labs_by_user": {"u1": ["l1"]}, "roles": []}}"#,
        )
        .unwrap();
        assert!(doc.labs.is_none());
        assert_eq!(
            doc.user_roles.unwrap().labs_by_user.unwrap()["u1"],
            vec!["l1".to_string()]
        );
    }
}
