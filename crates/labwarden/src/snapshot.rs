//! Diagnostics snapshot parsing.
//!
//! Turns a raw [`DiagnosticsDocument`] into the typed view the engine works
//! on: which labs are running, who owns them and how old they are, plus the
//! full set of lab ids the server knows about for the stale sweep.

use std::collections::BTreeSet;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use tracing::debug;

use crate::error::ParseError;
use crate::platform::models::{DiagnosticsDocument, LabEntry};

/// A lab currently running on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabSnapshot {
    pub server_id: String,
    pub lab_id: String,
    /// Owner as known to the lab platform (the user's fullname/e-mail).
    pub owner_key: String,
    pub created_at: Option<DateTime<Utc>>,
    /// Longest boot time among the lab's running nodes. Only set when node
    /// filtering is enabled.
    pub max_node_running_secs: Option<u64>,
}

impl LabSnapshot {
    /// Age used against the alert threshold.
    #[must_use]
    pub fn age_secs(&self, now: DateTime<Utc>) -> u64 {
        match (self.max_node_running_secs, self.created_at) {
            (Some(running), _) => running,
            (None, Some(created)) => u64::try_from((now - created).num_seconds()).unwrap_or(0),
            (None, None) => 0,
        }
    }
}

/// Everything the engine needs from one server's diagnostics.
#[derive(Debug, Clone, Default)]
pub struct ServerSnapshot {
    pub server_id: String,
    /// Running labs, grouped by owner in platform user order.
    pub labs: Vec<LabSnapshot>,
    /// Every lab id the platform reports, regardless of state or age.
    pub all_lab_ids: BTreeSet<String>,
    /// Labs that could not be classified this cycle and why.
    pub rejected: Vec<ParseError>,
}

impl ServerSnapshot {
    /// Parse a diagnostics document.
    ///
    /// With `require_booted_nodes`, labs whose nodes are all defined or
    /// stopped are left out and age is the longest node boot time.
    pub fn parse(
        server_id: &str,
        doc: &DiagnosticsDocument,
        require_booted_nodes: bool,
    ) -> Result<Self, ParseError> {
        let labs_by_user = doc
            .user_roles
            .as_ref()
            .and_then(|r| r.labs_by_user.as_ref())
            .ok_or(ParseError::MissingSection("user_roles.labs_by_user"))?;

        let has_labs = labs_by_user.values().any(|l| !l.is_empty());
        let lab_entries = match (&doc.labs, has_labs) {
            (Some(labs), _) => Some(labs),
            (None, false) => None,
            (None, true) => return Err(ParseError::MissingSection("labs")),
        };
        let users = match (&doc.user_list, has_labs) {
            (Some(users), _) => Some(users),
            (None, false) => None,
            (None, true) => return Err(ParseError::MissingSection("user_list")),
        };

        let mut snapshot = Self {
            server_id: server_id.to_string(),
            ..Self::default()
        };

        snapshot
            .all_lab_ids
            .extend(labs_by_user.values().flatten().cloned());
        if let Some(entries) = lab_entries {
            snapshot.all_lab_ids.extend(entries.keys().cloned());
        }

        for (user_id, lab_ids) in labs_by_user {
            if lab_ids.is_empty() {
                continue;
            }

            let owner_key = users
                .and_then(|u| u.get(user_id))
                .and_then(|u| u.fullname.as_deref())
                .map(str::trim)
                .filter(|name| !name.is_empty());
            let Some(owner_key) = owner_key else {
                debug!(
                    server = server_id,
                    user = %user_id,
                    "User has no fullname, skipping their labs"
                );
                continue;
            };

            for lab_id in lab_ids {
                let Some(entry) = lab_entries.and_then(|e| e.get(lab_id)) else {
                    snapshot.rejected.push(ParseError::InvalidField {
                        lab_id: lab_id.clone(),
                        field: "labs",
                        reason: "listed for a user but not described".to_string(),
                    });
                    continue;
                };

                match parse_lab(server_id, lab_id, owner_key, entry, require_booted_nodes) {
                    Ok(Some(lab)) => snapshot.labs.push(lab),
                    Ok(None) => {}
                    Err(e) => snapshot.rejected.push(e),
                }
            }
        }

        Ok(snapshot)
    }
}

fn parse_lab(
    server_id: &str,
    lab_id: &str,
    owner_key: &str,
    entry: &LabEntry,
    require_booted_nodes: bool,
) -> Result<Option<LabSnapshot>, ParseError> {
    let created = parse_created(lab_id, entry);

    let (created_at, max_node_running_secs) = if require_booted_nodes {
        let mut active = entry
            .nodes
            .iter()
            .flat_map(|nodes| nodes.values())
            .filter(|node| node.is_active())
            .peekable();
        if active.peek().is_none() {
            return Ok(None);
        }
        let running = active.map(|node| node.booted_secs()).max().unwrap_or(0);
        // Age comes from the nodes here, so a bad creation time is not fatal.
        (created.ok().flatten(), Some(running))
    } else {
        let created_at = created?.ok_or_else(|| ParseError::InvalidField {
            lab_id: lab_id.to_string(),
            field: "created",
            reason: "missing".to_string(),
        })?;
        (Some(created_at), None)
    };

    Ok(Some(LabSnapshot {
        server_id: server_id.to_string(),
        lab_id: lab_id.to_string(),
        owner_key: owner_key.to_string(),
        created_at,
        max_node_running_secs,
    }))
}

fn parse_created(lab_id: &str, entry: &LabEntry) -> Result<Option<DateTime<Utc>>, ParseError> {
    let Some(raw) = &entry.created else {
        return Ok(None);
    };
    let secs = raw.as_secs().ok_or_else(|| ParseError::InvalidField {
        lab_id: lab_id.to_string(),
        field: "created",
        reason: format!("not an epoch timestamp: {raw:?}"),
    })?;
    Utc.timestamp_opt(secs, 0)
        .single()
        .map(Some)
        .ok_or_else(|| ParseError::InvalidField {
            lab_id: lab_id.to_string(),
            field: "created",
            reason: format!("timestamp out of range: {secs}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> DiagnosticsDocument {
        serde_json::from_value(value).unwrap()
    }

    fn sample() -> DiagnosticsDocument {
        doc(json!({
            "user_roles": {"labs_by_user": {
                "u1": ["lab-a", "lab-b"],
                "u2": ["lab-c"],
                "u3": []
            }},
            "user_list": {
                "u1": {"username": "ann", "fullname": "ann@example.com"},
                "u2": {"username": "bob", "fullname": "bob@example.com"},
                "u3": {"username": "cat", "fullname": "cat@example.com"}
            },
            "labs": {
                "lab-a": {"created": 1_000, "nodes": {
                    "n1": {"state": "BOOTED", "state_times": {"BOOTED": 500}},
                    "n2": {"state": "STARTED", "state_times": {"BOOTED": 900}},
                    "n3": {"state": "STOPPED", "state_times": {"BOOTED": 99_999}}
                }},
                "lab-b": {"created": "2000", "nodes": {
                    "n1": {"state": "DEFINED_ON_CORE"},
                    "n2": {"state": "STOPPED"}
                }},
                "lab-c": {"created": 3_000, "nodes": {
                    "n1": {"state": "BOOTED"}
                }},
                "orphan": {"created": 4_000}
            }
        }))
    }

    #[test]
    fn test_node_filtering_excludes_idle_labs() {
        let snap = ServerSnapshot::parse("virl-1", &sample(), true).unwrap();
        let ids: Vec<&str> = snap.labs.iter().map(|l| l.lab_id.as_str()).collect();
        assert_eq!(ids, vec!["lab-a", "lab-c"]);

        // Stopped node's counter does not count.
        assert_eq!(snap.labs[0].max_node_running_secs, Some(900));
        assert_eq!(snap.labs[0].owner_key, "ann@example.com");
        // Missing state_times defaults to zero.
        assert_eq!(snap.labs[1].max_node_running_secs, Some(0));
        assert!(snap.rejected.is_empty());
    }

    #[test]
    fn test_without_node_filtering_all_labs_are_running() {
        let snap = ServerSnapshot::parse("virl-1", &sample(), false).unwrap();
        let ids: Vec<&str> = snap.labs.iter().map(|l| l.lab_id.as_str()).collect();
        assert_eq!(ids, vec!["lab-a", "lab-b", "lab-c"]);

        let now = Utc.timestamp_opt(10_000, 0).unwrap();
        assert_eq!(snap.labs[0].age_secs(now), 9_000);
        assert_eq!(snap.labs[1].age_secs(now), 8_000);
    }

    #[test]
    fn test_all_lab_ids_include_every_known_lab() {
        let snap = ServerSnapshot::parse("virl-1", &sample(), true).unwrap();
        let all: Vec<&str> = snap.all_lab_ids.iter().map(String::as_str).collect();
        assert_eq!(all, vec!["lab-a", "lab-b", "lab-c", "orphan"]);
    }

    #[test]
    fn test_age_prefers_node_running_time() {
        let snap = ServerSnapshot::parse("virl-1", &sample(), true).unwrap();
        let now = Utc.timestamp_opt(1_000_000, 0).unwrap();
        assert_eq!(snap.labs[0].age_secs(now), 900);
    }

    #[test]
    fn test_missing_labs_by_user_is_an_error() {
        let err = ServerSnapshot::parse("virl-1", &doc(json!({"labs": {}})), true).unwrap_err();
        assert!(matches!(err, ParseError::MissingSection("user_roles.labs_by_user")));
    }

    #[test]
    fn test_missing_lab_section_is_an_error_when_users_have_labs() {
        let d = doc(json!({
            "user_roles": {"labs_by_user": {"u1": ["lab-a"]}},
            "user_list": {"u1": {"fullname": "ann@example.com"}}
        }));
        assert!(matches!(
            ServerSnapshot::parse("virl-1", &d, true),
            Err(ParseError::MissingSection("labs"))
        ));

        let empty = doc(json!({"user_roles": {"labs_by_user": {"u1": []}}}));
        let snap = ServerSnapshot::parse("virl-1", &empty, true).unwrap();
        assert!(snap.labs.is_empty());
        assert!(snap.all_lab_ids.is_empty());
    }

    #[test]
    fn test_bad_lab_is_rejected_without_failing_others() {
        let d = doc(json!({
            "user_roles": {"labs_by_user": {"u1": ["ghost", "bad", "good"]}},
            "user_list": {"u1": {"fullname": "ann@example.com"}},
            "labs": {
                "bad": {"created": "last tuesday"},
                "good": {"created": 5}
            }
        }));
        let snap = ServerSnapshot::parse("virl-1", &d, false).unwrap();
        assert_eq!(snap.labs.len(), 1);
        assert_eq!(snap.labs[0].lab_id, "good");
        assert_eq!(snap.rejected.len(), 2);
        // Still part of the known set, so its record is not swept.
        assert!(snap.all_lab_ids.contains("ghost"));
    }

    #[test]
    fn test_user_without_fullname_is_skipped() {
        let d = doc(json!({
            "user_roles": {"labs_by_user": {"u1": ["lab-a"], "u2": ["lab-b"]}},
            "user_list": {
                "u1": {"username": "ann", "fullname": ""},
                "u2": {"fullname": "bob@example.com"}
            },
            "labs": {"lab-a": {"created": 1}, "lab-b": {"created": 1}}
        }));
        let snap = ServerSnapshot::parse("virl-1", &d, false).unwrap();
        assert_eq!(snap.labs.len(), 1);
        assert_eq!(snap.labs[0].owner_key, "bob@example.com");
        assert!(snap.all_lab_ids.contains("lab-a"));
    }

    #[test]
    fn test_null_state_counter_does_not_lose_other_labs() {
        let d = doc(json!({
            "user_roles": {"labs_by_user": {"u1": ["lab-a", "lab-b"]}},
            "user_list": {"u1": {"fullname": "ann@example.com"}},
            "labs": {
                "lab-a": {"created": 1, "nodes": {
                    "n1": {"state": "BOOTED", "state_times": {"BOOTED": 700}}
                }},
                "lab-b": {"created": 1, "nodes": {
                    "n1": {"state": "BOOTED", "state_times": {"BOOTED": 500, "STOPPED": null}},
                    "n2": {"state": "STARTED", "state_times": {"BOOTED": null}}
                }}
            }
        }));
        let snap = ServerSnapshot::parse("virl-1", &d, true).unwrap();
        assert_eq!(snap.labs.len(), 2);
        assert_eq!(snap.labs[0].max_node_running_secs, Some(700));
        assert_eq!(snap.labs[1].max_node_running_secs, Some(500));
        assert!(snap.rejected.is_empty());
    }

    #[test]
    fn test_bad_created_only_matters_without_node_filtering() {
        let d = doc(json!({
            "user_roles": {"labs_by_user": {"u1": ["lab-a"]}},
            "user_list": {"u1": {"fullname": "ann@example.com"}},
            "labs": {"lab-a": {"created": "last tuesday", "nodes": {
                "n1": {"state": "BOOTED", "state_times": {"BOOTED": 42}}
            }}}
        }));

        let snap = ServerSnapshot::parse("virl-1", &d, true).unwrap();
        assert_eq!(snap.labs.len(), 1);
        assert_eq!(snap.labs[0].created_at, None);
        assert_eq!(snap.labs[0].max_node_running_secs, Some(42));

        let snap = ServerSnapshot::parse("virl-1", &d, false).unwrap();
        assert!(snap.labs.is_empty());
        assert_eq!(snap.rejected.len(), 1);
    }
}
