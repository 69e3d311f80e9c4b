//! Lab lifecycle reconciliation.
//!
//! Runs once per server per cycle and makes two passes:
//!
//! 1. **Stale sweep** - records for labs the server no longer reports are
//!    dropped, whatever state they were in.
//! 2. **Classification** - every running lab older than the alert threshold
//!    is matched against its record and moved through the lifecycle:
//!
//! | record                                   | action                | notice      |
//! |------------------------------------------|-----------------------|-------------|
//! | none                                     | create                | new warning |
//! | renewed, extension still running         | nothing               | none        |
//! | renewed, extension ran out               | re-warn, clear flag   | re-warning  |
//! | not renewed, before the dead threshold   | nothing               | countdown   |
//! | not renewed, past the dead threshold     | delete, reclaim lab   | terminated  |
//!
//! The decision itself is the pure [`classify`]; [`Reconciler`] applies the
//! side effects.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use notify::{Identity, Messenger};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::{EngineOptions, TerminationPolicy, Thresholds};
use crate::error::StoreError;
use crate::platform::{LabPlatform, PlatformError, Session};
use crate::snapshot::{LabSnapshot, ServerSnapshot};
use crate::store::{LabRecord, RecordFilter, RecordKey, RecordStore, RecordUpdate};

/// Next step for a lab that already has a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Extension still running.
    Grace,
    /// Extension ran out; warn again and start a new countdown.
    Rewarn,
    /// Warned, not extended, deadline not reached yet.
    Countdown { remaining_secs: u64 },
    /// Deadline reached.
    Terminate,
}

/// Decide what to do with a tracked lab at `now`.
#[must_use]
pub fn classify(record: &LabRecord, now: DateTime<Utc>, thresholds: Thresholds) -> Transition {
    let elapsed = u64::try_from((now - record.warning_date).num_seconds()).unwrap_or(0);

    if record.renewal_flag {
        if elapsed < thresholds.alert_secs() {
            Transition::Grace
        } else {
            Transition::Rewarn
        }
    } else if elapsed < thresholds.dead_secs() {
        Transition::Countdown {
            remaining_secs: thresholds.dead_secs() - elapsed,
        }
    } else {
        Transition::Terminate
    }
}

/// Step of the reclaim sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationStep {
    Stop,
    Wipe,
    Delete,
}

impl fmt::Display for TerminationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stop => write!(f, "stop"),
            Self::Wipe => write!(f, "wipe"),
            Self::Delete => write!(f, "delete"),
        }
    }
}

/// How a termination went.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TerminationOutcome {
    /// Stopped, wiped and deleted on the platform.
    Reclaimed,
    /// The platform refused one of the steps; later steps were not tried.
    Failed { step: TerminationStep, error: String },
    /// Policy is record-only: the lab was left alone, only tracking ended.
    Untracked,
}

/// What an owner is told about one lab.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NoticeKind {
    NewWarning { age_secs: u64 },
    RenewalExpired { age_secs: u64 },
    Countdown { remaining_secs: u64 },
    Terminated {
        age_secs: u64,
        outcome: TerminationOutcome,
    },
}

/// One line of an owner's digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub identity: Identity,
    pub owner_key: String,
    pub lab_id: String,
    #[serde(flatten)]
    pub kind: NoticeKind,
}

/// Result of reconciling one server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub server_id: String,
    /// Labs whose stale records were swept.
    pub stale_removed: Vec<String>,
    /// Running labs older than the alert threshold.
    pub labs_over_threshold: usize,
    /// Labs inside an extension.
    pub labs_in_grace: usize,
    /// Owners that could not be resolved to a messaging identity.
    pub unresolved_owners: Vec<String>,
    pub terminations_failed: usize,
    pub notices: Vec<Notice>,
}

/// Applies [`classify`] decisions against the store and platform.
pub struct Reconciler<'a> {
    options: EngineOptions,
    platform: &'a dyn LabPlatform,
    messenger: &'a dyn Messenger,
    store: &'a dyn RecordStore,
}

impl<'a> Reconciler<'a> {
    #[must_use]
    pub fn new(
        options: EngineOptions,
        platform: &'a dyn LabPlatform,
        messenger: &'a dyn Messenger,
        store: &'a dyn RecordStore,
    ) -> Self {
        Self {
            options,
            platform,
            messenger,
            store,
        }
    }

    /// Reconcile one server's snapshot.
    ///
    /// Store failures abort the pass; everything else is contained to the
    /// lab or owner it concerns.
    pub async fn reconcile(
        &self,
        session: &Session,
        snapshot: &ServerSnapshot,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, StoreError> {
        let server = snapshot.server_id.as_str();
        let mut report = ReconcileReport {
            server_id: server.to_string(),
            ..ReconcileReport::default()
        };

        let stale = self
            .store
            .delete_many(&RecordFilter::server(server).lab_not_in(snapshot.all_lab_ids.clone()))
            .await?;
        for record in &stale {
            info!(server, lab = %record.key.lab_id, "Removed record for lab no longer on server");
        }
        report.stale_removed = stale.into_iter().map(|r| r.key.lab_id).collect();

        let alert_secs = self.options.thresholds.alert_secs();
        let mut identities: HashMap<&str, Option<Identity>> = HashMap::new();
        let mut terminated: BTreeSet<&str> = BTreeSet::new();

        for lab in &snapshot.labs {
            let age_secs = lab.age_secs(now);
            if age_secs <= alert_secs {
                continue;
            }
            report.labs_over_threshold += 1;

            if terminated.contains(lab.lab_id.as_str()) {
                debug!(server, lab = %lab.lab_id, "Already terminated this cycle");
                continue;
            }

            let identity = match identities.get(lab.owner_key.as_str()) {
                Some(cached) => cached.clone(),
                None => {
                    let resolved = self.resolve(server, &lab.owner_key).await;
                    if resolved.is_none() {
                        report.unresolved_owners.push(lab.owner_key.clone());
                    }
                    identities.insert(&lab.owner_key, resolved.clone());
                    resolved
                }
            };
            let Some(identity) = identity else {
                continue;
            };

            let key = RecordKey::new(server, identity.clone(), lab.lab_id.clone());
            let (record, created) = self.store.find_or_create(&key, now).await?;

            let kind = if created {
                info!(
                    server,
                    lab = %lab.lab_id,
                    owner = %lab.owner_key,
                    age_secs,
                    "Lab passed alert threshold"
                );
                Some(NoticeKind::NewWarning { age_secs })
            } else {
                match classify(&record, now, self.options.thresholds) {
                    Transition::Grace => {
                        debug!(server, lab = %lab.lab_id, "Lab is inside its extension");
                        report.labs_in_grace += 1;
                        None
                    }
                    Transition::Rewarn => {
                        self.store
                            .update(record.id, RecordUpdate::rewarn(now))
                            .await?;
                        info!(
                            server,
                            lab = %lab.lab_id,
                            owner = %lab.owner_key,
                            "Lab extension expired"
                        );
                        Some(NoticeKind::RenewalExpired { age_secs })
                    }
                    Transition::Countdown { remaining_secs } => {
                        debug!(server, lab = %lab.lab_id, remaining_secs, "Lab deadline pending");
                        Some(NoticeKind::Countdown { remaining_secs })
                    }
                    Transition::Terminate => {
                        terminated.insert(lab.lab_id.as_str());
                        self.store.delete(&key).await?;
                        let outcome = self.terminate(session, lab).await;
                        if matches!(outcome, TerminationOutcome::Failed { .. }) {
                            report.terminations_failed += 1;
                        }
                        Some(NoticeKind::Terminated { age_secs, outcome })
                    }
                }
            };

            if let Some(kind) = kind {
                report.notices.push(Notice {
                    identity,
                    owner_key: lab.owner_key.clone(),
                    lab_id: lab.lab_id.clone(),
                    kind,
                });
            }
        }

        Ok(report)
    }

    async fn resolve(&self, server: &str, owner_key: &str) -> Option<Identity> {
        match self.messenger.resolve_identity(owner_key).await {
            Ok(identity) => Some(identity),
            Err(e) if e.is_recipient_error() => {
                warn!(
                    server,
                    owner = owner_key,
                    error = %e,
                    "Owner has no messaging identity, skipping their labs"
                );
                None
            }
            Err(e) => {
                error!(
                    server,
                    owner = owner_key,
                    channel = self.messenger.name(),
                    error = %e,
                    "Failed to resolve owner, skipping their labs"
                );
                None
            }
        }
    }

    /// Reclaim a lab according to the configured policy. Each step only
    /// runs if the previous one succeeded.
    async fn terminate(&self, session: &Session, lab: &LabSnapshot) -> TerminationOutcome {
        let server = lab.server_id.as_str();
        if self.options.termination == TerminationPolicy::RecordOnly {
            info!(
                server,
                lab = %lab.lab_id,
                "Deadline reached, tracking ended (record-only policy)"
            );
            return TerminationOutcome::Untracked;
        }

        let steps = [
            TerminationStep::Stop,
            TerminationStep::Wipe,
            TerminationStep::Delete,
        ];
        for step in steps {
            let result: Result<(), PlatformError> = match step {
                TerminationStep::Stop => self.platform.stop_lab(session, &lab.lab_id).await,
                TerminationStep::Wipe => self.platform.wipe_lab(session, &lab.lab_id).await,
                TerminationStep::Delete => self.platform.delete_lab(session, &lab.lab_id).await,
            };
            if let Err(e) = result {
                error!(server, lab = %lab.lab_id, %step, error = %e, "Lab termination failed");
                return TerminationOutcome::Failed {
                    step,
                    error: e.to_string(),
                };
            }
        }

        info!(server, lab = %lab.lab_id, owner = %lab.owner_key, "Lab reclaimed");
        TerminationOutcome::Reclaimed
    }
}
