//! Cycle orchestration.
//!
//! A cycle walks every configured server in order: log in, pull diagnostics,
//! parse, reconcile, then send one digest per owner. A failure on one server
//! is logged and the cycle moves on to the next.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::Messenger;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::EngineOptions;
use crate::digest;
use crate::engine::{ReconcileReport, Reconciler};
use crate::error::{CycleError, Stage};
use crate::platform::LabPlatform;
use crate::snapshot::ServerSnapshot;
use crate::store::RecordStore;

/// Result of one server pass.
#[derive(Debug, Clone, Serialize)]
pub struct ServerReport {
    pub server_id: String,
    /// Labs that could not be classified this cycle.
    pub labs_rejected: usize,
    pub messages_sent: usize,
    pub messages_failed: usize,
    pub reconcile: ReconcileReport,
}

/// Outcome of one server in a cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServerOutcome {
    Completed(ServerReport),
    Failed {
        server_id: String,
        stage: String,
        error: String,
    },
}

/// Summary of a whole cycle.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub started_at: DateTime<Utc>,
    pub servers: Vec<ServerOutcome>,
}

impl CycleReport {
    /// Number of servers that could not be processed.
    #[must_use]
    pub fn failed_servers(&self) -> usize {
        self.servers
            .iter()
            .filter(|s| matches!(s, ServerOutcome::Failed { .. }))
            .count()
    }
}

/// Runs reconciliation cycles over a fixed set of servers.
pub struct CycleRunner {
    platforms: Vec<Arc<dyn LabPlatform>>,
    messenger: Arc<dyn Messenger>,
    store: Arc<dyn RecordStore>,
    options: EngineOptions,
}

impl CycleRunner {
    pub fn new(
        platforms: Vec<Arc<dyn LabPlatform>>,
        messenger: Arc<dyn Messenger>,
        store: Arc<dyn RecordStore>,
        options: EngineOptions,
    ) -> Self {
        Self {
            platforms,
            messenger,
            store,
            options,
        }
    }

    /// Process every server once, strictly in order.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> CycleReport {
        info!(servers = self.platforms.len(), "Starting cycle");
        let mut servers = Vec::with_capacity(self.platforms.len());

        for platform in &self.platforms {
            let server = platform.server_id();
            match self.process_server(platform.as_ref(), now).await {
                Ok(report) => {
                    info!(
                        server,
                        stale_removed = report.reconcile.stale_removed.len(),
                        over_threshold = report.reconcile.labs_over_threshold,
                        notices = report.reconcile.notices.len(),
                        messages_sent = report.messages_sent,
                        "Server processed"
                    );
                    servers.push(ServerOutcome::Completed(report));
                }
                Err(e) => {
                    error!(
                        server,
                        stage = %e.stage(),
                        error = %e,
                        "Server pass failed, continuing with next server"
                    );
                    servers.push(ServerOutcome::Failed {
                        server_id: server.to_string(),
                        stage: e.stage().to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        CycleReport {
            started_at: now,
            servers,
        }
    }

    /// Run cycles until the process is killed, sleeping `interval` between
    /// them.
    pub async fn run_forever(&self, interval: Duration) {
        loop {
            let report = self.run_cycle(Utc::now()).await;
            info!(
                servers = report.servers.len(),
                failed = report.failed_servers(),
                next_in_secs = interval.as_secs(),
                "Cycle complete"
            );
            tokio::time::sleep(interval).await;
        }
    }

    async fn process_server(
        &self,
        platform: &dyn LabPlatform,
        now: DateTime<Utc>,
    ) -> Result<ServerReport, CycleError> {
        let server = platform.server_id();
        let platform_err = |stage: Stage| {
            move |source| CycleError::Platform {
                server: server.to_string(),
                stage,
                source,
            }
        };

        let session = platform
            .authenticate()
            .await
            .map_err(platform_err(Stage::Authenticate))?;
        let document = platform
            .fetch_diagnostics(&session)
            .await
            .map_err(platform_err(Stage::FetchDiagnostics))?;

        let snapshot = ServerSnapshot::parse(server, &document, self.options.require_booted_nodes)
            .map_err(|source| CycleError::Parse {
                server: server.to_string(),
                stage: Stage::Parse,
                source,
            })?;
        for rejected in &snapshot.rejected {
            warn!(server, error = %rejected, "Lab skipped this cycle");
        }
        debug!(
            server,
            running = snapshot.labs.len(),
            known = snapshot.all_lab_ids.len(),
            "Parsed diagnostics"
        );

        let reconcile = Reconciler::new(
            self.options,
            platform,
            self.messenger.as_ref(),
            self.store.as_ref(),
        )
        .reconcile(&session, &snapshot, now)
        .await
        .map_err(|source| CycleError::Store {
            server: server.to_string(),
            stage: Stage::Reconcile,
            source,
        })?;

        let mut messages_sent = 0;
        let mut messages_failed = 0;
        for digest in digest::compose(server, &reconcile.notices) {
            match self
                .messenger
                .send(&digest.identity, &digest.render())
                .await
            {
                Ok(()) => {
                    debug!(
                        server,
                        owner = %digest.owner_key,
                        labs = digest.lines.len(),
                        "Digest sent"
                    );
                    messages_sent += 1;
                }
                Err(e) => {
                    error!(
                        server,
                        owner = %digest.owner_key,
                        channel = self.messenger.name(),
                        error = %e,
                        "Failed to send digest"
                    );
                    messages_failed += 1;
                }
            }
        }

        Ok(ServerReport {
            server_id: server.to_string(),
            labs_rejected: snapshot.rejected.len(),
            messages_sent,
            messages_failed,
            reconcile,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TerminationPolicy;
    use crate::engine::tests::{now, options, FakeMessenger, FakePlatform, ALERT};
    use crate::platform::{DiagnosticsDocument, PlatformError, Session};
    use crate::store::FileRecordStore;
    use async_trait::async_trait;
    use serde_json::json;
    use tempfile::TempDir;

    /// Serves a fixed diagnostics document, or fails at a chosen stage.
    struct ScriptedPlatform {
        inner: FakePlatform,
        document: serde_json::Value,
        fail_at: Option<Stage>,
    }

    impl ScriptedPlatform {
        fn new(server: &str, document: serde_json::Value) -> Self {
            Self {
                inner: FakePlatform::new(server),
                document,
                fail_at: None,
            }
        }

        fn failing(server: &str, stage: Stage) -> Self {
            Self {
                fail_at: Some(stage),
                ..Self::new(server, json!({}))
            }
        }
    }

    #[async_trait]
    impl LabPlatform for ScriptedPlatform {
        fn server_id(&self) -> &str {
            self.inner.server_id()
        }

        async fn authenticate(&self) -> Result<Session, PlatformError> {
            if self.fail_at == Some(Stage::Authenticate) {
                return Err(PlatformError::Auth("401 Unauthorized".to_string()));
            }
            Ok(Session::new("tok"))
        }

        async fn fetch_diagnostics(
            &self,
            _session: &Session,
        ) -> Result<DiagnosticsDocument, PlatformError> {
            if self.fail_at == Some(Stage::FetchDiagnostics) {
                return Err(PlatformError::Api {
                    status: 502,
                    message: "bad gateway".to_string(),
                });
            }
            Ok(serde_json::from_value(self.document.clone())?)
        }

        async fn stop_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
            self.inner.stop_lab(session, lab_id).await
        }

        async fn wipe_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
            self.inner.wipe_lab(session, lab_id).await
        }

        async fn delete_lab(&self, session: &Session, lab_id: &str) -> Result<(), PlatformError> {
            self.inner.delete_lab(session, lab_id).await
        }
    }

    fn diagnostics(created: i64) -> serde_json::Value {
        json!({
            "user_roles": {"labs_by_user": {"u1": ["lab-a", "lab-b"], "u2": ["lab-c"]}},
            "user_list": {
                "u1": {"fullname": "ann@x"},
                "u2": {"fullname": "bob@x"}
            },
            "labs": {
                "lab-a": {"created": created},
                "lab-b": {"created": created},
                "lab-c": {"created": now().timestamp()}
            }
        })
    }

    async fn runner(
        platforms: Vec<Arc<dyn LabPlatform>>,
        messenger: Arc<FakeMessenger>,
    ) -> (TempDir, Arc<FileRecordStore>, CycleRunner) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(
            FileRecordStore::open(temp_dir.path().join("records.json"))
                .await
                .unwrap(),
        );
        let runner = CycleRunner::new(
            platforms,
            messenger,
            store.clone(),
            options(TerminationPolicy::Cascade),
        );
        (temp_dir, store, runner)
    }

    #[tokio::test]
    async fn test_one_message_per_owner() {
        let old = now().timestamp() - ALERT as i64 - 100;
        let platform: Arc<dyn LabPlatform> =
            Arc::new(ScriptedPlatform::new("virl-1", diagnostics(old)));
        let messenger = Arc::new(FakeMessenger::default());
        let (_dir, store, runner) = runner(vec![platform], messenger.clone()).await;

        let report = runner.run_cycle(now()).await;

        let sent = messenger.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0.as_str(), "id-ann@x");
        assert!(sent[0].1.contains("lab-a"));
        assert!(sent[0].1.contains("lab-b"));
        assert_eq!(store.list(Some("virl-1")).await.unwrap().len(), 2);

        let ServerOutcome::Completed(server) = &report.servers[0] else {
            panic!("expected completed server");
        };
        assert_eq!(server.messages_sent, 1);
        assert_eq!(server.reconcile.notices.len(), 2);
    }

    #[tokio::test]
    async fn test_quiet_cycle_sends_nothing() {
        let platform: Arc<dyn LabPlatform> =
            Arc::new(ScriptedPlatform::new("virl-1", diagnostics(now().timestamp())));
        let messenger = Arc::new(FakeMessenger::default());
        let (_dir, _store, runner) = runner(vec![platform], messenger.clone()).await;

        let report = runner.run_cycle(now()).await;
        assert!(messenger.sent().is_empty());
        assert_eq!(report.failed_servers(), 0);
    }

    #[tokio::test]
    async fn test_failing_server_does_not_stop_cycle() {
        let old = now().timestamp() - ALERT as i64 - 100;
        let platforms: Vec<Arc<dyn LabPlatform>> = vec![
            Arc::new(ScriptedPlatform::failing("virl-down", Stage::Authenticate)),
            Arc::new(ScriptedPlatform::failing("virl-flaky", Stage::FetchDiagnostics)),
            Arc::new(ScriptedPlatform::new("virl-bad", json!({"labs": {}}))),
            Arc::new(ScriptedPlatform::new("virl-ok", diagnostics(old))),
        ];
        let messenger = Arc::new(FakeMessenger::default());
        let (_dir, _store, runner) = runner(platforms, messenger.clone()).await;

        let report = runner.run_cycle(now()).await;

        assert_eq!(report.servers.len(), 4);
        assert_eq!(report.failed_servers(), 3);
        let stages: Vec<String> = report
            .servers
            .iter()
            .filter_map(|s| match s {
                ServerOutcome::Failed { stage, .. } => Some(stage.clone()),
                ServerOutcome::Completed(_) => None,
            })
            .collect();
        assert_eq!(stages, vec!["authenticate", "fetch_diagnostics", "parse"]);
        assert_eq!(messenger.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_send_failure_is_counted_not_fatal() {
        let old = now().timestamp() - ALERT as i64 - 100;
        let platform: Arc<dyn LabPlatform> =
            Arc::new(ScriptedPlatform::new("virl-1", diagnostics(old)));
        let messenger = Arc::new(FakeMessenger {
            fail_send: true,
            ..FakeMessenger::default()
        });
        let (_dir, store, runner) = runner(vec![platform], messenger).await;

        let report = runner.run_cycle(now()).await;

        let ServerOutcome::Completed(server) = &report.servers[0] else {
            panic!("expected completed server");
        };
        assert_eq!(server.messages_failed, 1);
        // Records stay so the next cycle continues the countdown.
        assert_eq!(store.list(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_report_serializes() {
        let platform: Arc<dyn LabPlatform> =
            Arc::new(ScriptedPlatform::failing("virl-1", Stage::Authenticate));
        let messenger = Arc::new(FakeMessenger::default());
        let (_dir, _store, runner) = runner(vec![platform], messenger).await;

        let value = serde_json::to_value(runner.run_cycle(now()).await).unwrap();
        assert_eq!(value["servers"][0]["status"], "failed");
        assert_eq!(value["servers"][0]["stage"], "authenticate");
    }
}
