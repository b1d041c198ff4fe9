//! Repository runtime manager: the orchestration layer between persisted
//! repository records and the processes actually running on the host.
//!
//! Every lifecycle operation for a repository runs under that repository's
//! registry slot lock, so create/update/delete/redeploy for one repository
//! never interleave while distinct repositories proceed in parallel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::fs;

use crate::account::AccountStore;
use crate::deploy::{DeployCoordinator, PushEvent};
use crate::deployment::{DeploymentRecord, DeploymentStatus, DeploymentStore};
use crate::repository::RepositoryRecord;

use super::error::{RuntimeError, TeardownReport};
use super::logs::LogStore;
use super::registry::{RuntimeRegistry, SlotState};
use super::session::{ProcessSession, SessionState};

/// Result of a successful `on_create`, for the caller to persist.
#[derive(Debug)]
pub struct CreateOutcome {
    /// Provider-side webhook id; `None` when the remote repository is
    /// archived and the tolerance policy allowed creation anyway.
    pub webhook_id: Option<String>,
}

/// How a webhook event was handled.
#[derive(Debug, PartialEq, Eq)]
pub enum WebhookDisposition {
    Redeployed,
    /// Push was for a ref other than the deployed branch.
    Ignored,
}

/// Point-in-time view of a repository's session, for the API.
#[derive(Debug, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub started_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
}

pub struct RuntimeManager {
    registry: Arc<RuntimeRegistry>,
    logs: Arc<LogStore>,
    coordinator: Arc<DeployCoordinator>,
    accounts: AccountStore,
    deployments: DeploymentStore,
    /// Directory holding one fetched source tree per repository.
    sources_dir: PathBuf,
    /// Grace period between SIGTERM and SIGKILL.
    grace: Duration,
}

impl RuntimeManager {
    pub fn new(
        registry: Arc<RuntimeRegistry>,
        logs: Arc<LogStore>,
        coordinator: Arc<DeployCoordinator>,
        accounts: AccountStore,
        deployments: DeploymentStore,
        sources_dir: PathBuf,
        grace: Duration,
    ) -> Self {
        Self {
            registry,
            logs,
            coordinator,
            accounts,
            deployments,
            sources_dir,
            grace,
        }
    }

    pub fn registry(&self) -> &Arc<RuntimeRegistry> {
        &self.registry
    }

    pub fn logs(&self) -> &Arc<LogStore> {
        &self.logs
    }

    pub fn coordinator(&self) -> &Arc<DeployCoordinator> {
        &self.coordinator
    }

    /// Lifecycle hook: a repository record was just created.
    ///
    /// The remote deployment record comes first, then the webhook, so a
    /// deployment-creation failure never orphans a freshly registered
    /// webhook. A webhook failure other than tolerated archival aborts the
    /// whole creation before any process is spawned.
    pub async fn on_create(&self, config: &RepositoryRecord) -> Result<CreateOutcome, RuntimeError> {
        config
            .validate()
            .map_err(|reason| RuntimeError::ConfigInvalid {
                id: config.id.clone(),
                reason,
            })?;

        let remote_id = self.coordinator.create_deployment(config).await?;
        let mirror = DeploymentRecord::new(&config.id, &config.owner_id, &remote_id);
        self.deployments
            .insert(&mirror)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;

        let webhook_id = self.coordinator.register_webhook(config).await?;

        self.coordinator.provision_domains(config).await;

        let slot = self.registry.slot(&config.id);
        let mut state = slot.state.lock().await;
        self.spawn_locked(&mut state, config).await?;

        info!("Repository {} created and spawned", config.id);
        Ok(CreateOutcome { webhook_id })
    }

    /// Lifecycle hook: a repository record is about to change from `old` to
    /// `new`. Restarts only when a command or the root directory changed;
    /// a domain-set change alone just reconciles the proxy.
    pub async fn on_config_update(
        &self,
        old: &RepositoryRecord,
        new: &RepositoryRecord,
    ) -> Result<(), RuntimeError> {
        new.validate()
            .map_err(|reason| RuntimeError::ConfigInvalid {
                id: new.id.clone(),
                reason,
            })?;

        if old.domains != new.domains {
            self.coordinator.sync_domains(old, new).await;
        }

        if old.requires_restart(new) {
            info!("Repository {} commands changed, restarting", new.id);
            self.restart(new).await?;
        } else {
            debug!("Repository {} update needs no restart", new.id);
        }
        Ok(())
    }

    /// Tear down and respawn under one lock acquisition, leaving no window
    /// for a second live process.
    pub async fn restart(&self, config: &RepositoryRecord) -> Result<(), RuntimeError> {
        let slot = self.registry.slot(&config.id);
        let mut state = slot.state.lock().await;

        if let Some(session) = self.registry.detach_session(&config.id, &mut state) {
            session.teardown(self.grace).await;
        }
        self.spawn_locked(&mut state, config).await
    }

    /// Spawn a session only if the registry has none for this repository.
    /// Returns whether a spawn happened. Used by bootstrap reconciliation.
    pub async fn ensure_running(&self, config: &RepositoryRecord) -> Result<bool, RuntimeError> {
        let slot = self.registry.slot(&config.id);
        let mut state = slot.state.lock().await;

        if state.session().is_some() {
            return Ok(false);
        }
        self.spawn_locked(&mut state, config).await?;
        Ok(true)
    }

    /// Lifecycle hook: the repository record was deleted. Fixed six-step
    /// best-effort teardown; a failed step is recorded and never aborts the
    /// steps after it.
    pub async fn on_delete(&self, config: &RepositoryRecord) -> TeardownReport {
        let mut report = TeardownReport::new(&config.id);

        // 1. Detach the repository from its owning account.
        report.record(
            "detach from account",
            self.accounts
                .forget_repository(&config.owner_id, &config.id)
                .await,
        );

        // 2. Drop local deployment mirrors, keeping the remote ids (newest
        //    first) for step 6.
        let remote_ids: Vec<String> = report
            .record(
                "delete local deployments",
                self.deployments.take_for_repository(&config.id).await,
            )
            .map(|records| records.into_iter().map(|d| d.remote_id).collect())
            .unwrap_or_default();

        // 3. Remove domains from the reverse proxy.
        report.record(
            "remove proxy domains",
            self.coordinator.remove_domains(config).await,
        );

        // 4. Kill the session, delete its durable log and source tree.
        {
            let slot = self.registry.slot(&config.id);
            let mut state = slot.state.lock().await;
            if let Some(session) = self.registry.detach_session(&config.id, &mut state) {
                session.teardown(self.grace).await;
            }
        }
        report.record("delete logs", self.logs.remove(&config.id).await);
        report.record(
            "delete source tree",
            remove_dir_if_present(&self.source_dir(&config.id)).await,
        );
        self.registry.remove_slot(&config.id);

        // 5. Delete the webhook.
        if let Some(webhook_id) = &config.webhook_id {
            report.record(
                "delete webhook",
                self.coordinator.delete_webhook(config, webhook_id).await,
            );
        }

        // 6. Deactivate the active remote deployment, then delete every
        //    remote entry. The provider rejects deleting an active record.
        if let Some(active) = remote_ids.first() {
            report.record(
                "deactivate remote deployment",
                self.coordinator
                    .set_deployment_status(config, active, DeploymentStatus::Inactive)
                    .await,
            );
        }
        for remote_id in &remote_ids {
            report.record(
                "delete remote deployment",
                self.coordinator.delete_deployment(config, remote_id).await,
            );
        }

        if report.is_clean() {
            info!("Repository {} torn down cleanly", config.id);
        } else {
            warn!(
                "Repository {} torn down with {} failed step(s)",
                config.id,
                report.failures.len()
            );
        }
        report
    }

    /// A push webhook arrived for this repository. Pushes to the deployed
    /// branch redeploy; anything else is ignored.
    pub async fn on_webhook_event(
        &self,
        config: &RepositoryRecord,
        event: &PushEvent,
    ) -> Result<WebhookDisposition, RuntimeError> {
        if event.branch() != config.branch {
            debug!(
                "Ignoring push to {} for repository {} (deployed branch is {})",
                event.branch(),
                config.id,
                config.branch
            );
            return Ok(WebhookDisposition::Ignored);
        }

        info!(
            "Push to {} for repository {}, redeploying",
            config.branch, config.id
        );
        self.restart(config).await?;

        // Record the deployment; a provider hiccup here must not undo the
        // redeploy that already happened.
        match self.coordinator.create_deployment(config).await {
            Ok(remote_id) => {
                let mut mirror = DeploymentRecord::new(&config.id, &config.owner_id, &remote_id);
                if let Some(commit) = &event.head_commit {
                    mirror.commit_message = commit.message.clone();
                    mirror.commit_author = commit
                        .author
                        .as_ref()
                        .map(|a| a.name.clone())
                        .unwrap_or_default();
                    mirror.commit_date = commit.timestamp.clone();
                }
                mirror.status = DeploymentStatus::Success;
                if let Err(e) = self.deployments.insert(&mirror).await {
                    warn!("Failed to record deployment for {}: {}", config.id, e);
                }
                if let Err(e) = self
                    .coordinator
                    .set_deployment_status(config, &remote_id, DeploymentStatus::Success)
                    .await
                {
                    warn!("Failed to update remote deployment status: {}", e);
                }
            }
            Err(e) => warn!(
                "Failed to create remote deployment for {}: {}",
                config.id, e
            ),
        }

        Ok(WebhookDisposition::Redeployed)
    }

    /// Session status for a repository, if it has one.
    pub async fn status(&self, repository_id: &str) -> Option<SessionStatus> {
        let session = self.registry.get(repository_id)?;
        Some(SessionStatus {
            state: session.state().await,
            started_at: session.started_at().await,
            exit_code: session.exit_code().await,
        })
    }

    /// Terminate every live session. Process-exit path.
    pub async fn shutdown(&self) {
        self.registry.shutdown_all(self.grace).await;
    }

    fn source_dir(&self, repository_id: &str) -> PathBuf {
        self.sources_dir.join(repository_id)
    }

    /// Fetch the source, open the log sink, spawn the pipeline, and install
    /// the session. Caller holds the slot lock.
    ///
    /// The occupied check happens before anything is spawned; a rejected call
    /// must not leave a process behind.
    async fn spawn_locked(
        &self,
        state: &mut SlotState,
        config: &RepositoryRecord,
    ) -> Result<(), RuntimeError> {
        if state.session().is_some() {
            return Err(RuntimeError::AlreadyRunning(config.id.clone()));
        }

        config
            .validate()
            .map_err(|reason| RuntimeError::ConfigInvalid {
                id: config.id.clone(),
                reason,
            })?;

        let source_dir = self.source_dir(&config.id);
        self.coordinator.ensure_source(config, &source_dir).await?;

        let sink = self
            .logs
            .sink_for(&config.id)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;

        let session = ProcessSession::spawn(config, sink, &source_dir).await?;
        self.registry.install_session(&config.id, state, session)
    }
}

async fn remove_dir_if_present(path: &Path) -> std::io::Result<()> {
    match fs::remove_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::deploy::stub::{StubProxy, StubSourceControl};
    use crate::deploy::{CoordinatorOptions, SourceControlError};
    use tempfile::TempDir;

    struct Harness {
        manager: RuntimeManager,
        source: Arc<StubSourceControl>,
        #[allow(dead_code)]
        proxy: Arc<StubProxy>,
        deployments: DeploymentStore,
        _dir: TempDir,
    }

    async fn harness(source: Arc<StubSourceControl>) -> Harness {
        let dir = TempDir::new().unwrap();
        let db = Database::in_memory().await.unwrap();
        let proxy = Arc::new(StubProxy::default());

        let coordinator = Arc::new(DeployCoordinator::new(
            source.clone(),
            proxy.clone(),
            CoordinatorOptions {
                callback_url: "http://localhost:8080".to_string(),
                webhook_secret: "secret".to_string(),
                contact_email: "ops@example.com".to_string(),
                tolerate_archived: true,
            },
        ));

        let deployments = DeploymentStore::new(db.pool().clone());
        let manager = RuntimeManager::new(
            Arc::new(RuntimeRegistry::new()),
            Arc::new(LogStore::new(dir.path().join("logs"))),
            coordinator,
            AccountStore::new(db.pool().clone()),
            deployments.clone(),
            dir.path().join("sources"),
            Duration::from_secs(5),
        );

        Harness {
            manager,
            source,
            proxy,
            deployments,
            _dir: dir,
        }
    }

    fn config(id: &str) -> RepositoryRecord {
        RepositoryRecord {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            name: "demo".to_string(),
            url: "https://example.com/demo.git".to_string(),
            alias: "demo".to_string(),
            start_command: "sleep 30".to_string(),
            root_directory: "/".to_string(),
            branch: "main".to_string(),
            port: 3000,
            webhook_id: Some("wh-1".to_string()),
            created_at: Utc::now().to_rfc3339(),
            ..RepositoryRecord::default()
        }
    }

    #[tokio::test]
    async fn test_create_spawns_after_webhook_and_deployment() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let config = config("repo-1");

        let outcome = h.manager.on_create(&config).await.unwrap();
        assert!(outcome.webhook_id.is_some());
        assert!(h.manager.registry().get("repo-1").is_some());

        let calls = h.source.calls();
        let deployment_pos = calls.iter().position(|c| c.starts_with("create_deployment"));
        let webhook_pos = calls.iter().position(|c| c.starts_with("register_webhook"));
        let source_pos = calls.iter().position(|c| c.starts_with("ensure_source"));
        assert!(deployment_pos.unwrap() < webhook_pos.unwrap());
        assert!(webhook_pos.unwrap() < source_pos.unwrap());

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_duplicate_create_does_not_spawn_second_process() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let config = config("repo-1");
        h.manager.on_create(&config).await.unwrap();

        let err = h.manager.on_create(&config).await.unwrap_err();
        assert!(matches!(err, RuntimeError::AlreadyRunning(_)));
        assert_eq!(h.manager.registry().len(), 1);

        // The occupied guard fires before a second pipeline is spawned.
        let spawn_attempts = h
            .source
            .calls()
            .iter()
            .filter(|c| c.starts_with("ensure_source"))
            .count();
        assert_eq!(spawn_attempts, 1);

        h.manager.shutdown().await;
        assert!(h.manager.registry().is_empty());
    }

    #[tokio::test]
    async fn test_webhook_failure_aborts_creation() {
        let source = Arc::new(StubSourceControl::default());
        source.fail_webhook_with(SourceControlError::Unavailable("api down".to_string()));
        let h = harness(source).await;

        let err = h.manager.on_create(&config("repo-1")).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CollaboratorUnavailable(_)));
        assert!(h.manager.registry().get("repo-1").is_none());
    }

    #[tokio::test]
    async fn test_archived_repository_creates_without_webhook() {
        let source = Arc::new(StubSourceControl::default());
        source.fail_webhook_with(SourceControlError::Archived);
        let h = harness(source).await;

        let outcome = h.manager.on_create(&config("repo-1")).await.unwrap();
        assert!(outcome.webhook_id.is_none());
        assert!(h.manager.registry().get("repo-1").is_some());

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_domain_only_update_does_not_restart() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let old = config("repo-1");
        h.manager.on_create(&old).await.unwrap();

        let started = h.manager.status("repo-1").await.unwrap().started_at;

        let mut new = old.clone();
        new.domains = vec!["app.example.com".to_string()];
        h.manager.on_config_update(&old, &new).await.unwrap();

        assert_eq!(h.manager.status("repo-1").await.unwrap().started_at, started);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_build_command_change_restarts_with_one_live_session() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let old = config("repo-1");
        h.manager.on_create(&old).await.unwrap();

        let before = h.manager.status("repo-1").await.unwrap().started_at.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let mut new = old.clone();
        new.build_command = "echo building".to_string();
        h.manager.on_config_update(&old, &new).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = h.manager.status("repo-1").await.unwrap();
            if let Some(after) = status.started_at {
                if after > before {
                    break;
                }
            }
            assert!(tokio::time::Instant::now() < deadline, "no restart observed");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(h.manager.registry().len(), 1);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_delete_retires_remote_deployments_in_order() {
        let source = Arc::new(StubSourceControl::default());
        source.fail_deployment_delete("d0");
        let h = harness(source).await;

        let config = config("repo-1");
        let mut older = DeploymentRecord::new(&config.id, &config.owner_id, "d0");
        older.created_at = "2026-01-01T00:00:00+00:00".to_string();
        let mut newer = DeploymentRecord::new(&config.id, &config.owner_id, "d1");
        newer.created_at = "2026-02-01T00:00:00+00:00".to_string();
        h.deployments.insert(&older).await.unwrap();
        h.deployments.insert(&newer).await.unwrap();

        let report = h.manager.on_delete(&config).await;

        let calls = h.source.calls();
        let relevant: Vec<&String> = calls
            .iter()
            .filter(|c| {
                c.starts_with("set_deployment_status") || c.starts_with("delete_deployment")
            })
            .collect();
        assert_eq!(
            relevant,
            vec![
                "set_deployment_status d1 inactive",
                "delete_deployment d1",
                "delete_deployment d0",
            ]
        );

        // The d0 failure is recorded, not fatal.
        assert!(!report.is_clean());
        assert!(report.failures.iter().any(|f| f.step == "delete remote deployment"));
        assert!(h
            .deployments
            .list_for_repository(&config.id)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_delete_kills_session_and_removes_logs() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let config = config("repo-1");
        h.manager.on_create(&config).await.unwrap();

        let session = h.manager.registry().get("repo-1").unwrap();
        let log_path = session.sink().path().to_path_buf();

        let report = h.manager.on_delete(&config).await;

        assert!(report.failures.iter().all(|f| f.step != "delete logs"));
        assert_eq!(session.state().await, SessionState::Stopped);
        assert!(h.manager.registry().get("repo-1").is_none());
        assert!(!log_path.exists());
    }

    #[tokio::test]
    async fn test_push_to_other_branch_is_ignored() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let config = config("repo-1");
        h.manager.on_create(&config).await.unwrap();

        let started = h.manager.status("repo-1").await.unwrap().started_at;

        let event = PushEvent {
            git_ref: "refs/heads/feature".to_string(),
            head_commit: None,
        };
        let disposition = h.manager.on_webhook_event(&config, &event).await.unwrap();

        assert_eq!(disposition, WebhookDisposition::Ignored);
        assert_eq!(h.manager.status("repo-1").await.unwrap().started_at, started);

        h.manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_push_to_deployed_branch_redeploys_and_records() {
        let h = harness(Arc::new(StubSourceControl::default())).await;
        let config = config("repo-1");
        h.manager.on_create(&config).await.unwrap();

        let event = PushEvent {
            git_ref: "refs/heads/main".to_string(),
            head_commit: Some(crate::deploy::HeadCommit {
                id: "abc123".to_string(),
                message: "fix the thing".to_string(),
                timestamp: None,
                author: Some(crate::deploy::CommitAuthor {
                    name: "alice".to_string(),
                }),
            }),
        };
        let disposition = h.manager.on_webhook_event(&config, &event).await.unwrap();
        assert_eq!(disposition, WebhookDisposition::Redeployed);

        let deployments = h.deployments.list_for_repository("repo-1").await.unwrap();
        // One mirror from creation, one from the push.
        assert_eq!(deployments.len(), 2);
        assert!(deployments.iter().any(|d| d.commit_message == "fix the thing"));

        h.manager.shutdown().await;
    }
}
