//! Startup reconciliation: make the registry match the persisted records.

use std::sync::Arc;

use anyhow::Result;
use futures::future::join_all;
use log::{error, info};

use crate::repository::RepositoryStore;

use super::manager::RuntimeManager;

/// Outcome counts of one reconciliation pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct BootstrapSummary {
    pub started: usize,
    pub already_running: usize,
    pub failed: usize,
}

/// Load every persisted repository and spawn a session for each one that has
/// no live registry entry. Runs before the listener accepts traffic.
///
/// Webhooks and remote deployment records are assumed to exist from the
/// prior run; they are not recreated here.
pub async fn reconcile(
    manager: &Arc<RuntimeManager>,
    repositories: &RepositoryStore,
) -> Result<BootstrapSummary> {
    let records = repositories.list().await?;
    info!("Reconciling {} persisted repositories", records.len());

    let tasks = records.into_iter().map(|record| {
        let manager = manager.clone();
        async move {
            match manager.ensure_running(&record).await {
                Ok(true) => {
                    info!("Started repository {}", record.id);
                    Outcome::Started
                }
                Ok(false) => Outcome::AlreadyRunning,
                Err(e) => {
                    error!("Failed to start repository {}: {}", record.id, e);
                    Outcome::Failed
                }
            }
        }
    });

    let mut summary = BootstrapSummary::default();
    for outcome in join_all(tasks).await {
        match outcome {
            Outcome::Started => summary.started += 1,
            Outcome::AlreadyRunning => summary.already_running += 1,
            Outcome::Failed => summary.failed += 1,
        }
    }

    info!(
        "Reconciliation complete: {} started, {} already running, {} failed",
        summary.started, summary.already_running, summary.failed
    );
    Ok(summary)
}

enum Outcome {
    Started,
    AlreadyRunning,
    Failed,
}
