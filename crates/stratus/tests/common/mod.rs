//! Shared test setup: a full router backed by in-memory SQLite and offline
//! collaborators.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use tempfile::TempDir;

use stratus::account::AccountStore;
use stratus::api::{self, AppState};
use stratus::db::Database;
use stratus::deploy::stub::{StubProxy, StubSourceControl};
use stratus::deploy::{CoordinatorOptions, DeployCoordinator};
use stratus::deployment::DeploymentStore;
use stratus::repository::{RepositoryService, RepositoryStore};
use stratus::runtime::{LogStore, RuntimeManager, RuntimeRegistry};

pub const WEBHOOK_SECRET: &str = "test-secret";

pub struct TestApp {
    pub router: Router,
    pub manager: Arc<RuntimeManager>,
    /// Keeps the log/source scratch space alive for the test's duration.
    pub _dir: TempDir,
}

pub async fn test_app() -> TestApp {
    let dir = TempDir::new().unwrap();
    let db = Database::in_memory().await.unwrap();

    let coordinator = Arc::new(DeployCoordinator::new(
        Arc::new(StubSourceControl::default()),
        Arc::new(StubProxy::default()),
        CoordinatorOptions {
            callback_url: "http://localhost:8080".to_string(),
            webhook_secret: WEBHOOK_SECRET.to_string(),
            contact_email: "ops@example.com".to_string(),
            tolerate_archived: true,
        },
    ));

    let accounts = AccountStore::new(db.pool().clone());
    let deployments = DeploymentStore::new(db.pool().clone());
    let manager = Arc::new(RuntimeManager::new(
        Arc::new(RuntimeRegistry::new()),
        Arc::new(LogStore::new(dir.path().join("logs"))),
        coordinator,
        accounts.clone(),
        deployments.clone(),
        dir.path().join("sources"),
        Duration::from_secs(5),
    ));

    let repositories = RepositoryService::new(
        RepositoryStore::new(db.pool().clone()),
        accounts,
        manager.clone(),
    );

    let state = AppState::new(
        repositories,
        manager.clone(),
        deployments,
        WEBHOOK_SECRET.to_string(),
    );

    TestApp {
        router: api::create_router(state),
        manager,
        _dir: dir,
    }
}
