//! Application state shared across handlers.

use std::sync::Arc;

use crate::deployment::DeploymentStore;
use crate::repository::RepositoryService;
use crate::runtime::RuntimeManager;

#[derive(Clone)]
pub struct AppState {
    pub repositories: RepositoryService,
    pub manager: Arc<RuntimeManager>,
    pub deployments: DeploymentStore,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
}

impl AppState {
    pub fn new(
        repositories: RepositoryService,
        manager: Arc<RuntimeManager>,
        deployments: DeploymentStore,
        webhook_secret: String,
    ) -> Self {
        Self {
            repositories,
            manager,
            deployments,
            webhook_secret,
        }
    }
}
