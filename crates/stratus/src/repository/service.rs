//! Repository lifecycle service: the persistence boundary that guarantees
//! the runtime manager's hooks run around every create, update, and delete.

use std::sync::Arc;

use anyhow::Result;
use log::{error, warn};
use uuid::Uuid;

use crate::account::AccountStore;
use crate::deploy::PushEvent;
use crate::runtime::{RuntimeError, RuntimeManager, TeardownReport, WebhookDisposition};

use super::models::{NewRepository, RepositoryRecord, RepositoryUpdate};
use super::store::RepositoryStore;

#[derive(Clone)]
pub struct RepositoryService {
    store: RepositoryStore,
    accounts: AccountStore,
    manager: Arc<RuntimeManager>,
}

impl RepositoryService {
    pub fn new(store: RepositoryStore, accounts: AccountStore, manager: Arc<RuntimeManager>) -> Self {
        Self {
            store,
            accounts,
            manager,
        }
    }

    pub fn store(&self) -> &RepositoryStore {
        &self.store
    }

    /// Register a repository: persist the record, then run the create hook.
    /// If the hook fails the row is rolled back, so a failed creation leaves
    /// no trace.
    pub async fn create(
        &self,
        owner_id: &str,
        input: NewRepository,
    ) -> Result<RepositoryRecord, RuntimeError> {
        let alias = self
            .unique_alias(owner_id, input.alias.as_deref().unwrap_or(&input.name))
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;

        let mut record = RepositoryRecord {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            name: input.name,
            url: input.url,
            alias,
            install_command: input.install_command,
            build_command: input.build_command,
            start_command: input.start_command,
            root_directory: input.root_directory,
            environment: input.environment,
            domains: input.domains,
            branch: input.branch,
            port: input.port,
            webhook_id: None,
            created_at: chrono::Utc::now().to_rfc3339(),
        };

        record
            .validate()
            .map_err(|reason| RuntimeError::ConfigInvalid {
                id: record.id.clone(),
                reason,
            })?;

        self.store
            .create(&record)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;
        if let Err(e) = self.accounts.link_repository(owner_id, &record.id).await {
            warn!("Failed to link repository {} to account: {}", record.id, e);
        }

        match self.manager.on_create(&record).await {
            Ok(outcome) => {
                record.webhook_id = outcome.webhook_id;
                if let Err(e) = self
                    .store
                    .set_webhook_id(&record.id, record.webhook_id.as_deref())
                    .await
                {
                    warn!("Failed to persist webhook id for {}: {}", record.id, e);
                }
                Ok(record)
            }
            Err(e) => {
                error!("Creation of repository {} failed: {}", record.id, e);
                if let Err(rollback) = self.store.delete(&record.id).await {
                    error!("Rollback of repository {} failed: {}", record.id, rollback);
                }
                if let Err(rollback) = self
                    .accounts
                    .forget_repository(owner_id, &record.id)
                    .await
                {
                    error!("Account rollback for {} failed: {}", record.id, rollback);
                }
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: &str) -> Result<Option<RepositoryRecord>> {
        self.store.get(id).await
    }

    pub async fn list(&self) -> Result<Vec<RepositoryRecord>> {
        self.store.list().await
    }

    /// Apply a partial update. The update hook runs with both snapshots
    /// before the row is written; the row is only persisted if the hook
    /// accepts the new configuration.
    pub async fn update(
        &self,
        id: &str,
        changes: RepositoryUpdate,
    ) -> Result<Option<RepositoryRecord>, RuntimeError> {
        let Some(old) = self
            .store
            .get(id)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };

        let new = changes.apply(&old);
        self.manager.on_config_update(&old, &new).await?;

        self.store
            .update(&new)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?;
        Ok(Some(new))
    }

    /// Delete a repository. The row is removed first; the delete hook then
    /// runs against the snapshot, so teardown completes even though the
    /// record is already gone.
    pub async fn delete(&self, id: &str) -> Result<Option<TeardownReport>, RuntimeError> {
        let Some(snapshot) = self
            .store
            .delete(id)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };

        Ok(Some(self.manager.on_delete(&snapshot).await))
    }

    pub async fn restart(&self, id: &str) -> Result<Option<()>, RuntimeError> {
        let Some(record) = self
            .store
            .get(id)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        self.manager.restart(&record).await?;
        Ok(Some(()))
    }

    pub async fn handle_push(
        &self,
        id: &str,
        event: &PushEvent,
    ) -> Result<Option<WebhookDisposition>, RuntimeError> {
        let Some(record) = self
            .store
            .get(id)
            .await
            .map_err(|e| RuntimeError::Storage(e.to_string()))?
        else {
            return Ok(None);
        };
        Ok(Some(self.manager.on_webhook_event(&record, event).await?))
    }

    /// Derive a free alias for an owner, appending a short suffix on
    /// collision.
    async fn unique_alias(&self, owner_id: &str, desired: &str) -> Result<String> {
        let base = slugify(desired);
        let mut candidate = base.clone();
        while self.store.alias_exists(owner_id, &candidate).await? {
            let suffix = Uuid::new_v4().to_string();
            candidate = format!("{}-{}", base, &suffix[..4]);
        }
        Ok(candidate)
    }
}

fn slugify(name: &str) -> String {
    let slug: String = name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let slug = slug.trim_matches('-').to_string();
    if slug.is_empty() { "repo".to_string() } else { slug }
}
