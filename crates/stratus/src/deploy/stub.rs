//! Offline collaborators: in-memory source control and proxy.
//!
//! Used by `serve --offline` to run the platform without provider
//! credentials or an nginx installation, and by tests to observe the exact
//! collaborator call sequence.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use log::debug;
use tokio::fs;

use crate::deployment::DeploymentStatus;
use crate::repository::RepositoryRecord;

use super::{ProxyGateway, SourceControl, SourceControlError};

/// Source control that records every call and serves sources from an empty
/// local directory.
#[derive(Default)]
pub struct StubSourceControl {
    calls: Mutex<Vec<String>>,
    next_remote: AtomicU64,
    webhook_error: Mutex<Option<SourceControlError>>,
    failing_deletes: Mutex<HashSet<String>>,
}

impl StubSourceControl {
    /// Make the next webhook registration fail with `error`.
    pub fn fail_webhook_with(&self, error: SourceControlError) {
        *self.webhook_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    /// Make deleting the remote deployment `remote_id` fail.
    pub fn fail_deployment_delete(&self, remote_id: &str) {
        self.failing_deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(remote_id.to_string());
    }

    /// Every collaborator call so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, call: String) {
        debug!("offline source control: {}", call);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl SourceControl for StubSourceControl {
    async fn register_webhook(
        &self,
        repo: &RepositoryRecord,
        _callback_url: &str,
        _secret: &str,
    ) -> Result<String, SourceControlError> {
        self.record(format!("register_webhook {}", repo.id));
        if let Some(error) = self
            .webhook_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            return Err(error);
        }
        Ok(format!("webhook-{}", repo.id))
    }

    async fn delete_webhook(
        &self,
        repo: &RepositoryRecord,
        webhook_id: &str,
    ) -> Result<(), SourceControlError> {
        self.record(format!("delete_webhook {} {}", repo.id, webhook_id));
        Ok(())
    }

    async fn create_deployment(
        &self,
        repo: &RepositoryRecord,
    ) -> Result<String, SourceControlError> {
        self.record(format!("create_deployment {}", repo.id));
        let n = self.next_remote.fetch_add(1, Ordering::SeqCst);
        Ok(format!("remote-{}", n))
    }

    async fn set_deployment_status(
        &self,
        _repo: &RepositoryRecord,
        remote_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), SourceControlError> {
        self.record(format!("set_deployment_status {} {}", remote_id, status));
        Ok(())
    }

    async fn delete_deployment(
        &self,
        _repo: &RepositoryRecord,
        remote_id: &str,
    ) -> Result<(), SourceControlError> {
        self.record(format!("delete_deployment {}", remote_id));
        if self
            .failing_deletes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(remote_id)
        {
            return Err(SourceControlError::Unavailable(format!(
                "cannot delete {}",
                remote_id
            )));
        }
        Ok(())
    }

    async fn ensure_source(
        &self,
        repo: &RepositoryRecord,
        dest: &Path,
    ) -> Result<(), SourceControlError> {
        self.record(format!("ensure_source {}", repo.id));
        fs::create_dir_all(dest)
            .await
            .map_err(|e| SourceControlError::Unavailable(e.to_string()))
    }
}

/// Proxy gateway that records calls and configures nothing.
#[derive(Default)]
pub struct StubProxy {
    calls: Mutex<Vec<String>>,
}

impl StubProxy {
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn record(&self, call: String) {
        debug!("offline proxy: {}", call);
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(call);
    }
}

#[async_trait]
impl ProxyGateway for StubProxy {
    async fn add_domain(&self, host: &str, port: u16) -> anyhow::Result<()> {
        self.record(format!("add_domain {} {}", host, port));
        Ok(())
    }

    async fn update_domain(&self, host: &str, port: u16, use_tls: bool) -> anyhow::Result<()> {
        self.record(format!("update_domain {} {} tls={}", host, port, use_tls));
        Ok(())
    }

    async fn remove_domains(&self, hosts: &[String]) -> anyhow::Result<()> {
        self.record(format!("remove_domains {}", hosts.join(",")));
        Ok(())
    }

    async fn issue_certificate(&self, host: &str, contact_email: &str) -> anyhow::Result<()> {
        self.record(format!("issue_certificate {} {}", host, contact_email));
        Ok(())
    }
}
