//! Deployment coordination: the seam between the runtime core and its two
//! external collaborators, source control and the reverse proxy.
//!
//! The runtime manager never talks to a provider API or writes proxy config
//! directly; it goes through the [`DeployCoordinator`], which owns the
//! archived-repository tolerance policy and the FQDN filtering rules.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use log::{info, warn};
use serde::Deserialize;
use thiserror::Error;

use crate::deployment::DeploymentStatus;
use crate::repository::RepositoryRecord;
use crate::runtime::RuntimeError;

pub mod github;
pub mod proxy;
pub mod stub;

pub use github::GithubClient;
pub use proxy::NginxGateway;

/// Errors from the source-control provider.
#[derive(Debug, Error)]
pub enum SourceControlError {
    /// The remote repository is archived or otherwise read-only. Tolerated
    /// during webhook registration when the policy allows it.
    #[error("remote repository is archived or read-only")]
    Archived,
    #[error("{0}")]
    Unavailable(String),
}

/// Source-control provider contract.
#[async_trait]
pub trait SourceControl: Send + Sync {
    /// Register a push webhook, returning the provider-side webhook id.
    async fn register_webhook(
        &self,
        repo: &RepositoryRecord,
        callback_url: &str,
        secret: &str,
    ) -> Result<String, SourceControlError>;

    async fn delete_webhook(
        &self,
        repo: &RepositoryRecord,
        webhook_id: &str,
    ) -> Result<(), SourceControlError>;

    /// Create a remote deployment record, returning its id.
    async fn create_deployment(&self, repo: &RepositoryRecord)
    -> Result<String, SourceControlError>;

    async fn set_deployment_status(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), SourceControlError>;

    /// Delete a remote deployment record. The provider forbids deleting one
    /// that is still active; it must be marked inactive first.
    async fn delete_deployment(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
    ) -> Result<(), SourceControlError>;

    /// Clone the repository into `dest`, or update the checkout if it exists.
    async fn ensure_source(
        &self,
        repo: &RepositoryRecord,
        dest: &Path,
    ) -> Result<(), SourceControlError>;
}

/// Reverse-proxy contract.
#[async_trait]
pub trait ProxyGateway: Send + Sync {
    async fn add_domain(&self, host: &str, port: u16) -> anyhow::Result<()>;
    async fn update_domain(&self, host: &str, port: u16, use_tls: bool) -> anyhow::Result<()>;
    async fn remove_domains(&self, hosts: &[String]) -> anyhow::Result<()>;
    async fn issue_certificate(&self, host: &str, contact_email: &str) -> anyhow::Result<()>;
}

/// A push event delivered by the provider's webhook.
#[derive(Debug, Clone, Deserialize)]
pub struct PushEvent {
    /// Full git ref, e.g. `refs/heads/main`.
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub head_commit: Option<HeadCommit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeadCommit {
    pub id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub author: Option<CommitAuthor>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CommitAuthor {
    pub name: String,
}

impl PushEvent {
    /// Branch name of the pushed ref. Non-branch refs pass through unchanged
    /// and simply never match a configured branch.
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }
}

/// Policy knobs for the coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Base URL push webhooks should call back to.
    pub callback_url: String,
    /// Shared secret for webhook signature verification.
    pub webhook_secret: String,
    /// Contact email handed to certificate issuance.
    pub contact_email: String,
    /// Tolerate "archived" errors during webhook registration instead of
    /// failing the whole creation.
    pub tolerate_archived: bool,
}

/// Thin layer the runtime manager calls at lifecycle boundaries.
pub struct DeployCoordinator {
    source: Arc<dyn SourceControl>,
    proxy: Arc<dyn ProxyGateway>,
    options: CoordinatorOptions,
}

impl DeployCoordinator {
    pub fn new(
        source: Arc<dyn SourceControl>,
        proxy: Arc<dyn ProxyGateway>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            source,
            proxy,
            options,
        }
    }

    pub fn webhook_secret(&self) -> &str {
        &self.options.webhook_secret
    }

    /// Register the push webhook for a repository. Returns `None` when the
    /// remote repository is archived and the policy tolerates that.
    pub async fn register_webhook(
        &self,
        repo: &RepositoryRecord,
    ) -> Result<Option<String>, RuntimeError> {
        let callback = format!(
            "{}/webhooks/{}",
            self.options.callback_url.trim_end_matches('/'),
            repo.id
        );
        match self
            .source
            .register_webhook(repo, &callback, &self.options.webhook_secret)
            .await
        {
            Ok(id) => Ok(Some(id)),
            Err(SourceControlError::Archived) if self.options.tolerate_archived => {
                warn!(
                    "Repository {} is archived; continuing without a webhook",
                    repo.id
                );
                Ok(None)
            }
            Err(e) => Err(RuntimeError::CollaboratorUnavailable(e.to_string())),
        }
    }

    pub async fn delete_webhook(
        &self,
        repo: &RepositoryRecord,
        webhook_id: &str,
    ) -> Result<(), RuntimeError> {
        self.source
            .delete_webhook(repo, webhook_id)
            .await
            .map_err(|e| RuntimeError::CollaboratorUnavailable(e.to_string()))
    }

    pub async fn create_deployment(&self, repo: &RepositoryRecord) -> Result<String, RuntimeError> {
        self.source
            .create_deployment(repo)
            .await
            .map_err(|e| RuntimeError::CollaboratorUnavailable(e.to_string()))
    }

    pub async fn set_deployment_status(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), RuntimeError> {
        self.source
            .set_deployment_status(repo, remote_id, status)
            .await
            .map_err(|e| RuntimeError::CollaboratorUnavailable(e.to_string()))
    }

    pub async fn delete_deployment(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
    ) -> Result<(), RuntimeError> {
        self.source
            .delete_deployment(repo, remote_id)
            .await
            .map_err(|e| RuntimeError::CollaboratorUnavailable(e.to_string()))
    }

    pub async fn ensure_source(
        &self,
        repo: &RepositoryRecord,
        dest: &Path,
    ) -> Result<(), RuntimeError> {
        self.source
            .ensure_source(repo, dest)
            .await
            .map_err(|e| RuntimeError::CollaboratorUnavailable(e.to_string()))
    }

    /// Provision every valid domain of a repository: proxy entry, then
    /// certificate, then the TLS-enabled server block. Per-domain failures
    /// are logged and skipped; domain plumbing never fails a lifecycle
    /// operation outright.
    pub async fn provision_domains(&self, repo: &RepositoryRecord) {
        for host in valid_domains(&repo.domains, &repo.id) {
            if let Err(e) = self.proxy.add_domain(&host, repo.port).await {
                warn!("Failed to add domain {} for {}: {}", host, repo.id, e);
                continue;
            }
            if let Err(e) = self
                .proxy
                .issue_certificate(&host, &self.options.contact_email)
                .await
            {
                warn!("Certificate issuance failed for {}: {}", host, e);
                continue;
            }
            if let Err(e) = self.proxy.update_domain(&host, repo.port, true).await {
                warn!("Failed to enable TLS for {}: {}", host, e);
            }
        }
    }

    /// Reconcile the proxy with a changed domain set: drop hosts that left,
    /// provision hosts that arrived.
    pub async fn sync_domains(&self, old: &RepositoryRecord, new: &RepositoryRecord) {
        let before: HashSet<String> = valid_domains(&old.domains, &old.id).collect();
        let after: HashSet<String> = valid_domains(&new.domains, &new.id).collect();

        let removed: Vec<String> = before.difference(&after).cloned().collect();
        if !removed.is_empty() {
            info!("Removing {} domain(s) for {}", removed.len(), new.id);
            if let Err(e) = self.proxy.remove_domains(&removed).await {
                warn!("Failed to remove domains for {}: {}", new.id, e);
            }
        }

        let added: Vec<String> = after.difference(&before).cloned().collect();
        if !added.is_empty() {
            let mut scoped = new.clone();
            scoped.domains = added;
            self.provision_domains(&scoped).await;
        }
    }

    /// Remove all of a repository's valid domains from the proxy.
    pub async fn remove_domains(&self, repo: &RepositoryRecord) -> anyhow::Result<()> {
        let hosts: Vec<String> = valid_domains(&repo.domains, &repo.id).collect();
        if hosts.is_empty() {
            return Ok(());
        }
        self.proxy.remove_domains(&hosts).await
    }
}

/// Filter a domain list down to syntactically valid FQDNs, warning about the
/// rest.
fn valid_domains<'a>(
    domains: &'a [String],
    repository_id: &'a str,
) -> impl Iterator<Item = String> + 'a {
    domains.iter().filter_map(move |host| {
        if is_fqdn(host) {
            Some(host.clone())
        } else {
            warn!(
                "Skipping invalid domain {:?} for repository {}",
                host, repository_id
            );
            None
        }
    })
}

/// Syntactic FQDN check: dot-separated labels of letters, digits, and
/// interior hyphens, with an alphabetic top-level label.
pub fn is_fqdn(host: &str) -> bool {
    if host.is_empty() || host.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
        if !label
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
        {
            return false;
        }
    }
    let tld = labels[labels.len() - 1];
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fqdn_accepts_normal_hostnames() {
        assert!(is_fqdn("example.com"));
        assert!(is_fqdn("app.example.com"));
        assert!(is_fqdn("my-app.staging.example.io"));
    }

    #[test]
    fn test_fqdn_rejects_bad_hostnames() {
        assert!(!is_fqdn(""));
        assert!(!is_fqdn("localhost"));
        assert!(!is_fqdn("exa mple.com"));
        assert!(!is_fqdn("-bad.example.com"));
        assert!(!is_fqdn("bad-.example.com"));
        assert!(!is_fqdn("example.c0m"));
        assert!(!is_fqdn("example.c"));
        assert!(!is_fqdn(".example.com"));
    }

    #[test]
    fn test_push_event_branch_extraction() {
        let event = PushEvent {
            git_ref: "refs/heads/main".to_string(),
            head_commit: None,
        };
        assert_eq!(event.branch(), "main");

        let tag = PushEvent {
            git_ref: "refs/tags/v1.0".to_string(),
            head_commit: None,
        };
        assert_eq!(tag.branch(), "refs/tags/v1.0");
    }
}
