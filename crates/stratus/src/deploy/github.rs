//! GitHub implementation of the source-control contract.

use std::path::Path;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;
use tokio::process::Command;

use crate::deployment::DeploymentStatus;
use crate::repository::RepositoryRecord;

use super::{SourceControl, SourceControlError};

const DEFAULT_API_BASE: &str = "https://api.github.com";

pub struct GithubClient {
    http: reqwest::Client,
    token: String,
    api_base: String,
}

impl GithubClient {
    pub fn new(token: &str) -> Self {
        Self::with_api_base(token, DEFAULT_API_BASE)
    }

    pub fn with_api_base(token: &str, api_base: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            token: token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.http
            .request(method, format!("{}{}", self.api_base, path))
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "stratus")
    }

    /// Send a request and classify failures. Archived/read-only repositories
    /// answer 403/410 with an "archived" message.
    async fn send(
        &self,
        builder: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, SourceControlError> {
        let response = builder
            .send()
            .await
            .map_err(|e| SourceControlError::Unavailable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if (status == reqwest::StatusCode::FORBIDDEN || status == reqwest::StatusCode::GONE)
            && body.to_lowercase().contains("archived")
        {
            return Err(SourceControlError::Archived);
        }
        Err(SourceControlError::Unavailable(format!(
            "github returned {}: {}",
            status, body
        )))
    }
}

#[async_trait]
impl SourceControl for GithubClient {
    async fn register_webhook(
        &self,
        repo: &RepositoryRecord,
        callback_url: &str,
        secret: &str,
    ) -> Result<String, SourceControlError> {
        let slug = repo_slug(&repo.url)?;
        let response = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/hooks", slug))
                    .json(&json!({
                        "name": "web",
                        "active": true,
                        "events": ["push"],
                        "config": {
                            "url": callback_url,
                            "content_type": "json",
                            "secret": secret,
                        },
                    })),
            )
            .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceControlError::Unavailable(e.to_string()))?;
        let id = body["id"]
            .as_i64()
            .ok_or_else(|| SourceControlError::Unavailable("hook response had no id".into()))?;
        info!("Registered webhook {} for {}", id, slug);
        Ok(id.to_string())
    }

    async fn delete_webhook(
        &self,
        repo: &RepositoryRecord,
        webhook_id: &str,
    ) -> Result<(), SourceControlError> {
        let slug = repo_slug(&repo.url)?;
        self.send(self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{}/hooks/{}", slug, webhook_id),
        ))
        .await?;
        Ok(())
    }

    async fn create_deployment(
        &self,
        repo: &RepositoryRecord,
    ) -> Result<String, SourceControlError> {
        let slug = repo_slug(&repo.url)?;
        let response = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/deployments", slug))
                    .json(&json!({
                        "ref": repo.branch,
                        "auto_merge": false,
                        "required_contexts": [],
                        "environment": "production",
                    })),
            )
            .await?;

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SourceControlError::Unavailable(e.to_string()))?;
        let id = body["id"].as_i64().ok_or_else(|| {
            SourceControlError::Unavailable("deployment response had no id".into())
        })?;
        Ok(id.to_string())
    }

    async fn set_deployment_status(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
        status: DeploymentStatus,
    ) -> Result<(), SourceControlError> {
        let slug = repo_slug(&repo.url)?;
        self.send(
            self.request(
                reqwest::Method::POST,
                &format!("/repos/{}/deployments/{}/statuses", slug, remote_id),
            )
            .json(&json!({ "state": status.to_string() })),
        )
        .await?;
        Ok(())
    }

    async fn delete_deployment(
        &self,
        repo: &RepositoryRecord,
        remote_id: &str,
    ) -> Result<(), SourceControlError> {
        let slug = repo_slug(&repo.url)?;
        self.send(self.request(
            reqwest::Method::DELETE,
            &format!("/repos/{}/deployments/{}", slug, remote_id),
        ))
        .await?;
        Ok(())
    }

    /// Shallow-clone the deployed branch, or fast-forward an existing
    /// checkout to the remote head.
    async fn ensure_source(
        &self,
        repo: &RepositoryRecord,
        dest: &Path,
    ) -> Result<(), SourceControlError> {
        if dest.join(".git").exists() {
            debug!("Updating checkout for {} in {}", repo.id, dest.display());
            run_git(&[
                "-C",
                &dest.to_string_lossy(),
                "fetch",
                "--depth",
                "1",
                "origin",
                &repo.branch,
            ])
            .await?;
            run_git(&["-C", &dest.to_string_lossy(), "reset", "--hard", "FETCH_HEAD"]).await?;
        } else {
            debug!("Cloning {} into {}", repo.url, dest.display());
            if let Some(parent) = dest.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| SourceControlError::Unavailable(e.to_string()))?;
            }
            run_git(&[
                "clone",
                "--depth",
                "1",
                "--branch",
                &repo.branch,
                &repo.url,
                &dest.to_string_lossy(),
            ])
            .await?;
        }
        Ok(())
    }
}

async fn run_git(args: &[&str]) -> Result<(), SourceControlError> {
    let output = Command::new("git")
        .args(args)
        .output()
        .await
        .map_err(|e| SourceControlError::Unavailable(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(SourceControlError::Unavailable(format!(
            "git {} failed: {}",
            args.first().copied().unwrap_or_default(),
            stderr.trim()
        )));
    }
    Ok(())
}

/// Extract `owner/name` from a GitHub remote URL.
fn repo_slug(url: &str) -> Result<String, SourceControlError> {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");

    let path = if let Some(rest) = trimmed.strip_prefix("git@github.com:") {
        rest
    } else if let Some(idx) = trimmed.find("github.com/") {
        &trimmed[idx + "github.com/".len()..]
    } else {
        return Err(SourceControlError::Unavailable(format!(
            "not a github url: {}",
            url
        )));
    };

    let parts: Vec<&str> = path.split('/').collect();
    if parts.len() != 2 || parts.iter().any(|p| p.is_empty()) {
        return Err(SourceControlError::Unavailable(format!(
            "cannot extract owner/name from {}",
            url
        )));
    }
    Ok(format!("{}/{}", parts[0], parts[1]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repo_slug_parsing() {
        assert_eq!(
            repo_slug("https://github.com/alice/demo.git").unwrap(),
            "alice/demo"
        );
        assert_eq!(
            repo_slug("https://github.com/alice/demo").unwrap(),
            "alice/demo"
        );
        assert_eq!(
            repo_slug("git@github.com:alice/demo.git").unwrap(),
            "alice/demo"
        );
        assert!(repo_slug("https://example.com/alice/demo").is_err());
        assert!(repo_slug("https://github.com/alice").is_err());
    }
}
