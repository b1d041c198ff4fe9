//! Local mirrors of the provider's deployment records.
//!
//! Every remote deployment record the platform creates gets a local row so
//! teardown can find the remote ids to retire even when the provider is the
//! component being deleted against. Rows are ordered newest first; the
//! newest one mirrors the currently active remote deployment.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row, SqlitePool};
use uuid::Uuid;

/// Status of a deployment, local and remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    Pending,
    Success,
    Failure,
    Inactive,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeploymentStatus::Pending => write!(f, "pending"),
            DeploymentStatus::Success => write!(f, "success"),
            DeploymentStatus::Failure => write!(f, "failure"),
            DeploymentStatus::Inactive => write!(f, "inactive"),
        }
    }
}

impl std::str::FromStr for DeploymentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(DeploymentStatus::Pending),
            "success" => Ok(DeploymentStatus::Success),
            "failure" => Ok(DeploymentStatus::Failure),
            "inactive" => Ok(DeploymentStatus::Inactive),
            other => anyhow::bail!("unknown deployment status: {}", other),
        }
    }
}

/// One deployment of a repository.
#[derive(Debug, Clone, Serialize)]
pub struct DeploymentRecord {
    pub id: String,
    pub repository_id: String,
    pub owner_id: String,
    /// Provider-side deployment id.
    pub remote_id: String,
    pub status: DeploymentStatus,
    pub commit_message: String,
    pub commit_author: String,
    pub commit_date: Option<String>,
    pub created_at: String,
}

impl DeploymentRecord {
    pub fn new(repository_id: &str, owner_id: &str, remote_id: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            repository_id: repository_id.to_string(),
            owner_id: owner_id.to_string(),
            remote_id: remote_id.to_string(),
            status: DeploymentStatus::Pending,
            commit_message: String::new(),
            commit_author: String::new(),
            commit_date: None,
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

impl FromRow<'_, SqliteRow> for DeploymentRecord {
    fn from_row(row: &SqliteRow) -> std::result::Result<Self, sqlx::Error> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse()
            .map_err(|e: anyhow::Error| sqlx::Error::ColumnDecode {
                index: "status".to_string(),
                source: e.into(),
            })?;

        Ok(Self {
            id: row.try_get("id")?,
            repository_id: row.try_get("repository_id")?,
            owner_id: row.try_get("owner_id")?,
            remote_id: row.try_get("remote_id")?,
            status,
            commit_message: row.try_get("commit_message")?,
            commit_author: row.try_get("commit_author")?,
            commit_date: row.try_get("commit_date")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Deployment-mirror persistence.
#[derive(Debug, Clone)]
pub struct DeploymentStore {
    pool: SqlitePool,
}

impl DeploymentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, record: &DeploymentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO deployments (
                id, repository_id, owner_id, remote_id, status,
                commit_message, commit_author, commit_date, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.repository_id)
        .bind(&record.owner_id)
        .bind(&record.remote_id)
        .bind(record.status.to_string())
        .bind(&record.commit_message)
        .bind(&record.commit_author)
        .bind(&record.commit_date)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .context("inserting deployment")?;
        Ok(())
    }

    /// Deployments for a repository, newest first. Index 0 mirrors the
    /// currently active remote deployment.
    pub async fn list_for_repository(&self, repository_id: &str) -> Result<Vec<DeploymentRecord>> {
        let rows = sqlx::query_as::<_, DeploymentRecord>(
            r#"
            SELECT id, repository_id, owner_id, remote_id, status,
                   commit_message, commit_author, commit_date, created_at
            FROM deployments
            WHERE repository_id = ?
            ORDER BY created_at DESC, id DESC
            "#,
        )
        .bind(repository_id)
        .fetch_all(&self.pool)
        .await
        .context("listing deployments")?;
        Ok(rows)
    }

    /// Delete every local mirror for a repository, returning them newest
    /// first so the caller still has the remote ids to retire.
    pub async fn take_for_repository(&self, repository_id: &str) -> Result<Vec<DeploymentRecord>> {
        let records = self.list_for_repository(repository_id).await?;
        sqlx::query("DELETE FROM deployments WHERE repository_id = ?")
            .bind(repository_id)
            .execute(&self.pool)
            .await
            .context("deleting deployments")?;
        Ok(records)
    }

    pub async fn set_status(&self, id: &str, status: DeploymentStatus) -> Result<()> {
        sqlx::query("UPDATE deployments SET status = ? WHERE id = ?")
            .bind(status.to_string())
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating deployment status")?;
        Ok(())
    }
}
