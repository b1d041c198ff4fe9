//! Repository record and its API input shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;

/// A registered repository: the persisted desired state the runtime manager
/// reconciles processes against.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RepositoryRecord {
    pub id: String,
    pub owner_id: String,
    pub name: String,
    /// Remote git URL.
    pub url: String,
    /// Unique per owner; a short suffix is appended on collision.
    pub alias: String,
    /// Empty string means "skip this stage".
    pub install_command: String,
    pub build_command: String,
    pub start_command: String,
    /// Relative path inside the fetched source tree.
    pub root_directory: String,
    pub environment: HashMap<String, String>,
    pub domains: Vec<String>,
    /// Deployed ref; pushes to other refs are ignored.
    pub branch: String,
    /// Host port the application listens on; the proxy target.
    pub port: u16,
    /// Provider-side webhook id, set at creation. Absent for archived
    /// repositories created without a webhook.
    pub webhook_id: Option<String>,
    pub created_at: String,
}

impl RepositoryRecord {
    /// Whether updating to `new` requires tearing down and respawning the
    /// process. Domain or environment-display changes alone do not.
    pub fn requires_restart(&self, new: &Self) -> bool {
        self.install_command != new.install_command
            || self.build_command != new.build_command
            || self.start_command != new.start_command
            || self.root_directory != new.root_directory
    }

    /// Structural validation, run before any process is touched.
    pub fn validate(&self) -> Result<(), String> {
        if self.start_command.trim().is_empty() {
            return Err("start command must not be empty".to_string());
        }
        if self.root_directory.split('/').any(|part| part == "..") {
            return Err("root directory must not traverse upward".to_string());
        }
        if self.port == 0 {
            return Err("port must be non-zero".to_string());
        }
        Ok(())
    }
}

impl sqlx::FromRow<'_, SqliteRow> for RepositoryRecord {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        let environment: String = row.try_get("environment")?;
        let environment =
            serde_json::from_str(&environment).map_err(|e| sqlx::Error::ColumnDecode {
                index: "environment".to_string(),
                source: Box::new(e),
            })?;

        let domains: String = row.try_get("domains")?;
        let domains = serde_json::from_str(&domains).map_err(|e| sqlx::Error::ColumnDecode {
            index: "domains".to_string(),
            source: Box::new(e),
        })?;

        let port: i64 = row.try_get("port")?;

        Ok(Self {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            name: row.try_get("name")?,
            url: row.try_get("url")?,
            alias: row.try_get("alias")?,
            install_command: row.try_get("install_command")?,
            build_command: row.try_get("build_command")?,
            start_command: row.try_get("start_command")?,
            root_directory: row.try_get("root_directory")?,
            environment,
            domains,
            branch: row.try_get("branch")?,
            port: port as u16,
            webhook_id: row.try_get("webhook_id")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Input for registering a repository.
#[derive(Debug, Clone, Deserialize)]
pub struct NewRepository {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub alias: Option<String>,
    #[serde(default)]
    pub install_command: String,
    #[serde(default)]
    pub build_command: String,
    pub start_command: String,
    #[serde(default = "default_root_directory")]
    pub root_directory: String,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default = "default_branch")]
    pub branch: String,
    pub port: u16,
}

fn default_root_directory() -> String {
    "/".to_string()
}

fn default_branch() -> String {
    "main".to_string()
}

/// Partial update of a repository. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RepositoryUpdate {
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub root_directory: Option<String>,
    pub environment: Option<HashMap<String, String>>,
    pub domains: Option<Vec<String>>,
    pub branch: Option<String>,
    pub port: Option<u16>,
}

impl RepositoryUpdate {
    /// Apply this update on top of an existing record.
    pub fn apply(&self, record: &RepositoryRecord) -> RepositoryRecord {
        let mut updated = record.clone();
        if let Some(v) = &self.install_command {
            updated.install_command = v.clone();
        }
        if let Some(v) = &self.build_command {
            updated.build_command = v.clone();
        }
        if let Some(v) = &self.start_command {
            updated.start_command = v.clone();
        }
        if let Some(v) = &self.root_directory {
            updated.root_directory = v.clone();
        }
        if let Some(v) = &self.environment {
            updated.environment = v.clone();
        }
        if let Some(v) = &self.domains {
            updated.domains = v.clone();
        }
        if let Some(v) = &self.branch {
            updated.branch = v.clone();
        }
        if let Some(v) = self.port {
            updated.port = v;
        }
        updated
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> RepositoryRecord {
        RepositoryRecord {
            id: "repo-1".to_string(),
            start_command: "npm start".to_string(),
            root_directory: "/".to_string(),
            port: 3000,
            ..RepositoryRecord::default()
        }
    }

    #[test]
    fn test_restart_only_for_command_and_path_changes() {
        let old = record();

        let mut domains_only = old.clone();
        domains_only.domains = vec!["app.example.com".to_string()];
        assert!(!old.requires_restart(&domains_only));

        let mut build_changed = old.clone();
        build_changed.build_command = "npm run build".to_string();
        assert!(old.requires_restart(&build_changed));

        let mut root_changed = old.clone();
        root_changed.root_directory = "/server".to_string();
        assert!(old.requires_restart(&root_changed));
    }

    #[test]
    fn test_validation_rejects_traversal_and_empty_start() {
        let mut r = record();
        r.root_directory = "../outside".to_string();
        assert!(r.validate().is_err());

        let mut r = record();
        r.start_command = "  ".to_string();
        assert!(r.validate().is_err());

        assert!(record().validate().is_ok());
    }
}
