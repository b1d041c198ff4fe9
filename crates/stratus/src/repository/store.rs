//! Repository persistence.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use super::models::RepositoryRecord;

const COLUMNS: &str = "id, owner_id, name, url, alias, install_command, build_command, \
     start_command, root_directory, environment, domains, branch, port, webhook_id, created_at";

/// SQL store for repository records.
#[derive(Debug, Clone)]
pub struct RepositoryStore {
    pool: SqlitePool,
}

impl RepositoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, record: &RepositoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO repositories (
                id, owner_id, name, url, alias, install_command, build_command,
                start_command, root_directory, environment, domains, branch,
                port, webhook_id, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.name)
        .bind(&record.url)
        .bind(&record.alias)
        .bind(&record.install_command)
        .bind(&record.build_command)
        .bind(&record.start_command)
        .bind(&record.root_directory)
        .bind(serde_json::to_string(&record.environment)?)
        .bind(serde_json::to_string(&record.domains)?)
        .bind(&record.branch)
        .bind(record.port as i64)
        .bind(&record.webhook_id)
        .bind(&record.created_at)
        .execute(&self.pool)
        .await
        .context("creating repository")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<RepositoryRecord>> {
        let record = sqlx::query_as::<_, RepositoryRecord>(&format!(
            "SELECT {COLUMNS} FROM repositories WHERE id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching repository")?;
        Ok(record)
    }

    pub async fn list(&self) -> Result<Vec<RepositoryRecord>> {
        let records = sqlx::query_as::<_, RepositoryRecord>(&format!(
            "SELECT {COLUMNS} FROM repositories ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .context("listing repositories")?;
        Ok(records)
    }

    pub async fn list_for_owner(&self, owner_id: &str) -> Result<Vec<RepositoryRecord>> {
        let records = sqlx::query_as::<_, RepositoryRecord>(&format!(
            "SELECT {COLUMNS} FROM repositories WHERE owner_id = ? ORDER BY created_at DESC"
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await
        .context("listing repositories for owner")?;
        Ok(records)
    }

    pub async fn alias_exists(&self, owner_id: &str, alias: &str) -> Result<bool> {
        let row: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM repositories WHERE owner_id = ? AND alias = ?")
                .bind(owner_id)
                .bind(alias)
                .fetch_optional(&self.pool)
                .await
                .context("checking alias")?;
        Ok(row.is_some())
    }

    /// Full-row update by id.
    pub async fn update(&self, record: &RepositoryRecord) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE repositories SET
                name = ?, url = ?, alias = ?, install_command = ?,
                build_command = ?, start_command = ?, root_directory = ?,
                environment = ?, domains = ?, branch = ?, port = ?, webhook_id = ?
            WHERE id = ?
            "#,
        )
        .bind(&record.name)
        .bind(&record.url)
        .bind(&record.alias)
        .bind(&record.install_command)
        .bind(&record.build_command)
        .bind(&record.start_command)
        .bind(&record.root_directory)
        .bind(serde_json::to_string(&record.environment)?)
        .bind(serde_json::to_string(&record.domains)?)
        .bind(&record.branch)
        .bind(record.port as i64)
        .bind(&record.webhook_id)
        .bind(&record.id)
        .execute(&self.pool)
        .await
        .context("updating repository")?;
        Ok(())
    }

    pub async fn set_webhook_id(&self, id: &str, webhook_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE repositories SET webhook_id = ? WHERE id = ?")
            .bind(webhook_id)
            .bind(id)
            .execute(&self.pool)
            .await
            .context("updating repository webhook id")?;
        Ok(())
    }

    /// Delete a repository row, returning the deleted snapshot so lifecycle
    /// teardown still has the full record to work from.
    pub async fn delete(&self, id: &str) -> Result<Option<RepositoryRecord>> {
        let Some(record) = self.get(id).await? else {
            return Ok(None);
        };
        sqlx::query("DELETE FROM repositories WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("deleting repository")?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    fn sample(id: &str, alias: &str) -> RepositoryRecord {
        RepositoryRecord {
            id: id.to_string(),
            owner_id: "owner-1".to_string(),
            name: "demo".to_string(),
            url: "https://example.com/demo.git".to_string(),
            alias: alias.to_string(),
            start_command: "npm start".to_string(),
            root_directory: "/".to_string(),
            branch: "main".to_string(),
            port: 3000,
            created_at: chrono::Utc::now().to_rfc3339(),
            ..RepositoryRecord::default()
        }
    }

    #[tokio::test]
    async fn test_json_columns_round_trip() {
        let db = Database::in_memory().await.unwrap();
        let store = RepositoryStore::new(db.pool().clone());

        let mut record = sample("repo-1", "demo");
        record
            .environment
            .insert("NODE_ENV".to_string(), "production".to_string());
        record.domains = vec!["app.example.com".to_string()];

        store.create(&record).await.unwrap();
        let loaded = store.get("repo-1").await.unwrap().unwrap();

        assert_eq!(loaded.environment.get("NODE_ENV").unwrap(), "production");
        assert_eq!(loaded.domains, vec!["app.example.com"]);
        assert_eq!(loaded.port, 3000);
    }

    #[tokio::test]
    async fn test_delete_returns_snapshot() {
        let db = Database::in_memory().await.unwrap();
        let store = RepositoryStore::new(db.pool().clone());

        store.create(&sample("repo-1", "demo")).await.unwrap();

        let snapshot = store.delete("repo-1").await.unwrap().unwrap();
        assert_eq!(snapshot.id, "repo-1");
        assert!(store.get("repo-1").await.unwrap().is_none());
        assert!(store.delete("repo-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_alias_lookup_is_scoped_to_owner() {
        let db = Database::in_memory().await.unwrap();
        let store = RepositoryStore::new(db.pool().clone());

        store.create(&sample("repo-1", "demo")).await.unwrap();

        assert!(store.alias_exists("owner-1", "demo").await.unwrap());
        assert!(!store.alias_exists("owner-2", "demo").await.unwrap());
    }
}
