//! Owning accounts and their repository links.

use anyhow::{Context, Result};
use chrono::Utc;
use sqlx::SqlitePool;
use uuid::Uuid;

/// A platform account that owns repositories.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct AccountRecord {
    pub id: String,
    pub username: String,
    pub created_at: String,
}

impl AccountRecord {
    pub fn new(username: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            username: username.to_string(),
            created_at: Utc::now().to_rfc3339(),
        }
    }
}

/// Account persistence.
#[derive(Debug, Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, account: &AccountRecord) -> Result<()> {
        sqlx::query("INSERT INTO accounts (id, username, created_at) VALUES (?, ?, ?)")
            .bind(&account.id)
            .bind(&account.username)
            .bind(&account.created_at)
            .execute(&self.pool)
            .await
            .context("creating account")?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Option<AccountRecord>> {
        let account = sqlx::query_as::<_, AccountRecord>(
            "SELECT id, username, created_at FROM accounts WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("fetching account")?;
        Ok(account)
    }

    /// Attach a repository to an account. Idempotent.
    pub async fn link_repository(&self, account_id: &str, repository_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO account_repositories (account_id, repository_id)
            VALUES (?, ?)
            "#,
        )
        .bind(account_id)
        .bind(repository_id)
        .execute(&self.pool)
        .await
        .context("linking repository to account")?;
        Ok(())
    }

    /// Detach a repository from its owning account. Removing an absent link
    /// is a no-op.
    pub async fn forget_repository(&self, account_id: &str, repository_id: &str) -> Result<()> {
        sqlx::query(
            "DELETE FROM account_repositories WHERE account_id = ? AND repository_id = ?",
        )
        .bind(account_id)
        .bind(repository_id)
        .execute(&self.pool)
        .await
        .context("detaching repository from account")?;
        Ok(())
    }

    /// Repository ids linked to an account.
    pub async fn repository_ids(&self, account_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT repository_id FROM account_repositories WHERE account_id = ?",
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await
        .context("listing account repositories")?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[tokio::test]
    async fn test_link_and_forget_repository() {
        let db = Database::in_memory().await.unwrap();
        let store = AccountStore::new(db.pool().clone());

        let account = AccountRecord::new("alice");
        store.create(&account).await.unwrap();

        store.link_repository(&account.id, "repo-1").await.unwrap();
        store.link_repository(&account.id, "repo-1").await.unwrap();
        assert_eq!(store.repository_ids(&account.id).await.unwrap().len(), 1);

        store
            .forget_repository(&account.id, "repo-1")
            .await
            .unwrap();
        assert!(store.repository_ids(&account.id).await.unwrap().is_empty());

        // Forgetting again is a no-op.
        store
            .forget_repository(&account.id, "repo-1")
            .await
            .unwrap();
    }
}
