//! SQLite pool and schema bootstrap.

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;

/// Database connection pool.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the database at `path`.
    pub async fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating database directory: {}", parent.display()))?;
        }

        let database_url = format!("sqlite://{}?mode=rwc", path.display());

        let options = SqliteConnectOptions::from_str(&database_url)
            .context("parsing database URL")?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("connecting to database")?;

        let db = Self { pool };
        db.ensure_schema().await?;

        Ok(db)
    }

    /// Create an in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .context("parsing in-memory database URL")?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .context("connecting to in-memory database")?;

        let db = Self { pool };
        db.ensure_schema().await?;

        Ok(db)
    }

    /// Create the schema if it does not exist yet.
    async fn ensure_schema(&self) -> Result<()> {
        sqlx::raw_sql(
            r#"
            CREATE TABLE IF NOT EXISTS accounts (
                id TEXT PRIMARY KEY,
                username TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS account_repositories (
                account_id TEXT NOT NULL,
                repository_id TEXT NOT NULL,
                PRIMARY KEY (account_id, repository_id)
            );

            CREATE TABLE IF NOT EXISTS repositories (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                url TEXT NOT NULL,
                alias TEXT NOT NULL,
                install_command TEXT NOT NULL DEFAULT '',
                build_command TEXT NOT NULL DEFAULT '',
                start_command TEXT NOT NULL,
                root_directory TEXT NOT NULL DEFAULT '/',
                environment TEXT NOT NULL DEFAULT '{}',
                domains TEXT NOT NULL DEFAULT '[]',
                branch TEXT NOT NULL DEFAULT 'main',
                port INTEGER NOT NULL,
                webhook_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_repositories_owner_alias
                ON repositories (owner_id, alias);

            CREATE TABLE IF NOT EXISTS deployments (
                id TEXT PRIMARY KEY,
                repository_id TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                remote_id TEXT NOT NULL,
                status TEXT NOT NULL,
                commit_message TEXT NOT NULL DEFAULT '',
                commit_author TEXT NOT NULL DEFAULT '',
                commit_date TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_deployments_repository
                ON deployments (repository_id, created_at DESC);
            "#,
        )
        .execute(&self.pool)
        .await
        .context("creating database schema")?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
