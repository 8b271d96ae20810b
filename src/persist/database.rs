/// Relational backing store connection
///
/// A single SQLite pool shared by the resource store, the archive and the
/// offload table. The schema is created on connect; every statement is
/// `IF NOT EXISTS` so reconnecting to an existing file is harmless.

use crate::error::Result;
use crate::persist::{archive::ArchiveRepository, offload::OffloadRepository};
use crate::workflow::{
    storage::SqliteResourceStore,
    types::{CronWorkflow, Workflow},
};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;

/// Connection pool plus schema bootstrap
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (creating if missing) the database at `url` and initialise the schema
    pub async fn connect(url: &str) -> Result<Self> {
        tracing::info!("🗄️ Opening database: {}", url);

        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let db = Self { pool };
        db.init_schema().await?;

        tracing::info!("✅ Database ready: {}", url);
        Ok(db)
    }

    /// Private in-memory database, used by tests and dry runs
    pub async fn in_memory() -> Result<Self> {
        let db = Self {
            pool: memory_pool().await?,
        };
        db.init_schema().await?;
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        // Workflow and CronWorkflow share the resources table
        SqliteResourceStore::<Workflow>::new(self.pool.clone())
            .init_schema()
            .await?;
        SqliteResourceStore::<CronWorkflow>::new(self.pool.clone())
            .init_schema()
            .await?;
        ArchiveRepository::new(self.pool.clone()).init_schema().await?;
        OffloadRepository::new(self.pool.clone()).init_schema().await?;
        Ok(())
    }
}

/// Single-connection pool over `sqlite::memory:`
///
/// Every connection to `sqlite::memory:` is its own database, so the pool is
/// pinned to one connection that is never recycled.
pub async fn memory_pool() -> std::result::Result<SqlitePool, sqlx::Error> {
    SqlitePoolOptions::new()
        .max_connections(1)
        .min_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_connect_creates_file_and_schema() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}", dir.path().join("argosy.db").display());

        let db = Database::connect(&url).await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();
        assert!(names.contains(&"resources"));
        assert!(names.contains(&"archived_workflows"));
        assert!(names.contains(&"offloaded_nodes"));

        // reconnecting to the same file is fine
        drop(db);
        Database::connect(&url).await.unwrap();
    }
}
