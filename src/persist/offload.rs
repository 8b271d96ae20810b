/// Offloaded node status
///
/// When even the compressed node map will not fit in the resource store, it is
/// written to `offloaded_nodes` instead and the workflow keeps only the
/// content version. Versions are content hashes, so rewriting an unchanged map
/// is a no-op and a stale reader can never see a half-written map.

use crate::error::{EngineError, Result};
use crate::workflow::{packer::checksum, types::NodeStatus};
use sqlx::{sqlite::SqlitePool, Row};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct OffloadRepository {
    pool: SqlitePool,
}

impl OffloadRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS offloaded_nodes (
                namespace TEXT NOT NULL,
                uid TEXT NOT NULL,
                version TEXT NOT NULL,
                nodes JSON NOT NULL,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (namespace, uid, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Store a node map, returning its version
    pub async fn save(&self, namespace: &str, uid: &str, nodes: &BTreeMap<String, NodeStatus>) -> Result<String> {
        let raw = serde_json::to_string(nodes)?;
        let version = format!("sha256:{}", &checksum(raw.as_bytes())[..16]);

        sqlx::query(
            r#"
            INSERT INTO offloaded_nodes (namespace, uid, version, nodes)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(namespace, uid, version) DO UPDATE SET updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(namespace)
        .bind(uid)
        .bind(&version)
        .bind(&raw)
        .execute(&self.pool)
        .await?;

        tracing::debug!("💾 Offloaded {} nodes for {}/{} as {}", nodes.len(), namespace, uid, version);
        Ok(version)
    }

    /// Load the node map stored under `version`
    pub async fn load(&self, namespace: &str, uid: &str, version: &str) -> Result<BTreeMap<String, NodeStatus>> {
        let row = sqlx::query(
            "SELECT nodes FROM offloaded_nodes WHERE namespace = ? AND uid = ? AND version = ?",
        )
        .bind(namespace)
        .bind(uid)
        .bind(version)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let raw: String = row.get("nodes");
                Ok(serde_json::from_str(&raw)?)
            }
            None => Err(EngineError::NotFound(format!(
                "offloaded node status {} for {}/{} not found",
                version, namespace, uid
            ))),
        }
    }

    /// Drop every version of a workflow's nodes except `keep`
    pub async fn gc(&self, namespace: &str, uid: &str, keep: &str) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM offloaded_nodes WHERE namespace = ? AND uid = ? AND version != ?",
        )
        .bind(namespace)
        .bind(uid)
        .bind(keep)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Drop all versions of a workflow's nodes
    pub async fn delete_all(&self, namespace: &str, uid: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM offloaded_nodes WHERE namespace = ? AND uid = ?")
            .bind(namespace)
            .bind(uid)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::database::Database;
    use crate::workflow::types::{NodePhase, NodeType};
    use chrono::Utc;

    fn nodes(count: usize) -> BTreeMap<String, NodeStatus> {
        (0..count)
            .map(|i| {
                let node = NodeStatus::new(
                    "wf",
                    format!("wf.t{}", i),
                    format!("t{}", i),
                    NodeType::Pod,
                    "step".to_string(),
                    Some("wf".to_string()),
                    NodePhase::Succeeded,
                    Utc::now(),
                );
                (node.id.clone(), node)
            })
            .collect()
    }

    #[tokio::test]
    async fn test_save_load_and_gc() {
        let db = Database::in_memory().await.unwrap();
        let repo = OffloadRepository::new(db.pool().clone());

        let first = nodes(2);
        let v1 = repo.save("argo", "u1", &first).await.unwrap();
        assert_eq!(repo.save("argo", "u1", &first).await.unwrap(), v1);
        let second = nodes(3);
        let v2 = repo.save("argo", "u1", &second).await.unwrap();
        assert_ne!(v1, v2);

        assert_eq!(repo.load("argo", "u1", &v1).await.unwrap(), first);
        assert_eq!(repo.gc("argo", "u1", &v2).await.unwrap(), 1);
        assert!(matches!(
            repo.load("argo", "u1", &v1).await,
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(repo.load("argo", "u1", &v2).await.unwrap(), second);
        assert_eq!(repo.delete_all("argo", "u1").await.unwrap(), 1);
    }
}
