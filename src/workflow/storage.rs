/// Resource store for live workflows and cron workflows
///
/// The cluster resource store is an external collaborator; `ResourceStore` is
/// its interface: create/get/list/update/delete keyed by (namespace, name) with
/// optimistic concurrency on `resource_version`, plus a watch stream.
/// `SqliteResourceStore` implements it over sqlx so the engine runs standalone.

use crate::error::StoreError;
use crate::workflow::types::{CronWorkflow, LabelSelector, ObjectMeta, Workflow};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sqlx::{sqlite::SqlitePool, Row};
use std::{marker::PhantomData, sync::Arc};
use tokio::sync::broadcast;

/// A stored, versioned resource
pub trait Resource: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn metadata(&self) -> &ObjectMeta;
    fn metadata_mut(&mut self) -> &mut ObjectMeta;
}

impl Resource for Workflow {
    const KIND: &'static str = "Workflow";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl Resource for CronWorkflow {
    const KIND: &'static str = "CronWorkflow";

    fn metadata(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEventKind {
    Added,
    Modified,
    Deleted,
}

/// Change notification from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub resource_kind: &'static str,
    pub namespace: String,
    pub name: String,
}

/// Interface to the external resource store
#[async_trait]
pub trait ResourceStore<T: Resource>: Send + Sync {
    /// Create a new resource; fails with `AlreadyExists` on a name collision
    async fn create(&self, resource: &T) -> Result<T, StoreError>;

    /// Fetch by key; fails with `NotFound`
    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError>;

    /// List resources, optionally restricted to one namespace
    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<T>, StoreError>;

    /// Conditional update against `metadata.resource_version`
    ///
    /// Returns the stored resource with its bumped version, or `Conflict` when
    /// the stored version moved on since the caller read it.
    async fn update(&self, resource: &T) -> Result<T, StoreError>;

    /// Delete by key; fails with `NotFound`
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

pub type WorkflowStore = Arc<dyn ResourceStore<Workflow>>;
pub type CronWorkflowStore = Arc<dyn ResourceStore<CronWorkflow>>;

/// SQLite-backed resource store
///
/// One `resources` table holds every kind; the body is the JSON resource,
/// with key, version and labels kept in columns for conditional updates.
#[derive(Debug, Clone)]
pub struct SqliteResourceStore<T> {
    pool: SqlitePool,
    events: broadcast::Sender<WatchEvent>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Resource> SqliteResourceStore<T> {
    pub fn new(pool: SqlitePool) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            pool,
            events,
            _marker: PhantomData,
        }
    }

    /// Create the resources table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resources (
                kind TEXT NOT NULL,
                namespace TEXT NOT NULL,
                name TEXT NOT NULL,
                uid TEXT NOT NULL,
                resource_version INTEGER NOT NULL,
                body JSON NOT NULL,
                created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
                PRIMARY KEY (kind, namespace, name)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_resources_uid ON resources(uid)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    fn notify(&self, kind: WatchEventKind, meta: &ObjectMeta) {
        // no receivers is fine
        let _ = self.events.send(WatchEvent {
            kind,
            resource_kind: T::KIND,
            namespace: meta.namespace.clone(),
            name: meta.name.clone(),
        });
    }

    async fn current_version(&self, namespace: &str, name: &str) -> Result<Option<u64>, StoreError> {
        let row = sqlx::query(
            "SELECT resource_version FROM resources WHERE kind = ? AND namespace = ? AND name = ?",
        )
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get::<i64, _>("resource_version") as u64))
    }

    fn not_found(namespace: &str, name: &str) -> StoreError {
        StoreError::NotFound {
            kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl<T: Resource> ResourceStore<T> for SqliteResourceStore<T> {
    async fn create(&self, resource: &T) -> Result<T, StoreError> {
        let mut stored = resource.clone();
        stored.metadata_mut().resource_version = 1;
        let body = serde_json::to_string(&stored)?;
        let meta = stored.metadata();

        let result = sqlx::query(
            r#"
            INSERT INTO resources (kind, namespace, name, uid, resource_version, body)
            VALUES (?, ?, ?, ?, 1, ?)
            ON CONFLICT(kind, namespace, name) DO NOTHING
            "#,
        )
        .bind(T::KIND)
        .bind(&meta.namespace)
        .bind(&meta.name)
        .bind(&meta.uid)
        .bind(&body)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::AlreadyExists {
                kind: T::KIND,
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        }

        tracing::debug!("➕ Created {} {}", T::KIND, meta.key());
        self.notify(WatchEventKind::Added, stored.metadata());
        Ok(stored)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<T, StoreError> {
        let row = sqlx::query(
            "SELECT body FROM resources WHERE kind = ? AND namespace = ? AND name = ?",
        )
        .bind(T::KIND)
        .bind(namespace)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let body: String = row.get("body");
                Ok(serde_json::from_str(&body)?)
            }
            None => Err(Self::not_found(namespace, name)),
        }
    }

    async fn list(&self, namespace: Option<&str>, selector: &LabelSelector) -> Result<Vec<T>, StoreError> {
        let rows = match namespace {
            Some(ns) => {
                sqlx::query(
                    "SELECT body FROM resources WHERE kind = ? AND namespace = ? ORDER BY rowid",
                )
                .bind(T::KIND)
                .bind(ns)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT body FROM resources WHERE kind = ? ORDER BY rowid")
                    .bind(T::KIND)
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut resources = Vec::with_capacity(rows.len());
        for row in rows {
            let body: String = row.get("body");
            let resource: T = serde_json::from_str(&body)?;
            if selector.matches(&resource.metadata().labels) {
                resources.push(resource);
            }
        }
        Ok(resources)
    }

    async fn update(&self, resource: &T) -> Result<T, StoreError> {
        let expected = resource.metadata().resource_version;
        let mut stored = resource.clone();
        stored.metadata_mut().resource_version = expected + 1;
        let body = serde_json::to_string(&stored)?;
        let meta = stored.metadata();

        let result = sqlx::query(
            r#"
            UPDATE resources
            SET resource_version = ?, body = ?, updated_at = CURRENT_TIMESTAMP
            WHERE kind = ? AND namespace = ? AND name = ? AND resource_version = ?
            "#,
        )
        .bind((expected + 1) as i64)
        .bind(&body)
        .bind(T::KIND)
        .bind(&meta.namespace)
        .bind(&meta.name)
        .bind(expected as i64)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return match self.current_version(&meta.namespace, &meta.name).await? {
                Some(actual) => Err(StoreError::Conflict {
                    namespace: meta.namespace.clone(),
                    name: meta.name.clone(),
                    expected,
                    actual,
                }),
                None => Err(Self::not_found(&meta.namespace, &meta.name)),
            };
        }

        self.notify(WatchEventKind::Modified, stored.metadata());
        Ok(stored)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM resources WHERE kind = ? AND namespace = ? AND name = ?")
            .bind(T::KIND)
            .bind(namespace)
            .bind(name)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(Self::not_found(namespace, name));
        }

        tracing::debug!("🗑️ Deleted {} {}/{}", T::KIND, namespace, name);
        let _ = self.events.send(WatchEvent {
            kind: WatchEventKind::Deleted,
            resource_kind: T::KIND,
            namespace: namespace.to_string(),
            name: name.to_string(),
        });
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.events.subscribe()
    }
}
