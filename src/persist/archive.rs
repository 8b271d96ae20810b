/// Workflow archive
///
/// Durable history of completed workflows in the `archived_workflows` table,
/// keyed by (namespace, uid). Rows are immutable once written; the only
/// mutations are the idempotent insert and delete.

use crate::error::{EngineError, Result};
use crate::workflow::{
    packer::StatusPacker,
    submit::WorkflowSubmitter,
    types::{
        LabelSelector, ObjectMeta, Workflow, WorkflowPhase, ARCHIVING_STATUS_LABEL,
        COMPLETED_LABEL, CRON_WORKFLOW_LABEL,
    },
};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqlitePool, QueryBuilder, Row, Sqlite};
use std::collections::BTreeMap;

/// One archive row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedWorkflow {
    pub namespace: String,
    pub uid: String,
    pub name: String,
    pub phase: WorkflowPhase,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub archived_at: DateTime<Utc>,
    /// Full snapshot with the node map unpacked
    pub workflow: Workflow,
}

/// Query filters for `list`
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    /// Match any of these phases; empty matches all
    pub phases: Vec<WorkflowPhase>,
    pub selector: LabelSelector,
    pub name_prefix: Option<String>,
    pub limit: Option<usize>,
    pub offset: usize,
}

/// Archive table access
#[derive(Debug, Clone)]
pub struct ArchiveRepository {
    pool: SqlitePool,
}

impl ArchiveRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the archive table. Safe to call multiple times.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS archived_workflows (
                namespace TEXT NOT NULL,
                uid TEXT NOT NULL,
                name TEXT NOT NULL,
                phase TEXT NOT NULL,
                labels JSON NOT NULL,
                started_at TEXT,
                finished_at TEXT,
                archived_at TEXT NOT NULL,
                workflow JSON NOT NULL,
                PRIMARY KEY (namespace, uid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_archived_workflows_archived_at ON archived_workflows(archived_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Insert an archive record for a completed workflow
    ///
    /// Returns false when a record for this UID already exists; the existing
    /// row is left untouched.
    pub async fn archive(&self, workflow: &Workflow) -> Result<bool> {
        if !workflow.is_completed() {
            return Err(EngineError::Validation(format!(
                "workflow {} is {} and cannot be archived",
                workflow.metadata.key(),
                workflow.status.phase
            )));
        }
        if workflow.status.offload_node_status_version.is_some() {
            return Err(EngineError::Validation(format!(
                "workflow {} must be hydrated before archiving",
                workflow.metadata.key()
            )));
        }

        let mut snapshot = workflow.clone();
        StatusPacker::default().unpack_workflow(&mut snapshot)?;

        let meta = &snapshot.metadata;
        let archived_at = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO archived_workflows
                (namespace, uid, name, phase, labels, started_at, finished_at, archived_at, workflow)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(namespace, uid) DO NOTHING
            "#,
        )
        .bind(&meta.namespace)
        .bind(&meta.uid)
        .bind(&meta.name)
        .bind(snapshot.status.phase.as_str())
        .bind(serde_json::to_string(&meta.labels)?)
        .bind(snapshot.status.started_at.map(timestamp))
        .bind(snapshot.status.finished_at.map(timestamp))
        .bind(timestamp(archived_at))
        .bind(serde_json::to_string(&snapshot)?)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        if inserted {
            tracing::info!("🗃️ Archived workflow {} (uid {})", meta.key(), meta.uid);
        } else {
            tracing::debug!("🗃️ Workflow {} already archived", meta.key());
        }
        Ok(inserted)
    }

    /// Archived records, most recently archived first
    pub async fn list(&self, namespace: Option<&str>, filter: &ArchiveFilter) -> Result<Vec<ArchivedWorkflow>> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "SELECT namespace, uid, name, phase, labels, started_at, finished_at, archived_at, workflow \
             FROM archived_workflows WHERE 1 = 1",
        );
        if let Some(ns) = namespace.filter(|ns| !ns.is_empty()) {
            query.push(" AND namespace = ").push_bind(ns.to_string());
        }
        if let Some(prefix) = filter.name_prefix.as_ref().filter(|p| !p.is_empty()) {
            query
                .push(" AND substr(name, 1, ")
                .push_bind(prefix.chars().count() as i64)
                .push(") = ")
                .push_bind(prefix.clone());
        }
        if !filter.phases.is_empty() {
            query.push(" AND phase IN (");
            let mut phases = query.separated(", ");
            for phase in &filter.phases {
                phases.push_bind(phase.as_str());
            }
            phases.push_unseparated(")");
        }
        query.push(" ORDER BY archived_at DESC, rowid DESC");

        let rows = query.build().fetch_all(&self.pool).await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let record = Self::from_row(&row)?;
            if filter.selector.matches(&record.labels) {
                records.push(record);
            }
        }

        let records = records.into_iter().skip(filter.offset);
        Ok(match filter.limit {
            Some(limit) => records.take(limit).collect(),
            None => records.collect(),
        })
    }

    /// Fetch one record; `NotFound` if absent
    pub async fn get(&self, namespace: &str, uid: &str) -> Result<ArchivedWorkflow> {
        let row = sqlx::query(
            r#"
            SELECT namespace, uid, name, phase, labels, started_at, finished_at, archived_at, workflow
            FROM archived_workflows WHERE namespace = ? AND uid = ?
            "#,
        )
        .bind(namespace)
        .bind(uid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Self::from_row(&row),
            None => Err(not_found(namespace, uid)),
        }
    }

    /// Fetch a record by UID alone, for callers that only know the UID
    pub async fn find_by_uid(&self, uid: &str) -> Result<ArchivedWorkflow> {
        let row = sqlx::query("SELECT namespace FROM archived_workflows WHERE uid = ? LIMIT 1")
            .bind(uid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let namespace: String = row.get("namespace");
                self.get(&namespace, uid).await
            }
            None => Err(EngineError::NotFound(format!("archived workflow {} not found", uid))),
        }
    }

    /// Remove a record; live workflows are never touched
    pub async fn delete(&self, namespace: &str, uid: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM archived_workflows WHERE namespace = ? AND uid = ?")
            .bind(namespace)
            .bind(uid)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(not_found(namespace, uid));
        }
        tracing::info!("🗑️ Deleted archived workflow {}/{}", namespace, uid);
        Ok(())
    }

    /// Start a new live run from an archived record
    ///
    /// The new workflow gets its own name (archived name plus a generated
    /// suffix) and UID, and goes through the normal submission path.
    pub async fn resubmit(&self, namespace: &str, uid: &str, submitter: &WorkflowSubmitter) -> Result<Workflow> {
        let record = self.get(namespace, uid).await?;
        let workflow = resubmittable(&record.workflow);
        let created = submitter.submit(workflow).await?;
        tracing::info!(
            "🔄 Archived workflow {} resubmitted as {}",
            uid,
            created.metadata.key()
        );
        Ok(created)
    }

    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<ArchivedWorkflow> {
        let phase: String = row.get("phase");
        let labels: String = row.get("labels");
        let started_at: Option<String> = row.get("started_at");
        let finished_at: Option<String> = row.get("finished_at");
        let archived_at: String = row.get("archived_at");
        let workflow: String = row.get("workflow");

        Ok(ArchivedWorkflow {
            namespace: row.get("namespace"),
            uid: row.get("uid"),
            name: row.get("name"),
            phase: phase.parse().map_err(EngineError::Infrastructure)?,
            labels: serde_json::from_str(&labels)?,
            started_at: started_at.as_deref().map(parse_timestamp).transpose()?,
            finished_at: finished_at.as_deref().map(parse_timestamp).transpose()?,
            archived_at: parse_timestamp(&archived_at)?,
            workflow: serde_json::from_str(&workflow)?,
        })
    }
}

/// Fresh workflow seeded from an archived one
///
/// The cron label goes too: a resubmitted run is not one of the cron's runs and
/// must not count against its history limits.
pub fn resubmittable(archived: &Workflow) -> Workflow {
    let mut labels = archived.metadata.labels.clone();
    for internal in [ARCHIVING_STATUS_LABEL, COMPLETED_LABEL, CRON_WORKFLOW_LABEL] {
        labels.remove(internal);
    }

    let mut spec = archived.spec.clone();
    spec.shutdown = None;

    Workflow {
        metadata: ObjectMeta {
            name: String::new(),
            generate_name: Some(format!("{}-", archived.metadata.name)),
            namespace: archived.metadata.namespace.clone(),
            labels,
            annotations: archived.metadata.annotations.clone(),
            ..Default::default()
        },
        spec,
        status: Default::default(),
    }
}

fn not_found(namespace: &str, uid: &str) -> EngineError {
    EngineError::NotFound(format!("archived workflow {}/{} not found", namespace, uid))
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| EngineError::Infrastructure(format!("bad timestamp '{}': {}", raw, e)))
}
