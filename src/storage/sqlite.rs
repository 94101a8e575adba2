//! SQLite storage implementation.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{
    params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension,
    TransactionBehavior,
};
use tokio::sync::Mutex;

use super::models::*;
use crate::error::{Error, Result};
use crate::workflow::{to_canonical_json, WorkflowDefinition, WorkflowStatus};

/// Parse an RFC 3339 datetime string into a `chrono::DateTime<Utc>`.
///
/// Returns a `rusqlite::Error` on parse failure instead of panicking,
/// so it is safe to use inside `query_row` / `query_map` closures.
fn parse_datetime_utc(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_datetime_utc).transpose()
}

fn parse_json_column(s: Option<String>) -> Option<serde_json::Value> {
    s.and_then(|s| serde_json::from_str(&s).ok())
}

fn conversion_error(e: Error) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

/// Default query limit.
const DEFAULT_QUERY_LIMIT: usize = 50;
/// Maximum query limit to prevent abuse.
const MAX_QUERY_LIMIT: usize = 1000;

const WORKFLOW_COLUMNS: &str =
    "id, name, institute_id, status, definition, created_at, updated_at";
const VERSION_COLUMNS: &str = "id, workflow_id, version, definition, checksum, created_at, created_by";
const EXECUTION_COLUMNS: &str = "id, workflow_id, workflow_version, institute_id, idempotency_key, \
     trigger_type, status, input, created_at, started_at, completed_at, error_message, failed_node_id";
const LOG_COLUMNS: &str = "id, execution_id, node_template_id, node_type, status, started_at, \
     completed_at, execution_time_ms, details, error_message, error_type";

/// SQLite-based storage for definitions, executions and their logs.
#[derive(Clone)]
pub struct SqliteStorage {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut conn = Connection::open(path)?;

        // Initialize schema synchronously before wrapping in async mutex
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let mut conn = Connection::open_in_memory()?;
        Self::init_schema_sync(&mut conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn init_schema_sync(conn: &mut Connection) -> Result<()> {
        // WAL mode must be set before any transaction begins
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                institute_id TEXT,
                status TEXT NOT NULL DEFAULT 'ACTIVE',
                definition TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS workflow_versions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                definition TEXT NOT NULL,
                checksum TEXT NOT NULL,
                created_at TEXT NOT NULL,
                created_by TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE,
                UNIQUE(workflow_id, version)
            );

            CREATE TABLE IF NOT EXISTS executions (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                workflow_version INTEGER NOT NULL,
                institute_id TEXT,
                idempotency_key TEXT NOT NULL,
                trigger_type TEXT NOT NULL,
                status TEXT NOT NULL,
                input TEXT NOT NULL,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                error_message TEXT,
                failed_node_id TEXT,
                FOREIGN KEY (workflow_id) REFERENCES workflows(id) ON DELETE CASCADE
            );

            CREATE TABLE IF NOT EXISTS execution_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                execution_id TEXT NOT NULL,
                node_template_id TEXT NOT NULL,
                node_type TEXT NOT NULL,
                status TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                execution_time_ms INTEGER,
                details TEXT,
                error_message TEXT,
                error_type TEXT,
                FOREIGN KEY (execution_id) REFERENCES executions(id)
            );

            -- One claim per (workflow, key). expires_at is epoch millis, NULL = never.
            CREATE TABLE IF NOT EXISTS idempotency_keys (
                workflow_id TEXT NOT NULL,
                idempotency_key TEXT NOT NULL,
                execution_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at INTEGER,
                PRIMARY KEY (workflow_id, idempotency_key)
            );

            CREATE TRIGGER IF NOT EXISTS execution_logs_no_update
            BEFORE UPDATE ON execution_logs
            BEGIN
                SELECT RAISE(ABORT, 'execution_logs is append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS execution_logs_no_delete
            BEFORE DELETE ON execution_logs
            BEGIN
                SELECT RAISE(ABORT, 'execution_logs is append-only');
            END;

            CREATE INDEX IF NOT EXISTS idx_workflows_institute ON workflows(institute_id);
            CREATE INDEX IF NOT EXISTS idx_workflow_versions_workflow
                ON workflow_versions(workflow_id, version DESC);
            CREATE INDEX IF NOT EXISTS idx_executions_workflow ON executions(workflow_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_execution_logs_execution
                ON execution_logs(execution_id, id);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Workflow operations
    // ========================================================================

    /// Store a definition and cut a new version if its content changed.
    ///
    /// Returns the version now current for the workflow.
    pub async fn save_workflow(
        &self,
        definition: &WorkflowDefinition,
        created_by: Option<&str>,
    ) -> Result<WorkflowVersion> {
        let canonical = to_canonical_json(definition)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            "INSERT INTO workflows (id, name, institute_id, status, definition, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                institute_id = excluded.institute_id,
                status = excluded.status,
                definition = excluded.definition,
                updated_at = excluded.updated_at",
            params![
                definition.id,
                definition.name,
                definition.institute_id,
                definition.status.as_str(),
                canonical,
                now,
            ],
        )?;
        let version =
            Self::record_workflow_version_if_changed(&tx, &definition.id, &canonical, created_by)?;
        tx.commit()?;
        Ok(version)
    }

    pub async fn get_workflow(&self, id: &str) -> Result<Option<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM workflows WHERE id = ?1", WORKFLOW_COLUMNS);
        let workflow = conn
            .query_row(&sql, [id], Self::row_to_workflow)
            .optional()?;
        Ok(workflow)
    }

    /// List workflows, optionally restricted to one institute.
    pub async fn list_workflows(&self, institute_id: Option<&str>) -> Result<Vec<StoredWorkflow>> {
        let conn = self.conn.lock().await;
        let workflows = match institute_id {
            Some(institute) => {
                let sql = format!(
                    "SELECT {} FROM workflows WHERE institute_id = ?1 ORDER BY id",
                    WORKFLOW_COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([institute], Self::row_to_workflow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
            None => {
                let sql = format!("SELECT {} FROM workflows ORDER BY id", WORKFLOW_COLUMNS);
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], Self::row_to_workflow)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows
            }
        };
        Ok(workflows)
    }

    /// Activate or deactivate a workflow. Returns `false` for unknown ids.
    pub async fn set_workflow_status(&self, id: &str, status: WorkflowStatus) -> Result<bool> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE workflows SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), id],
        )?;
        Ok(changed > 0)
    }

    pub async fn list_workflow_versions(&self, workflow_id: &str) -> Result<Vec<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ?1 ORDER BY version DESC",
            VERSION_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let versions = stmt
            .query_map([workflow_id], Self::row_to_workflow_version)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(versions)
    }

    pub async fn get_workflow_version(
        &self,
        workflow_id: &str,
        version: u32,
    ) -> Result<Option<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ?1 AND version = ?2",
            VERSION_COLUMNS
        );
        let version = conn
            .query_row(&sql, params![workflow_id, version], Self::row_to_workflow_version)
            .optional()?;
        Ok(version)
    }

    pub async fn get_latest_workflow_version(
        &self,
        workflow_id: &str,
    ) -> Result<Option<WorkflowVersion>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ?1 ORDER BY version DESC LIMIT 1",
            VERSION_COLUMNS
        );
        let version = conn
            .query_row(&sql, [workflow_id], Self::row_to_workflow_version)
            .optional()?;
        Ok(version)
    }

    // ========================================================================
    // Execution operations
    // ========================================================================

    /// Atomically claim `execution.idempotency_key` for its workflow and
    /// insert the PENDING execution.
    ///
    /// A claim whose `expires_at` is at or before `now` is replaced inside
    /// the same transaction. A live claim yields `Duplicate` and inserts nothing.
    pub async fn claim_and_create_execution(
        &self,
        execution: &WorkflowExecution,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<ClaimOutcome> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        tx.execute(
            "DELETE FROM idempotency_keys
             WHERE workflow_id = ?1 AND idempotency_key = ?2
               AND expires_at IS NOT NULL AND expires_at <= ?3",
            params![
                execution.workflow_id,
                execution.idempotency_key,
                now.timestamp_millis()
            ],
        )?;

        let claimed = tx.execute(
            "INSERT OR IGNORE INTO idempotency_keys
             (workflow_id, idempotency_key, execution_id, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                execution.workflow_id,
                execution.idempotency_key,
                execution.id,
                now.to_rfc3339(),
                expires_at.map(|t| t.timestamp_millis()),
            ],
        )?;

        if claimed == 0 {
            let existing_execution_id: String = tx.query_row(
                "SELECT execution_id FROM idempotency_keys
                 WHERE workflow_id = ?1 AND idempotency_key = ?2",
                params![execution.workflow_id, execution.idempotency_key],
                |row| row.get(0),
            )?;
            tx.commit()?;
            return Ok(ClaimOutcome::Duplicate {
                existing_execution_id,
            });
        }

        tx.execute(
            "INSERT INTO executions
             (id, workflow_id, workflow_version, institute_id, idempotency_key, trigger_type,
              status, input, created_at, started_at, completed_at, error_message, failed_node_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                execution.id,
                execution.workflow_id,
                execution.workflow_version,
                execution.institute_id,
                execution.idempotency_key,
                execution.trigger_type,
                execution.status.to_string(),
                serde_json::to_string(&execution.input)?,
                execution.created_at.to_rfc3339(),
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.error_message,
                execution.failed_node_id,
            ],
        )?;
        tx.commit()?;
        Ok(ClaimOutcome::Claimed)
    }

    /// Persist a state transition of an existing execution.
    pub async fn update_execution(&self, execution: &WorkflowExecution) -> Result<()> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE executions
             SET status = ?1, started_at = ?2, completed_at = ?3,
                 error_message = ?4, failed_node_id = ?5
             WHERE id = ?6",
            params![
                execution.status.to_string(),
                execution.started_at.map(|t| t.to_rfc3339()),
                execution.completed_at.map(|t| t.to_rfc3339()),
                execution.error_message,
                execution.failed_node_id,
                execution.id,
            ],
        )?;
        if changed == 0 {
            return Err(Error::Storage(format!(
                "Execution '{}' not found",
                execution.id
            )));
        }
        Ok(())
    }

    pub async fn get_execution(&self, id: &str) -> Result<Option<WorkflowExecution>> {
        let conn = self.conn.lock().await;
        let sql = format!("SELECT {} FROM executions WHERE id = ?1", EXECUTION_COLUMNS);
        let execution = conn
            .query_row(&sql, [id], Self::row_to_execution)
            .optional()?;
        Ok(execution)
    }

    /// Executions matching `query`, newest first.
    pub async fn list_executions(&self, query: &ExecutionQuery) -> Result<Vec<WorkflowExecution>> {
        let conn = self.conn.lock().await;

        let mut sql = format!("SELECT {} FROM executions WHERE 1=1", EXECUTION_COLUMNS);
        let mut bind: Vec<SqlValue> = Vec::new();

        if let Some(workflow_id) = &query.workflow_id {
            sql.push_str(" AND workflow_id = ?");
            bind.push(SqlValue::Text(workflow_id.clone()));
        }

        if let Some(institute_id) = &query.institute_id {
            sql.push_str(" AND institute_id = ?");
            bind.push(SqlValue::Text(institute_id.clone()));
        }

        if let Some(status) = &query.status {
            sql.push_str(" AND status = ?");
            bind.push(SqlValue::Text(status.to_string()));
        }

        sql.push_str(" ORDER BY created_at DESC, rowid DESC LIMIT ? OFFSET ?");
        let limit = if query.limit == 0 {
            DEFAULT_QUERY_LIMIT
        } else {
            query.limit.min(MAX_QUERY_LIMIT)
        };
        bind.push(SqlValue::Integer(limit as i64));
        bind.push(SqlValue::Integer(query.offset as i64));

        let mut stmt = conn.prepare(&sql)?;
        let executions = stmt
            .query_map(params_from_iter(bind.iter()), Self::row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(executions)
    }

    /// Fail executions left PENDING or RUNNING by a previous process.
    pub async fn fail_interrupted_executions(&self, reason: &str) -> Result<usize> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE executions
             SET status = 'FAILED', completed_at = ?1, error_message = ?2
             WHERE status IN ('PENDING', 'RUNNING')",
            params![Utc::now().to_rfc3339(), reason],
        )?;
        Ok(changed)
    }

    pub async fn get_execution_trace(&self, execution_id: &str) -> Result<Option<ExecutionTrace>> {
        let Some(execution) = self.get_execution(execution_id).await? else {
            return Ok(None);
        };

        let logs = self.get_execution_logs(execution_id).await?;
        Ok(Some(ExecutionTrace { execution, logs }))
    }

    // ========================================================================
    // Execution log operations
    // ========================================================================

    /// Append a log row. Rows are never updated; returns the new row id.
    pub async fn append_log(&self, log: &ExecutionLog) -> Result<i64> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO execution_logs
             (execution_id, node_template_id, node_type, status, started_at, completed_at,
              execution_time_ms, details, error_message, error_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                log.execution_id,
                log.node_template_id,
                log.node_type,
                log.status.to_string(),
                log.started_at.to_rfc3339(),
                log.completed_at.map(|t| t.to_rfc3339()),
                log.execution_time_ms,
                log.details.as_ref().map(serde_json::to_string).transpose()?,
                log.error_message,
                log.error_type,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Log rows of an execution in append order.
    pub async fn get_execution_logs(&self, execution_id: &str) -> Result<Vec<ExecutionLog>> {
        let conn = self.conn.lock().await;
        let sql = format!(
            "SELECT {} FROM execution_logs WHERE execution_id = ?1 ORDER BY id",
            LOG_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let logs = stmt
            .query_map([execution_id], Self::row_to_log)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(logs)
    }

    // ========================================================================
    // Health
    // ========================================================================

    pub async fn check_health(&self) -> Result<DatabaseHealth> {
        let conn = self.conn.lock().await;

        let foreign_keys_enabled: i64 =
            conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        let integrity_check: String =
            conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        let in_flight: i64 = conn.query_row(
            "SELECT COUNT(*) FROM executions WHERE status IN ('PENDING', 'RUNNING')",
            [],
            |row| row.get(0),
        )?;

        Ok(DatabaseHealth {
            foreign_keys_enabled: foreign_keys_enabled == 1,
            integrity_check,
            journal_mode,
            in_flight_executions: in_flight.max(0) as u64,
        })
    }

    // ========================================================================
    // Row mapping
    // ========================================================================

    fn row_to_workflow(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredWorkflow> {
        let status: String = row.get(3)?;
        Ok(StoredWorkflow {
            id: row.get(0)?,
            name: row.get(1)?,
            institute_id: row.get(2)?,
            status: status.parse().map_err(conversion_error)?,
            definition: row.get(4)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            updated_at: parse_datetime_utc(&row.get::<_, String>(6)?)?,
        })
    }

    fn row_to_workflow_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowVersion> {
        Ok(WorkflowVersion {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            version: row.get(2)?,
            definition: row.get(3)?,
            checksum: row.get(4)?,
            created_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            created_by: row.get(6)?,
        })
    }

    fn row_to_execution(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkflowExecution> {
        let status: String = row.get(6)?;
        let input: String = row.get(7)?;

        Ok(WorkflowExecution {
            id: row.get(0)?,
            workflow_id: row.get(1)?,
            workflow_version: row.get(2)?,
            institute_id: row.get(3)?,
            idempotency_key: row.get(4)?,
            trigger_type: row.get(5)?,
            status: status.parse().map_err(conversion_error)?,
            input: serde_json::from_str(&input).unwrap_or(serde_json::Value::Null),
            created_at: parse_datetime_utc(&row.get::<_, String>(8)?)?,
            started_at: parse_optional_datetime(row.get(9)?)?,
            completed_at: parse_optional_datetime(row.get(10)?)?,
            error_message: row.get(11)?,
            failed_node_id: row.get(12)?,
        })
    }

    fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionLog> {
        let status: String = row.get(4)?;
        Ok(ExecutionLog {
            id: row.get(0)?,
            execution_id: row.get(1)?,
            node_template_id: row.get(2)?,
            node_type: row.get(3)?,
            status: status.parse().map_err(conversion_error)?,
            started_at: parse_datetime_utc(&row.get::<_, String>(5)?)?,
            completed_at: parse_optional_datetime(row.get(6)?)?,
            execution_time_ms: row.get(7)?,
            details: parse_json_column(row.get(8)?),
            error_message: row.get(9)?,
            error_type: row.get(10)?,
        })
    }

    fn record_workflow_version_if_changed(
        conn: &Connection,
        workflow_id: &str,
        definition: &str,
        created_by: Option<&str>,
    ) -> Result<WorkflowVersion> {
        let checksum = definition_checksum(definition);

        let sql = format!(
            "SELECT {} FROM workflow_versions WHERE workflow_id = ?1 ORDER BY version DESC LIMIT 1",
            VERSION_COLUMNS
        );
        let latest = conn
            .query_row(&sql, [workflow_id], Self::row_to_workflow_version)
            .optional()?;

        if let Some(latest) = &latest {
            if latest.checksum == checksum {
                return Ok(latest.clone());
            }
        }

        let version = WorkflowVersion {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            version: latest.map(|v| v.version + 1).unwrap_or(1),
            definition: definition.to_string(),
            checksum,
            created_at: Utc::now(),
            created_by: created_by.map(str::to_string),
        };

        conn.execute(
            "INSERT INTO workflow_versions
             (id, workflow_id, version, definition, checksum, created_at, created_by)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.id,
                version.workflow_id,
                version.version,
                version.definition,
                version.checksum,
                version.created_at.to_rfc3339(),
                version.created_by,
            ],
        )?;

        Ok(version)
    }
}

fn definition_checksum(definition: &str) -> String {
    let mut hasher = DefaultHasher::new();
    definition.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
