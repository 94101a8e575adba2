//! Storage models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::workflow::{parse_workflow, WorkflowDefinition, WorkflowStatus};

/// Stored workflow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredWorkflow {
    pub id: String,
    pub name: String,
    pub institute_id: Option<String>,
    pub status: WorkflowStatus,
    pub definition: String, // canonical JSON
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoredWorkflow {
    /// Parse the stored definition. The `status` column wins over the
    /// status embedded in the JSON, since activation does not cut a version.
    pub fn to_definition(&self) -> Result<WorkflowDefinition> {
        let mut definition = parse_workflow(&self.definition)?;
        definition.status = self.status;
        Ok(definition)
    }
}

/// Stored workflow version snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: String,
    pub workflow_id: String,
    pub version: u32,
    pub definition: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
    pub created_by: Option<String>,
}

impl WorkflowVersion {
    pub fn to_definition(&self) -> Result<WorkflowDefinition> {
        parse_workflow(&self.definition)
    }
}

/// Execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Running => write!(f, "RUNNING"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
        }
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "RUNNING" => Ok(Self::Running),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            _ => Err(Error::Parse(format!("Unknown execution status: {}", s))),
        }
    }
}

/// One firing of a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    /// Definition version the walk is pinned to
    pub workflow_version: u32,
    pub institute_id: Option<String>,
    pub idempotency_key: String,
    pub trigger_type: String,
    pub status: ExecutionStatus,
    /// Trigger payload the context was seeded with
    pub input: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub failed_node_id: Option<String>,
}

impl WorkflowExecution {
    /// A fresh PENDING execution.
    pub fn pending(
        workflow_id: &str,
        workflow_version: u32,
        institute_id: Option<String>,
        idempotency_key: &str,
        trigger_type: &str,
        input: Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            workflow_version,
            institute_id,
            idempotency_key: idempotency_key.to_string(),
            trigger_type: trigger_type.to_string(),
            status: ExecutionStatus::Pending,
            input,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            failed_node_id: None,
        }
    }
}

/// Status of an execution log row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStatus {
    Started,
    Succeeded,
    Failed,
    Skipped,
}

impl std::fmt::Display for LogStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Started => write!(f, "STARTED"),
            Self::Succeeded => write!(f, "SUCCEEDED"),
            Self::Failed => write!(f, "FAILED"),
            Self::Skipped => write!(f, "SKIPPED"),
        }
    }
}

impl std::str::FromStr for LogStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STARTED" => Ok(Self::Started),
            "SUCCEEDED" => Ok(Self::Succeeded),
            "FAILED" => Ok(Self::Failed),
            "SKIPPED" => Ok(Self::Skipped),
            _ => Err(Error::Parse(format!("Unknown log status: {}", s))),
        }
    }
}

/// Append-only audit row for one node visit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLog {
    /// Insertion sequence; zero until appended
    pub id: i64,
    pub execution_id: String,
    pub node_template_id: String,
    pub node_type: String,
    pub status: LogStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub execution_time_ms: Option<i64>,
    pub details: Option<Value>,
    pub error_message: Option<String>,
    pub error_type: Option<String>,
}

impl ExecutionLog {
    pub fn started(execution_id: &str, node_id: &str, node_type: &str) -> Self {
        Self {
            id: 0,
            execution_id: execution_id.to_string(),
            node_template_id: node_id.to_string(),
            node_type: node_type.to_string(),
            status: LogStatus::Started,
            started_at: Utc::now(),
            completed_at: None,
            execution_time_ms: None,
            details: None,
            error_message: None,
            error_type: None,
        }
    }

    /// Terminal row following a STARTED row. Timing is measured from it.
    pub fn finish(&self, status: LogStatus, details: Option<Value>) -> Self {
        let completed_at = Utc::now();
        Self {
            id: 0,
            status,
            completed_at: Some(completed_at),
            execution_time_ms: Some((completed_at - self.started_at).num_milliseconds()),
            details,
            error_message: None,
            error_type: None,
            ..self.clone()
        }
    }

    /// Terminal FAILED row carrying the error and its code.
    pub fn fail(&self, error: &Error, details: Option<Value>) -> Self {
        Self {
            error_message: Some(error.to_string()),
            error_type: Some(error.code().to_string()),
            ..self.finish(LogStatus::Failed, details)
        }
    }
}

/// Execution with its log rows in append order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionTrace {
    pub execution: WorkflowExecution,
    pub logs: Vec<ExecutionLog>,
}

/// Outcome of the atomic dedupe check-and-create.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed,
    Duplicate { existing_execution_id: String },
}

/// Database health snapshot for `/api/health`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseHealth {
    pub foreign_keys_enabled: bool,
    pub integrity_check: String,
    pub journal_mode: String,
    /// Executions still PENDING or RUNNING
    pub in_flight_executions: u64,
}

/// Query filters for listing executions.
#[derive(Debug, Clone)]
pub struct ExecutionQuery {
    pub workflow_id: Option<String>,
    pub institute_id: Option<String>,
    pub status: Option<ExecutionStatus>,
    pub limit: usize,
    pub offset: usize,
}

impl Default for ExecutionQuery {
    fn default() -> Self {
        Self {
            workflow_id: None,
            institute_id: None,
            status: None,
            limit: 50,
            offset: 0,
        }
    }
}
