//! Workflow interpreter.
//!
//! `fire` turns a trigger firing into at most one execution per idempotency
//! key; `run` walks the pinned definition node by node, following routing,
//! and appends a log row for every state a node passes through.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn, Span};

use crate::error::{Error, Result};
use crate::expression::{self, is_truthy};
use crate::idempotency::TriggerFiring;
use crate::metrics;
use crate::nodes::{NodeContext, NodeRegistry};
use crate::storage::{
    ClaimOutcome, ExecutionLog, ExecutionStatus, LogStatus, SqliteStorage, WorkflowExecution,
};
use crate::workflow::{resolve_routing, NodeTemplate, WorkflowDefinition, WorkflowStatus};

/// Default cap on visited nodes per execution.
pub const DEFAULT_MAX_STEPS: usize = 1000;
/// Default per-node timeout.
pub const DEFAULT_NODE_TIMEOUT_SECS: u64 = 120;

/// Interpreter limits.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Loop guard: visiting more nodes than this fails the execution
    pub max_steps: usize,
    /// Used for nodes without their own `timeout_seconds`
    pub node_timeout_seconds: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: DEFAULT_MAX_STEPS,
            node_timeout_seconds: DEFAULT_NODE_TIMEOUT_SECS,
        }
    }
}

/// Result of firing a trigger.
#[derive(Debug)]
pub enum FireOutcome {
    /// A new execution was claimed and its walk spawned.
    Started {
        execution_id: String,
        handle: JoinHandle<Result<WorkflowExecution>>,
    },
    /// The key was already claimed inside its validity window.
    Duplicate {
        idempotency_key: String,
        existing_execution_id: String,
    },
}

impl FireOutcome {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate { .. })
    }

    /// Id of the execution handling this firing, new or existing.
    pub fn execution_id(&self) -> &str {
        match self {
            Self::Started { execution_id, .. } => execution_id,
            Self::Duplicate {
                existing_execution_id,
                ..
            } => existing_execution_id,
        }
    }
}

/// A failure that ends the walk, with the node it happened on.
struct WalkFailure {
    node_id: Option<String>,
    error: Error,
}

impl WalkFailure {
    fn at(node_id: &str, error: Error) -> Self {
        Self {
            node_id: Some(node_id.to_string()),
            error,
        }
    }
}

impl From<Error> for WalkFailure {
    fn from(error: Error) -> Self {
        Self {
            node_id: None,
            error,
        }
    }
}

/// Workflow interpreter.
#[derive(Clone)]
pub struct Engine {
    storage: SqliteStorage,
    nodes: Arc<NodeRegistry>,
    config: EngineConfig,
}

impl Engine {
    pub fn new(storage: SqliteStorage, nodes: NodeRegistry, config: EngineConfig) -> Self {
        Self {
            storage,
            nodes: Arc::new(nodes),
            config,
        }
    }

    pub fn storage(&self) -> &SqliteStorage {
        &self.storage
    }

    pub fn nodes(&self) -> &NodeRegistry {
        &self.nodes
    }

    /// Mark executions left PENDING or RUNNING by a previous process as FAILED.
    pub async fn recover_interrupted(&self) -> Result<usize> {
        let count = self
            .storage
            .fail_interrupted_executions("Interrupted by engine restart")
            .await?;
        if count > 0 {
            warn!("Marked {} interrupted executions as FAILED", count);
        }
        Ok(count)
    }

    /// Fire `workflow_id`'s trigger now.
    pub async fn fire(&self, workflow_id: &str, firing: TriggerFiring) -> Result<FireOutcome> {
        self.fire_at(workflow_id, firing, Utc::now()).await
    }

    /// Fire `workflow_id`'s trigger as of `now`.
    ///
    /// The key claim and the PENDING insert happen in one transaction, so
    /// concurrent firings with the same key start at most one execution.
    #[instrument(
        name = "workflow.fire",
        skip(self, firing, now),
        fields(
            workflow_id = %workflow_id,
            trigger_type = %firing.trigger_type,
            execution_id = tracing::field::Empty,
        )
    )]
    pub async fn fire_at(
        &self,
        workflow_id: &str,
        firing: TriggerFiring,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let stored = self
            .storage
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| Error::Workflow(format!("Workflow not found: {}", workflow_id)))?;

        if stored.status != WorkflowStatus::Active {
            return Err(Error::Workflow(format!(
                "Workflow '{}' is inactive",
                workflow_id
            )));
        }

        // Pin the walk to the latest version snapshot.
        let (version, workflow) = match self.storage.get_latest_workflow_version(workflow_id).await? {
            Some(v) => (v.version, v.to_definition()?),
            None => (0, stored.to_definition()?),
        };

        let trigger = workflow.trigger_node().ok_or_else(|| {
            Error::Workflow(format!("Workflow '{}' has no TRIGGER node", workflow_id))
        })?;
        let settings = workflow.trigger_config()?.idempotency;
        let key = firing.idempotency_key(&settings, &trigger.id, now)?;

        let execution = WorkflowExecution::pending(
            workflow_id,
            version,
            stored.institute_id.clone(),
            &key,
            &firing.trigger_type,
            Value::Object(firing.payload),
        );

        match self
            .storage
            .claim_and_create_execution(&execution, settings.expires_at(now), now)
            .await?
        {
            ClaimOutcome::Duplicate {
                existing_execution_id,
            } => {
                info!(
                    idempotency_key = %key,
                    existing_execution_id = %existing_execution_id,
                    "Duplicate firing suppressed"
                );
                metrics::record_duplicate_firing(workflow_id);
                Ok(FireOutcome::Duplicate {
                    idempotency_key: key,
                    existing_execution_id,
                })
            }
            ClaimOutcome::Claimed => {
                let execution_id = execution.id.clone();
                Span::current().record("execution_id", execution_id.as_str());
                debug!(idempotency_key = %key, version, "Execution claimed");

                let engine = self.clone();
                let workflow = Arc::new(workflow);
                let handle = tokio::spawn(async move { engine.run(execution, workflow).await });

                Ok(FireOutcome::Started {
                    execution_id,
                    handle,
                })
            }
        }
    }

    /// Walk `workflow` for a PENDING `execution` until it ends.
    ///
    /// Workflow failures end in a FAILED execution, not an `Err`; `Err` is
    /// reserved for storage failures while recording state.
    #[instrument(
        name = "workflow.execute",
        skip(self, execution, workflow),
        fields(
            workflow_id = %execution.workflow_id,
            execution_id = %execution.id,
            trigger_type = %execution.trigger_type,
        )
    )]
    pub async fn run(
        &self,
        mut execution: WorkflowExecution,
        workflow: Arc<WorkflowDefinition>,
    ) -> Result<WorkflowExecution> {
        execution.status = ExecutionStatus::Running;
        execution.started_at = Some(Utc::now());
        self.storage.update_execution(&execution).await?;

        info!(
            "Starting execution {} of workflow '{}' (version {})",
            execution.id, workflow.id, execution.workflow_version
        );
        metrics::inc_active_executions();
        let start_time = Instant::now();

        let outcome = self.walk(&execution, &workflow).await;

        execution.completed_at = Some(Utc::now());
        match outcome {
            Ok(()) => {
                execution.status = ExecutionStatus::Succeeded;
                info!("Execution {} succeeded", execution.id);
            }
            Err(failure) => {
                execution.status = ExecutionStatus::Failed;
                execution.error_message = Some(failure.error.to_string());
                execution.failed_node_id = failure.node_id;
                error!(
                    node_id = ?execution.failed_node_id,
                    error_type = failure.error.code(),
                    "Execution {} failed: {}",
                    execution.id,
                    failure.error
                );
            }
        }

        metrics::dec_active_executions();
        metrics::record_workflow_execution(
            &execution.status.to_string().to_lowercase(),
            &execution.trigger_type,
        );
        metrics::record_workflow_duration(start_time.elapsed(), &execution.workflow_id);

        self.storage.update_execution(&execution).await?;
        Ok(execution)
    }

    async fn walk(
        &self,
        execution: &WorkflowExecution,
        workflow: &WorkflowDefinition,
    ) -> std::result::Result<(), WalkFailure> {
        let mut values = Arc::new(match &execution.input {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        });

        let mut current = workflow
            .trigger_node()
            .map(|n| n.id.clone())
            .ok_or_else(|| {
                Error::Workflow(format!("Workflow '{}' has no TRIGGER node", workflow.id))
            })?;
        let mut steps = 0usize;

        loop {
            steps += 1;
            if steps > self.config.max_steps {
                return Err(WalkFailure::at(
                    &current,
                    Error::ExecutionFatal(format!(
                        "Exceeded {} steps; routing loops without reaching an end",
                        self.config.max_steps
                    )),
                ));
            }

            let node = workflow.node(&current).ok_or_else(|| {
                WalkFailure::at(
                    &current,
                    Error::Routing(format!("Node '{}' not found in workflow", current)),
                )
            })?;

            let ctx = NodeContext::new(&execution.id, &workflow.id, values.clone())
                .with_institute(execution.institute_id.clone());
            let writes = self.execute_node(node, &ctx).await?;
            if !writes.is_empty() {
                Arc::make_mut(&mut values).extend(writes);
            }

            match resolve_routing(&node.routing, &values, workflow) {
                Ok(Some(next)) => {
                    debug!(from = %node.id, to = %next, "Routing");
                    current = next;
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    // The node itself already succeeded or was skipped.
                    let row = ExecutionLog::started(&execution.id, &node.id, node.node_type.as_str())
                        .fail(&e, None);
                    self.storage.append_log(&row).await?;
                    return Err(WalkFailure::at(&node.id, e));
                }
            }
        }
    }

    /// Run one node and log it. Returns the fields it writes to the context.
    #[instrument(
        name = "node.execute",
        skip(self, node, ctx),
        fields(node_id = %node.id, node_type = %node.node_type)
    )]
    async fn execute_node(
        &self,
        node: &NodeTemplate,
        ctx: &NodeContext,
    ) -> std::result::Result<Map<String, Value>, WalkFailure> {
        let node_type = node.node_type.as_str();
        let started = ExecutionLog::started(&ctx.execution_id, &node.id, node_type);
        self.storage.append_log(&started).await?;

        if let Some(condition) = &node.condition {
            match expression::evaluate(condition, &ctx.values) {
                Ok(value) if !is_truthy(&value) => {
                    info!("Skipping node '{}' due to false condition", node.id);
                    self.storage
                        .append_log(&started.finish(LogStatus::Skipped, None))
                        .await?;
                    metrics::record_node_execution(node_type, "skipped");
                    return Ok(Map::new());
                }
                Ok(_) => {}
                Err(e) => {
                    self.storage.append_log(&started.fail(&e, None)).await?;
                    return Err(WalkFailure::at(&node.id, e));
                }
            }
        }

        let timeout_secs = node
            .timeout_seconds
            .unwrap_or(self.config.node_timeout_seconds)
            .max(1);
        let node_start = Instant::now();

        let result = match timeout(Duration::from_secs(timeout_secs), self.nodes.execute(node, ctx))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(Error::ExecutionFatal(format!(
                "Node '{}' timed out after {}s",
                node.id, timeout_secs
            ))),
        };
        metrics::record_node_duration(node_start.elapsed(), node_type);

        match result {
            Ok(result) => {
                metrics::record_node_execution(node_type, "succeeded");
                self.storage
                    .append_log(&started.finish(LogStatus::Succeeded, Some(result.data)))
                    .await?;
                Ok(result.writes)
            }
            Err(e) => {
                metrics::record_node_execution(node_type, "failed");
                self.storage.append_log(&started.fail(&e, None)).await?;
                Err(WalkFailure::at(&node.id, e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{RecordingDb, RecordingNotifications};
    use crate::actions::ActionRegistry;
    use crate::nodes::{Node, NodeResult};
    use crate::workflow::NodeType;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use serde_json::json;

    struct Harness {
        engine: Engine,
        db: Arc<RecordingDb>,
    }

    fn harness_with(config: EngineConfig, extra: Option<Arc<dyn Node>>) -> Harness {
        let db = Arc::new(RecordingDb::default());
        let actions = Arc::new(ActionRegistry::new(
            Arc::new(RecordingNotifications::default()),
            db.clone(),
        ));
        let mut nodes = NodeRegistry::new(actions, db.clone(), 2);
        if let Some(node) = extra {
            nodes.register(node);
        }
        let storage = SqliteStorage::open_in_memory().unwrap();
        Harness {
            engine: Engine::new(storage, nodes, config),
            db,
        }
    }

    fn harness() -> Harness {
        harness_with(EngineConfig::default(), None)
    }

    async fn save(engine: &Engine, definition: Value) -> WorkflowDefinition {
        let workflow: WorkflowDefinition = serde_json::from_value(definition).unwrap();
        engine.storage().save_workflow(&workflow, None).await.unwrap();
        workflow
    }

    async fn fire_and_wait(engine: &Engine, workflow_id: &str, payload: Value) -> WorkflowExecution {
        let firing = TriggerFiring::manual(None, payload.as_object().cloned().unwrap());
        match engine.fire(workflow_id, firing).await.unwrap() {
            FireOutcome::Started { handle, .. } => handle.await.unwrap().unwrap(),
            other => panic!("expected a new execution, got {:?}", other),
        }
    }

    fn statuses(logs: &[ExecutionLog]) -> Vec<(String, LogStatus)> {
        logs.iter()
            .map(|l| (l.node_template_id.clone(), l.status))
            .collect()
    }

    #[tokio::test]
    async fn test_linear_walk_succeeds() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "welcome",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "greet"}},
                    {"id": "greet", "type": "TRANSFORM", "config": {"fields": [
                        {"name": "greeting", "expression": "'Hi ' + name"}
                    ]}}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "welcome", json!({"name": "Asha"})).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert!(execution.completed_at.is_some());

        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        assert_eq!(
            statuses(&logs),
            vec![
                ("start".to_string(), LogStatus::Started),
                ("start".to_string(), LogStatus::Succeeded),
                ("greet".to_string(), LogStatus::Started),
                ("greet".to_string(), LogStatus::Succeeded),
            ]
        );
        assert_eq!(logs[3].details, Some(json!({"greeting": "Hi Asha"})));
        assert!(logs[3].execution_time_ms.is_some());
    }

    #[tokio::test]
    async fn test_time_window_dedupes_firings_in_one_bucket() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "digest",
                "nodes": [{"id": "start", "type": "TRIGGER", "config": {
                    "idempotency": {"strategy": "TIME_WINDOW", "ttl_minutes": 15}
                }}]
            }),
        )
        .await;

        // Both firings lie in the past; expiry is judged against the firing time.
        let t = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let first = h
            .engine
            .fire_at("digest", TriggerFiring::manual(None, Map::new()), t)
            .await
            .unwrap();
        let second = h
            .engine
            .fire_at(
                "digest",
                TriggerFiring::manual(None, Map::new()),
                t + chrono::Duration::minutes(5),
            )
            .await
            .unwrap();

        assert!(!first.is_duplicate());
        assert_eq!(second.execution_id(), first.execution_id());
        match second {
            FireOutcome::Duplicate {
                idempotency_key, ..
            } => assert!(idempotency_key.starts_with("tw:")),
            other => panic!("expected duplicate, got {:?}", other),
        }
        if let FireOutcome::Started { handle, .. } = first {
            handle.await.unwrap().unwrap();
        }

        let executions = h
            .engine
            .storage()
            .list_executions(&crate::storage::ExecutionQuery {
                workflow_id: Some("digest".into()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(executions.len(), 1);
    }

    #[tokio::test]
    async fn test_false_condition_skips_and_follows_routing() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "cond",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "maybe"}},
                    {"id": "maybe", "type": "TRANSFORM", "condition": "vip",
                     "config": {"fields": [{"name": "tier", "expression": "'gold'"}]},
                     "routing": {"type": "goto", "target_node_id": "after"}},
                    {"id": "after", "type": "SWITCH", "config": {"expression": "vip"}}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "cond", json!({"vip": false})).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);

        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        assert_eq!(logs[3].status, LogStatus::Skipped);
        assert_eq!(logs[5].node_template_id, "after");
        assert_eq!(logs[5].status, LogStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_routing_error_appends_failed_row() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "branchy",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {
                        "type": "conditional", "condition": "score > 10",
                        "true_node_id": "start", "false_node_id": "start"
                    }}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "branchy", json!({})).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_node_id.as_deref(), Some("start"));
        assert!(execution.error_message.unwrap().contains("score"));

        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        assert_eq!(
            statuses(&logs),
            vec![
                ("start".to_string(), LogStatus::Started),
                ("start".to_string(), LogStatus::Succeeded),
                ("start".to_string(), LogStatus::Failed),
            ]
        );
        assert_eq!(logs[2].error_type.as_deref(), Some("EXPRESSION_ERROR"));
    }

    #[tokio::test]
    async fn test_loop_guard_fails_execution() {
        let h = harness_with(
            EngineConfig {
                max_steps: 5,
                ..Default::default()
            },
            None,
        );
        save(
            &h.engine,
            json!({
                "id": "spin",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "again"}},
                    {"id": "again", "type": "SWITCH", "routing": {"type": "goto", "target_node_id": "again"}}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "spin", json!({})).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_node_id.as_deref(), Some("again"));
        assert!(execution.error_message.unwrap().contains("Exceeded 5 steps"));
    }

    struct SlowNode;

    #[async_trait]
    impl Node for SlowNode {
        fn node_type(&self) -> NodeType {
            NodeType::Transform
        }

        async fn execute(&self, _node: &NodeTemplate, _ctx: &NodeContext) -> Result<NodeResult> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(NodeResult::default())
        }
    }

    #[tokio::test]
    async fn test_node_timeout_fails_execution() {
        let h = harness_with(EngineConfig::default(), Some(Arc::new(SlowNode)));
        save(
            &h.engine,
            json!({
                "id": "slow",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "wait"}},
                    {"id": "wait", "type": "TRANSFORM", "timeout_seconds": 1}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "slow", json!({})).await;
        assert_eq!(execution.status, ExecutionStatus::Failed);
        assert_eq!(execution.failed_node_id.as_deref(), Some("wait"));

        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        let last = logs.last().unwrap();
        assert_eq!(last.status, LogStatus::Failed);
        assert_eq!(last.error_type.as_deref(), Some("EXECUTION_FATAL"));
    }

    #[tokio::test]
    async fn test_handler_failure_is_reported_not_fatal() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "act",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "do"}},
                    {"id": "do", "type": "ACTION", "config": {"data_processor": "no_such_handler"},
                     "routing": {"type": "conditional", "condition": "do.success",
                                 "true_node_id": "start", "false_node_id": "done"}},
                    {"id": "done", "type": "SWITCH"}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(&h.engine, "act", json!({})).await;
        assert_eq!(execution.status, ExecutionStatus::Succeeded);

        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        assert_eq!(logs[3].details.as_ref().unwrap()["success"], false);
        assert_eq!(logs.last().unwrap().node_template_id, "done");
    }

    #[tokio::test]
    async fn test_combot_updates_flow_through_context() {
        let h = harness();
        save(
            &h.engine,
            json!({
                "id": "decrement",
                "nodes": [
                    {"id": "start", "type": "TRIGGER", "routing": {"type": "goto", "target_node_id": "each"}},
                    {"id": "each", "type": "COMBOT", "config": {
                        "list": "mappings",
                        "for_each": {"operation": "UPDATE", "data_processor": "remaining_days_update"},
                        "result_key": "updates"
                    }, "routing": {"type": "switch", "expression": "updates.succeeded",
                                   "cases": {"2": "ok"}}},
                    {"id": "ok", "type": "SWITCH"}
                ]
            }),
        )
        .await;

        let execution = fire_and_wait(
            &h.engine,
            "decrement",
            json!({"mappings": [
                {"mapping_id": "m1", "remaining_days": 3, "is_weekend": false},
                {"mapping_id": "m2", "remaining_days": 5, "is_weekend": true}
            ]}),
        )
        .await;

        assert_eq!(execution.status, ExecutionStatus::Succeeded);
        assert_eq!(h.db.updates.lock().unwrap().len(), 1);
        let logs = h.engine.storage().get_execution_logs(&execution.id).await.unwrap();
        assert_eq!(logs.last().unwrap().node_template_id, "ok");
    }

    #[tokio::test]
    async fn test_inactive_workflow_is_rejected() {
        let h = harness();
        let mut workflow = save(
            &h.engine,
            json!({"id": "off", "nodes": [{"id": "start", "type": "TRIGGER"}]}),
        )
        .await;
        workflow.status = WorkflowStatus::Inactive;
        h.engine.storage().save_workflow(&workflow, None).await.unwrap();

        let err = h
            .engine
            .fire("off", TriggerFiring::manual(None, Map::new()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("inactive"));
    }

    #[tokio::test]
    async fn test_execution_pins_latest_version() {
        let h = harness();
        let mut workflow = save(
            &h.engine,
            json!({"id": "v", "nodes": [{"id": "start", "type": "TRIGGER"}]}),
        )
        .await;
        workflow.name = "Renamed".into();
        h.engine.storage().save_workflow(&workflow, None).await.unwrap();

        let execution = fire_and_wait(&h.engine, "v", json!({})).await;
        assert_eq!(execution.workflow_version, 2);
    }
}
