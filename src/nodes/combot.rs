//! Combot node - fans a context list out into per-item operations.
//!
//! Items run concurrently up to `max_concurrency`; results keep item order.
//! Per-item failures are reported in `results` and never abort the node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::action::dispatch_action;
use super::query::eval_params;
use super::types::{result_key, Node, NodeContext, NodeResult};
use crate::actions::ActionRegistry;
use crate::clients::DbClient;
use crate::error::{Error, Result};
use crate::expression;
use crate::workflow::{CombotConfig, ForEachConfig, ForEachOperation, NodeTemplate, NodeType};

/// Row cap for per-item QUERY operations.
const ITEM_QUERY_MAX_ROWS: usize = 1000;
/// Item field receiving QUERY rows when `result_field` is unset.
const DEFAULT_RESULT_FIELD: &str = "rows";

pub struct CombotNode {
    actions: Arc<ActionRegistry>,
    db: Arc<dyn DbClient>,
    default_concurrency: usize,
}

impl CombotNode {
    pub fn new(actions: Arc<ActionRegistry>, db: Arc<dyn DbClient>, default_concurrency: usize) -> Self {
        Self {
            actions,
            db,
            default_concurrency: default_concurrency.max(1),
        }
    }
}

/// Everything one item's task needs.
struct ItemTask {
    actions: Arc<ActionRegistry>,
    db: Arc<dyn DbClient>,
    for_each: ForEachConfig,
    ctx: NodeContext,
}

impl ItemTask {
    async fn run(&self, item: &Value) -> Value {
        match self.try_run(item).await {
            Ok(value) => value,
            Err(e) => json!({"success": false, "error": e.to_string()}),
        }
    }

    async fn try_run(&self, item: &Value) -> Result<Value> {
        let scope = self.ctx.scope_with_item(item);

        match self.for_each.operation {
            ForEachOperation::Query => {
                let sql = self
                    .for_each
                    .sql
                    .as_deref()
                    .ok_or_else(|| Error::Node("QUERY for_each needs sql".to_string()))?;
                let params = eval_params(&self.for_each.params, &scope)?;
                let rows = self.db.query(sql, &params, ITEM_QUERY_MAX_ROWS).await?;

                let field = self
                    .for_each
                    .result_field
                    .as_deref()
                    .unwrap_or(DEFAULT_RESULT_FIELD);
                let mut out = match item {
                    Value::Object(map) => map.clone(),
                    other => {
                        let mut map = serde_json::Map::new();
                        map.insert("item".to_string(), other.clone());
                        map
                    }
                };
                out.insert(field.to_string(), Value::Array(rows));
                Ok(Value::Object(out))
            }
            ForEachOperation::Update | ForEachOperation::SendMessage | ForEachOperation::Custom => {
                let processor = self.for_each.data_processor.as_deref().ok_or_else(|| {
                    Error::Node("for_each operation needs a data_processor".to_string())
                })?;
                Ok(dispatch_action(&self.actions, processor, item, &self.for_each.config, &scope).await)
            }
        }
    }
}

fn item_succeeded(result: &Value) -> bool {
    result.get("success").and_then(Value::as_bool).unwrap_or(true)
}

fn spawn_item(join_set: &mut JoinSet<(usize, Value)>, index: usize, item: Value, task: &Arc<ItemTask>) {
    let task = task.clone();
    join_set.spawn(async move { (index, task.run(&item).await) });
}

#[async_trait]
impl Node for CombotNode {
    fn node_type(&self) -> NodeType {
        NodeType::Combot
    }

    fn description(&self) -> &str {
        "Run a per-item operation over a context list"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: CombotConfig = node.parse_config()?;
        let key = result_key(node, config.result_key.as_deref());

        let items = match expression::evaluate(&config.list, &ctx.values)? {
            Value::Array(items) => items,
            Value::Null => Vec::new(),
            other => {
                return Err(Error::ExecutionFatal(format!(
                    "Combot node '{}' list must be an array, got {}",
                    node.id, other
                )))
            }
        };

        if items.is_empty() {
            debug!(node_id = %node.id, "Combot list is empty");
            return Ok(NodeResult::stored(key, json!({"success": true})));
        }

        let total = items.len();
        let max_concurrency = config.max_concurrency.unwrap_or(self.default_concurrency).max(1);
        let task = Arc::new(ItemTask {
            actions: self.actions.clone(),
            db: self.db.clone(),
            for_each: config.for_each.clone(),
            ctx: ctx.clone(),
        });

        let mut results =
            vec![json!({"success": false, "error": "item task did not complete"}); total];
        let mut join_set: JoinSet<(usize, Value)> = JoinSet::new();
        let mut pending = items.into_iter().enumerate();

        for (index, item) in pending.by_ref().take(max_concurrency) {
            spawn_item(&mut join_set, index, item, &task);
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = result,
                Err(e) => warn!(node_id = %node.id, error = %e, "Combot item task failed to join"),
            }
            if let Some((index, item)) = pending.next() {
                spawn_item(&mut join_set, index, item, &task);
            }
        }

        let succeeded = results.iter().filter(|r| item_succeeded(r)).count();
        let failed = total - succeeded;
        debug!(node_id = %node.id, total, succeeded, failed, "Combot finished");

        Ok(NodeResult::stored(
            key,
            json!({
                "success": failed == 0,
                "total": total,
                "succeeded": succeeded,
                "failed": failed,
                "results": results,
            }),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{RecordingDb, RecordingNotifications};
    use serde_json::Map;

    fn combot(db: Arc<RecordingDb>, notifications: Arc<RecordingNotifications>) -> CombotNode {
        let actions = Arc::new(ActionRegistry::new(notifications, db.clone()));
        CombotNode::new(actions, db, 4)
    }

    fn node(config: Value) -> NodeTemplate {
        serde_json::from_value(json!({"id": "loop", "type": "COMBOT", "config": config})).unwrap()
    }

    fn ctx(values: Value) -> NodeContext {
        NodeContext::new("e1", "wf", Arc::new(values.as_object().cloned().unwrap()))
    }

    #[tokio::test]
    async fn test_empty_list_succeeds_without_handler_calls() {
        let db = Arc::new(RecordingDb::default());
        let notifications = Arc::new(RecordingNotifications::default());
        let result = combot(db.clone(), notifications.clone())
            .execute(
                &node(json!({
                    "list": "mappings",
                    "for_each": {"operation": "UPDATE", "data_processor": "remaining_days_update"}
                })),
                &ctx(json!({"mappings": []})),
            )
            .await
            .unwrap();

        assert_eq!(result.data, json!({"success": true}));
        assert_eq!(result.writes["loop"], json!({"success": true}));
        assert!(db.updates.lock().unwrap().is_empty());
        assert!(notifications.emails.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_results_keep_item_order() {
        let db = Arc::new(RecordingDb::default());
        let mappings: Vec<Value> = (0..10)
            .map(|i| json!({"mapping_id": format!("m{}", i), "remaining_days": i, "is_weekend": false}))
            .collect();

        let result = combot(db.clone(), Arc::new(RecordingNotifications::default()))
            .execute(
                &node(json!({
                    "list": "mappings",
                    "max_concurrency": 3,
                    "for_each": {"operation": "UPDATE", "data_processor": "remaining_days_update"},
                    "result_key": "updates"
                })),
                &ctx(json!({ "mappings": mappings })),
            )
            .await
            .unwrap();

        let out = &result.writes["updates"];
        assert_eq!(out["success"], true);
        assert_eq!(out["total"], 10);
        assert_eq!(out["succeeded"], 10);
        let results = out["results"].as_array().unwrap();
        assert_eq!(results[0]["reason"], "ALREADY_ZERO");
        for (i, r) in results.iter().enumerate().skip(1) {
            assert_eq!(r["mapping_id"], format!("m{}", i));
            assert_eq!(r["new_remaining_days"], json!(i as i64 - 1));
        }
        assert_eq!(db.updates.lock().unwrap().len(), 9);
    }

    #[tokio::test]
    async fn test_item_failures_are_counted() {
        let db = Arc::new(RecordingDb {
            fail_updates: true,
            ..Default::default()
        });
        let result = combot(db, Arc::new(RecordingNotifications::default()))
            .execute(
                &node(json!({
                    "list": "mappings",
                    "for_each": {"operation": "UPDATE", "data_processor": "remaining_days_update"}
                })),
                &ctx(json!({"mappings": [
                    {"mapping_id": "m1", "remaining_days": 2, "is_weekend": false},
                    {"mapping_id": "m2", "remaining_days": 2, "is_weekend": true}
                ]})),
            )
            .await
            .unwrap();

        assert_eq!(result.data["success"], false);
        assert_eq!(result.data["succeeded"], 1);
        assert_eq!(result.data["failed"], 1);
        assert_eq!(result.data["results"][1]["reason"], "WEEKEND");
    }

    #[tokio::test]
    async fn test_query_operation_attaches_rows() {
        let db = Arc::new(RecordingDb {
            rows: vec![json!({"course": "c1"})],
            ..Default::default()
        });
        let result = combot(db, Arc::new(RecordingNotifications::default()))
            .execute(
                &node(json!({
                    "list": "leads",
                    "for_each": {
                        "operation": "QUERY",
                        "sql": "SELECT course FROM enrollments WHERE lead_id = ?1",
                        "params": ["item.id"],
                        "result_field": "courses"
                    }
                })),
                &ctx(json!({"leads": [{"id": "l1"}]})),
            )
            .await
            .unwrap();

        assert_eq!(
            result.data["results"][0],
            json!({"id": "l1", "courses": [{"course": "c1"}]})
        );
    }

    #[tokio::test]
    async fn test_non_list_is_fatal() {
        let err = combot(
            Arc::new(RecordingDb::default()),
            Arc::new(RecordingNotifications::default()),
        )
        .execute(
            &node(json!({
                "list": "count",
                "for_each": {"operation": "CUSTOM", "data_processor": "send_email"}
            })),
            &NodeContext::new("e1", "wf", Arc::new({
                let mut m = Map::new();
                m.insert("count".into(), json!(3));
                m
            })),
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), "EXECUTION_FATAL");
    }
}
