//! Action node - dispatches to a registered action handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::warn;

use super::types::{result_key, Node, NodeContext, NodeResult};
use crate::actions::ActionRegistry;
use crate::error::Result;
use crate::expression;
use crate::workflow::{ActionConfig, NodeTemplate, NodeType};

pub struct ActionNode {
    actions: Arc<ActionRegistry>,
}

impl ActionNode {
    pub fn new(actions: Arc<ActionRegistry>) -> Self {
        Self { actions }
    }
}

/// Run a handler and fold any error into `{success: false, error}`.
pub(crate) async fn dispatch_action(
    actions: &ActionRegistry,
    action_type: &str,
    item: &Value,
    config: &Value,
    ctx: &Map<String, Value>,
) -> Value {
    let output = match actions.execute(action_type, item, config, ctx).await {
        Ok(output) => output,
        Err(e) => {
            warn!(action_type, error = %e, "Action handler failed");
            json!({"success": false, "error": e.to_string()})
        }
    };
    let success = output.get("success").and_then(Value::as_bool).unwrap_or(true);
    crate::metrics::record_action_result(action_type, success);
    output
}

#[async_trait]
impl Node for ActionNode {
    fn node_type(&self) -> NodeType {
        NodeType::Action
    }

    fn description(&self) -> &str {
        "Invoke a registered action handler"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: ActionConfig = node.parse_config()?;

        let item = match &config.items {
            Some(items) => expression::evaluate(items, &ctx.values)?,
            None => Value::Object((*ctx.values).clone()),
        };

        let output = dispatch_action(
            &self.actions,
            &config.data_processor,
            &item,
            &config.config,
            &ctx.values,
        )
        .await;

        Ok(NodeResult::stored(
            result_key(node, config.result_key.as_deref()),
            output,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{RecordingDb, RecordingNotifications};

    fn registry(db: Arc<RecordingDb>) -> Arc<ActionRegistry> {
        Arc::new(ActionRegistry::new(
            Arc::new(RecordingNotifications::default()),
            db,
        ))
    }

    fn node(config: Value) -> NodeTemplate {
        serde_json::from_value(json!({"id": "act", "type": "ACTION", "config": config})).unwrap()
    }

    #[tokio::test]
    async fn test_context_is_the_item_by_default() {
        let db = Arc::new(RecordingDb::default());
        let values = json!({"is_weekend": false, "remaining_days": 3, "mapping_id": "m1"});
        let ctx = NodeContext::new("e1", "wf", Arc::new(values.as_object().cloned().unwrap()));

        let result = ActionNode::new(registry(db.clone()))
            .execute(
                &node(json!({"data_processor": "remaining_days_update", "result_key": "update"})),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.writes["update"]["new_remaining_days"], 2);
        assert_eq!(result.success(), Some(true));
        assert_eq!(db.updates.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_handler_error_becomes_data() {
        let ctx = NodeContext::new("e1", "wf", Arc::new(Map::new()));
        let result = ActionNode::new(registry(Arc::new(RecordingDb::default())))
            .execute(&node(json!({"data_processor": "not_registered"})), &ctx)
            .await
            .unwrap();

        assert_eq!(result.data["success"], false);
        assert!(result.data["error"]
            .as_str()
            .unwrap()
            .contains("not_registered"));
        assert_eq!(result.writes["act"], result.data);
    }
}
