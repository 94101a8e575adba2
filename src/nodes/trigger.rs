//! Trigger node - entry point of every graph.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{Node, NodeContext, NodeResult};
use crate::error::Result;
use crate::workflow::{NodeTemplate, NodeType, TriggerConfig};

/// The context is seeded with the firing's payload before the walk starts,
/// so this node only records what fired.
pub struct TriggerNode;

impl TriggerNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TriggerNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for TriggerNode {
    fn node_type(&self) -> NodeType {
        NodeType::Trigger
    }

    fn description(&self) -> &str {
        "Entry node; records the trigger payload"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: TriggerConfig = node.parse_config()?;
        Ok(NodeResult::new(json!({
            "event_name": config.event_name,
            "idempotency_strategy": config.idempotency.strategy.to_string(),
            "payload": Value::Object((*ctx.values).clone()),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_records_payload_without_writes() {
        let node: NodeTemplate = serde_json::from_value(json!({
            "id": "start",
            "type": "TRIGGER",
            "config": {"event_name": "lead.created"}
        }))
        .unwrap();
        let values = json!({"lead_id": "l1"}).as_object().cloned().unwrap();
        let ctx = NodeContext::new("e1", "wf", Arc::new(values));

        let result = TriggerNode::new().execute(&node, &ctx).await.unwrap();
        assert_eq!(result.data["event_name"], "lead.created");
        assert_eq!(result.data["idempotency_strategy"], "UUID");
        assert_eq!(result.data["payload"]["lead_id"], "l1");
        assert!(result.writes.is_empty());
    }
}
