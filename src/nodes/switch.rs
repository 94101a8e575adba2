//! Switch node - records the value its routing branches on.

use async_trait::async_trait;
use serde_json::{json, Value};

use super::types::{Node, NodeContext, NodeResult};
use crate::error::Result;
use crate::expression::{self, to_display_string};
use crate::workflow::{NodeTemplate, NodeType, SwitchConfig};

/// Pass-through node. Branching happens in its `switch` routing; the
/// configured expression is evaluated so the log shows what was switched on.
pub struct SwitchNode;

impl SwitchNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for SwitchNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for SwitchNode {
    fn node_type(&self) -> NodeType {
        NodeType::Switch
    }

    fn description(&self) -> &str {
        "Branch point; evaluates and records the switch value"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: SwitchConfig = node.parse_config()?;
        let source = config
            .expression
            .as_deref()
            .or_else(|| node.routing.expression());

        let Some(source) = source else {
            return Ok(NodeResult::new(json!({})));
        };

        let value = expression::evaluate(source, &ctx.values)?;
        let case = match &value {
            Value::Null => Value::Null,
            other => Value::String(to_display_string(other)),
        };
        Ok(NodeResult::new(json!({
            "expression": source,
            "value": value,
            "case": case,
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ctx(values: Value) -> NodeContext {
        NodeContext::new("e1", "wf", Arc::new(values.as_object().cloned().unwrap()))
    }

    #[tokio::test]
    async fn test_records_routing_expression_value() {
        let node: NodeTemplate = serde_json::from_value(json!({
            "id": "route",
            "type": "SWITCH",
            "routing": {
                "type": "switch",
                "expression": "remaining_days",
                "cases": {"3": "three"},
                "default_node_id": "other"
            }
        }))
        .unwrap();

        let result = SwitchNode::new()
            .execute(&node, &ctx(json!({"remaining_days": 3})))
            .await
            .unwrap();
        assert_eq!(result.data["value"], 3);
        assert_eq!(result.data["case"], "3");
        assert!(result.writes.is_empty());
    }

    #[tokio::test]
    async fn test_config_expression_wins() {
        let node: NodeTemplate = serde_json::from_value(json!({
            "id": "route",
            "type": "SWITCH",
            "config": {"expression": "upper(plan)"}
        }))
        .unwrap();

        let result = SwitchNode::new()
            .execute(&node, &ctx(json!({"plan": "gold"})))
            .await
            .unwrap();
        assert_eq!(result.data["value"], "GOLD");
    }
}
