//! Transform node - computes named fields into the context.

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::types::{Node, NodeContext, NodeResult};
use crate::error::Result;
use crate::expression;
use crate::workflow::{NodeTemplate, NodeType, TransformConfig};

/// Evaluates `fields` in order. Each field is visible to the ones after it.
pub struct TransformNode;

impl TransformNode {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TransformNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for TransformNode {
    fn node_type(&self) -> NodeType {
        NodeType::Transform
    }

    fn description(&self) -> &str {
        "Compute named fields from expressions"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: TransformConfig = node.parse_config()?;

        let mut scope = (*ctx.values).clone();
        let mut writes = Map::new();
        for field in &config.fields {
            let value = expression::evaluate(&field.expression, &scope)?;
            debug!(node_id = %node.id, field = %field.name, "Transform field computed");
            scope.insert(field.name.clone(), value.clone());
            writes.insert(field.name.clone(), value);
        }

        Ok(NodeResult::with_writes(Value::Object(writes.clone()), writes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    fn node(fields: Value) -> NodeTemplate {
        serde_json::from_value(json!({
            "id": "calc",
            "type": "TRANSFORM",
            "config": {"fields": fields}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_later_fields_see_earlier_ones() {
        let values = json!({"remaining_days": 6}).as_object().cloned().unwrap();
        let ctx = NodeContext::new("e1", "wf", Arc::new(values));

        let result = TransformNode::new()
            .execute(
                &node(json!([
                    {"name": "every", "expression": "3"},
                    {"name": "due", "expression": "remaining_days % every == 0"}
                ])),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result.writes["every"], json!(3));
        assert_eq!(result.writes["due"], json!(true));
        assert_eq!(result.data, json!({"every": 3, "due": true}));
    }

    #[tokio::test]
    async fn test_unresolved_reference_fails() {
        let ctx = NodeContext::new("e1", "wf", Arc::new(Map::new()));
        let err = TransformNode::new()
            .execute(&node(json!([{"name": "x", "expression": "ghost + 1"}])), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXPRESSION_ERROR");
    }
}
