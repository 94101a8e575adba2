//! Routing resolution: picks the node that runs after the current one.

use serde_json::{Map, Value};

use super::types::{Routing, WorkflowDefinition};
use crate::error::{Error, Result};
use crate::expression::{self, is_truthy, to_display_string};

/// Resolve `routing` against the execution context.
///
/// Returns `Ok(None)` when the walk should end. Conditional branches without
/// a target and switches with no matching case and no default also end the
/// walk. A target that names no node in `workflow` is a routing error.
pub fn resolve_routing(
    routing: &Routing,
    ctx: &Map<String, Value>,
    workflow: &WorkflowDefinition,
) -> Result<Option<String>> {
    let next = match routing {
        Routing::End => None,
        Routing::Goto { target_node_id } => Some(target_node_id.clone()),
        Routing::Conditional {
            condition,
            true_node_id,
            false_node_id,
        } => {
            let value = expression::evaluate(condition, ctx)?;
            if is_truthy(&value) {
                true_node_id.clone()
            } else {
                false_node_id.clone()
            }
        }
        Routing::Switch {
            expression: expr,
            cases,
            default_node_id,
        } => {
            let key = to_display_string(&expression::evaluate(expr, ctx)?);
            cases.get(&key).cloned().or_else(|| default_node_id.clone())
        }
    };

    match next {
        Some(id) if workflow.node(&id).is_none() => Err(Error::Routing(format!(
            "Routing targets unknown node '{}' in workflow '{}'",
            id, workflow.id
        ))),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{NodeTemplate, NodeType, WorkflowStatus};
    use serde_json::json;
    use std::collections::BTreeMap;

    fn workflow(ids: &[&str]) -> WorkflowDefinition {
        WorkflowDefinition {
            id: "wf".into(),
            name: "wf".into(),
            institute_id: None,
            status: WorkflowStatus::Active,
            description: String::new(),
            nodes: ids
                .iter()
                .map(|id| NodeTemplate {
                    id: id.to_string(),
                    node_type: NodeType::Transform,
                    name: None,
                    config: Value::Null,
                    routing: Routing::End,
                    condition: None,
                    timeout_seconds: None,
                })
                .collect(),
        }
    }

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn switch(default: Option<&str>) -> Routing {
        let mut cases = BTreeMap::new();
        cases.insert("3".to_string(), "three".to_string());
        cases.insert("gold".to_string(), "gold".to_string());
        Routing::Switch {
            expression: "key".into(),
            cases,
            default_node_id: default.map(String::from),
        }
    }

    #[test]
    fn test_goto_and_end() {
        let wf = workflow(&["a", "b"]);
        let goto = Routing::Goto {
            target_node_id: "b".into(),
        };
        assert_eq!(
            resolve_routing(&goto, &Map::new(), &wf).unwrap(),
            Some("b".to_string())
        );
        assert_eq!(resolve_routing(&Routing::End, &Map::new(), &wf).unwrap(), None);
    }

    #[test]
    fn test_conditional_branches() {
        let wf = workflow(&["yes", "no"]);
        let routing = Routing::Conditional {
            condition: "remaining_days % 3 == 0".into(),
            true_node_id: Some("yes".into()),
            false_node_id: Some("no".into()),
        };
        assert_eq!(
            resolve_routing(&routing, &ctx(json!({"remaining_days": 6})), &wf).unwrap(),
            Some("yes".to_string())
        );
        assert_eq!(
            resolve_routing(&routing, &ctx(json!({"remaining_days": 5})), &wf).unwrap(),
            Some("no".to_string())
        );
    }

    #[test]
    fn test_conditional_expression_error_propagates() {
        let wf = workflow(&["yes"]);
        let routing = Routing::Conditional {
            condition: "missing > 1".into(),
            true_node_id: Some("yes".into()),
            false_node_id: None,
        };
        let err = resolve_routing(&routing, &Map::new(), &wf).unwrap_err();
        assert_eq!(err.code(), "EXPRESSION_ERROR");
    }

    #[test]
    fn test_switch_coerces_value_to_string() {
        let wf = workflow(&["three", "gold", "fallback"]);
        assert_eq!(
            resolve_routing(&switch(None), &ctx(json!({"key": 3})), &wf).unwrap(),
            Some("three".to_string())
        );
        assert_eq!(
            resolve_routing(&switch(None), &ctx(json!({"key": "gold"})), &wf).unwrap(),
            Some("gold".to_string())
        );
    }

    #[test]
    fn test_switch_without_match_uses_default_then_end() {
        let wf = workflow(&["three", "gold", "fallback"]);
        assert_eq!(
            resolve_routing(&switch(Some("fallback")), &ctx(json!({"key": 9})), &wf).unwrap(),
            Some("fallback".to_string())
        );
        assert_eq!(
            resolve_routing(&switch(None), &ctx(json!({"key": 9})), &wf).unwrap(),
            None
        );
    }

    #[test]
    fn test_unknown_target_is_routing_error() {
        let wf = workflow(&["a"]);
        let goto = Routing::Goto {
            target_node_id: "ghost".into(),
        };
        let err = resolve_routing(&goto, &Map::new(), &wf).unwrap_err();
        assert_eq!(err.code(), "ROUTING_ERROR");
        assert!(err.to_string().contains("ghost"));
    }
}
