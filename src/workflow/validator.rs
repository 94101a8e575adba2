//! Workflow validation.

use std::collections::HashSet;

use super::types::{ForEachOperation, NodeConfig, Schedule, WorkflowDefinition};
use crate::actions::ActionRegistry;
use crate::error::{Error, Result};
use crate::expression::parse_expression;

/// Validate a workflow definition.
///
/// Checks for:
/// - Required fields (id, nodes)
/// - Exactly one TRIGGER node
/// - Unique, non-empty node IDs
/// - Routing targets that exist
/// - Node configs that parse into their DTOs
/// - Expressions that parse
pub fn validate_workflow(workflow: &WorkflowDefinition) -> Result<()> {
    validate(workflow, None)
}

/// Like [`validate_workflow`], also requiring every referenced
/// `data_processor` to be registered in `actions`.
pub fn validate_workflow_with_actions(
    workflow: &WorkflowDefinition,
    actions: &ActionRegistry,
) -> Result<()> {
    validate(workflow, Some(actions))
}

fn validate(workflow: &WorkflowDefinition, actions: Option<&ActionRegistry>) -> Result<()> {
    if workflow.id.is_empty() {
        return Err(Error::Validation("Workflow id is required".into()));
    }

    if !workflow
        .id
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::Validation(
            "Workflow id must contain only alphanumeric characters, dots, hyphens, and underscores"
                .into(),
        ));
    }

    if workflow.nodes.is_empty() {
        return Err(Error::Validation(
            "Workflow must have at least one node".into(),
        ));
    }

    let triggers = workflow
        .nodes
        .iter()
        .filter(|n| n.node_type == super::NodeType::Trigger)
        .count();
    if triggers != 1 {
        return Err(Error::Validation(format!(
            "Workflow must have exactly one TRIGGER node, found {}",
            triggers
        )));
    }

    let mut ids = HashSet::new();
    for node in &workflow.nodes {
        if node.id.is_empty() {
            return Err(Error::Validation("Node ID cannot be empty".into()));
        }
        if !ids.insert(node.id.as_str()) {
            return Err(Error::Validation(format!("Duplicate node ID: {}", node.id)));
        }
    }

    for node in &workflow.nodes {
        for target in node.routing.targets() {
            if !ids.contains(target) {
                return Err(Error::Validation(format!(
                    "Node '{}' routes to non-existent node '{}'",
                    node.id, target
                )));
            }
        }

        if let Some(expr) = node.routing.expression() {
            check_expression(&node.id, "routing", expr)?;
        }
        if let Some(condition) = &node.condition {
            check_expression(&node.id, "condition", condition)?;
        }

        let config = node
            .typed_config()
            .map_err(|e| Error::Validation(e.to_string()))?;
        validate_config(&node.id, &config, actions)?;
    }

    Ok(())
}

fn validate_config(
    node_id: &str,
    config: &NodeConfig,
    actions: Option<&ActionRegistry>,
) -> Result<()> {
    let require_processor = |processor: &str| -> Result<()> {
        match actions {
            Some(registry) if !registry.has(processor) => Err(Error::Validation(format!(
                "Node '{}' uses unknown data_processor '{}'",
                node_id, processor
            ))),
            _ => Ok(()),
        }
    };

    match config {
        NodeConfig::Trigger(trigger) => {
            trigger
                .idempotency
                .validate()
                .map_err(|e| Error::Validation(format!("Node '{}': {}", node_id, e)))?;
            if let Some(schedule) = &trigger.schedule {
                validate_schedule(node_id, schedule)?;
            }
        }
        NodeConfig::Query(query) => {
            match (&query.sql, &query.expression) {
                (Some(_), None) => {}
                (None, Some(expr)) => check_expression(node_id, "expression", expr)?,
                _ => {
                    return Err(Error::Validation(format!(
                        "Node '{}' must set exactly one of sql or expression",
                        node_id
                    )))
                }
            }
            for param in &query.params {
                check_expression(node_id, "params", param)?;
            }
        }
        NodeConfig::Transform(transform) => {
            for field in &transform.fields {
                if field.name.is_empty() {
                    return Err(Error::Validation(format!(
                        "Node '{}' has a transform field without a name",
                        node_id
                    )));
                }
                check_expression(node_id, &field.name, &field.expression)?;
            }
        }
        NodeConfig::Action(action) => {
            if let Some(items) = &action.items {
                check_expression(node_id, "items", items)?;
            }
            require_processor(&action.data_processor)?;
        }
        NodeConfig::Combot(combot) => {
            check_expression(node_id, "list", &combot.list)?;
            for param in &combot.for_each.params {
                check_expression(node_id, "for_each.params", param)?;
            }
            if combot.max_concurrency == Some(0) {
                return Err(Error::Validation(format!(
                    "Node '{}' max_concurrency must be at least 1",
                    node_id
                )));
            }
            match (combot.for_each.operation, &combot.for_each.data_processor) {
                (ForEachOperation::Query, _) if combot.for_each.sql.is_none() => {
                    return Err(Error::Validation(format!(
                        "Node '{}' QUERY for_each needs sql",
                        node_id
                    )))
                }
                (ForEachOperation::Query, _) => {}
                (_, Some(processor)) => require_processor(processor)?,
                (_, None) => {
                    return Err(Error::Validation(format!(
                        "Node '{}' for_each needs a data_processor",
                        node_id
                    )))
                }
            }
        }
        NodeConfig::SendEmail(matrix) | NodeConfig::SendWhatsApp(matrix) => {
            check_expression(node_id, "key_expression", &matrix.key_expression)?;
            if let Some(items) = &matrix.items {
                check_expression(node_id, "items", items)?;
            }
            if matrix.templates.is_empty() {
                return Err(Error::Validation(format!(
                    "Node '{}' has an empty template matrix",
                    node_id
                )));
            }
        }
        NodeConfig::HttpRequest(http) => {
            if http.url.is_empty() {
                return Err(Error::Validation(format!(
                    "Node '{}' has an empty url",
                    node_id
                )));
            }
        }
        NodeConfig::Switch(switch) => {
            if let Some(expr) = &switch.expression {
                check_expression(node_id, "expression", expr)?;
            }
        }
    }

    Ok(())
}

fn validate_schedule(node_id: &str, schedule: &Schedule) -> Result<()> {
    let invalid = |msg: String| Error::Validation(format!("Node '{}': {}", node_id, msg));
    match schedule {
        Schedule::Cron { expression, .. } => {
            let fields = expression.split_whitespace().count();
            if !(5..=7).contains(&fields) {
                return Err(invalid(format!(
                    "cron expression '{}' must have 5 to 7 fields",
                    expression
                )));
            }
        }
        Schedule::Interval { every_seconds } => {
            if *every_seconds == 0 {
                return Err(invalid("interval every_seconds must be positive".into()));
            }
        }
        Schedule::DayOfMonth { days, at, .. } => {
            if days.is_empty() || days.iter().any(|d| !(1..=31).contains(d)) {
                return Err(invalid("day_of_month days must be within 1..=31".into()));
            }
            if chrono::NaiveTime::parse_from_str(at, "%H:%M").is_err() {
                return Err(invalid(format!("day_of_month time '{}' is not HH:MM", at)));
            }
        }
    }
    Ok(())
}

fn check_expression(node_id: &str, field: &str, source: &str) -> Result<()> {
    parse_expression(source).map(|_| ()).map_err(|e| {
        Error::Validation(format!("Node '{}' {}: {}", node_id, field, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::parse_workflow;

    const VALID: &str = r#"
id: reminders
name: Reminders
nodes:
  - id: start
    type: TRIGGER
    config:
      idempotency: { strategy: TIME_WINDOW, ttl_minutes: 15 }
    routing: { type: goto, target_node_id: check }
  - id: check
    type: SWITCH
    config: { expression: "remaining_days" }
    routing:
      type: switch
      expression: "string(remaining_days)"
      cases: { "3": notify }
  - id: notify
    type: ACTION
    config: { data_processor: remaining_days_update }
"#;

    #[test]
    fn test_valid_workflow() {
        let workflow = parse_workflow(VALID).unwrap();
        assert!(validate_workflow(&workflow).is_ok());
    }

    #[test]
    fn test_requires_exactly_one_trigger() {
        let yaml = r#"
id: no-trigger
nodes:
  - id: a
    type: TRANSFORM
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("exactly one TRIGGER"));
    }

    #[test]
    fn test_duplicate_node_ids() {
        let yaml = r#"
id: dupes
nodes:
  - id: a
    type: TRIGGER
  - id: a
    type: TRANSFORM
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("Duplicate node ID"));
    }

    #[test]
    fn test_unknown_routing_target() {
        let yaml = r#"
id: dangling
nodes:
  - id: a
    type: TRIGGER
    routing: { type: conditional, condition: "x > 1", true_node_id: b, false_node_id: ghost }
  - id: b
    type: TRANSFORM
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_bad_expression_is_rejected() {
        let yaml = r#"
id: bad-expr
nodes:
  - id: a
    type: TRIGGER
    condition: "x >"
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_trigger_idempotency_is_validated() {
        let yaml = r#"
id: no-ttl
nodes:
  - id: a
    type: TRIGGER
    config:
      idempotency: { strategy: TIME_WINDOW }
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("ttl_minutes"));
    }

    #[test]
    fn test_day_of_month_schedule_checks() {
        let yaml = r#"
id: monthly
nodes:
  - id: a
    type: TRIGGER
    config:
      schedule: { type: day_of_month, days: [0], at: "09:00" }
"#;
        assert!(validate_workflow(&parse_workflow(yaml).unwrap()).is_err());
    }

    #[test]
    fn test_unregistered_data_processor() {
        let workflow = parse_workflow(VALID).unwrap();
        let empty = ActionRegistry::empty();
        let err = validate_workflow_with_actions(&workflow, &empty).unwrap_err();
        assert!(err.to_string().contains("remaining_days_update"));
    }

    #[test]
    fn test_for_each_operation_needs_its_source() {
        let yaml = r#"
id: combot
nodes:
  - id: a
    type: TRIGGER
    routing: { type: goto, target_node_id: loop }
  - id: loop
    type: COMBOT
    config:
      list: "mappings"
      for_each: { operation: QUERY }
"#;
        let err = validate_workflow(&parse_workflow(yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("needs sql"));

        let yaml = yaml.replace("{ operation: QUERY }", "{ operation: UPDATE }");
        let err = validate_workflow(&parse_workflow(&yaml).unwrap()).unwrap_err();
        assert!(err.to_string().contains("needs a data_processor"));
    }
}
