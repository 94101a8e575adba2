//! Send-Email and Send-WhatsApp nodes.
//!
//! Both evaluate their item list and hand the template matrix to the
//! matching action handler; send failures come back as data.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::action::dispatch_action;
use super::types::{result_key, Node, NodeContext, NodeResult};
use crate::actions::{ActionRegistry, SEND_EMAIL, SEND_WHATSAPP};
use crate::error::Result;
use crate::expression;
use crate::workflow::{MatrixMessageConfig, NodeTemplate, NodeType};

pub struct MessageNode {
    node_type: NodeType,
    action_type: &'static str,
    actions: Arc<ActionRegistry>,
}

impl MessageNode {
    pub fn email(actions: Arc<ActionRegistry>) -> Self {
        Self {
            node_type: NodeType::SendEmail,
            action_type: SEND_EMAIL,
            actions,
        }
    }

    pub fn whatsapp(actions: Arc<ActionRegistry>) -> Self {
        Self {
            node_type: NodeType::SendWhatsApp,
            action_type: SEND_WHATSAPP,
            actions,
        }
    }
}

#[async_trait]
impl Node for MessageNode {
    fn node_type(&self) -> NodeType {
        self.node_type
    }

    fn description(&self) -> &str {
        match self.node_type {
            NodeType::SendWhatsApp => "Send WhatsApp messages from a template matrix",
            _ => "Send emails from a template matrix",
        }
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: MatrixMessageConfig = node.parse_config()?;

        let items = match &config.items {
            Some(items) => expression::evaluate(items, &ctx.values)?,
            None => Value::Object((*ctx.values).clone()),
        };
        let handler_config = serde_json::to_value(&config)?;

        let output = dispatch_action(
            &self.actions,
            self.action_type,
            &items,
            &handler_config,
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
    use serde_json::json;

    fn actions(notifications: Arc<RecordingNotifications>) -> Arc<ActionRegistry> {
        Arc::new(ActionRegistry::new(notifications, Arc::new(RecordingDb::default())))
    }

    #[tokio::test]
    async fn test_email_node_sends_matrix_over_items() {
        let notifications = Arc::new(RecordingNotifications::default());
        let node: NodeTemplate = serde_json::from_value(json!({
            "id": "mail",
            "type": "SEND_EMAIL",
            "config": {
                "items": "expiring",
                "key_expression": "string(remaining_days)",
                "templates": {"DEFAULT": [{"subject": "{{remaining_days}} days", "body": "Hi {{name}}"}]},
                "result_key": "mail_result"
            }
        }))
        .unwrap();
        let values = json!({"expiring": [
            {"remaining_days": 3, "name": "Asha", "email": "asha@x.io"},
            {"remaining_days": 1, "name": "Ravi", "email": "ravi@x.io"}
        ]});
        let ctx = NodeContext::new("e1", "wf", Arc::new(values.as_object().cloned().unwrap()));

        let result = MessageNode::email(actions(notifications.clone()))
            .execute(&node, &ctx)
            .await
            .unwrap();

        assert_eq!(result.writes["mail_result"]["sent"], 2);
        let sent = notifications.emails.lock().unwrap();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].group_key, "3#0");
        assert_eq!(sent[1].messages[0].subject, "1 days");
    }

    #[tokio::test]
    async fn test_whatsapp_node_uses_context_as_single_item() {
        let notifications = Arc::new(RecordingNotifications {
            fail_groups: vec!["gold#0".into()],
            ..Default::default()
        });
        let node: NodeTemplate = serde_json::from_value(json!({
            "id": "wa",
            "type": "SEND_WHATSAPP",
            "config": {
                "key_expression": "plan",
                "templates": {"gold": [{"body": "Hi {{name}}"}]}
            }
        }))
        .unwrap();
        let values = json!({"plan": "gold", "name": "Asha", "phone": "+9111"});
        let ctx = NodeContext::new("e1", "wf", Arc::new(values.as_object().cloned().unwrap()));

        let result = MessageNode::whatsapp(actions(notifications))
            .execute(&node, &ctx)
            .await
            .unwrap();

        assert_eq!(result.success(), Some(false));
        assert_eq!(result.writes["wa"]["failed"], 1);
    }
}
