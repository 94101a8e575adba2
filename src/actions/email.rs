//! Template-matrix email handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::matrix::{dispatch_matrix, MatrixChannel, MatrixGroup, Recipient};
use super::ActionHandler;
use crate::clients::{DispatchReceipt, EmailBatch, EmailMessage, NotificationClient};
use crate::error::Result;

pub const SEND_EMAIL: &str = "send_email";

pub struct EmailMatrixHandler {
    client: Arc<dyn NotificationClient>,
}

impl EmailMatrixHandler {
    pub fn new(client: Arc<dyn NotificationClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MatrixChannel for EmailMatrixHandler {
    fn channel(&self) -> &'static str {
        "email"
    }

    fn default_recipient_field(&self) -> &'static str {
        "email"
    }

    async fn send_group(
        &self,
        group: &MatrixGroup,
        recipients: &[Recipient],
    ) -> Result<DispatchReceipt> {
        let subject = group.variant.subject.as_deref().unwrap_or_default();
        let batch = EmailBatch {
            group_key: group.group_key.clone(),
            messages: recipients
                .iter()
                .map(|r| EmailMessage {
                    to: r.address.clone(),
                    subject: r.render(subject),
                    body: r.render(&group.variant.body),
                })
                .collect(),
        };
        self.client.send_email(&batch).await
    }
}

#[async_trait]
impl ActionHandler for EmailMatrixHandler {
    fn action_type(&self) -> &str {
        SEND_EMAIL
    }

    fn description(&self) -> &str {
        "Render email templates from a key matrix and send one batch per template variant"
    }

    async fn execute(&self, item: &Value, config: &Value, ctx: &Map<String, Value>) -> Result<Value> {
        dispatch_matrix(self, item, config, ctx).await
    }
}
