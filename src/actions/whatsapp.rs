//! Template-matrix WhatsApp handler.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use super::matrix::{dispatch_matrix, MatrixChannel, MatrixGroup, Recipient};
use super::ActionHandler;
use crate::clients::{DispatchReceipt, NotificationClient, WhatsAppBatch, WhatsAppMessage};
use crate::error::Result;

pub const SEND_WHATSAPP: &str = "send_whatsapp";

pub struct WhatsAppMatrixHandler {
    client: Arc<dyn NotificationClient>,
}

impl WhatsAppMatrixHandler {
    pub fn new(client: Arc<dyn NotificationClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MatrixChannel for WhatsAppMatrixHandler {
    fn channel(&self) -> &'static str {
        "whatsapp"
    }

    fn default_recipient_field(&self) -> &'static str {
        "phone"
    }

    async fn send_group(
        &self,
        group: &MatrixGroup,
        recipients: &[Recipient],
    ) -> Result<DispatchReceipt> {
        let batch = WhatsAppBatch {
            group_key: group.group_key.clone(),
            template_name: group.variant.template_name.clone(),
            language: group.variant.language.clone(),
            messages: recipients
                .iter()
                .map(|r| WhatsAppMessage {
                    to: r.address.clone(),
                    body: r.render(&group.variant.body),
                })
                .collect(),
        };
        self.client.send_whatsapp(&batch).await
    }
}

#[async_trait]
impl ActionHandler for WhatsAppMatrixHandler {
    fn action_type(&self) -> &str {
        SEND_WHATSAPP
    }

    fn description(&self) -> &str {
        "Render WhatsApp templates from a key matrix and send one batch per template variant"
    }

    async fn execute(&self, item: &Value, config: &Value, ctx: &Map<String, Value>) -> Result<Value> {
        dispatch_matrix(self, item, config, ctx).await
    }
}
