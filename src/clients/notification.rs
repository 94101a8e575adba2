//! Notification transport used by the email and WhatsApp handlers.
//!
//! Delivery itself belongs to an external notification service; this module
//! only defines the batch contract and two transports: HTTP to that service,
//! and a dry-run client that logs instead of sending.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Error, Result};

const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

/// One rendered email.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailMessage {
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Emails sharing a template-matrix group, sent in one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailBatch {
    pub group_key: String,
    pub messages: Vec<EmailMessage>,
}

/// One rendered WhatsApp message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsAppMessage {
    pub to: String,
    pub body: String,
}

/// WhatsApp messages sharing a template-matrix group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WhatsAppBatch {
    pub group_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub messages: Vec<WhatsAppMessage>,
}

/// Acknowledgement from the transport.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DispatchReceipt {
    /// Messages the transport accepted
    #[serde(default)]
    pub accepted: usize,
    /// Transport-side batch id, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

#[async_trait]
pub trait NotificationClient: Send + Sync {
    async fn send_email(&self, batch: &EmailBatch) -> Result<DispatchReceipt>;

    async fn send_whatsapp(&self, batch: &WhatsAppBatch) -> Result<DispatchReceipt>;
}

/// Posts batches to a notification service.
///
/// Endpoints are `{base_url}/email/batch` and `{base_url}/whatsapp/batch`;
/// the API key, when set, is sent as a bearer token.
pub struct HttpNotificationClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpNotificationClient {
    pub fn new(base_url: &str, api_key: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Failed to build notification HTTP client with timeouts: {}", e);
                Client::new()
            });
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        }
    }

    async fn post<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<DispatchReceipt> {
        let url = format!("{}{}", self.base_url, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(Error::Handler(format!(
                "Notification service {} -> {}: {}",
                url,
                status.as_u16(),
                text
            )));
        }

        // Services that answer with an empty body still count as accepted.
        if text.trim().is_empty() {
            return Ok(DispatchReceipt::default());
        }
        Ok(serde_json::from_str(&text).unwrap_or_default())
    }
}

#[async_trait]
impl NotificationClient for HttpNotificationClient {
    async fn send_email(&self, batch: &EmailBatch) -> Result<DispatchReceipt> {
        let mut receipt = self.post("/email/batch", batch).await?;
        if receipt.accepted == 0 {
            receipt.accepted = batch.messages.len();
        }
        Ok(receipt)
    }

    async fn send_whatsapp(&self, batch: &WhatsAppBatch) -> Result<DispatchReceipt> {
        let mut receipt = self.post("/whatsapp/batch", batch).await?;
        if receipt.accepted == 0 {
            receipt.accepted = batch.messages.len();
        }
        Ok(receipt)
    }
}

/// Logs batches instead of sending them. Used when no service URL is configured.
#[derive(Debug, Default, Clone)]
pub struct DryRunNotificationClient;

#[async_trait]
impl NotificationClient for DryRunNotificationClient {
    async fn send_email(&self, batch: &EmailBatch) -> Result<DispatchReceipt> {
        info!(
            group = %batch.group_key,
            recipients = batch.messages.len(),
            "Dry run: email batch not sent"
        );
        Ok(DispatchReceipt {
            accepted: batch.messages.len(),
            batch_id: None,
        })
    }

    async fn send_whatsapp(&self, batch: &WhatsAppBatch) -> Result<DispatchReceipt> {
        info!(
            group = %batch.group_key,
            recipients = batch.messages.len(),
            "Dry run: WhatsApp batch not sent"
        );
        Ok(DispatchReceipt {
            accepted: batch.messages.len(),
            batch_id: None,
        })
    }
}
