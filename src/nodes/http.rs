//! HTTP request node.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::types::{result_key, Node, NodeContext, NodeResult};
use crate::actions::{render_placeholders, render_value};
use crate::error::{Error, Result};
use crate::workflow::{HttpRequestConfig, NodeTemplate, NodeType};

const DEFAULT_HTTP_CONNECT_TIMEOUT_SECS: u64 = 10;

pub struct HttpRequestNode {
    client: Client,
}

impl HttpRequestNode {
    pub fn new() -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(DEFAULT_HTTP_CONNECT_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client with timeout defaults: {}", e);
                Client::new()
            });
        Self { client }
    }
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Node for HttpRequestNode {
    fn node_type(&self) -> NodeType {
        NodeType::HttpRequest
    }

    fn description(&self) -> &str {
        "Make an HTTP request with {{field}} placeholders rendered from the context"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: HttpRequestConfig = node.parse_config()?;

        let url = render_placeholders(&config.url, &ctx.values);
        let method = Method::from_bytes(config.method.to_ascii_uppercase().as_bytes())
            .map_err(|_| Error::Node(format!("Unknown HTTP method: {}", config.method)))?;

        debug!("HTTP {} {}", method, url);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .timeout(Duration::from_secs(config.timeout_seconds));
        for (name, value) in &config.headers {
            request = request.header(name, render_placeholders(value, &ctx.values));
        }
        if let Some(body) = &config.body {
            request = request.json(&render_value(body, &ctx.values));
        }

        let start = std::time::Instant::now();
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Node(format!(
                    "HTTP {} {} timed out after {}s",
                    method, url, config.timeout_seconds
                ))
            } else {
                Error::Http(e)
            }
        })?;
        let status = response.status();

        let body_text = response.text().await.map_err(|e| {
            Error::Node(format!("Failed to read HTTP response body from {}: {}", url, e))
        })?;

        if !status.is_success() {
            return Err(Error::Node(format!(
                "HTTP {} {} -> {}: {}",
                method,
                url,
                status.as_u16(),
                body_text
            )));
        }

        let body = serde_json::from_str(&body_text).unwrap_or(Value::String(body_text));

        info!(
            "HTTP {} {} -> {} ({}ms)",
            method,
            url,
            status.as_u16(),
            start.elapsed().as_millis()
        );

        Ok(NodeResult::stored(
            result_key(node, config.result_key.as_deref()),
            json!({"status": status.as_u16(), "body": body}),
        ))
    }
}
