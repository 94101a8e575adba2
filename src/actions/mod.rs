//! Action handlers: pluggable side effects dispatched by ACTION, COMBOT and
//! SEND_* nodes.
//!
//! Handlers are looked up by their declared type string (a node's
//! `data_processor`). The registry is built once at startup and is
//! read-only afterwards.

mod db_update;
mod email;
mod matrix;
mod template;
mod whatsapp;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::clients::{DbClient, NotificationClient};
use crate::error::{Error, Result};

pub use db_update::{RemainingDaysUpdateHandler, REMAINING_DAYS_UPDATE};
pub use email::{EmailMatrixHandler, SEND_EMAIL};
pub use matrix::{plan_matrix, MatrixGroup, MatrixPlan, DEFAULT_TEMPLATE_KEY};
pub use template::{render_placeholders, render_value};
pub use whatsapp::{WhatsAppMatrixHandler, SEND_WHATSAPP};

/// A single named side effect.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Type string nodes refer to in `data_processor`.
    fn action_type(&self) -> &str;

    /// Run the side effect.
    ///
    /// `item` is the current loop item, or the execution context as an
    /// object when the node does not iterate. Handlers report their own
    /// failures as `{"success": false, ...}`; an `Err` is converted to the
    /// same shape by the calling node.
    async fn execute(&self, item: &Value, config: &Value, ctx: &Map<String, Value>)
        -> Result<Value>;

    fn description(&self) -> &str {
        "An action handler"
    }
}

/// Registry of action handlers keyed by type.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: HashMap<String, Arc<dyn ActionHandler>>,
}

impl ActionRegistry {
    /// Registry with the built-in handlers wired to the given collaborators.
    pub fn new(notifications: Arc<dyn NotificationClient>, db: Arc<dyn DbClient>) -> Self {
        let mut registry = Self::empty();

        registry.register(Arc::new(RemainingDaysUpdateHandler::new(db)));
        registry.register(Arc::new(EmailMatrixHandler::new(notifications.clone())));
        registry.register(Arc::new(WhatsAppMatrixHandler::new(notifications)));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Register a handler. A handler with the same type is replaced.
    pub fn register(&mut self, handler: Arc<dyn ActionHandler>) {
        self.handlers
            .insert(handler.action_type().to_string(), handler);
    }

    pub fn get(&self, action_type: &str) -> Option<Arc<dyn ActionHandler>> {
        self.handlers.get(action_type).cloned()
    }

    pub fn has(&self, action_type: &str) -> bool {
        self.handlers.contains_key(action_type)
    }

    /// Execute a handler by type.
    pub async fn execute(
        &self,
        action_type: &str,
        item: &Value,
        config: &Value,
        ctx: &Map<String, Value>,
    ) -> Result<Value> {
        let handler = self
            .get(action_type)
            .ok_or_else(|| Error::Handler(format!("Unknown data_processor: {}", action_type)))?;

        handler.execute(item, config, ctx).await
    }

    /// Registered handler types, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(|s| s.as_str()).collect();
        types.sort_unstable();
        types
    }

    pub fn descriptions(&self) -> Vec<(&str, &str)> {
        let mut described: Vec<(&str, &str)> = self
            .handlers
            .iter()
            .map(|(name, handler)| (name.as_str(), handler.description()))
            .collect();
        described.sort_unstable();
        described
    }
}
