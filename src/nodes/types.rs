//! Node trait and context types.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::expression::ITEM_KEY;
use crate::workflow::{NodeTemplate, NodeType};

/// Result of node execution.
#[derive(Debug, Clone, Default)]
pub struct NodeResult {
    /// Output recorded as the log row's `details`
    pub data: Value,
    /// Fields merged into the execution context
    pub writes: Map<String, Value>,
}

impl NodeResult {
    /// Create a result that leaves the context untouched.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            writes: Map::new(),
        }
    }

    /// Create a result that also stores `data` under `key`.
    pub fn stored(key: impl Into<String>, data: Value) -> Self {
        let mut writes = Map::new();
        writes.insert(key.into(), data.clone());
        Self { data, writes }
    }

    pub fn with_writes(data: Value, writes: Map<String, Value>) -> Self {
        Self { data, writes }
    }

    /// `success` flag reported by a handler, if any.
    pub fn success(&self) -> Option<bool> {
        self.data.get("success").and_then(Value::as_bool)
    }
}

/// Context passed to a node during execution.
///
/// `values` is a read-only snapshot of the execution context; nodes return
/// their changes through [`NodeResult::writes`].
#[derive(Debug, Clone)]
pub struct NodeContext {
    pub execution_id: String,
    pub workflow_id: String,
    pub institute_id: Option<String>,
    pub values: Arc<Map<String, Value>>,
}

impl NodeContext {
    pub fn new(execution_id: &str, workflow_id: &str, values: Arc<Map<String, Value>>) -> Self {
        Self {
            execution_id: execution_id.to_string(),
            workflow_id: workflow_id.to_string(),
            institute_id: None,
            values,
        }
    }

    pub fn with_institute(mut self, institute_id: Option<String>) -> Self {
        self.institute_id = institute_id;
        self
    }

    /// Context map with `item` bound to one list element.
    pub fn scope_with_item(&self, item: &Value) -> Map<String, Value> {
        let mut scope = (*self.values).clone();
        scope.insert(ITEM_KEY.to_string(), item.clone());
        scope
    }
}

/// Trait that all node types must implement.
#[async_trait]
pub trait Node: Send + Sync {
    fn node_type(&self) -> NodeType;

    /// Execute `node` against the current context.
    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult>;

    fn description(&self) -> &str {
        "A workflow node"
    }
}

/// Context key a node's output is stored under.
pub(crate) fn result_key<'a>(node: &'a NodeTemplate, configured: Option<&'a str>) -> &'a str {
    configured.unwrap_or(node.id.as_str())
}
