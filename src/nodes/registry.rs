//! Node registry - maps each node type to its executor.

use std::collections::HashMap;
use std::sync::Arc;

use super::types::{Node, NodeContext, NodeResult};
use super::{
    ActionNode, CombotNode, HttpRequestNode, MessageNode, QueryNode, SwitchNode, TransformNode,
    TriggerNode,
};
use crate::actions::ActionRegistry;
use crate::clients::DbClient;
use crate::error::{Error, Result};
use crate::workflow::{NodeTemplate, NodeType};

/// Registry of node executors, built once and shared read-only.
#[derive(Clone)]
pub struct NodeRegistry {
    nodes: HashMap<NodeType, Arc<dyn Node>>,
    actions: Arc<ActionRegistry>,
}

impl NodeRegistry {
    /// Create a registry with an executor for every node type.
    pub fn new(
        actions: Arc<ActionRegistry>,
        db: Arc<dyn DbClient>,
        combot_max_concurrency: usize,
    ) -> Self {
        let mut registry = Self {
            nodes: HashMap::new(),
            actions: actions.clone(),
        };

        registry.register(Arc::new(TriggerNode::new()));
        registry.register(Arc::new(QueryNode::new(db.clone())));
        registry.register(Arc::new(TransformNode::new()));
        registry.register(Arc::new(ActionNode::new(actions.clone())));
        registry.register(Arc::new(CombotNode::new(
            actions.clone(),
            db,
            combot_max_concurrency,
        )));
        registry.register(Arc::new(MessageNode::email(actions.clone())));
        registry.register(Arc::new(MessageNode::whatsapp(actions)));
        registry.register(Arc::new(HttpRequestNode::new()));
        registry.register(Arc::new(SwitchNode::new()));

        registry
    }

    /// Create an empty registry (for testing).
    pub fn empty() -> Self {
        Self {
            nodes: HashMap::new(),
            actions: Arc::new(ActionRegistry::empty()),
        }
    }

    /// Register a node executor, replacing any existing one for its type.
    pub fn register(&mut self, node: Arc<dyn Node>) {
        self.nodes.insert(node.node_type(), node);
    }

    pub fn get(&self, node_type: NodeType) -> Option<Arc<dyn Node>> {
        self.nodes.get(&node_type).cloned()
    }

    pub fn has(&self, node_type: NodeType) -> bool {
        self.nodes.contains_key(&node_type)
    }

    /// Action handlers the ACTION, COMBOT and SEND_* nodes dispatch to.
    pub fn actions(&self) -> &ActionRegistry {
        &self.actions
    }

    /// Execute `node` with the executor for its type.
    pub async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let executor = self
            .get(node.node_type)
            .ok_or_else(|| Error::Node(format!("Unknown node type: {}", node.node_type)))?;

        executor.execute(node, ctx).await
    }

    /// Registered node types, in declaration order.
    pub fn list(&self) -> Vec<NodeType> {
        NodeType::ALL
            .iter()
            .copied()
            .filter(|t| self.has(*t))
            .collect()
    }

    pub fn descriptions(&self) -> Vec<(NodeType, &str)> {
        self.list()
            .into_iter()
            .filter_map(|t| self.nodes.get(&t).map(|node| (t, node.description())))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::testing::{RecordingDb, RecordingNotifications};
    use serde_json::{json, Map};

    fn registry() -> NodeRegistry {
        let db = Arc::new(RecordingDb::default());
        let actions = Arc::new(ActionRegistry::new(
            Arc::new(RecordingNotifications::default()),
            db.clone(),
        ));
        NodeRegistry::new(actions, db, 2)
    }

    #[test]
    fn test_every_node_type_has_an_executor() {
        let registry = registry();
        assert_eq!(registry.list(), NodeType::ALL.to_vec());
        assert_eq!(registry.descriptions().len(), NodeType::ALL.len());
        assert!(registry.actions().has("remaining_days_update"));
    }

    #[tokio::test]
    async fn test_empty_registry_rejects_nodes() {
        let node: NodeTemplate =
            serde_json::from_value(json!({"id": "t", "type": "TRANSFORM"})).unwrap();
        let ctx = NodeContext::new("e1", "wf", Arc::new(Map::new()));

        let err = NodeRegistry::empty().execute(&node, &ctx).await.unwrap_err();
        assert_eq!(err.code(), "NODE_ERROR");
        assert!(registry().execute(&node, &ctx).await.is_ok());
    }
}
