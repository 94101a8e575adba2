//! Query node - loads rows from the tenant data store or derives data
//! from the context.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::debug;

use super::types::{result_key, Node, NodeContext, NodeResult};
use crate::clients::DbClient;
use crate::error::{Error, Result};
use crate::expression;
use crate::workflow::{NodeTemplate, NodeType, QueryConfig};

pub struct QueryNode {
    db: Arc<dyn DbClient>,
}

impl QueryNode {
    pub fn new(db: Arc<dyn DbClient>) -> Self {
        Self { db }
    }
}

/// Evaluate positional SQL parameters.
pub(crate) fn eval_params(params: &[String], scope: &Map<String, Value>) -> Result<Vec<Value>> {
    params
        .iter()
        .map(|param| expression::evaluate(param, scope))
        .collect()
}

#[async_trait]
impl Node for QueryNode {
    fn node_type(&self) -> NodeType {
        NodeType::Query
    }

    fn description(&self) -> &str {
        "Run a read-only query or evaluate an expression into the context"
    }

    async fn execute(&self, node: &NodeTemplate, ctx: &NodeContext) -> Result<NodeResult> {
        let config: QueryConfig = node.parse_config()?;
        let key = result_key(node, config.result_key.as_deref());

        let value = match (&config.sql, &config.expression) {
            (Some(sql), _) => {
                let params = eval_params(&config.params, &ctx.values)?;
                let rows = self.db.query(sql, &params, config.max_rows).await?;
                debug!(node_id = %node.id, rows = rows.len(), "Query returned rows");
                Value::Array(rows)
            }
            (None, Some(expr)) => expression::evaluate(expr, &ctx.values)?,
            (None, None) => {
                return Err(Error::Node(format!(
                    "Query node '{}' needs sql or expression",
                    node.id
                )))
            }
        };

        Ok(NodeResult::stored(key, value))
    }
}
