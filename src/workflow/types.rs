//! Workflow type definitions.
//!
//! A workflow is a graph of typed nodes. Each node carries a type-specific
//! `config` object and a `routing` rule naming the node that runs next.
//! Configs are kept as raw JSON on the template and parsed into their DTO
//! when the node runs, so unknown fields are ignored.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::idempotency::IdempotencySettings;

/// A complete workflow definition.
///
/// # Example YAML
///
/// ```yaml
/// id: enrollment-reminders
/// name: Enrollment reminders
/// institute_id: inst-1
///
/// nodes:
///   - id: start
///     type: TRIGGER
///     config:
///       schedule: { type: cron, expression: "0 9 * * *" }
///       idempotency: { strategy: TIME_WINDOW, ttl_minutes: 60 }
///     routing: { type: goto, target_node_id: load }
///
///   - id: load
///     type: QUERY
///     config:
///       sql: "SELECT * FROM enrollment_policy_mappings WHERE remaining_days > 0"
///       result_key: mappings
///     routing: { type: goto, target_node_id: decrement }
///
///   - id: decrement
///     type: COMBOT
///     config:
///       list: mappings
///       for_each: { operation: UPDATE, data_processor: remaining_days_update }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Stable workflow id
    pub id: String,

    /// Human-readable name
    #[serde(default)]
    pub name: String,

    /// Owning tenant
    #[serde(default, alias = "instituteId", skip_serializing_if = "Option::is_none")]
    pub institute_id: Option<String>,

    #[serde(default)]
    pub status: WorkflowStatus,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    /// Node templates; exactly one must be a TRIGGER
    pub nodes: Vec<NodeTemplate>,
}

impl WorkflowDefinition {
    /// Get a node by ID.
    pub fn node(&self, id: &str) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The entry node of the graph.
    pub fn trigger_node(&self) -> Option<&NodeTemplate> {
        self.nodes.iter().find(|n| n.node_type == NodeType::Trigger)
    }

    /// Parsed trigger config, or an error if the workflow has no trigger.
    pub fn trigger_config(&self) -> Result<TriggerConfig> {
        let trigger = self.trigger_node().ok_or_else(|| {
            Error::Workflow(format!("Workflow '{}' has no TRIGGER node", self.id))
        })?;
        trigger.parse_config()
    }

    pub fn is_active(&self) -> bool {
        self.status == WorkflowStatus::Active
    }

    /// Get all node types used in this workflow.
    pub fn node_types(&self) -> Vec<NodeType> {
        let mut types: Vec<NodeType> = self.nodes.iter().map(|n| n.node_type).collect();
        types.sort_by_key(|t| t.as_str());
        types.dedup();
        types
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatus {
    #[default]
    Active,
    Inactive,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Active => "ACTIVE",
            WorkflowStatus::Inactive => "INACTIVE",
        }
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "ACTIVE" => Ok(WorkflowStatus::Active),
            "INACTIVE" => Ok(WorkflowStatus::Inactive),
            other => Err(Error::Parse(format!("Unknown workflow status: {}", other))),
        }
    }
}

/// Node kinds understood by the interpreter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Trigger,
    Query,
    Transform,
    Action,
    Combot,
    SendEmail,
    #[serde(rename = "SEND_WHATSAPP")]
    SendWhatsApp,
    HttpRequest,
    Switch,
}

impl NodeType {
    pub const ALL: [NodeType; 9] = [
        NodeType::Trigger,
        NodeType::Query,
        NodeType::Transform,
        NodeType::Action,
        NodeType::Combot,
        NodeType::SendEmail,
        NodeType::SendWhatsApp,
        NodeType::HttpRequest,
        NodeType::Switch,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Trigger => "TRIGGER",
            NodeType::Query => "QUERY",
            NodeType::Transform => "TRANSFORM",
            NodeType::Action => "ACTION",
            NodeType::Combot => "COMBOT",
            NodeType::SendEmail => "SEND_EMAIL",
            NodeType::SendWhatsApp => "SEND_WHATSAPP",
            NodeType::HttpRequest => "HTTP_REQUEST",
            NodeType::Switch => "SWITCH",
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node (step) in the workflow graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeTemplate {
    /// Unique node ID within this workflow
    pub id: String,

    #[serde(rename = "type")]
    pub node_type: NodeType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Type-specific configuration, parsed on use
    #[serde(default)]
    pub config: Value,

    /// What runs after this node
    #[serde(default)]
    pub routing: Routing,

    /// Condition expression; when false the node is skipped but routing is still followed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    /// Per-node timeout in seconds (overrides the engine default)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

impl NodeTemplate {
    /// Deserialize `config` into a DTO. A missing config parses as `{}`.
    pub fn parse_config<T: DeserializeOwned>(&self) -> Result<T> {
        let raw = match &self.config {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(raw).map_err(|e| {
            Error::Workflow(format!(
                "Invalid {} config for node '{}': {}",
                self.node_type, self.id, e
            ))
        })
    }

    /// Parse `config` according to this node's type.
    pub fn typed_config(&self) -> Result<NodeConfig> {
        Ok(match self.node_type {
            NodeType::Trigger => NodeConfig::Trigger(self.parse_config()?),
            NodeType::Query => NodeConfig::Query(self.parse_config()?),
            NodeType::Transform => NodeConfig::Transform(self.parse_config()?),
            NodeType::Action => NodeConfig::Action(self.parse_config()?),
            NodeType::Combot => NodeConfig::Combot(self.parse_config()?),
            NodeType::SendEmail => NodeConfig::SendEmail(self.parse_config()?),
            NodeType::SendWhatsApp => NodeConfig::SendWhatsApp(self.parse_config()?),
            NodeType::HttpRequest => NodeConfig::HttpRequest(self.parse_config()?),
            NodeType::Switch => NodeConfig::Switch(self.parse_config()?),
        })
    }
}

/// A node config parsed into its DTO.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeConfig {
    Trigger(TriggerConfig),
    Query(QueryConfig),
    Transform(TransformConfig),
    Action(ActionConfig),
    Combot(CombotConfig),
    SendEmail(MatrixMessageConfig),
    SendWhatsApp(MatrixMessageConfig),
    HttpRequest(HttpRequestConfig),
    Switch(SwitchConfig),
}

// =============================================================================
// ROUTING
// =============================================================================

/// Which node runs after the current one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Routing {
    Goto {
        target_node_id: String,
    },
    Conditional {
        condition: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        true_node_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        false_node_id: Option<String>,
    },
    Switch {
        expression: String,
        /// Evaluated value (as a string) to node id
        #[serde(default)]
        cases: BTreeMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        default_node_id: Option<String>,
    },
    #[default]
    End,
}

impl Routing {
    /// Every node id this routing can lead to.
    pub fn targets(&self) -> Vec<&str> {
        match self {
            Routing::Goto { target_node_id } => vec![target_node_id.as_str()],
            Routing::Conditional {
                true_node_id,
                false_node_id,
                ..
            } => true_node_id
                .iter()
                .chain(false_node_id.iter())
                .map(String::as_str)
                .collect(),
            Routing::Switch {
                cases,
                default_node_id,
                ..
            } => cases
                .values()
                .chain(default_node_id.iter())
                .map(String::as_str)
                .collect(),
            Routing::End => Vec::new(),
        }
    }

    /// The expression this routing evaluates, if any.
    pub fn expression(&self) -> Option<&str> {
        match self {
            Routing::Conditional { condition, .. } => Some(condition),
            Routing::Switch { expression, .. } => Some(expression),
            Routing::Goto { .. } | Routing::End => None,
        }
    }
}

// =============================================================================
// NODE CONFIGS
// =============================================================================

/// `TRIGGER` node config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TriggerConfig {
    /// Event name this workflow listens for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,

    #[serde(default)]
    pub idempotency: IdempotencySettings,
}

/// Time-based trigger schedule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Schedule {
    /// Cron expression (5 or 6 fields)
    Cron {
        expression: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
    /// Fixed interval
    Interval { every_seconds: u64 },
    /// Selected days of the month at a wall-clock time
    DayOfMonth {
        days: Vec<u32>,
        /// `HH:MM`
        #[serde(default = "default_day_time")]
        at: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timezone: Option<String>,
    },
}

fn default_day_time() -> String {
    "00:00".to_string()
}

/// `QUERY` node config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Read-only SQL against the tenant data store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Derive data from the context instead of querying
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,

    /// Expressions bound to `?1`, `?2`, ...
    #[serde(default)]
    pub params: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,

    #[serde(default = "default_max_rows")]
    pub max_rows: usize,
}

fn default_max_rows() -> usize {
    1000
}

/// `TRANSFORM` node config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Evaluated in order; later fields can read earlier ones
    #[serde(default)]
    pub fields: Vec<TransformField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformField {
    pub name: String,
    pub expression: String,
}

/// `ACTION` node config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionConfig {
    /// Registered handler type
    #[serde(alias = "dataProcessor")]
    pub data_processor: String,

    /// List expression passed to the handler as its item; the whole
    /// context is passed when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,

    /// Handler-specific settings
    #[serde(default)]
    pub config: Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

/// `COMBOT` node config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombotConfig {
    /// Expression yielding the list to iterate
    pub list: String,

    pub for_each: ForEachConfig,

    /// Items processed at once (engine default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

/// Per-item operation of a `COMBOT` node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForEachConfig {
    pub operation: ForEachOperation,

    /// Handler type for UPDATE / SEND_MESSAGE / CUSTOM
    #[serde(default, alias = "dataProcessor", skip_serializing_if = "Option::is_none")]
    pub data_processor: Option<String>,

    /// SQL for QUERY
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    #[serde(default)]
    pub params: Vec<String>,

    /// Item field receiving QUERY rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_field: Option<String>,

    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ForEachOperation {
    Query,
    Update,
    SendMessage,
    Custom,
}

/// `SEND_EMAIL` / `SEND_WHATSAPP` template-matrix config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatrixMessageConfig {
    /// List expression; defaults to the whole context as a single item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<String>,

    /// Evaluated per item to pick a template bucket
    #[serde(alias = "keyExpression")]
    pub key_expression: String,

    /// Matrix key to variants; `DEFAULT` catches unmatched keys
    #[serde(default)]
    pub templates: BTreeMap<String, Vec<TemplateVariant>>,

    /// Item field holding the address (`email` / `phone` when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient_field: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

/// One template in a matrix bucket.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TemplateVariant {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,

    #[serde(default)]
    pub body: String,

    /// Provider template name (WhatsApp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// `HTTP_REQUEST` node config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestConfig {
    pub url: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,

    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_key: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

fn default_http_timeout() -> u64 {
    30
}

/// `SWITCH` node config.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SwitchConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}
