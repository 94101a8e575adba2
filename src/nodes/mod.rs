//! Node implementations.
//!
//! Each node type of a workflow template has one executor here. Executors
//! read a snapshot of the execution context and return the fields they
//! write back.

mod action;
mod combot;
mod http;
mod message;
mod query;
mod registry;
mod switch;
mod transform;
mod trigger;
mod types;

pub use action::ActionNode;
pub use combot::CombotNode;
pub use http::HttpRequestNode;
pub use message::MessageNode;
pub use query::QueryNode;
pub use registry::NodeRegistry;
pub use switch::SwitchNode;
pub use transform::TransformNode;
pub use trigger::TriggerNode;
pub use types::{Node, NodeContext, NodeResult};
