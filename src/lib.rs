//! eduflow - workflow automation engine for multi-tenant education platforms
//!
//! Institutes describe automations (welcome emails for new leads, renewal
//! reminders, attendance nudges) as graphs of typed nodes. The engine fires a
//! workflow from an event, a schedule or a manual request, dedupes the firing
//! through an idempotency key, then walks the graph one node at a time while
//! appending an audit row per node visit.
//!
//! ## Example
//!
//! ```yaml
//! id: lead-welcome
//! institute_id: inst-1
//!
//! nodes:
//!   - id: start
//!     type: TRIGGER
//!     config:
//!       event_name: lead.created
//!       idempotency: { strategy: EVENT_BASED }
//!     routing: { type: goto, target_node_id: greet }
//!
//!   - id: greet
//!     type: SEND_EMAIL
//!     config:
//!       key_expression: "'DEFAULT'"
//!       templates:
//!         DEFAULT:
//!           - subject: "Welcome, {{name}}"
//!             body: "Thanks for reaching out to us."
//! ```

pub mod actions;
pub mod api;
pub mod clients;
pub mod config;
pub mod engine;
pub mod error;
pub mod expression;
pub mod idempotency;
pub mod metrics;
pub mod nodes;
pub mod storage;
pub mod triggers;
pub mod workflow;

pub use error::{Error, Result};
