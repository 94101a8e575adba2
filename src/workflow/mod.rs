//! Workflow definition, parsing, validation and routing.
//!
//! Workflows are defined in JSON or YAML and consist of:
//! - Exactly one TRIGGER node: the entry point, with schedule/event and idempotency settings
//! - Typed nodes carrying a config object and a routing rule

mod parser;
mod routing;
mod types;
mod validator;

pub use parser::{parse_workflow, parse_workflow_file, to_canonical_json};
pub use routing::resolve_routing;
pub use types::*;
pub use validator::{validate_workflow, validate_workflow_with_actions};
