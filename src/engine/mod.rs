//! Workflow interpreter: trigger firing, dedupe and the graph walk.

mod executor;

pub use executor::{
    Engine, EngineConfig, FireOutcome, DEFAULT_MAX_STEPS, DEFAULT_NODE_TIMEOUT_SECS,
};
