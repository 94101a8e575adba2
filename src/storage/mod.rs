//! Storage layer for workflows and executions.

mod models;
mod sqlite;

pub use models::*;
pub use sqlite::SqliteStorage;
