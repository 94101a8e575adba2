//! Trigger sources.
//!
//! Triggers decide when a workflow fires:
//! - Schedule: cron, interval or day-of-month, via the scheduler
//! - Event: collaborator events routed by trigger `event_name`
//! - Manual: CLI or API invocation through [`crate::engine::Engine::fire`]

mod event;
mod scheduler;

pub use event::{EventDispatch, EventDispatcher, EventMessage};
pub use scheduler::Scheduler;
