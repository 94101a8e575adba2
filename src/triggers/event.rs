//! Event trigger dispatch.
//!
//! An incoming event fires every ACTIVE workflow whose trigger node listens
//! for its name, each through the engine's dedupe path.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::engine::{Engine, FireOutcome};
use crate::error::Result;
use crate::idempotency::TriggerFiring;

/// An event published by a collaborator (lead capture, enrollment policy, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    /// Event name, matched against the trigger's `event_name`
    pub event_name: String,
    /// Publisher-assigned id, used by EVENT_BASED idempotency
    #[serde(default)]
    pub event_id: Option<String>,
    /// Restrict dispatch to one tenant's workflows
    #[serde(default)]
    pub institute_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl EventMessage {
    pub fn new(event_name: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            event_name: event_name.into(),
            event_id: None,
            institute_id: None,
            payload,
        }
    }

    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_institute(mut self, institute_id: impl Into<String>) -> Self {
        self.institute_id = Some(institute_id.into());
        self
    }
}

/// Outcome of firing one matching workflow.
#[derive(Debug)]
pub struct EventDispatch {
    pub workflow_id: String,
    pub outcome: Result<FireOutcome>,
}

/// Routes events to the workflows listening for them.
#[derive(Clone)]
pub struct EventDispatcher {
    engine: Engine,
}

impl EventDispatcher {
    pub fn new(engine: Engine) -> Self {
        Self { engine }
    }

    /// Fire every matching workflow. A failure to fire one workflow is
    /// reported in its outcome and does not stop the others.
    pub async fn dispatch(&self, event: &EventMessage) -> Result<Vec<EventDispatch>> {
        let workflows = self
            .engine
            .storage()
            .list_workflows(event.institute_id.as_deref())
            .await?;

        let mut dispatched = Vec::new();
        for stored in workflows {
            let definition = match stored.to_definition() {
                Ok(d) => d,
                Err(e) => {
                    warn!("Skipping unparseable workflow '{}': {}", stored.id, e);
                    continue;
                }
            };
            if !definition.is_active() {
                continue;
            }
            let listens = definition
                .trigger_config()
                .map(|c| c.event_name.as_deref() == Some(event.event_name.as_str()))
                .unwrap_or(false);
            if !listens {
                continue;
            }

            debug!(workflow_id = %stored.id, event = %event.event_name, "Event matched workflow");
            let firing = TriggerFiring::event(
                event.event_name.clone(),
                event.event_id.clone(),
                event.payload.clone(),
            );
            let outcome = self.engine.fire(&stored.id, firing).await;
            dispatched.push(EventDispatch {
                workflow_id: stored.id,
                outcome,
            });
        }

        info!(
            "Event '{}' dispatched to {} workflow(s)",
            event.event_name,
            dispatched.len()
        );
        Ok(dispatched)
    }
}
