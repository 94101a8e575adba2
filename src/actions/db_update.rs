//! Remaining-days counter update.
//!
//! Decrements an enrollment mapping's `remaining_days` by one on working days.
//! Weekend items and counters already at zero are skipped. Persistence
//! failures are reported as `success: false`, never as an error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::ActionHandler;
use crate::clients::{DbClient, FieldTarget};
use crate::error::Result;
use crate::expression::is_truthy;

pub const REMAINING_DAYS_UPDATE: &str = "remaining_days_update";

#[derive(Debug, Deserialize)]
#[serde(default)]
struct UpdateConfig {
    table: String,
    column: String,
    id_column: String,
    /// Item field carrying the entity id
    id_field: String,
    weekend_field: String,
    days_field: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            table: "enrollment_policy_mappings".to_string(),
            column: "remaining_days".to_string(),
            id_column: "id".to_string(),
            id_field: "mapping_id".to_string(),
            weekend_field: "is_weekend".to_string(),
            days_field: "remaining_days".to_string(),
        }
    }
}

pub struct RemainingDaysUpdateHandler {
    db: Arc<dyn DbClient>,
}

impl RemainingDaysUpdateHandler {
    pub fn new(db: Arc<dyn DbClient>) -> Self {
        Self { db }
    }
}

fn failure(mapping_id: &Value, error: impl Into<String>) -> Value {
    json!({
        "success": false,
        "mapping_id": mapping_id,
        "error": error.into(),
    })
}

/// Day counter as stored by the tenant: an integer, an integral REAL
/// (`3.0`) or numeric TEXT (`"3"`).
fn whole_days(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| integral(n.as_f64()?)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| integral(s.parse::<f64>().ok()?))
        }
        _ => None,
    }
}

fn integral(f: f64) -> Option<i64> {
    (f.is_finite() && f.fract() == 0.0 && f.abs() < i64::MAX as f64).then_some(f as i64)
}

#[async_trait]
impl ActionHandler for RemainingDaysUpdateHandler {
    fn action_type(&self) -> &str {
        REMAINING_DAYS_UPDATE
    }

    fn description(&self) -> &str {
        "Decrement an enrollment mapping's remaining days unless it is a weekend or already zero"
    }

    async fn execute(
        &self,
        item: &Value,
        config: &Value,
        _ctx: &Map<String, Value>,
    ) -> Result<Value> {
        let config: UpdateConfig = match config {
            Value::Null => UpdateConfig::default(),
            raw => match serde_json::from_value(raw.clone()) {
                Ok(config) => config,
                Err(e) => return Ok(failure(&Value::Null, format!("Invalid config: {}", e))),
            },
        };

        let mapping_id = item.get(&config.id_field).cloned().unwrap_or(Value::Null);

        if item.get(&config.weekend_field).map(is_truthy).unwrap_or(false) {
            debug!(mapping_id = %mapping_id, "Weekend, remaining days unchanged");
            return Ok(json!({"success": true, "skipped": true, "reason": "WEEKEND"}));
        }

        let remaining = match item.get(&config.days_field).and_then(whole_days) {
            Some(days) => days,
            None => {
                return Ok(failure(
                    &mapping_id,
                    format!("Item has no whole-number '{}'", config.days_field),
                ))
            }
        };
        if remaining <= 0 {
            return Ok(json!({"success": true, "skipped": true, "reason": "ALREADY_ZERO"}));
        }
        if mapping_id.is_null() {
            return Ok(failure(
                &mapping_id,
                format!("Item has no '{}'", config.id_field),
            ));
        }

        let new_remaining = remaining - 1;
        let target = FieldTarget {
            table: config.table,
            column: config.column,
            id_column: config.id_column,
        };

        match self
            .db
            .update_field(&target, &mapping_id, &json!(new_remaining))
            .await
        {
            Ok(true) => Ok(json!({
                "success": true,
                "mapping_id": mapping_id,
                "new_remaining_days": new_remaining,
            })),
            Ok(false) => Ok(failure(&mapping_id, "No row matched the mapping id")),
            Err(e) => {
                warn!(mapping_id = %mapping_id, error = %e, "Remaining days update failed");
                Ok(failure(&mapping_id, e.to_string()))
            }
        }
    }
}
