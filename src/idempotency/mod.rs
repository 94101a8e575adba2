//! Idempotency keys for trigger firings.
//!
//! A key is computed once per firing from the trigger node's
//! [`IdempotencySettings`]. Two firings of the same workflow that produce the
//! same key while the first claim is still valid collapse into one execution.
//!
//! Keys are a strategy tag followed by `:`-separated components:
//!
//! | Strategy              | Layout                                   |
//! |-----------------------|------------------------------------------|
//! | `UUID`                | `uuid:<random>`                          |
//! | `TIME_WINDOW`         | `tw:<trigger>:<bucket>`                  |
//! | `CONTEXT_BASED`       | `ctx:<trigger>:<f1=v1\|f2=v2>`           |
//! | `CONTEXT_TIME_WINDOW` | `ctxtw:<trigger>:<f1=v1\|f2=v2>:<bucket>`|
//! | `EVENT_BASED`         | `evt:<trigger>:<event name>:<event id>`  |
//! | `CUSTOM_EXPRESSION`   | `custom:<expression result>`             |
//!
//! The trigger component is omitted when `include_trigger_id` is false; the
//! event components are omitted when their flags are false.
//!
//! # Missing context fields
//!
//! With `fail_on_missing_context = false` a missing field is rendered as the
//! literal `null`, exactly like a field that is present with a null value.
//! Callers relying on CONTEXT_* strategies must make sure the listed fields
//! are always populated, otherwise unrelated firings may be deduplicated
//! against each other.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::expression::{self, to_display_string};

/// Rendering of a missing or null context value.
pub const NULL_COMPONENT: &str = "null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdempotencyStrategy {
    /// Fresh random key per firing; never deduplicates.
    #[default]
    Uuid,
    TimeWindow,
    ContextBased,
    ContextTimeWindow,
    EventBased,
    CustomExpression,
}

impl IdempotencyStrategy {
    fn tag(&self) -> &'static str {
        match self {
            IdempotencyStrategy::Uuid => "uuid",
            IdempotencyStrategy::TimeWindow => "tw",
            IdempotencyStrategy::ContextBased => "ctx",
            IdempotencyStrategy::ContextTimeWindow => "ctxtw",
            IdempotencyStrategy::EventBased => "evt",
            IdempotencyStrategy::CustomExpression => "custom",
        }
    }
}

impl std::fmt::Display for IdempotencyStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IdempotencyStrategy::Uuid => "UUID",
            IdempotencyStrategy::TimeWindow => "TIME_WINDOW",
            IdempotencyStrategy::ContextBased => "CONTEXT_BASED",
            IdempotencyStrategy::ContextTimeWindow => "CONTEXT_TIME_WINDOW",
            IdempotencyStrategy::EventBased => "EVENT_BASED",
            IdempotencyStrategy::CustomExpression => "CUSTOM_EXPRESSION",
        };
        f.write_str(name)
    }
}

fn default_true() -> bool {
    true
}

/// Idempotency settings attached to a trigger node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencySettings {
    #[serde(default)]
    pub strategy: IdempotencyStrategy,

    /// Window length in (fractional) minutes. Also bounds how long a claim
    /// blocks duplicates; no TTL means the claim never expires.
    #[serde(default, alias = "ttlMinutes", skip_serializing_if = "Option::is_none")]
    pub ttl_minutes: Option<f64>,

    /// Dotted paths into the firing context, in key order.
    #[serde(default, alias = "contextFields")]
    pub context_fields: Vec<String>,

    #[serde(default = "default_true", alias = "includeTriggerId")]
    pub include_trigger_id: bool,

    #[serde(default = "default_true", alias = "includeEventType")]
    pub include_event_type: bool,

    #[serde(default = "default_true", alias = "includeEventId")]
    pub include_event_id: bool,

    #[serde(default, alias = "customExpression", skip_serializing_if = "Option::is_none")]
    pub custom_expression: Option<String>,

    #[serde(default, alias = "failOnMissingContext")]
    pub fail_on_missing_context: bool,
}

impl Default for IdempotencySettings {
    fn default() -> Self {
        Self {
            strategy: IdempotencyStrategy::Uuid,
            ttl_minutes: None,
            context_fields: Vec::new(),
            include_trigger_id: true,
            include_event_type: true,
            include_event_id: true,
            custom_expression: None,
            fail_on_missing_context: false,
        }
    }
}

impl IdempotencySettings {
    pub fn with_strategy(strategy: IdempotencyStrategy) -> Self {
        Self {
            strategy,
            ..Self::default()
        }
    }

    /// Check that the parameters the strategy needs are present.
    pub fn validate(&self) -> Result<()> {
        match self.strategy {
            IdempotencyStrategy::TimeWindow | IdempotencyStrategy::ContextTimeWindow => {
                self.window_ms()?;
            }
            _ => {}
        }
        if let Some(ttl) = self.ttl_minutes {
            if !(ttl.is_finite() && ttl > 0.0) {
                return Err(Error::Validation(format!(
                    "ttl_minutes must be a positive number, got {}",
                    ttl
                )));
            }
        }
        match self.strategy {
            IdempotencyStrategy::ContextBased | IdempotencyStrategy::ContextTimeWindow
                if self.context_fields.is_empty() =>
            {
                Err(Error::Validation(format!(
                    "{} requires at least one context field",
                    self.strategy
                )))
            }
            IdempotencyStrategy::CustomExpression => {
                let source = self.custom_expression.as_deref().ok_or_else(|| {
                    Error::Validation("CUSTOM_EXPRESSION requires custom_expression".to_string())
                })?;
                expression::parse_expression(source)?;
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// When a claim made at `now` stops blocking duplicates.
    pub fn expires_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let ttl = self.ttl_minutes.filter(|t| t.is_finite() && *t > 0.0)?;
        Some(now + Duration::milliseconds((ttl * 60_000.0).round() as i64))
    }

    fn window_ms(&self) -> Result<i64> {
        match self.ttl_minutes {
            Some(ttl) if ttl.is_finite() && ttl > 0.0 => {
                // Sub-millisecond windows would make every firing unique anyway.
                Ok(((ttl * 60_000.0).floor() as i64).max(1))
            }
            _ => Err(Error::Validation(format!(
                "{} requires ttl_minutes > 0",
                self.strategy
            ))),
        }
    }
}

/// One trigger firing: where it came from and the payload that seeds the
/// execution context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerFiring {
    /// `event`, `schedule` or `manual`
    pub trigger_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl TriggerFiring {
    pub fn event(
        event_name: impl Into<String>,
        event_id: Option<String>,
        payload: Map<String, Value>,
    ) -> Self {
        Self {
            trigger_type: "event".to_string(),
            event_name: Some(event_name.into()),
            event_id,
            payload,
        }
    }

    pub fn schedule(scheduled_at: DateTime<Utc>) -> Self {
        let mut payload = Map::new();
        payload.insert("scheduled_at".to_string(), json!(scheduled_at.to_rfc3339()));
        Self {
            trigger_type: "schedule".to_string(),
            event_name: None,
            event_id: None,
            payload,
        }
    }

    pub fn manual(event_id: Option<String>, payload: Map<String, Value>) -> Self {
        Self {
            trigger_type: "manual".to_string(),
            event_name: None,
            event_id,
            payload,
        }
    }

    /// Key for this firing of the trigger node `trigger_id`.
    pub fn idempotency_key(
        &self,
        settings: &IdempotencySettings,
        trigger_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String> {
        generate_key_at(
            settings,
            trigger_id,
            self.event_name.as_deref(),
            self.event_id.as_deref(),
            &self.payload,
            now,
        )
    }
}

/// Compute the idempotency key for a firing at the current time.
pub fn generate_key(
    settings: &IdempotencySettings,
    trigger_id: &str,
    event_name: Option<&str>,
    event_id: Option<&str>,
    ctx: &Map<String, Value>,
) -> Result<String> {
    generate_key_at(settings, trigger_id, event_name, event_id, ctx, Utc::now())
}

/// Compute the idempotency key for a firing at `now`.
pub fn generate_key_at(
    settings: &IdempotencySettings,
    trigger_id: &str,
    event_name: Option<&str>,
    event_id: Option<&str>,
    ctx: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<String> {
    let strategy = settings.strategy;
    let mut parts: Vec<String> = vec![strategy.tag().to_string()];

    if strategy == IdempotencyStrategy::Uuid {
        parts.push(Uuid::new_v4().to_string());
        return Ok(parts.join(":"));
    }

    if strategy == IdempotencyStrategy::CustomExpression {
        let source = settings.custom_expression.as_deref().ok_or_else(|| {
            Error::Validation("CUSTOM_EXPRESSION requires custom_expression".to_string())
        })?;
        let scope = json!({
            "triggerId": trigger_id,
            "eventName": event_name,
            "eventId": event_id,
            "ctx": Value::Object(ctx.clone()),
        });
        let scope = match scope {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let value = expression::evaluate(source, &scope)?;
        if value.is_null() {
            return Err(Error::Expression(format!(
                "custom idempotency expression '{}' evaluated to null",
                source
            )));
        }
        parts.push(escape_component(&to_display_string(&value)));
        return Ok(parts.join(":"));
    }

    if settings.include_trigger_id {
        parts.push(escape_component(trigger_id));
    }

    match strategy {
        IdempotencyStrategy::TimeWindow => {
            parts.push(bucket(settings, now)?.to_string());
        }
        IdempotencyStrategy::ContextBased => {
            parts.push(context_component(settings, ctx)?);
        }
        IdempotencyStrategy::ContextTimeWindow => {
            parts.push(context_component(settings, ctx)?);
            parts.push(bucket(settings, now)?.to_string());
        }
        IdempotencyStrategy::EventBased => {
            if settings.include_event_type {
                parts.push(escape_component(event_name.unwrap_or(NULL_COMPONENT)));
            }
            if settings.include_event_id {
                parts.push(escape_component(event_id.unwrap_or(NULL_COMPONENT)));
            }
        }
        IdempotencyStrategy::Uuid | IdempotencyStrategy::CustomExpression => {}
    }

    Ok(parts.join(":"))
}

fn bucket(settings: &IdempotencySettings, now: DateTime<Utc>) -> Result<i64> {
    Ok(now.timestamp_millis().div_euclid(settings.window_ms()?))
}

fn context_component(settings: &IdempotencySettings, ctx: &Map<String, Value>) -> Result<String> {
    let mut fields = Vec::with_capacity(settings.context_fields.len());
    for field in &settings.context_fields {
        let rendered = match lookup_path(ctx, field) {
            Some(Value::Null) => NULL_COMPONENT.to_string(),
            Some(value) => to_display_string(value),
            None if settings.fail_on_missing_context => {
                return Err(Error::MissingContext(field.clone()));
            }
            None => NULL_COMPONENT.to_string(),
        };
        fields.push(format!(
            "{}={}",
            escape_component(field),
            escape_component(&rendered)
        ));
    }
    Ok(fields.join("|"))
}

/// Resolve a dotted path (`lead.profile.id`, `rows.0`) into the context.
pub fn lookup_path<'a>(ctx: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = ctx.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

fn escape_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '\\' | ':' | '|' | '=') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ctx(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, h, m, 0).unwrap()
    }

    fn settings(strategy: IdempotencyStrategy) -> IdempotencySettings {
        IdempotencySettings::with_strategy(strategy)
    }

    #[test]
    fn test_uuid_keys_are_unique() {
        let s = settings(IdempotencyStrategy::Uuid);
        let a = generate_key(&s, "trigger", None, None, &Map::new()).unwrap();
        let b = generate_key(&s, "trigger", None, None, &Map::new()).unwrap();
        assert!(a.starts_with("uuid:"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_time_window_collapses_within_bucket() {
        let mut s = settings(IdempotencyStrategy::TimeWindow);
        s.ttl_minutes = Some(15.0);

        let first = generate_key_at(&s, "trigger", None, None, &Map::new(), at(0, 0)).unwrap();
        let second = generate_key_at(&s, "trigger", None, None, &Map::new(), at(0, 5)).unwrap();
        let later = generate_key_at(&s, "trigger", None, None, &Map::new(), at(0, 15)).unwrap();

        assert_eq!(first, second);
        assert_ne!(first, later);
        assert!(first.starts_with("tw:trigger:"));
    }

    #[test]
    fn test_fractional_ttl_minutes() {
        let mut s = settings(IdempotencyStrategy::TimeWindow);
        s.ttl_minutes = Some(0.5);

        let start = at(0, 0);
        let a = generate_key_at(&s, "t", None, None, &Map::new(), start).unwrap();
        let b = generate_key_at(&s, "t", None, None, &Map::new(), start + Duration::seconds(29))
            .unwrap();
        let c = generate_key_at(&s, "t", None, None, &Map::new(), start + Duration::seconds(30))
            .unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_time_window_requires_ttl() {
        let s = settings(IdempotencyStrategy::TimeWindow);
        let err = generate_key(&s, "t", None, None, &Map::new()).unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert!(s.validate().is_err());
    }

    #[test]
    fn test_context_based_only_listed_fields_matter() {
        let mut s = settings(IdempotencyStrategy::ContextBased);
        s.context_fields = vec!["userId".into(), "packageId".into()];

        let base = generate_key(
            &s,
            "trigger",
            None,
            None,
            &ctx(json!({"userId": "u1", "packageId": "p9", "note": "a"})),
        )
        .unwrap();
        let unlisted_changed = generate_key(
            &s,
            "trigger",
            None,
            None,
            &ctx(json!({"userId": "u1", "packageId": "p9", "note": "b"})),
        )
        .unwrap();
        let listed_changed = generate_key(
            &s,
            "trigger",
            None,
            None,
            &ctx(json!({"userId": "u2", "packageId": "p9", "note": "a"})),
        )
        .unwrap();

        assert_eq!(base, "ctx:trigger:userId=u1|packageId=p9");
        assert_eq!(base, unlisted_changed);
        assert_ne!(base, listed_changed);
    }

    #[test]
    fn test_context_fields_follow_declared_order() {
        let mut s = settings(IdempotencyStrategy::ContextBased);
        s.context_fields = vec!["b".into(), "a".into()];
        let key = generate_key(&s, "t", None, None, &ctx(json!({"a": 1, "b": 2}))).unwrap();
        assert_eq!(key, "ctx:t:b=2|a=1");
    }

    #[test]
    fn test_missing_context_field_matches_null() {
        let mut s = settings(IdempotencyStrategy::ContextBased);
        s.context_fields = vec!["userId".into()];

        let missing = generate_key(&s, "t", None, None, &Map::new()).unwrap();
        let null = generate_key(&s, "t", None, None, &ctx(json!({"userId": null}))).unwrap();
        assert_eq!(missing, null);
        assert_eq!(missing, "ctx:t:userId=null");
    }

    #[test]
    fn test_fail_on_missing_context() {
        let mut s = settings(IdempotencyStrategy::ContextBased);
        s.context_fields = vec!["lead.id".into()];
        s.fail_on_missing_context = true;

        let err = generate_key(&s, "t", None, None, &ctx(json!({"lead": {}}))).unwrap_err();
        assert!(matches!(err, Error::MissingContext(ref f) if f == "lead.id"));

        let key = generate_key(&s, "t", None, None, &ctx(json!({"lead": {"id": 7}}))).unwrap();
        assert_eq!(key, "ctx:t:lead.id=7");
    }

    #[test]
    fn test_separators_in_values_are_escaped() {
        let mut s = settings(IdempotencyStrategy::ContextBased);
        s.context_fields = vec!["a".into(), "b".into()];

        let tricky = generate_key(&s, "t", None, None, &ctx(json!({"a": "x|b=y", "b": "z"})))
            .unwrap();
        let plain = generate_key(&s, "t", None, None, &ctx(json!({"a": "x", "b": "y|b=z"})))
            .unwrap();
        assert_ne!(tricky, plain);
    }

    #[test]
    fn test_context_time_window_combines_both() {
        let mut s = settings(IdempotencyStrategy::ContextTimeWindow);
        s.context_fields = vec!["userId".into()];
        s.ttl_minutes = Some(60.0);

        let c = ctx(json!({"userId": "u1"}));
        let a = generate_key_at(&s, "t", None, None, &c, at(10, 0)).unwrap();
        let b = generate_key_at(&s, "t", None, None, &c, at(10, 59)).unwrap();
        let other_user =
            generate_key_at(&s, "t", None, None, &ctx(json!({"userId": "u2"})), at(10, 0)).unwrap();
        let next_hour = generate_key_at(&s, "t", None, None, &c, at(11, 0)).unwrap();

        assert_eq!(a, b);
        assert_ne!(a, other_user);
        assert_ne!(a, next_hour);
        assert!(a.starts_with("ctxtw:t:userId=u1:"));
    }

    #[test]
    fn test_event_based_flags() {
        let mut s = settings(IdempotencyStrategy::EventBased);
        let key = generate_key(&s, "trigger", Some("lead.created"), Some("e-42"), &Map::new())
            .unwrap();
        assert_eq!(key, "evt:trigger:lead.created:e-42");

        s.include_event_id = false;
        let key = generate_key(&s, "trigger", Some("lead.created"), Some("e-43"), &Map::new())
            .unwrap();
        assert_eq!(key, "evt:trigger:lead.created");

        s.include_trigger_id = false;
        s.include_event_id = true;
        let key = generate_key(&s, "trigger", Some("lead.created"), None, &Map::new()).unwrap();
        assert_eq!(key, "evt:lead.created:null");
    }

    #[test]
    fn test_custom_expression_scope() {
        let mut s = settings(IdempotencyStrategy::CustomExpression);
        s.custom_expression = Some("triggerId + '/' + ctx.userId + '/' + eventName".into());

        let key = generate_key(
            &s,
            "t1",
            Some("payment.done"),
            None,
            &ctx(json!({"userId": "u1"})),
        )
        .unwrap();
        assert_eq!(key, "custom:t1/u1/payment.done");

        s.custom_expression = Some("eventId".into());
        let err = generate_key(&s, "t1", None, None, &Map::new()).unwrap_err();
        assert_eq!(err.code(), "EXPRESSION_ERROR");
    }

    #[test]
    fn test_settings_deserialize_with_defaults_and_aliases() {
        let s: IdempotencySettings = serde_json::from_value(json!({
            "strategy": "CONTEXT_TIME_WINDOW",
            "ttlMinutes": 7.5,
            "context_fields": ["userId"],
            "failOnMissingContext": true,
            "unknown": "ignored"
        }))
        .unwrap();

        assert_eq!(s.strategy, IdempotencyStrategy::ContextTimeWindow);
        assert_eq!(s.ttl_minutes, Some(7.5));
        assert!(s.include_trigger_id);
        assert!(s.fail_on_missing_context);
        assert!(s.validate().is_ok());

        let empty: IdempotencySettings = serde_json::from_value(json!({})).unwrap();
        assert_eq!(empty, IdempotencySettings::default());
    }

    #[test]
    fn test_expires_at() {
        let mut s = settings(IdempotencyStrategy::TimeWindow);
        assert_eq!(s.expires_at(at(0, 0)), None);
        s.ttl_minutes = Some(15.0);
        assert_eq!(s.expires_at(at(0, 0)), Some(at(0, 15)));
    }

    #[test]
    fn test_lookup_path() {
        let c = ctx(json!({"lead": {"tags": ["a", "b"]}}));
        assert_eq!(lookup_path(&c, "lead.tags.1"), Some(&json!("b")));
        assert_eq!(lookup_path(&c, "lead.missing"), None);
    }

    #[test]
    fn test_event_firing_key() {
        let firing = TriggerFiring::event("lead.created", Some("e-42".into()), Map::new());
        let key = firing
            .idempotency_key(&settings(IdempotencyStrategy::EventBased), "trigger", at(0, 0))
            .unwrap();
        assert_eq!(key, "evt:trigger:lead.created:e-42");
    }

    #[test]
    fn test_schedule_firing_payload() {
        let firing = TriggerFiring::schedule(at(0, 5));
        assert_eq!(firing.trigger_type, "schedule");
        assert!(firing.payload["scheduled_at"].as_str().unwrap().starts_with("20"));
    }
}
