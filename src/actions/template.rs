//! `{{field}}` placeholder rendering.

use std::sync::OnceLock;

use regex_lite::{Captures, Regex};
use serde_json::{Map, Value};

use crate::expression::to_display_string;
use crate::idempotency::lookup_path;

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z0-9_]+)*)\s*\}\}")
            .expect("placeholder pattern compiles")
    })
}

/// Replace `{{path}}` tokens with values from `scope`.
///
/// Paths are dotted (`{{ lead.name }}`). Tokens that do not resolve are left
/// in place so a broken template is visible in the sent message.
pub fn render_placeholders(template: &str, scope: &Map<String, Value>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    placeholder_regex()
        .replace_all(template, |caps: &Captures<'_>| {
            match lookup_path(scope, &caps[1]) {
                Some(value) => to_display_string(value),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Render placeholders inside every string of a JSON value.
pub fn render_value(value: &Value, scope: &Map<String, Value>) -> Value {
    match value {
        Value::String(s) => Value::String(render_placeholders(s, scope)),
        Value::Array(items) => Value::Array(items.iter().map(|v| render_value(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), render_value(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}
