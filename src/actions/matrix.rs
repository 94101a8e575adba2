//! Template matrix: picks template variants per item and batches items that
//! share a variant.
//!
//! Each item's `key_expression` selects a bucket in `templates`, falling back
//! to `DEFAULT`. Every variant in the bucket becomes one group, keyed
//! `<key>#<variant index>`, so a bucket with two variants sends two batches.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use super::template::render_placeholders;
use crate::clients::DispatchReceipt;
use crate::error::{Error, Result};
use crate::expression::{self, to_display_string, ITEM_KEY};
use crate::idempotency::lookup_path;
use crate::workflow::{MatrixMessageConfig, TemplateVariant};

/// Fallback bucket for keys without their own templates.
pub const DEFAULT_TEMPLATE_KEY: &str = "DEFAULT";

/// Items that share a matrix key and a variant.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixGroup {
    /// `<evaluated key>#<variant index>`
    pub group_key: String,
    /// Bucket the variant came from (the key itself or `DEFAULT`)
    pub template_key: String,
    pub variant_index: usize,
    pub variant: TemplateVariant,
    /// Items in input order
    pub items: Vec<Value>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatrixPlan {
    /// Groups in first-seen order
    pub groups: Vec<MatrixGroup>,
    /// Items whose key matched no bucket and no `DEFAULT`
    pub unmatched: usize,
    /// Items whose key could not be evaluated: `{index, error}`
    pub errors: Vec<Value>,
}

/// Group `items` by matrix key and variant.
pub fn plan_matrix(
    config: &MatrixMessageConfig,
    items: &[Value],
    ctx: &Map<String, Value>,
) -> MatrixPlan {
    let mut plan = MatrixPlan::default();
    let mut index: HashMap<String, usize> = HashMap::new();

    let key_expr = match expression::Expression::parse(&config.key_expression) {
        Ok(parsed) => parsed,
        Err(e) => {
            plan.errors = (0..items.len())
                .map(|i| json!({"index": i, "error": e.to_string()}))
                .collect();
            return plan;
        }
    };

    for (i, item) in items.iter().enumerate() {
        // Item fields shadow context keys of the same name.
        let mut scope = ctx.clone();
        if let Value::Object(fields) = item {
            scope.extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        scope.insert(ITEM_KEY.to_string(), item.clone());

        let key = match key_expr.evaluate(&scope) {
            Ok(value) => to_display_string(&value),
            Err(e) => {
                plan.errors.push(json!({"index": i, "error": e.to_string()}));
                continue;
            }
        };

        let (template_key, variants) = match config.templates.get(&key) {
            Some(variants) => (key.clone(), variants),
            None => match config.templates.get(DEFAULT_TEMPLATE_KEY) {
                Some(variants) => (DEFAULT_TEMPLATE_KEY.to_string(), variants),
                None => {
                    debug!(key = %key, "No template for matrix key");
                    plan.unmatched += 1;
                    continue;
                }
            },
        };

        for (variant_index, variant) in variants.iter().enumerate() {
            let group_key = format!("{}#{}", key, variant_index);
            let slot = *index.entry(group_key.clone()).or_insert_with(|| {
                plan.groups.push(MatrixGroup {
                    group_key,
                    template_key: template_key.clone(),
                    variant_index,
                    variant: variant.clone(),
                    items: Vec::new(),
                });
                plan.groups.len() - 1
            });
            plan.groups[slot].items.push(item.clone());
        }
    }

    plan
}

/// A rendered message for one recipient.
#[derive(Debug, Clone)]
pub(crate) struct Recipient {
    pub address: String,
    pub scope: Map<String, Value>,
}

impl Recipient {
    pub fn render(&self, template: &str) -> String {
        render_placeholders(template, &self.scope)
    }
}

/// Transport side of a matrix handler.
#[async_trait]
pub(crate) trait MatrixChannel: Send + Sync {
    /// Metric label (`email`, `whatsapp`).
    fn channel(&self) -> &'static str;

    /// Item field used when `recipient_field` is unset.
    fn default_recipient_field(&self) -> &'static str;

    async fn send_group(
        &self,
        group: &MatrixGroup,
        recipients: &[Recipient],
    ) -> Result<DispatchReceipt>;
}

/// Plan, render and send a template matrix over `item`.
///
/// `item` is either a list of items or a single item. Send failures are
/// caught per group; the result is successful when at least one group was
/// sent, or when nothing needed sending and nothing failed.
pub(crate) async fn dispatch_matrix<C: MatrixChannel>(
    channel: &C,
    item: &Value,
    config: &Value,
    ctx: &Map<String, Value>,
) -> Result<Value> {
    let config: MatrixMessageConfig = serde_json::from_value(config.clone())
        .map_err(|e| Error::Handler(format!("Invalid template matrix config: {}", e)))?;

    let items: Vec<Value> = match item {
        Value::Array(list) => list.clone(),
        Value::Null => Vec::new(),
        single => vec![single.clone()],
    };
    let recipient_field = config
        .recipient_field
        .as_deref()
        .unwrap_or_else(|| channel.default_recipient_field());

    let plan = plan_matrix(&config, &items, ctx);

    let mut batches = Vec::with_capacity(plan.groups.len());
    let (mut sent, mut failed, mut skipped) = (0usize, 0usize, plan.unmatched);
    let mut any_sent = false;

    for group in &plan.groups {
        let mut recipients = Vec::with_capacity(group.items.len());
        for member in &group.items {
            let scope = member.as_object().cloned().unwrap_or_default();
            match lookup_path(&scope, recipient_field) {
                Some(Value::Null) | None => skipped += 1,
                Some(address) => recipients.push(Recipient {
                    address: to_display_string(address),
                    scope,
                }),
            }
        }

        if recipients.is_empty() {
            batches.push(json!({
                "group_key": group.group_key,
                "template_key": group.template_key,
                "variant_index": group.variant_index,
                "recipients": 0,
                "success": false,
                "error": format!("No items with '{}'", recipient_field),
            }));
            continue;
        }

        let result = channel.send_group(group, &recipients).await;
        let success = result.is_ok();
        crate::metrics::record_notification(channel.channel(), success);

        let mut entry = json!({
            "group_key": group.group_key,
            "template_key": group.template_key,
            "variant_index": group.variant_index,
            "recipients": recipients.len(),
            "success": success,
        });
        match result {
            Ok(_) => {
                sent += recipients.len();
                any_sent = true;
            }
            Err(e) => {
                warn!(
                    channel = channel.channel(),
                    group = %group.group_key,
                    error = %e,
                    "Template matrix send failed"
                );
                failed += recipients.len();
                entry["error"] = json!(e.to_string());
            }
        }
        batches.push(entry);
    }

    let nothing_failed = failed == 0 && plan.errors.is_empty();
    let mut out = json!({
        "success": any_sent || (nothing_failed && batches.iter().all(|b| b["success"] == true)),
        "batches": batches,
        "sent": sent,
        "failed": failed,
        "skipped": skipped,
    });
    if !plan.errors.is_empty() {
        out["errors"] = Value::Array(plan.errors);
    }
    Ok(out)
}
