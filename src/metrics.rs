//! Prometheus metrics for eduflow.
//!
//! Exposed via the `/metrics` endpoint.
//!
//! ## Metrics
//!
//! ### Counters
//! - `eduflow_workflows_executed_total` - Executions by terminal status and trigger_type
//! - `eduflow_nodes_executed_total` - Node runs by node_type and status
//! - `eduflow_duplicate_firings_total` - Firings suppressed by an idempotency claim
//! - `eduflow_action_results_total` - Handler results by action_type and success
//! - `eduflow_notifications_sent_total` - Notification batches by channel and success
//!
//! ### Histograms
//! - `eduflow_workflow_duration_seconds` - Execution duration
//! - `eduflow_node_duration_seconds` - Node duration by node_type
//!
//! ### Gauges
//! - `eduflow_active_executions` - Executions currently walking their graph

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::warn;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once.
///
/// Returns `None` when another recorder is already installed.
pub fn init_metrics() -> Option<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Some(handle.clone());
    }
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(PROMETHEUS_HANDLE.get_or_init(|| handle).clone()),
        Err(e) => {
            // Lost an install race against ourselves: the winner's handle is usable.
            if let Some(handle) = PROMETHEUS_HANDLE.get() {
                return Some(handle.clone());
            }
            warn!("Failed to install Prometheus recorder: {}", e);
            None
        }
    }
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Workflow Metrics
// =============================================================================

pub fn record_workflow_execution(status: &str, trigger_type: &str) {
    counter!(
        "eduflow_workflows_executed_total",
        "status" => status.to_string(),
        "trigger_type" => trigger_type.to_string()
    )
    .increment(1);
}

pub fn record_workflow_duration(duration: Duration, workflow_id: &str) {
    histogram!(
        "eduflow_workflow_duration_seconds",
        "workflow" => workflow_id.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn inc_active_executions() {
    gauge!("eduflow_active_executions").increment(1.0);
}

pub fn dec_active_executions() {
    gauge!("eduflow_active_executions").decrement(1.0);
}

/// A firing that reused an existing idempotency claim.
pub fn record_duplicate_firing(workflow_id: &str) {
    counter!(
        "eduflow_duplicate_firings_total",
        "workflow" => workflow_id.to_string()
    )
    .increment(1);
}

// =============================================================================
// Node Metrics
// =============================================================================

pub fn record_node_execution(node_type: &str, status: &str) {
    counter!(
        "eduflow_nodes_executed_total",
        "node_type" => node_type.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_node_duration(duration: Duration, node_type: &str) {
    histogram!(
        "eduflow_node_duration_seconds",
        "node_type" => node_type.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Action Metrics
// =============================================================================

pub fn record_action_result(action_type: &str, success: bool) {
    counter!(
        "eduflow_action_results_total",
        "action_type" => action_type.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}

pub fn record_notification(channel: &str, success: bool) {
    counter!(
        "eduflow_notifications_sent_total",
        "channel" => channel.to_string(),
        "success" => success.to_string()
    )
    .increment(1);
}
