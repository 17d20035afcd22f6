//! Prometheus metrics for opsflow, served on `/metrics`.
//!
//! ## Metrics
//!
//! ### Counters
//! - `opsflow_executions_total` - Finished executions by status and trigger_type
//! - `opsflow_node_dispatch_total` - Node dispatches by action and status
//! - `opsflow_trigger_dispatch_total` - Trigger admissions by trigger_type and outcome
//!
//! ### Histograms
//! - `opsflow_execution_duration_seconds` - Running segment duration by workflow
//! - `opsflow_node_duration_seconds` - Node dispatch duration by action
//!
//! ### Gauges
//! - `opsflow_active_executions` - Executions holding a concurrency permit
//! - `opsflow_queued_executions` - Executions waiting for a permit

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

use crate::error::{Error, Result};

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Calling it again returns the handle
/// installed first.
pub fn init_metrics() -> Result<PrometheusHandle> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("Failed to install Prometheus recorder: {}", e)))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Render current metrics in Prometheus text format.
pub fn render_metrics() -> String {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => handle.render(),
        None => "# Metrics not initialized\n".to_string(),
    }
}

// =============================================================================
// Execution Metrics
// =============================================================================

/// Record an execution reaching a terminal or waiting state.
pub fn record_execution(status: &str, trigger_type: &str) {
    counter!(
        "opsflow_executions_total",
        "status" => status.to_string(),
        "trigger_type" => trigger_type.to_string()
    )
    .increment(1);
}

pub fn record_execution_duration(duration: Duration, workflow_name: &str) {
    histogram!(
        "opsflow_execution_duration_seconds",
        "workflow" => workflow_name.to_string()
    )
    .record(duration.as_secs_f64());
}

pub fn inc_active_executions() {
    gauge!("opsflow_active_executions").increment(1.0);
}

pub fn dec_active_executions() {
    gauge!("opsflow_active_executions").decrement(1.0);
}

pub fn inc_queued_executions() {
    gauge!("opsflow_queued_executions").increment(1.0);
}

pub fn dec_queued_executions() {
    gauge!("opsflow_queued_executions").decrement(1.0);
}

// =============================================================================
// Node Metrics
// =============================================================================

pub fn record_node_dispatch(action: &str, status: &str) {
    counter!(
        "opsflow_node_dispatch_total",
        "action" => action.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_node_duration(duration: Duration, action: &str) {
    histogram!(
        "opsflow_node_duration_seconds",
        "action" => action.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Trigger Metrics
// =============================================================================

/// `outcome` is one of started, filtered, rejected or failed.
pub fn record_trigger(trigger_type: &str, outcome: &str) {
    counter!(
        "opsflow_trigger_dispatch_total",
        "trigger_type" => trigger_type.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}
