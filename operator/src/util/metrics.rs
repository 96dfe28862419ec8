//! Prometheus counters/histograms/gauges for the reconciler, keyed by
//! Skyhook/package/stage/state the way spec.md §6 says existing tests
//! already depend on. Unlike the teacher (which builds a `prometheus`
//! `Registry` by hand per controller), this workspace's metrics server
//! installs one global `metrics-exporter-prometheus` recorder
//! (`skyhook_common::metrics`), so these are just typed call sites over
//! the `metrics` crate's global macros — no registry object to thread
//! through `ContextData`.

use metrics::{counter, gauge, histogram};

/// Thin, zero-sized handle kept on `ContextData` so call sites read the
/// same way the teacher's `ControllerMetrics` does
/// (`context.metrics.reconcile_counter...`) even though there is no
/// per-instance state left to hold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControllerMetrics;

impl ControllerMetrics {
    pub fn new(_subsystem: &str) -> Self {
        ControllerMetrics
    }

    pub fn record_reconcile(&self, skyhook: &str) {
        counter!("skyhook_reconcile_count", "skyhook" => skyhook.to_owned()).increment(1);
    }

    pub fn record_action(&self, skyhook: &str, action: &str) {
        counter!("skyhook_action_count", "skyhook" => skyhook.to_owned(), "action" => action.to_owned())
            .increment(1);
    }

    pub fn observe_read(&self, skyhook: &str, seconds: f64) {
        histogram!("skyhook_reconcile_read_seconds", "skyhook" => skyhook.to_owned()).record(seconds);
    }

    pub fn observe_write(&self, skyhook: &str, seconds: f64) {
        histogram!("skyhook_reconcile_write_seconds", "skyhook" => skyhook.to_owned()).record(seconds);
    }

    /// Named exactly as spec.md §6 says existing tests expect.
    pub fn record_package_stage(&self, skyhook: &str, package: &str, stage: &str, state: &str) {
        counter!(
            "skyhook_package_stage_count",
            "skyhook" => skyhook.to_owned(),
            "package" => package.to_owned(),
            "stage" => stage.to_owned(),
            "state" => state.to_owned()
        )
        .increment(1);
    }

    /// Named exactly as spec.md §6 says existing tests expect.
    pub fn set_nodes_in_progress(&self, skyhook: &str, count: i64) {
        gauge!("skyhook_node_in_progress_count", "skyhook" => skyhook.to_owned()).set(count as f64);
    }

    pub fn record_batch_evaluation(&self, skyhook: &str, compartment: &str, healthy: bool) {
        counter!(
            "skyhook_batch_evaluation_count",
            "skyhook" => skyhook.to_owned(),
            "compartment" => compartment.to_owned(),
            "healthy" => healthy.to_string()
        )
        .increment(1);
    }

    pub fn set_interrupt_budget_ceiling(&self, skyhook: &str, ceiling: usize) {
        gauge!("skyhook_interrupt_budget_ceiling", "skyhook" => skyhook.to_owned()).set(ceiling as f64);
    }
}
