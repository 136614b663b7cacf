//! Prometheus metrics exposition
//!
//! The pool records through the `metrics` facade:
//!
//! - `onliner_sessions_online` (gauge)
//! - `onliner_connect_attempts_total` (counter): label `outcome`
//! - `onliner_reconcile_passes_total` (counter)

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Install the Prometheus recorder and return a handle for rendering metrics.
pub fn install_recorder() -> anyhow::Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    describe();
    Ok(handle)
}

/// Register help text for every metric the service emits.
fn describe() {
    metrics::describe_gauge!(
        "onliner_sessions_online",
        "Sessions currently held online by the pool"
    );
    metrics::describe_counter!(
        "onliner_connect_attempts_total",
        "Connect attempts that completed, by outcome"
    );
    metrics::describe_counter!(
        "onliner_reconcile_passes_total",
        "Reconciliation passes started"
    );
}
