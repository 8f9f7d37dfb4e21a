//! Prometheus text exposition of pool state
//!
//! `status --prometheus` prints a snapshot suitable for the node_exporter
//! textfile collector:
//!
//! - `gemini_pool_keys` (gauge): label `state` = active | exhausted | invalid
//! - `gemini_pool_remaining` (gauge): calls left today across active keys
//! - `gemini_key_usage` / `gemini_key_remaining` (gauge): label `key_index`

use gemini_pool::{KeySnapshot, PoolStatus};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Render pool and per-key gauges in Prometheus text format.
///
/// Uses a local recorder rather than installing a global one, so rendering
/// twice in one process is fine.
pub fn render_pool_status(status: &PoolStatus, keys: &[KeySnapshot]) -> String {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let _guard = metrics::set_default_local_recorder(&recorder);

    record_pool_status(status, keys);
    handle.render()
}

fn record_pool_status(status: &PoolStatus, keys: &[KeySnapshot]) {
    for (state, count) in [
        ("active", status.active_keys),
        ("exhausted", status.exhausted_keys),
        ("invalid", status.invalid_keys),
    ] {
        metrics::gauge!("gemini_pool_keys", "state" => state).set(count as f64);
    }
    metrics::gauge!("gemini_pool_remaining").set(status.total_remaining as f64);

    for key in keys {
        let index = key.index.to_string();
        metrics::gauge!("gemini_key_usage", "key_index" => index.clone()).set(f64::from(key.usage));
        metrics::gauge!("gemini_key_remaining", "key_index" => index).set(f64::from(key.remaining));
    }
}
