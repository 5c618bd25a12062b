//! Prometheus metrics for pipeline runs
//!
//! Counters are recorded per chain while a run executes and rendered in the
//! text exposition format once it finishes.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use tracing::warn;

lazy_static! {
    pub static ref STEPS_SUBMITTED: CounterVec = register_counter_vec!(
        "pipeline_steps_submitted_total",
        "Total steps broadcast",
        &["chain_id"]
    ).unwrap();

    pub static ref STEPS_CONFIRMED: CounterVec = register_counter_vec!(
        "pipeline_steps_confirmed_total",
        "Total steps confirmed on chain",
        &["chain_id"]
    ).unwrap();

    pub static ref STEPS_FAILED: CounterVec = register_counter_vec!(
        "pipeline_steps_failed_total",
        "Total steps failed by error kind",
        &["chain_id", "kind"]
    ).unwrap();

    pub static ref CONFIRMATION_LATENCY: HistogramVec = register_histogram_vec!(
        "pipeline_confirmation_latency_seconds",
        "Time from broadcast to confirmation",
        &["chain_id"],
        vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
    ).unwrap();
}

pub fn record_step_submitted(chain_id: u64) {
    STEPS_SUBMITTED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_step_confirmed(chain_id: u64) {
    STEPS_CONFIRMED
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_step_failed(chain_id: u64, kind: &str) {
    STEPS_FAILED
        .with_label_values(&[&chain_id.to_string(), kind])
        .inc();
}

pub fn record_confirmation_latency(chain_id: u64, latency_secs: f64) {
    CONFIRMATION_LATENCY
        .with_label_values(&[&chain_id.to_string()])
        .observe(latency_secs);
}

/// Render all registered metrics in the Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!("Failed to encode metrics: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
