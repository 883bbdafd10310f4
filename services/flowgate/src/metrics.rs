//! Prometheus metrics exposition
//!
//! Service-level metrics:
//!
//! - `generation_requests_total` (counter): labels `kind`, `outcome`
//! - `generation_duration_seconds` (histogram): label `kind`
//! - `generation_rejected_total` (counter): label `kind`, requests turned away
//!   because no worker was eligible
//!
//! The worker-pool crate records its own `pool_*` series through the same
//! global recorder.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};
use upstream::{Kind, Outcome};

/// Histogram boundaries from 100ms to 30 minutes. Video generation runs for
/// many minutes so the tail is wide.
const DURATION_BUCKETS: &[f64] = &[
    0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new().set_buckets_for_metric(
        Matcher::Full("generation_duration_seconds".to_string()),
        DURATION_BUCKETS,
    )
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// `generation_duration_seconds` gets explicit buckets so it renders as a
/// histogram with `_bucket` lines rather than the default summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record a finished generation request.
pub fn record_generation(kind: Kind, outcome: Outcome, duration_secs: f64) {
    metrics::counter!(
        "generation_requests_total",
        "kind" => kind.as_str(),
        "outcome" => outcome.label()
    )
    .increment(1);
    metrics::histogram!("generation_duration_seconds", "kind" => kind.as_str())
        .record(duration_secs);
}

/// Record a request rejected before reaching upstream.
pub fn record_rejected(kind: Kind) {
    metrics::counter!("generation_rejected_total", "kind" => kind.as_str()).increment(1);
}
