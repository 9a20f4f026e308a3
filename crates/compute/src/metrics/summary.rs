use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::MetricSample;

/// Nearest-rank percentile of an ascending slice.
///
/// Index is `ceil(p * n) - 1`, clamped to `[0, n - 1]`. Returns `None` for
/// an empty slice.
#[must_use]
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
pub fn percentile(sorted: &[f64], p: f64) -> Option<f64> {
    let n = sorted.len();
    if n == 0 {
        return None;
    }
    let rank = (p * n as f64).ceil() - 1.0;
    let index = if rank <= 0.0 {
        0
    } else {
        (rank as usize).min(n - 1)
    };
    Some(sorted[index])
}

/// Aggregate statistics over a deployment's rolling window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSummary {
    /// Requests in the window.
    pub total_requests: u64,
    /// Successful requests.
    pub successful_requests: u64,
    /// Failed requests.
    pub failed_requests: u64,
    /// Successful / total.
    pub success_rate: f64,
    /// Failed / total.
    pub error_rate: f64,
    /// Mean latency.
    pub avg_latency_ms: f64,
    /// Median latency.
    pub p50_latency_ms: f64,
    /// 95th percentile latency.
    pub p95_latency_ms: f64,
    /// 99th percentile latency.
    pub p99_latency_ms: f64,
    /// Prompt tokens.
    pub total_tokens_in: u64,
    /// Completion tokens.
    pub total_tokens_out: u64,
    /// Cost in USD.
    pub total_cost: f64,
    /// Requests per second over the throughput window ending at the newest
    /// sample.
    pub throughput_rps: f64,
    /// Oldest sample in the window.
    pub window_start: DateTime<Utc>,
    /// Newest sample in the window.
    pub window_end: DateTime<Utc>,
}

/// Result of a metrics query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum MetricsReport {
    /// No samples in the window.
    NoData,
    /// Statistics over the window.
    Stats(MetricsSummary),
}

impl MetricsReport {
    /// The summary, if there is one.
    #[must_use]
    pub fn summary(&self) -> Option<&MetricsSummary> {
        match self {
            Self::NoData => None,
            Self::Stats(summary) => Some(summary),
        }
    }
}

impl MetricsSummary {
    /// Summarise samples ordered by timestamp.
    ///
    /// Returns `None` when `samples` is empty.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_samples(samples: &[MetricSample], throughput_window: chrono::Duration) -> Option<Self> {
        let first = samples.first()?;
        let last = samples.last()?;

        let total_requests = samples.len() as u64;
        let successful_requests = samples.iter().filter(|s| s.success).count() as u64;
        let failed_requests = total_requests - successful_requests;

        let mut latencies: Vec<f64> = samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_by(f64::total_cmp);
        let avg_latency_ms = latencies.iter().sum::<f64>() / total_requests as f64;

        let window_end = last.timestamp;
        let throughput_start = window_end - throughput_window;
        let recent = samples
            .iter()
            .filter(|s| s.timestamp > throughput_start)
            .count();
        let window_secs = throughput_window.num_milliseconds() as f64 / 1000.0;
        let throughput_rps = if window_secs > 0.0 {
            recent as f64 / window_secs
        } else {
            0.0
        };

        Some(Self {
            total_requests,
            successful_requests,
            failed_requests,
            success_rate: successful_requests as f64 / total_requests as f64,
            error_rate: failed_requests as f64 / total_requests as f64,
            avg_latency_ms,
            p50_latency_ms: percentile(&latencies, 0.50).unwrap_or_default(),
            p95_latency_ms: percentile(&latencies, 0.95).unwrap_or_default(),
            p99_latency_ms: percentile(&latencies, 0.99).unwrap_or_default(),
            total_tokens_in: samples.iter().map(|s| s.tokens_in).sum(),
            total_tokens_out: samples.iter().map(|s| s.tokens_out).sum(),
            total_cost: samples.iter().map(|s| s.cost).sum(),
            throughput_rps,
            window_start: first.timestamp,
            window_end,
        })
    }
}
