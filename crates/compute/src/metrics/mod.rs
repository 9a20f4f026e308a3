//! Rolling per-deployment request metrics.
//!
//! Samples are keyed by `sample_id`; ingesting a sample twice is a no-op, so
//! replaying a batch never changes the report. Each window keeps samples
//! ordered by `(timestamp, sample_id)` and evicts from the old end, by count
//! and by age relative to the newest sample. The window contents therefore
//! depend only on the set of samples ingested, not on arrival order.

mod summary;

pub use summary::{percentile, MetricsReport, MetricsSummary};

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use tracing::debug;

use crate::config::WindowConfig;
use crate::error::{OrchestratorError, Result};
use crate::models::MetricSample;

#[derive(Debug, Default)]
struct RollingWindow {
    samples: Vec<MetricSample>,
    ids: HashSet<String>,
}

impl RollingWindow {
    fn insert(&mut self, sample: MetricSample) -> bool {
        if self.ids.contains(&sample.sample_id) {
            return false;
        }
        let key = (sample.timestamp, sample.sample_id.as_str());
        let position = self
            .samples
            .partition_point(|s| (s.timestamp, s.sample_id.as_str()) <= key);
        self.ids.insert(sample.sample_id.clone());
        self.samples.insert(position, sample);
        true
    }

    fn evict(&mut self, config: &WindowConfig) {
        let mut drop_front = self.samples.len().saturating_sub(config.max_samples);

        if let (Some(max_age), Some(newest)) = (config.max_age, self.samples.last()) {
            let cutoff = newest.timestamp - max_age;
            let expired = self.samples.partition_point(|s| s.timestamp < cutoff);
            drop_front = drop_front.max(expired);
        }

        for sample in self.samples.drain(..drop_front) {
            self.ids.remove(&sample.sample_id);
        }
    }
}

/// Rolling windows keyed by a deployment's `metrics_ref`.
#[derive(Debug)]
pub struct MetricsAggregator {
    config: WindowConfig,
    windows: RwLock<HashMap<String, RollingWindow>>,
}

impl Default for MetricsAggregator {
    fn default() -> Self {
        Self::new(WindowConfig::default())
    }
}

impl MetricsAggregator {
    /// Create an aggregator with the given window bounds.
    #[must_use]
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Add samples to a window.
    ///
    /// The batch is validated as a whole; nothing is ingested if any sample
    /// is invalid. Returns the samples that were new.
    ///
    /// # Errors
    /// Returns `Validation` for negative or non-finite measurements.
    pub fn ingest(&self, metrics_ref: &str, samples: &[MetricSample]) -> Result<Vec<MetricSample>> {
        for sample in samples {
            sample.validate()?;
        }

        let mut windows = self
            .windows
            .write()
            .map_err(|_| OrchestratorError::Config("metrics lock poisoned".into()))?;
        let window = windows.entry(metrics_ref.to_string()).or_default();

        let inserted: Vec<&MetricSample> = samples
            .iter()
            .filter(|s| window.insert((*s).clone()))
            .collect();
        window.evict(&self.config);
        // Samples already outside the window are not new.
        let accepted: Vec<MetricSample> = inserted
            .into_iter()
            .filter(|s| window.ids.contains(&s.sample_id))
            .cloned()
            .collect();

        debug!(
            metrics_ref = %metrics_ref,
            received = samples.len(),
            accepted = accepted.len(),
            window = window.samples.len(),
            "Ingested metric samples"
        );
        Ok(accepted)
    }

    /// Statistics over a window; `NoData` if it is empty or unknown.
    #[must_use]
    pub fn report(&self, metrics_ref: &str) -> MetricsReport {
        let Ok(windows) = self.windows.read() else {
            return MetricsReport::NoData;
        };
        windows
            .get(metrics_ref)
            .and_then(|w| MetricsSummary::from_samples(&w.samples, self.config.throughput_window))
            .map_or(MetricsReport::NoData, MetricsReport::Stats)
    }

    /// Samples currently in a window, oldest first.
    #[must_use]
    pub fn window(&self, metrics_ref: &str) -> Vec<MetricSample> {
        self.windows
            .read()
            .ok()
            .and_then(|w| w.get(metrics_ref).map(|w| w.samples.clone()))
            .unwrap_or_default()
    }

    /// Drop a window.
    pub fn remove(&self, metrics_ref: &str) {
        if let Ok(mut windows) = self.windows.write() {
            windows.remove(metrics_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Duration, Utc};

    use super::*;

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn sample(id: &str, secs: i64, latency_ms: f64, success: bool) -> MetricSample {
        MetricSample {
            sample_id: id.into(),
            timestamp: at(secs),
            latency_ms,
            tokens_in: 10,
            tokens_out: 20,
            success,
            cost: 0.001,
        }
    }

    fn config(max_samples: usize, max_age_secs: Option<i64>) -> WindowConfig {
        WindowConfig {
            max_samples,
            max_age: max_age_secs.map(Duration::seconds),
            throughput_window: Duration::seconds(10),
        }
    }

    #[test]
    fn test_empty_window_reports_no_data() {
        let agg = MetricsAggregator::default();
        assert_eq!(agg.report("dep-1"), MetricsReport::NoData);
        agg.ingest("dep-1", &[]).unwrap();
        assert_eq!(agg.report("dep-1"), MetricsReport::NoData);
    }

    #[test]
    fn test_summary_counts_and_totals() {
        let agg = MetricsAggregator::new(config(100, None));
        agg.ingest(
            "dep-1",
            &[
                sample("a", 0, 100.0, true),
                sample("b", 1, 200.0, true),
                sample("c", 2, 300.0, false),
                sample("d", 3, 400.0, true),
            ],
        )
        .unwrap();

        let report = agg.report("dep-1");
        let summary = report.summary().unwrap();
        assert_eq!(summary.total_requests, 4);
        assert_eq!(summary.successful_requests, 3);
        assert_eq!(summary.failed_requests, 1);
        assert!((summary.success_rate - 0.75).abs() < f64::EPSILON);
        assert!((summary.error_rate - 0.25).abs() < f64::EPSILON);
        assert!((summary.avg_latency_ms - 250.0).abs() < f64::EPSILON);
        assert_eq!(summary.p50_latency_ms, 200.0);
        assert_eq!(summary.p99_latency_ms, 400.0);
        assert_eq!(summary.total_tokens_in, 40);
        assert_eq!(summary.total_tokens_out, 80);
        assert!((summary.throughput_rps - 0.4).abs() < 1e-9);
    }

    #[test]
    fn test_replay_is_idempotent() {
        let agg = MetricsAggregator::new(config(3, Some(3600)));
        let batch: Vec<_> = (0..5)
            .map(|i| sample(&format!("s{i}"), i, f64::from(i as i32) * 10.0, true))
            .collect();

        agg.ingest("dep-1", &batch).unwrap();
        let first = agg.report("dep-1");
        let replayed = agg.ingest("dep-1", &batch).unwrap();
        assert_eq!(agg.report("dep-1"), first);
        assert!(replayed.is_empty());

        let mut reversed = batch.clone();
        reversed.reverse();
        let other = MetricsAggregator::new(config(3, Some(3600)));
        other.ingest("dep-1", &reversed).unwrap();
        assert_eq!(other.report("dep-1"), first);
    }

    #[test]
    fn test_evicts_by_count_and_age() {
        let agg = MetricsAggregator::new(config(3, None));
        for i in 0..5 {
            agg.ingest("dep-1", &[sample(&format!("s{i}"), i, 1.0, true)])
                .unwrap();
        }
        let ids: Vec<_> = agg.window("dep-1").into_iter().map(|s| s.sample_id).collect();
        assert_eq!(ids, vec!["s2", "s3", "s4"]);

        let aged = MetricsAggregator::new(config(100, Some(60)));
        aged.ingest(
            "dep-1",
            &[sample("old", 0, 1.0, true), sample("new", 120, 1.0, true)],
        )
        .unwrap();
        let ids: Vec<_> = aged.window("dep-1").into_iter().map(|s| s.sample_id).collect();
        assert_eq!(ids, vec!["new"]);
    }

    #[test]
    fn test_invalid_batch_is_rejected_whole() {
        let agg = MetricsAggregator::default();
        let err = agg
            .ingest(
                "dep-1",
                &[sample("a", 0, 1.0, true), sample("b", 1, -5.0, true)],
            )
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Validation(_)));
        assert_eq!(agg.report("dep-1"), MetricsReport::NoData);
    }

    #[test]
    fn test_percentiles_ordered_for_any_window_size() {
        for n in 1..=200usize {
            let agg = MetricsAggregator::new(config(1_000, None));
            // 7919 is prime, so i * 7919 mod n visits every rank once.
            let batch: Vec<_> = (0..n)
                .map(|i| {
                    let rank = (i * 7919) % n;
                    sample(
                        &format!("s{i}"),
                        i64::try_from(i).unwrap(),
                        1.5 * rank as f64 + 3.0,
                        true,
                    )
                })
                .collect();
            agg.ingest("dep-1", &batch).unwrap();

            let report = agg.report("dep-1");
            let summary = report.summary().unwrap();
            let max = 1.5 * (n - 1) as f64 + 3.0;
            assert_eq!(summary.total_requests, n as u64);
            assert!(summary.p50_latency_ms >= 3.0, "n={n}");
            assert!(summary.p50_latency_ms <= summary.p95_latency_ms, "n={n}");
            assert!(summary.p95_latency_ms <= summary.p99_latency_ms, "n={n}");
            assert!(summary.p99_latency_ms <= max, "n={n}");
        }
    }
}
