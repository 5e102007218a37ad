//! Metrics collection and aggregation for test runs.
//!
//! A [`MetricsCollector`] accumulates per-request outcomes incrementally
//! and computes aggregate statistics on demand: latency percentiles by
//! linear interpolation, throughput, error rate, and status-code and
//! error-type breakdowns. [`EndpointMetricsCollector`] fans outcomes out
//! to per-endpoint collectors plus an aggregate for multi-endpoint runs.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};

use crate::run::{EndpointMetrics, Metrics, RequestResult};
use crate::spec::Thresholds;

/// Accumulates request outcomes and computes aggregate statistics.
///
/// Not internally synchronized: the engine guards its collector with a
/// per-run lock so live-progress readers and the completion path
/// serialize through it.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    results: Vec<RequestResult>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp the start of collection.
    pub fn start(&mut self) {
        self.start_time = Some(Utc::now());
    }

    /// Stamp the end of collection.
    pub fn stop(&mut self) {
        self.end_time = Some(Utc::now());
    }

    /// Record one request outcome.
    pub fn add_result(&mut self, result: RequestResult) {
        self.results.push(result);
    }

    /// Number of recorded outcomes.
    pub fn count(&self) -> u64 {
        self.results.len() as u64
    }

    /// Compute aggregate metrics over everything recorded so far.
    pub fn compute_metrics(&self) -> Metrics {
        if self.results.is_empty() {
            return Metrics::default();
        }

        let failed = self.results.iter().filter(|r| r.is_failure()).count() as u64;
        let total = self.results.len() as u64;
        let successful = total - failed;

        let mut status_code_counts: BTreeMap<u16, u64> = BTreeMap::new();
        for result in &self.results {
            if let Some(code) = result.status_code {
                *status_code_counts.entry(code).or_insert(0) += 1;
            }
        }

        let mut errors_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for result in self.results.iter().filter(|r| r.is_failure()) {
            let label = normalize_error_label(result.error.as_deref().unwrap_or("unknown"));
            *errors_by_type.entry(label).or_insert(0) += 1;
        }

        let total_bytes_received = self
            .results
            .iter()
            .filter(|r| !r.is_failure())
            .filter_map(|r| r.response_size_bytes)
            .sum();

        let duration_seconds = match (self.start_time, self.end_time) {
            (Some(start), Some(end)) => {
                let micros = (end - start).num_microseconds().unwrap_or(0);
                Some(micros as f64 / 1_000_000.0)
            }
            _ => None,
        };
        let requests_per_second = duration_seconds
            .filter(|d| *d > 0.0)
            .map(|d| total as f64 / d);

        let mut metrics = Metrics {
            total_requests: total,
            successful_requests: successful,
            failed_requests: failed,
            status_code_counts,
            errors_by_type,
            total_bytes_received,
            duration_seconds,
            requests_per_second,
            error_rate: Some(failed as f64 / total as f64),
            ..Metrics::default()
        };

        // Latencies from every outcome that measured one, failures included.
        let mut latencies: Vec<f64> = self
            .results
            .iter()
            .map(|r| r.latency_ms)
            .filter(|l| *l > 0.0)
            .collect();
        if !latencies.is_empty() {
            latencies.sort_by(|a, b| a.partial_cmp(b).expect("latencies are finite"));
            metrics.latency_min_ms = Some(latencies[0]);
            metrics.latency_max_ms = Some(latencies[latencies.len() - 1]);
            metrics.latency_mean_ms =
                Some(latencies.iter().sum::<f64>() / latencies.len() as f64);
            metrics.latency_p50_ms = Some(percentile(&latencies, 50.0));
            metrics.latency_p90_ms = Some(percentile(&latencies, 90.0));
            metrics.latency_p95_ms = Some(percentile(&latencies, 95.0));
            metrics.latency_p99_ms = Some(percentile(&latencies, 99.0));
        }

        metrics
    }

    /// Evaluate thresholds against current metrics.
    ///
    /// Returns `(passed, failure_reasons)`; reason ordering is fixed:
    /// failed requests, latency percentiles, error rate, throughput,
    /// unexpected status codes (ascending).
    pub fn check_thresholds(
        &self,
        thresholds: &Thresholds,
        expected_status_codes: &[u16],
    ) -> (bool, Vec<String>) {
        let metrics = self.compute_metrics();
        let mut failures = Vec::new();

        if metrics.failed_requests > 0 {
            failures.push(format!("{} request(s) failed", metrics.failed_requests));
        }

        let percentile_checks = [
            ("P50", thresholds.max_latency_p50_ms, metrics.latency_p50_ms),
            ("P95", thresholds.max_latency_p95_ms, metrics.latency_p95_ms),
            ("P99", thresholds.max_latency_p99_ms, metrics.latency_p99_ms),
        ];
        for (label, limit, observed) in percentile_checks {
            if let (Some(limit), Some(observed)) = (limit, observed) {
                if observed > limit {
                    failures.push(format!(
                        "{} latency {:.1}ms exceeds threshold {}ms",
                        label, observed, limit
                    ));
                }
            }
        }

        if let (Some(limit), Some(rate)) = (thresholds.max_error_rate, metrics.error_rate) {
            if rate > limit {
                failures.push(format!(
                    "Error rate {:.1}% exceeds threshold {:.1}%",
                    rate * 100.0,
                    limit * 100.0
                ));
            }
        }

        if let Some(limit) = thresholds.min_throughput_rps {
            let actual = metrics.requests_per_second.unwrap_or(0.0);
            if actual < limit {
                failures.push(format!(
                    "Throughput {:.1} rps below threshold {} rps",
                    actual, limit
                ));
            }
        }

        for (code, count) in &metrics.status_code_counts {
            if !expected_status_codes.contains(code) {
                failures.push(format!(
                    "Received {} responses with unexpected status code {}",
                    count, code
                ));
            }
        }

        (failures.is_empty(), failures)
    }
}

/// Percentile by linear interpolation over sorted samples.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let k = (n - 1) as f64 * (p / 100.0);
    let f = k.floor() as usize;
    let c = (f + 1).min(n - 1);
    if f == c {
        return sorted[f];
    }

    sorted[f] * (c as f64 - k) + sorted[c] * (k - f as f64)
}

/// Collapse raw error strings into stable buckets. The engine already
/// standardizes its own categories; this catches variants carried in
/// transport messages.
fn normalize_error_label(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    if lowered.contains("timeout") {
        "timeout".to_string()
    } else if lowered.contains("connection") {
        "connection_error".to_string()
    } else {
        raw.to_string()
    }
}

/// Fan-out collector for multi-endpoint runs: one collector per endpoint
/// plus an aggregate. Threshold checks always use the aggregate.
#[derive(Debug)]
pub struct EndpointMetricsCollector {
    endpoint_names: Vec<String>,
    endpoint_collectors: HashMap<String, MetricsCollector>,
    aggregate: MetricsCollector,
}

impl EndpointMetricsCollector {
    pub fn new(endpoint_names: Vec<String>) -> Self {
        let endpoint_collectors = endpoint_names
            .iter()
            .map(|name| (name.clone(), MetricsCollector::new()))
            .collect();
        Self {
            endpoint_names,
            endpoint_collectors,
            aggregate: MetricsCollector::new(),
        }
    }

    pub fn start(&mut self) {
        for collector in self.endpoint_collectors.values_mut() {
            collector.start();
        }
        self.aggregate.start();
    }

    pub fn stop(&mut self) {
        for collector in self.endpoint_collectors.values_mut() {
            collector.stop();
        }
        self.aggregate.stop();
    }

    /// Route an outcome to the aggregate and, when its endpoint is known,
    /// to that endpoint's collector.
    pub fn add_result(&mut self, result: RequestResult) {
        if let Some(name) = result.endpoint_name.as_deref() {
            if let Some(collector) = self.endpoint_collectors.get_mut(name) {
                collector.add_result(result.clone());
            }
        }
        self.aggregate.add_result(result);
    }

    pub fn count(&self) -> u64 {
        self.aggregate.count()
    }

    pub fn compute_aggregate_metrics(&self) -> Metrics {
        self.aggregate.compute_metrics()
    }

    /// Per-endpoint metrics, in spec order.
    pub fn compute_endpoint_metrics(&self) -> Vec<EndpointMetrics> {
        self.endpoint_names
            .iter()
            .map(|name| EndpointMetrics {
                endpoint_name: name.clone(),
                metrics: self.endpoint_collectors[name].compute_metrics(),
            })
            .collect()
    }

    pub fn check_thresholds(
        &self,
        thresholds: &Thresholds,
        expected_status_codes: &[u16],
    ) -> (bool, Vec<String>) {
        self.aggregate.check_thresholds(thresholds, expected_status_codes)
    }
}
