//! Run records: per-request outcomes, aggregate metrics, and the durable
//! result of a test run.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::spec::TestSpec;

/// Lifecycle status of a run.
///
/// Transitions: pending → running → {completed, cancelled, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
    Failed,
}

impl RunStatus {
    /// True for statuses that no longer change.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Cancelled | RunStatus::Failed)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Outcome of a single HTTP request.
///
/// Exactly one of `status_code` (with `error` unset) or `error` is present.
/// The `request_*`/`response_*` capture fields are populated only for
/// sampled requests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestResult {
    pub request_number: u64,
    #[serde(default)]
    pub status_code: Option<u16>,
    /// Wall-clock milliseconds from dispatch to response or failure.
    pub latency_ms: f64,
    #[serde(default)]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub response_size_bytes: Option<u64>,
    #[serde(default)]
    pub endpoint_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
}

impl RequestResult {
    /// A failure is any outcome with an error or without a status code.
    pub fn is_failure(&self) -> bool {
        self.error.is_some() || self.status_code.is_none()
    }
}

/// Aggregated metrics for a run or a single endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,

    // Latency statistics (milliseconds), absent until a latency is recorded.
    pub latency_min_ms: Option<f64>,
    pub latency_max_ms: Option<f64>,
    pub latency_mean_ms: Option<f64>,
    pub latency_p50_ms: Option<f64>,
    pub latency_p90_ms: Option<f64>,
    pub latency_p95_ms: Option<f64>,
    pub latency_p99_ms: Option<f64>,

    pub requests_per_second: Option<f64>,
    pub duration_seconds: Option<f64>,

    pub error_rate: Option<f64>,
    pub errors_by_type: BTreeMap<String, u64>,
    pub status_code_counts: BTreeMap<u16, u64>,

    pub total_bytes_received: u64,
}

/// Metrics for one endpoint of a multi-endpoint run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointMetrics {
    pub endpoint_name: String,
    pub metrics: Metrics,
}

/// Complete record of a test run. Created at submission, owned by the
/// engine while running, frozen on terminal transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    pub id: Uuid,
    pub spec: TestSpec,
    pub status: RunStatus,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub metrics: Metrics,
    pub passed: Option<bool>,
    #[serde(default)]
    pub failure_reasons: Vec<String>,

    /// Per-endpoint metrics, populated for multi-endpoint runs.
    #[serde(default)]
    pub endpoint_metrics: Vec<EndpointMetrics>,

    /// Dispatched requests that have finished (successfully or not).
    pub requests_completed: u64,

    /// Populated when `status` is failed.
    pub error_message: Option<String>,

    /// First successes up to the sampling cap plus every dispatch failure,
    /// ordered by request number.
    #[serde(default)]
    pub sampled_requests: Vec<RequestResult>,
}

impl RunResult {
    /// Mint a pending record for a spec.
    pub fn new(spec: TestSpec) -> Self {
        Self {
            id: Uuid::new_v4(),
            spec,
            status: RunStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            metrics: Metrics::default(),
            passed: None,
            failure_reasons: Vec::new(),
            endpoint_metrics: Vec::new(),
            requests_completed: 0,
            error_message: None,
            sampled_requests: Vec::new(),
        }
    }
}

/// Per-name registry entry holding the most recent spec submitted under
/// that name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestConfig {
    pub name: String,
    pub enabled: bool,
    pub spec: TestSpec,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TestConfig {
    /// A fresh enabled entry for a spec.
    pub fn new(spec: TestSpec) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name.clone(),
            enabled: true,
            spec,
            created_at: now,
            updated_at: now,
        }
    }
}
