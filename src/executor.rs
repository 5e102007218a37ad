//! Load-test execution engine.
//!
//! [`TestExecutor::run`] drives one spec to a terminal status: it
//! dispatches up to `concurrency` in-flight requests through the rate
//! limiter, substitutes templates, applies auth headers, records every
//! outcome into the metrics collector, publishes live progress through
//! the active-run table, and honors cooperative cancellation.
//!
//! The executor owns the active-run table. While a run is in flight its
//! `RunResult` lives there behind a lock; the engine is the only writer
//! and readers (the orchestrator's live-progress path) clone coherent
//! snapshots.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::auth::AuthProvider;
use crate::errors::{classify_transport_error, EngineError};
use crate::metrics::EndpointMetricsCollector;
use crate::rate_limiter::RateLimiter;
use crate::run::{RequestResult, RunResult, RunStatus};
use crate::selector::EndpointSelector;
use crate::spec::{EndpointSpec, TestSpec};
use crate::templating::TemplateEngine;

/// Successful requests captured in full before sampling stops. Failures
/// are always captured.
const MAX_SAMPLED_REQUESTS: usize = 20;

/// Captured response bodies are truncated at this many bytes.
const MAX_SAMPLED_BODY_BYTES: usize = 10 * 1024;

/// Live aggregate metrics are recomputed every this many completions and
/// on the final one.
const METRICS_REFRESH_INTERVAL: u64 = 5;

/// Invoked after each dispatched completion with `(completed, total)`.
/// Runs synchronously on the completion path; must be cheap.
pub type ProgressCallback = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Executes load tests and tracks the runs currently in flight.
pub struct TestExecutor {
    /// Injected client used for every run (tests); otherwise one client
    /// is built per run with the spec's timeout.
    client: Option<reqwest::Client>,
    active_runs: RwLock<HashMap<Uuid, Arc<RwLock<RunResult>>>>,
    cancel_flags: RwLock<HashMap<Uuid, Arc<AtomicBool>>>,
}

impl TestExecutor {
    pub fn new() -> Self {
        Self {
            client: None,
            active_runs: RwLock::new(HashMap::new()),
            cancel_flags: RwLock::new(HashMap::new()),
        }
    }

    /// An executor that performs all requests through the given client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self {
            client: Some(client),
            ..Self::new()
        }
    }

    /// Run a spec to completion and return the finalized record.
    pub async fn run(&self, spec: TestSpec) -> RunResult {
        self.run_with(spec, None, None).await
    }

    /// Run with an explicit run id and/or progress callback.
    pub async fn run_with(
        &self,
        spec: TestSpec,
        run_id: Option<Uuid>,
        on_progress: Option<ProgressCallback>,
    ) -> RunResult {
        let mut pending = RunResult::new(spec);
        if let Some(id) = run_id {
            pending.id = id;
        }
        let id = pending.id;

        let cancel = Arc::new(AtomicBool::new(false));
        let live = Arc::new(RwLock::new(pending));
        self.cancel_flags.write().unwrap().insert(id, cancel.clone());
        self.active_runs.write().unwrap().insert(id, live.clone());

        info!(run_id = %id, "Starting load test run");

        if let Err(e) = self.execute(id, &cancel, &live, on_progress).await {
            error!(run_id = %id, error = %e, "Run failed");
            let mut run = live.write().unwrap();
            run.status = RunStatus::Failed;
            run.error_message = Some(e.to_string());
            run.passed = Some(false);
        }

        live.write().unwrap().completed_at = Some(Utc::now());

        self.cancel_flags.write().unwrap().remove(&id);
        self.active_runs.write().unwrap().remove(&id);

        let result = live.read().unwrap().clone();
        info!(
            run_id = %id,
            status = %result.status,
            requests_completed = result.requests_completed,
            "Run finished"
        );
        result
    }

    /// Signal cancellation for an active run. Returns whether a signal
    /// was delivered; terminal or unknown runs return false. Idempotent.
    pub fn cancel(&self, run_id: Uuid) -> bool {
        match self.cancel_flags.read().unwrap().get(&run_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                info!(run_id = %run_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// True while the run is in flight.
    pub fn is_active(&self, run_id: Uuid) -> bool {
        self.active_runs.read().unwrap().contains_key(&run_id)
    }

    /// Snapshot of an active run's live state.
    pub fn active_run(&self, run_id: Uuid) -> Option<RunResult> {
        self.active_runs
            .read()
            .unwrap()
            .get(&run_id)
            .map(|live| live.read().unwrap().clone())
    }

    /// Snapshots of every active run.
    pub fn active_runs(&self) -> Vec<RunResult> {
        self.active_runs
            .read()
            .unwrap()
            .values()
            .map(|live| live.read().unwrap().clone())
            .collect()
    }

    async fn execute(
        &self,
        id: Uuid,
        cancel: &Arc<AtomicBool>,
        live: &Arc<RwLock<RunResult>>,
        on_progress: Option<ProgressCallback>,
    ) -> Result<(), EngineError> {
        let spec = live.read().unwrap().spec.clone();

        {
            let mut run = live.write().unwrap();
            run.status = RunStatus::Running;
            run.started_at = Some(Utc::now());
        }

        let client = match &self.client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder()
                .timeout(Duration::from_secs_f64(spec.timeout_seconds))
                .build()
                .map_err(EngineError::ClientBuild)?,
        };

        let templates = Arc::new(TemplateEngine::new(spec.variables.clone()));

        // Global auth headers are resolved once, before dispatch begins.
        // A failure here is fatal to the run.
        let auth_headers = match &spec.auth {
            Some(config) => {
                let provider = AuthProvider::new(templates.clone(), client.clone());
                provider.headers(config).await?
            }
            None => HashMap::new(),
        };

        let rate_limiter = match spec.requests_per_second {
            Some(rate) => RateLimiter::capped(rate),
            None => RateLimiter::unlimited(),
        };

        let selector = EndpointSelector::new(
            spec.resolved_endpoints(),
            spec.distribution_strategy,
            spec.total_requests,
        );

        let mut collector = EndpointMetricsCollector::new(selector.endpoint_names());
        collector.start();

        let shared = Arc::new(RunShared {
            spec: spec.clone(),
            cancel: cancel.clone(),
            semaphore: Semaphore::new(spec.concurrency),
            rate_limiter,
            templates,
            selector,
            client,
            auth_headers,
            collector: Mutex::new(collector),
            sampled: Mutex::new(Vec::new()),
            completed: Mutex::new(0),
            live: live.clone(),
            on_progress,
        });

        let mut handles = Vec::with_capacity(spec.total_requests as usize);
        for request_number in 1..=spec.total_requests {
            let shared = shared.clone();
            handles.push(tokio::spawn(execute_request(shared, request_number)));
        }
        for handle in handles {
            // A panicked request task loses its outcome but must not take
            // the run down with it.
            let _ = handle.await;
        }

        // Finalize: stop the clock, compute the terminal aggregate, check
        // thresholds, and settle the status.
        shared.collector.lock().unwrap().stop();

        let (metrics, endpoint_metrics, passed, failure_reasons) = {
            let collector = shared.collector.lock().unwrap();
            let (passed, failures) =
                collector.check_thresholds(&spec.thresholds, &spec.expected_status_codes);
            let endpoint_metrics = if spec.is_multi_endpoint() {
                collector.compute_endpoint_metrics()
            } else {
                Vec::new()
            };
            (collector.compute_aggregate_metrics(), endpoint_metrics, passed, failures)
        };

        let sampled = shared.sorted_sampled();
        let cancelled = cancel.load(Ordering::SeqCst);

        {
            let mut run = live.write().unwrap();
            run.metrics = metrics;
            run.endpoint_metrics = endpoint_metrics;
            run.sampled_requests = sampled;
            run.passed = Some(passed);
            run.failure_reasons = failure_reasons;
            run.status = if cancelled {
                RunStatus::Cancelled
            } else {
                RunStatus::Completed
            };
        }

        debug!(run_id = %id, cancelled, passed, "Run finalized");
        Ok(())
    }
}

impl Default for TestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by every request task of one run.
struct RunShared {
    spec: TestSpec,
    cancel: Arc<AtomicBool>,
    semaphore: Semaphore,
    rate_limiter: RateLimiter,
    templates: Arc<TemplateEngine>,
    selector: EndpointSelector,
    client: reqwest::Client,
    auth_headers: HashMap<String, String>,
    collector: Mutex<EndpointMetricsCollector>,
    sampled: Mutex<Vec<RequestResult>>,
    /// Dispatched-completion counter; held across the whole live-update so
    /// readers see a non-decreasing count with a matching aggregate.
    completed: Mutex<u64>,
    live: Arc<RwLock<RunResult>>,
    on_progress: Option<ProgressCallback>,
}

async fn execute_request(shared: Arc<RunShared>, request_number: u64) {
    if shared.cancel.load(Ordering::SeqCst) {
        shared.record_cancelled(request_number);
        return;
    }

    let _permit = match shared.semaphore.acquire().await {
        Ok(permit) => permit,
        Err(_) => return,
    };

    if shared.cancel.load(Ordering::SeqCst) {
        shared.record_cancelled(request_number);
        return;
    }

    shared.rate_limiter.acquire().await;

    if shared.cancel.load(Ordering::SeqCst) {
        shared.record_cancelled(request_number);
        return;
    }

    let endpoint = shared.selector.select(request_number).clone();
    let result = shared.dispatch(&endpoint, request_number).await;
    shared.record_completion(result);
}

impl RunShared {
    /// Build and perform one request, classifying the outcome.
    async fn dispatch(&self, endpoint: &EndpointSpec, request_number: u64) -> RequestResult {
        let url = self.templates.substitute(&endpoint.url, request_number);

        // Endpoint headers take precedence over global auth headers.
        let mut headers = self.auth_headers.clone();
        for (name, value) in &endpoint.headers {
            headers.insert(name.clone(), self.templates.substitute(value, request_number));
        }

        let body = match &endpoint.body {
            Some(Value::String(text)) => Some(self.templates.substitute(text, request_number)),
            Some(structured) => {
                if !headers.keys().any(|k| k.eq_ignore_ascii_case("content-type")) {
                    headers.insert("Content-Type".to_string(), "application/json".to_string());
                }
                Some(self.templates.substitute_value(structured, request_number).to_string())
            }
            None => None,
        };

        let mut request = self
            .client
            .request(endpoint.method.to_reqwest(), &url)
            .timeout(Duration::from_secs_f64(self.spec.timeout_seconds));
        for (name, value) in &headers {
            request = request.header(name, value);
        }
        if let Some(body) = &body {
            request = request.body(body.clone());
        }

        let start = Instant::now();
        let outcome = async {
            let response = request.send().await?;
            let status = response.status().as_u16();
            let response_headers: HashMap<String, String> = response
                .headers()
                .iter()
                .map(|(name, value)| {
                    (
                        name.to_string(),
                        String::from_utf8_lossy(value.as_bytes()).into_owned(),
                    )
                })
                .collect();
            let bytes = response.bytes().await?;
            Ok::<_, reqwest::Error>((status, response_headers, bytes))
        }
        .await;
        let latency_ms = start.elapsed().as_secs_f64() * 1000.0;

        let mut result = RequestResult {
            request_number,
            status_code: None,
            latency_ms,
            error: None,
            timestamp: Utc::now(),
            response_size_bytes: None,
            endpoint_name: Some(endpoint.name.clone()),
            request_url: None,
            request_method: None,
            request_headers: None,
            request_body: None,
            response_headers: None,
            response_body: None,
        };

        match outcome {
            Ok((status, response_headers, bytes)) => {
                result.status_code = Some(status);
                result.response_size_bytes = Some(bytes.len() as u64);

                debug!(
                    request_number,
                    endpoint = %endpoint.name,
                    status_code = status,
                    latency_ms,
                    "Request completed"
                );

                // Capture the first MAX_SAMPLED_REQUESTS successes in full.
                let mut sampled = self.sampled.lock().unwrap();
                if sampled.len() < MAX_SAMPLED_REQUESTS {
                    result.request_url = Some(url);
                    result.request_method = Some(endpoint.method.to_string());
                    result.request_headers = Some(headers);
                    result.request_body = body;
                    result.response_headers = Some(response_headers);
                    result.response_body = Some(truncate_body(&bytes));
                    sampled.push(result.clone());
                }
            }
            Err(error) => {
                let category = classify_transport_error(&error);
                warn!(
                    request_number,
                    endpoint = %endpoint.name,
                    error = %category,
                    latency_ms,
                    "Request failed"
                );

                result.error = Some(category);
                result.request_url = Some(url);
                result.request_method = Some(endpoint.method.to_string());
                result.request_headers = Some(headers);
                result.request_body = body;

                // Failures are always captured.
                self.sampled.lock().unwrap().push(result.clone());
            }
        }

        result
    }

    /// Record an outcome for a task that observed cancellation before
    /// dispatching. Feeds the collector (visible in `errors_by_type`) but
    /// does not count as a dispatched completion.
    fn record_cancelled(&self, request_number: u64) {
        let result = RequestResult {
            request_number,
            status_code: None,
            latency_ms: 0.0,
            error: Some("cancelled".to_string()),
            timestamp: Utc::now(),
            response_size_bytes: None,
            endpoint_name: None,
            request_url: None,
            request_method: None,
            request_headers: None,
            request_body: None,
            response_headers: None,
            response_body: None,
        };
        self.collector.lock().unwrap().add_result(result);
    }

    /// Commit a dispatched outcome: collector, completion counter, sampled
    /// list, live record, progress callback. The completion lock is held
    /// across the whole update so live readers never observe a torn state.
    fn record_completion(&self, result: RequestResult) {
        let mut completed = self.completed.lock().unwrap();

        self.collector.lock().unwrap().add_result(result);
        *completed += 1;

        let refresh = *completed % METRICS_REFRESH_INTERVAL == 0
            || *completed == self.spec.total_requests;
        let metrics = refresh
            .then(|| self.collector.lock().unwrap().compute_aggregate_metrics());

        let sampled = self.sorted_sampled();

        {
            let mut run = self.live.write().unwrap();
            run.requests_completed = *completed;
            run.sampled_requests = sampled;
            if let Some(metrics) = metrics {
                run.metrics = metrics;
            }
        }

        if let Some(on_progress) = &self.on_progress {
            on_progress(*completed, self.spec.total_requests);
        }
    }

    fn sorted_sampled(&self) -> Vec<RequestResult> {
        let mut sampled = self.sampled.lock().unwrap().clone();
        sampled.sort_by_key(|r| r.request_number);
        sampled
    }
}

/// UTF-8 body truncated to the sampling cap; binary bodies degrade to a
/// size placeholder.
fn truncate_body(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(text) => {
            if text.len() <= MAX_SAMPLED_BODY_BYTES {
                text.to_string()
            } else {
                let mut end = MAX_SAMPLED_BODY_BYTES;
                while !text.is_char_boundary(end) {
                    end -= 1;
                }
                text[..end].to_string()
            }
        }
        Err(_) => format!("<binary: {} bytes>", bytes.len()),
    }
}
