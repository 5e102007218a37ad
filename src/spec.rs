//! Load-test specifications.
//!
//! A [`TestSpec`] is an immutable, request-shaped job description: the
//! target (one URL or a list of endpoints), the load profile, pass/fail
//! thresholds, template variables, and optional authentication. Specs are
//! validated once at submission and never mutated during a run.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::auth::AuthConfig;
use crate::errors::SpecError;

/// Supported HTTP methods.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    /// The reqwest method for this variant.
    pub fn to_reqwest(self) -> reqwest::Method {
        match self {
            HttpMethod::Get => reqwest::Method::GET,
            HttpMethod::Post => reqwest::Method::POST,
            HttpMethod::Put => reqwest::Method::PUT,
            HttpMethod::Patch => reqwest::Method::PATCH,
            HttpMethod::Delete => reqwest::Method::DELETE,
            HttpMethod::Head => reqwest::Method::HEAD,
            HttpMethod::Options => reqwest::Method::OPTIONS,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_reqwest().as_str())
    }
}

/// Strategy for distributing requests across multiple endpoints.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistributionStrategy {
    /// Cycle through endpoints: A, B, C, A, B, C, ...
    #[default]
    RoundRobin,
    /// Independent weighted draw per request.
    Weighted,
    /// All requests to A, then B, then C.
    Sequential,
}

/// Pass/fail thresholds for aggregate metrics. Unset fields impose no
/// constraint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub max_latency_p50_ms: Option<f64>,
    pub max_latency_p95_ms: Option<f64>,
    pub max_latency_p99_ms: Option<f64>,
    pub max_error_rate: Option<f64>,
    pub min_throughput_rps: Option<f64>,
}

/// Request shape for a single endpoint in a multi-endpoint test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointSpec {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Weight for weighted distribution; ignored under other strategies.
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,
}

/// Specification for a load test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,

    // Single-endpoint target. Ignored when `endpoints` is non-empty.
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub method: HttpMethod,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,

    // Multi-endpoint target.
    #[serde(default)]
    pub endpoints: Option<Vec<EndpointSpec>>,
    #[serde(default)]
    pub distribution_strategy: DistributionStrategy,

    // Load profile.
    #[serde(default = "default_total_requests")]
    pub total_requests: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub requests_per_second: Option<f64>,
    #[serde(default = "default_timeout_seconds")]
    pub timeout_seconds: f64,

    // Success criteria.
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default = "default_expected_status_codes")]
    pub expected_status_codes: Vec<u16>,

    // Template variables (user-provided values).
    #[serde(default)]
    pub variables: HashMap<String, String>,

    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

fn default_weight() -> u32 {
    1
}

fn default_expected_status_codes() -> Vec<u16> {
    vec![200, 201, 204]
}

fn default_total_requests() -> u64 {
    100
}

fn default_concurrency() -> usize {
    10
}

fn default_timeout_seconds() -> f64 {
    30.0
}

impl TestSpec {
    /// True when this spec targets an explicit endpoint list.
    pub fn is_multi_endpoint(&self) -> bool {
        self.endpoints.as_ref().is_some_and(|eps| !eps.is_empty())
    }

    /// The endpoint list driving request building. Single-URL specs derive
    /// a synthetic "default" endpoint so the engine handles both shapes
    /// uniformly.
    pub fn resolved_endpoints(&self) -> Vec<EndpointSpec> {
        if let Some(endpoints) = &self.endpoints {
            if !endpoints.is_empty() {
                return endpoints.clone();
            }
        }

        vec![EndpointSpec {
            name: "default".to_string(),
            url: self.url.clone(),
            method: self.method,
            headers: self.headers.clone(),
            body: self.body.clone(),
            weight: 1,
            expected_status_codes: self.expected_status_codes.clone(),
        }]
    }

    /// Validate field ranges. Called once at submission; the engine assumes
    /// a validated spec.
    pub fn validate(&self) -> Result<(), SpecError> {
        if self.name.is_empty() || self.name.len() > 256 {
            return Err(SpecError::invalid("name", "must be 1-256 characters"));
        }
        if self.total_requests == 0 || self.total_requests > 1_000_000 {
            return Err(SpecError::invalid("total_requests", "must be in [1, 1000000]"));
        }
        if self.concurrency == 0 || self.concurrency > 1000 {
            return Err(SpecError::invalid("concurrency", "must be in [1, 1000]"));
        }
        if let Some(rps) = self.requests_per_second {
            if !(0.1..=10_000.0).contains(&rps) {
                return Err(SpecError::invalid("requests_per_second", "must be in [0.1, 10000]"));
            }
        }
        if !(1.0..=300.0).contains(&self.timeout_seconds) {
            return Err(SpecError::invalid("timeout_seconds", "must be in [1, 300]"));
        }
        if let Some(rate) = self.thresholds.max_error_rate {
            if !(0.0..=1.0).contains(&rate) {
                return Err(SpecError::invalid("thresholds.max_error_rate", "must be in [0, 1]"));
            }
        }

        if self.is_multi_endpoint() {
            for endpoint in self.endpoints.as_deref().unwrap_or_default() {
                if endpoint.name.is_empty() || endpoint.name.len() > 128 {
                    return Err(SpecError::invalid("endpoints.name", "must be 1-128 characters"));
                }
                if endpoint.url.is_empty() {
                    return Err(SpecError::invalid("endpoints.url", "must not be empty"));
                }
                if endpoint.weight == 0 || endpoint.weight > 100 {
                    return Err(SpecError::invalid("endpoints.weight", "must be in [1, 100]"));
                }
            }
        } else if self.url.is_empty() {
            return Err(SpecError::invalid("url", "must not be empty"));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> TestSpec {
        serde_json::from_value(serde_json::json!({
            "name": "smoke",
            "url": "https://example.com/api"
        }))
        .unwrap()
    }

    #[test]
    fn defaults_applied_on_deserialize() {
        let spec = base_spec();

        assert_eq!(spec.method, HttpMethod::Get);
        assert_eq!(spec.total_requests, 100);
        assert_eq!(spec.concurrency, 10);
        assert_eq!(spec.timeout_seconds, 30.0);
        assert_eq!(spec.expected_status_codes, vec![200, 201, 204]);
        assert_eq!(spec.distribution_strategy, DistributionStrategy::RoundRobin);
        assert!(spec.requests_per_second.is_none());
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn single_url_derives_default_endpoint() {
        let mut spec = base_spec();
        spec.method = HttpMethod::Post;
        spec.headers.insert("X-Custom".into(), "value".into());
        spec.expected_status_codes = vec![200, 201];

        assert!(!spec.is_multi_endpoint());
        let endpoints = spec.resolved_endpoints();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].name, "default");
        assert_eq!(endpoints[0].url, "https://example.com/api");
        assert_eq!(endpoints[0].method, HttpMethod::Post);
        assert_eq!(endpoints[0].headers.get("X-Custom").unwrap(), "value");
        assert_eq!(endpoints[0].expected_status_codes, vec![200, 201]);
    }

    #[test]
    fn explicit_endpoints_override_single_url() {
        let mut spec = base_spec();
        spec.url = String::new();
        spec.endpoints = Some(vec![
            EndpointSpec {
                name: "a".into(),
                url: "https://example.com/a".into(),
                method: HttpMethod::Get,
                headers: HashMap::new(),
                body: None,
                weight: 1,
                expected_status_codes: vec![200],
            },
            EndpointSpec {
                name: "b".into(),
                url: "https://example.com/b".into(),
                method: HttpMethod::Get,
                headers: HashMap::new(),
                body: None,
                weight: 3,
                expected_status_codes: vec![200],
            },
        ]);

        assert!(spec.is_multi_endpoint());
        assert_eq!(spec.resolved_endpoints().len(), 2);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn empty_endpoint_list_falls_back_to_url() {
        let mut spec = base_spec();
        spec.endpoints = Some(vec![]);

        assert!(!spec.is_multi_endpoint());
        assert_eq!(spec.resolved_endpoints()[0].name, "default");
    }

    #[test]
    fn validate_rejects_out_of_range_fields() {
        let mut spec = base_spec();
        spec.total_requests = 0;
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.concurrency = 1001;
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.requests_per_second = Some(0.01);
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.timeout_seconds = 0.5;
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.thresholds.max_error_rate = Some(1.5);
        assert!(spec.validate().is_err());

        let mut spec = base_spec();
        spec.url = String::new();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn method_serializes_uppercase() {
        let json = serde_json::to_string(&HttpMethod::Delete).unwrap();
        assert_eq!(json, "\"DELETE\"");

        let method: HttpMethod = serde_json::from_str("\"POST\"").unwrap();
        assert_eq!(method, HttpMethod::Post);
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&DistributionStrategy::RoundRobin).unwrap();
        assert_eq!(json, "\"round_robin\"");
    }
}
