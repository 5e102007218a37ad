//! Error types for the service, by subsystem, plus classification of
//! per-request transport failures into stable category strings.
//!
//! Per-request errors are data: they become category strings inside a
//! `RequestResult` and never abort a run. Auth and internal errors are
//! fatal to their run; orchestrator errors surface to the caller.

use thiserror::Error;
use uuid::Uuid;

/// A spec field failed range validation.
#[derive(Error, Debug)]
pub enum SpecError {
    #[error("invalid value for {field}: {message}")]
    InvalidValue {
        field: &'static str,
        message: &'static str,
    },
}

impl SpecError {
    pub(crate) fn invalid(field: &'static str, message: &'static str) -> Self {
        SpecError::InvalidValue { field, message }
    }
}

/// Failures resolving an auth config to headers. Fatal to the run.
#[derive(Error, Debug)]
pub enum AuthError {
    #[error("token endpoint returned status {status}")]
    TokenEndpointStatus { status: u16 },

    #[error("token endpoint request failed: {0}")]
    TokenRequest(#[from] reqwest::Error),

    #[error("OAuth2 response missing access_token")]
    MissingAccessToken,

    #[error("unsupported JWT algorithm: {0}")]
    UnsupportedJwtAlgorithm(String),

    #[error("JWT signing failed: {0}")]
    JwtSigning(#[from] jsonwebtoken::errors::Error),
}

/// Run-fatal engine failures (anything outside per-request handling).
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    #[error("failed to build HTTP client: {0}")]
    ClientBuild(reqwest::Error),
}

/// Repository backend failures.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Control-plane errors surfaced by the orchestrator.
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("invalid spec: {0}")]
    Spec(#[from] SpecError),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} is still active")]
    RunActive(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Scheduler and schedule-manager errors.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("schedule {0} not found")]
    NotFound(Uuid),

    #[error("invalid trigger: {0}")]
    InvalidTrigger(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Map a transport failure onto its stable category string.
///
/// Timeouts collapse to `timeout`, connection-level failures to
/// `connection_error: <detail>`; anything else keeps its raw message so
/// the metrics normalization can still bucket it.
pub fn classify_transport_error(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        return "timeout".to_string();
    }
    if error.is_connect() {
        return format!("connection_error: {}", error);
    }

    let message = error.to_string();
    let lowered = message.to_lowercase();
    if lowered.contains("timeout") {
        "timeout".to_string()
    } else if lowered.contains("connect") || lowered.contains("connection") {
        format!("connection_error: {}", error)
    } else {
        message
    }
}
