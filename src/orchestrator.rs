//! Control plane for test runs.
//!
//! The orchestrator accepts submissions, persists the initial record,
//! detaches the engine task, and mediates all reads and mutations of run
//! state: live runs are served from the executor's active-run table,
//! terminal runs from the repository. It never crashes on a single run's
//! failure.

use std::sync::Arc;

use tracing::{error, info};
use uuid::Uuid;

use crate::errors::OrchestratorError;
use crate::executor::TestExecutor;
use crate::run::{RunResult, RunStatus, TestConfig};
use crate::spec::TestSpec;
use crate::storage::{RunQuery, RunRepository};

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The run was active and cancellation was signalled.
    Signalled,
    /// The run had already reached the given terminal status.
    AlreadyTerminal(RunStatus),
}

/// One orchestrator is created per process and shared behind an `Arc`.
pub struct Orchestrator {
    executor: Arc<TestExecutor>,
    repository: Arc<dyn RunRepository>,
}

impl Orchestrator {
    pub fn new(executor: Arc<TestExecutor>, repository: Arc<dyn RunRepository>) -> Self {
        Self { executor, repository }
    }

    /// Validate and accept a spec, persist the pending record, and launch
    /// execution in the background. Returns immediately with the run id;
    /// the run is guaranteed to reach a terminal status observable via
    /// [`get`](Self::get).
    pub async fn submit(&self, spec: TestSpec) -> Result<Uuid, OrchestratorError> {
        spec.validate()?;

        let pending = RunResult::new(spec.clone());
        let run_id = pending.id;
        self.repository.save(&pending).await?;

        let executor = self.executor.clone();
        let repository = self.repository.clone();
        tokio::spawn(async move {
            let result = executor.run_with(spec, Some(run_id), None).await;

            if let Err(e) = repository.save(&result).await {
                error!(run_id = %run_id, error = %e, "Failed to persist run result");
            }

            // Keep the per-name config registry pointing at the latest spec.
            let config = TestConfig::new(result.spec.clone());
            if let Err(e) = repository.save_test_config(&config).await {
                error!(run_id = %run_id, error = %e, "Failed to upsert test config");
            }
        });

        info!(run_id = %run_id, "Run submitted");
        Ok(run_id)
    }

    /// The run's current state: the live record while active, otherwise
    /// the persisted one.
    pub async fn get(&self, run_id: Uuid) -> Result<RunResult, OrchestratorError> {
        if let Some(live) = self.executor.active_run(run_id) {
            return Ok(live);
        }
        self.repository
            .load(run_id)
            .await?
            .ok_or(OrchestratorError::RunNotFound(run_id))
    }

    /// Signal cancellation. Terminal runs report their status benignly;
    /// unknown runs are an error.
    pub async fn cancel(&self, run_id: Uuid) -> Result<CancelOutcome, OrchestratorError> {
        if self.executor.cancel(run_id) {
            return Ok(CancelOutcome::Signalled);
        }

        match self.repository.load(run_id).await? {
            Some(run) if run.status.is_terminal() => Ok(CancelOutcome::AlreadyTerminal(run.status)),
            _ => Err(OrchestratorError::RunNotFound(run_id)),
        }
    }

    /// Remove a terminal run from the repository. Active runs are refused.
    pub async fn delete(&self, run_id: Uuid) -> Result<(), OrchestratorError> {
        if self.executor.is_active(run_id) {
            return Err(OrchestratorError::RunActive(run_id));
        }
        if self.repository.delete(run_id).await? {
            Ok(())
        } else {
            Err(OrchestratorError::RunNotFound(run_id))
        }
    }

    /// List runs, substituting live records for entries still in flight so
    /// callers see up-to-the-moment progress.
    pub async fn list(&self, query: &RunQuery) -> Result<(Vec<RunResult>, usize), OrchestratorError> {
        let (mut runs, total) = self.repository.list(query).await?;
        for run in &mut runs {
            if let Some(live) = self.executor.active_run(run.id) {
                *run = live;
            }
        }
        Ok((runs, total))
    }

    /// The per-name config registry entry, if any.
    pub async fn get_test_config(&self, name: &str) -> Result<Option<TestConfig>, OrchestratorError> {
        Ok(self.repository.get_test_config(name).await?)
    }

    /// All registered test configs.
    pub async fn list_test_configs(&self, enabled_only: bool) -> Result<Vec<TestConfig>, OrchestratorError> {
        Ok(self.repository.list_test_configs(enabled_only).await?)
    }

    /// Toggle a test config. Returns false when the name is unknown.
    pub async fn set_test_enabled(&self, name: &str, enabled: bool) -> Result<bool, OrchestratorError> {
        Ok(self.repository.set_test_enabled(name, enabled).await?)
    }

    /// Remove a test config. Returns false when the name is unknown.
    pub async fn delete_test_config(&self, name: &str) -> Result<bool, OrchestratorError> {
        Ok(self.repository.delete_test_config(name).await?)
    }
}
