//! Run and schedule persistence.
//!
//! The core depends only on the [`RunRepository`] and
//! [`ScheduleRepository`] traits. Two backends are provided: an in-memory
//! store for tests and embedded use, and a JSON-file store that keeps one
//! file per run plus `test_configs.json` / `schedules.json` under a data
//! directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ServiceConfig, StorageKind};
use crate::errors::StorageError;
use crate::run::{RunResult, RunStatus, TestConfig};
use crate::scheduler::{ScheduleConfig, ScheduleRun};

/// Filters and pagination for run listings.
#[derive(Debug, Clone)]
pub struct RunQuery {
    pub limit: usize,
    pub offset: usize,
    pub status: Option<RunStatus>,
    /// Exact spec-name match.
    pub name: Option<String>,
}

impl Default for RunQuery {
    fn default() -> Self {
        Self {
            limit: 50,
            offset: 0,
            status: None,
            name: None,
        }
    }
}

/// Persistence contract for run records and the per-name test-config
/// registry. Implementations must be safe for concurrent use.
#[async_trait]
pub trait RunRepository: Send + Sync {
    /// Insert or replace a run record.
    async fn save(&self, result: &RunResult) -> Result<(), StorageError>;

    async fn load(&self, run_id: Uuid) -> Result<Option<RunResult>, StorageError>;

    /// Returns true when a record was removed.
    async fn delete(&self, run_id: Uuid) -> Result<bool, StorageError>;

    /// Matching runs newest-first, paged; the second element is the total
    /// match count before paging.
    async fn list(&self, query: &RunQuery) -> Result<(Vec<RunResult>, usize), StorageError>;

    /// Upsert keyed by `config.name`, preserving the original
    /// `created_at` on update.
    async fn save_test_config(&self, config: &TestConfig) -> Result<(), StorageError>;

    async fn get_test_config(&self, name: &str) -> Result<Option<TestConfig>, StorageError>;

    async fn list_test_configs(&self, enabled_only: bool) -> Result<Vec<TestConfig>, StorageError>;

    /// Returns false when the name is unknown.
    async fn set_test_enabled(&self, name: &str, enabled: bool) -> Result<bool, StorageError>;

    async fn delete_test_config(&self, name: &str) -> Result<bool, StorageError>;
}

/// Persistence contract for schedule state and the fire audit trail.
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn save_schedule(&self, config: &ScheduleConfig) -> Result<(), StorageError>;

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StorageError>;

    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>, StorageError>;

    async fn record_run(&self, record: &ScheduleRun) -> Result<(), StorageError>;

    /// Most recent audit records, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScheduleRun>, StorageError>;
}

fn apply_query(mut runs: Vec<RunResult>, query: &RunQuery) -> (Vec<RunResult>, usize) {
    runs.retain(|run| {
        query.status.map_or(true, |status| run.status == status)
            && query.name.as_deref().map_or(true, |name| run.spec.name == name)
    });
    runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let total = runs.len();
    let page = runs
        .into_iter()
        .skip(query.offset)
        .take(query.limit)
        .collect();
    (page, total)
}

fn upsert_config(existing: &mut HashMap<String, TestConfig>, config: &TestConfig) {
    match existing.get_mut(&config.name) {
        Some(entry) => {
            entry.spec = config.spec.clone();
            entry.enabled = config.enabled;
            entry.updated_at = Utc::now();
        }
        None => {
            existing.insert(config.name.clone(), config.clone());
        }
    }
}

/// In-memory backend. State dies with the process.
#[derive(Default)]
pub struct MemoryRepository {
    runs: RwLock<HashMap<Uuid, RunResult>>,
    test_configs: RwLock<HashMap<String, TestConfig>>,
    schedules: RwLock<HashMap<Uuid, ScheduleConfig>>,
    schedule_runs: RwLock<Vec<ScheduleRun>>,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RunRepository for MemoryRepository {
    async fn save(&self, result: &RunResult) -> Result<(), StorageError> {
        self.runs.write().await.insert(result.id, result.clone());
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunResult>, StorageError> {
        Ok(self.runs.read().await.get(&run_id).cloned())
    }

    async fn delete(&self, run_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.runs.write().await.remove(&run_id).is_some())
    }

    async fn list(&self, query: &RunQuery) -> Result<(Vec<RunResult>, usize), StorageError> {
        let runs: Vec<RunResult> = self.runs.read().await.values().cloned().collect();
        Ok(apply_query(runs, query))
    }

    async fn save_test_config(&self, config: &TestConfig) -> Result<(), StorageError> {
        upsert_config(&mut *self.test_configs.write().await, config);
        Ok(())
    }

    async fn get_test_config(&self, name: &str) -> Result<Option<TestConfig>, StorageError> {
        Ok(self.test_configs.read().await.get(name).cloned())
    }

    async fn list_test_configs(&self, enabled_only: bool) -> Result<Vec<TestConfig>, StorageError> {
        let mut configs: Vec<TestConfig> = self
            .test_configs
            .read()
            .await
            .values()
            .filter(|c| !enabled_only || c.enabled)
            .cloned()
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    async fn set_test_enabled(&self, name: &str, enabled: bool) -> Result<bool, StorageError> {
        let mut configs = self.test_configs.write().await;
        match configs.get_mut(name) {
            Some(config) => {
                config.enabled = enabled;
                config.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_test_config(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self.test_configs.write().await.remove(name).is_some())
    }
}

#[async_trait]
impl ScheduleRepository for MemoryRepository {
    async fn save_schedule(&self, config: &ScheduleConfig) -> Result<(), StorageError> {
        self.schedules.write().await.insert(config.id, config.clone());
        Ok(())
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StorageError> {
        Ok(self.schedules.write().await.remove(&schedule_id).is_some())
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>, StorageError> {
        let mut schedules: Vec<ScheduleConfig> =
            self.schedules.read().await.values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn record_run(&self, record: &ScheduleRun) -> Result<(), StorageError> {
        let mut runs = self.schedule_runs.write().await;
        runs.insert(0, record.clone());
        runs.truncate(100);
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScheduleRun>, StorageError> {
        Ok(self.schedule_runs.read().await.iter().take(limit).cloned().collect())
    }
}

/// On-disk schedule state: configs plus the audit trail, one file.
#[derive(Debug, Default, Serialize, Deserialize)]
struct ScheduleState {
    schedules: HashMap<Uuid, ScheduleConfig>,
    recent_runs: Vec<ScheduleRun>,
}

/// JSON-file backend: `<data_dir>/runs/<id>.json` per run,
/// `test_configs.json` and `schedules.json` at the top.
pub struct JsonFileRepository {
    data_dir: PathBuf,
    runs_dir: PathBuf,
    /// Serializes read-modify-write cycles on the shared JSON files.
    file_lock: tokio::sync::Mutex<()>,
}

impl JsonFileRepository {
    /// Open (and create if needed) the data directory.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        let runs_dir = data_dir.join("runs");
        std::fs::create_dir_all(&runs_dir)?;
        Ok(Self {
            data_dir,
            runs_dir,
            file_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir.join(format!("{}.json", run_id))
    }

    fn configs_path(&self) -> PathBuf {
        self.data_dir.join("test_configs.json")
    }

    fn schedules_path(&self) -> PathBuf {
        self.data_dir.join("schedules.json")
    }

    fn read_json<T: Default + for<'de> Deserialize<'de>>(path: &Path) -> Result<T, StorageError> {
        if !path.exists() {
            return Ok(T::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
        let encoded = serde_json::to_string_pretty(value)?;
        std::fs::write(path, encoded)?;
        Ok(())
    }

    fn load_all_runs(&self) -> Result<Vec<RunResult>, StorageError> {
        let mut runs = Vec::new();
        for entry in std::fs::read_dir(&self.runs_dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            let raw = std::fs::read_to_string(&path)?;
            match serde_json::from_str::<RunResult>(&raw) {
                Ok(run) => runs.push(run),
                Err(e) => {
                    // A corrupt record should not hide every other run.
                    warn!(path = %path.display(), error = %e, "Skipping unreadable run record");
                }
            }
        }
        Ok(runs)
    }
}

#[async_trait]
impl RunRepository for JsonFileRepository {
    async fn save(&self, result: &RunResult) -> Result<(), StorageError> {
        Self::write_json(&self.run_path(result.id), result)?;
        debug!(run_id = %result.id, "Persisted run record");
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<RunResult>, StorageError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn delete(&self, run_id: Uuid) -> Result<bool, StorageError> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)?;
        Ok(true)
    }

    async fn list(&self, query: &RunQuery) -> Result<(Vec<RunResult>, usize), StorageError> {
        Ok(apply_query(self.load_all_runs()?, query))
    }

    async fn save_test_config(&self, config: &TestConfig) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut configs: HashMap<String, TestConfig> = Self::read_json(&self.configs_path())?;
        upsert_config(&mut configs, config);
        Self::write_json(&self.configs_path(), &configs)
    }

    async fn get_test_config(&self, name: &str) -> Result<Option<TestConfig>, StorageError> {
        let _guard = self.file_lock.lock().await;
        let configs: HashMap<String, TestConfig> = Self::read_json(&self.configs_path())?;
        Ok(configs.get(name).cloned())
    }

    async fn list_test_configs(&self, enabled_only: bool) -> Result<Vec<TestConfig>, StorageError> {
        let _guard = self.file_lock.lock().await;
        let configs: HashMap<String, TestConfig> = Self::read_json(&self.configs_path())?;
        let mut configs: Vec<TestConfig> = configs
            .into_values()
            .filter(|c| !enabled_only || c.enabled)
            .collect();
        configs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(configs)
    }

    async fn set_test_enabled(&self, name: &str, enabled: bool) -> Result<bool, StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut configs: HashMap<String, TestConfig> = Self::read_json(&self.configs_path())?;
        match configs.get_mut(name) {
            Some(config) => {
                config.enabled = enabled;
                config.updated_at = Utc::now();
                Self::write_json(&self.configs_path(), &configs)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_test_config(&self, name: &str) -> Result<bool, StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut configs: HashMap<String, TestConfig> = Self::read_json(&self.configs_path())?;
        let removed = configs.remove(name).is_some();
        if removed {
            Self::write_json(&self.configs_path(), &configs)?;
        }
        Ok(removed)
    }
}

#[async_trait]
impl ScheduleRepository for JsonFileRepository {
    async fn save_schedule(&self, config: &ScheduleConfig) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut state: ScheduleState = Self::read_json(&self.schedules_path())?;
        state.schedules.insert(config.id, config.clone());
        Self::write_json(&self.schedules_path(), &state)
    }

    async fn delete_schedule(&self, schedule_id: Uuid) -> Result<bool, StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut state: ScheduleState = Self::read_json(&self.schedules_path())?;
        let removed = state.schedules.remove(&schedule_id).is_some();
        if removed {
            Self::write_json(&self.schedules_path(), &state)?;
        }
        Ok(removed)
    }

    async fn list_schedules(&self) -> Result<Vec<ScheduleConfig>, StorageError> {
        let _guard = self.file_lock.lock().await;
        let state: ScheduleState = Self::read_json(&self.schedules_path())?;
        let mut schedules: Vec<ScheduleConfig> = state.schedules.into_values().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn record_run(&self, record: &ScheduleRun) -> Result<(), StorageError> {
        let _guard = self.file_lock.lock().await;
        let mut state: ScheduleState = Self::read_json(&self.schedules_path())?;
        state.recent_runs.insert(0, record.clone());
        state.recent_runs.truncate(100);
        Self::write_json(&self.schedules_path(), &state)
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<ScheduleRun>, StorageError> {
        let _guard = self.file_lock.lock().await;
        let state: ScheduleState = Self::read_json(&self.schedules_path())?;
        Ok(state.recent_runs.into_iter().take(limit).collect())
    }
}

/// The repository pair used by the orchestrator and the schedule manager.
/// Both handles point at the same backend instance.
pub struct Repositories {
    pub runs: Arc<dyn RunRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
}

/// Build the repository backend selected by the service configuration.
pub fn create_repositories(config: &ServiceConfig) -> Result<Repositories, StorageError> {
    match config.storage {
        StorageKind::Memory => {
            let backend = Arc::new(MemoryRepository::new());
            Ok(Repositories {
                runs: backend.clone(),
                schedules: backend,
            })
        }
        StorageKind::Json => {
            let backend = Arc::new(JsonFileRepository::new(&config.data_dir)?);
            Ok(Repositories {
                runs: backend.clone(),
                schedules: backend,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_named(name: &str, status: RunStatus) -> RunResult {
        let spec = serde_json::from_value(serde_json::json!({
            "name": name,
            "url": "https://example.com"
        }))
        .unwrap();
        let mut run = RunResult::new(spec);
        run.status = status;
        run
    }

    #[tokio::test]
    async fn memory_round_trip_and_delete() {
        let repo = MemoryRepository::new();
        let run = run_named("t", RunStatus::Completed);

        repo.save(&run).await.unwrap();
        let loaded = repo.load(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.id, run.id);

        assert!(repo.delete(run.id).await.unwrap());
        assert!(!repo.delete(run.id).await.unwrap());
        assert!(repo.load(run.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_filters_and_pages() {
        let repo = MemoryRepository::new();
        for i in 0..5 {
            let status = if i % 2 == 0 {
                RunStatus::Completed
            } else {
                RunStatus::Failed
            };
            repo.save(&run_named(&format!("run-{}", i), status)).await.unwrap();
        }

        let (all, total) = repo.list(&RunQuery::default()).await.unwrap();
        assert_eq!(total, 5);
        assert_eq!(all.len(), 5);

        let (completed, total) = repo
            .list(&RunQuery {
                status: Some(RunStatus::Completed),
                ..RunQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 3);
        assert!(completed.iter().all(|r| r.status == RunStatus::Completed));

        let (named, total) = repo
            .list(&RunQuery {
                name: Some("run-1".to_string()),
                ..RunQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(named[0].spec.name, "run-1");

        let (page, total) = repo
            .list(&RunQuery {
                limit: 2,
                offset: 4,
                ..RunQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 1);
    }

    #[tokio::test]
    async fn test_config_upsert_preserves_created_at() {
        let repo = MemoryRepository::new();
        let first = TestConfig::new(run_named("api", RunStatus::Completed).spec);
        repo.save_test_config(&first).await.unwrap();

        let created_at = repo.get_test_config("api").await.unwrap().unwrap().created_at;

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = TestConfig::new(run_named("api", RunStatus::Completed).spec);
        repo.save_test_config(&second).await.unwrap();

        let stored = repo.get_test_config("api").await.unwrap().unwrap();
        assert_eq!(stored.created_at, created_at);
        assert!(stored.updated_at > created_at);
    }

    #[tokio::test]
    async fn test_config_enable_toggle_and_listing() {
        let repo = MemoryRepository::new();
        repo.save_test_config(&TestConfig::new(run_named("a", RunStatus::Completed).spec))
            .await
            .unwrap();
        repo.save_test_config(&TestConfig::new(run_named("b", RunStatus::Completed).spec))
            .await
            .unwrap();

        assert!(repo.set_test_enabled("a", false).await.unwrap());
        assert!(!repo.set_test_enabled("missing", false).await.unwrap());

        let enabled = repo.list_test_configs(true).await.unwrap();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].name, "b");

        assert!(repo.delete_test_config("a").await.unwrap());
        assert!(!repo.delete_test_config("a").await.unwrap());
    }
}
