//! Scheduled runs: trigger variants, the timer core, and the schedule
//! manager that submits through the orchestrator.
//!
//! A [`ScheduleConfig`] pairs a spec with a [`Trigger`] (interval, cron,
//! or one-shot date). The [`Scheduler`] arms one timer task per enabled
//! schedule; on each fire the [`ScheduleManager`] enforces the `max_runs`
//! cap, records an audit entry, submits the spec through the
//! orchestrator, and persists the updated state.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::errors::ScheduleError;
use crate::orchestrator::Orchestrator;
use crate::spec::TestSpec;
use crate::storage::ScheduleRepository;

/// Firing rule of a schedule, tagged by `type` on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Trigger {
    /// Fire every N seconds, N being the sum of the components.
    Interval {
        #[serde(default)]
        seconds: u64,
        #[serde(default)]
        minutes: u64,
        #[serde(default)]
        hours: u64,
        #[serde(default)]
        days: u64,
    },
    /// Fire at times matching all five fields, in the given timezone.
    Cron {
        #[serde(default = "default_cron_field")]
        minute: String,
        #[serde(default = "default_cron_field")]
        hour: String,
        #[serde(default = "default_cron_field")]
        day: String,
        #[serde(default = "default_cron_field")]
        month: String,
        #[serde(default = "default_cron_field")]
        day_of_week: String,
        #[serde(default = "default_timezone")]
        timezone: String,
    },
    /// Fire once at the given instant; a date in the past never fires.
    Date { run_date: DateTime<Utc> },
}

fn default_cron_field() -> String {
    "*".to_string()
}

fn default_timezone() -> String {
    "UTC".to_string()
}

impl Trigger {
    /// Wire label of the variant.
    pub fn kind(&self) -> &'static str {
        match self {
            Trigger::Interval { .. } => "interval",
            Trigger::Cron { .. } => "cron",
            Trigger::Date { .. } => "date",
        }
    }

    /// Check the trigger can actually fire: a positive interval period, a
    /// parseable cron expression and timezone.
    pub fn validate(&self) -> Result<(), ScheduleError> {
        match self {
            Trigger::Interval { .. } => {
                if self.interval_period().is_none() {
                    return Err(ScheduleError::InvalidTrigger(
                        "interval period must be at least one second".to_string(),
                    ));
                }
                Ok(())
            }
            Trigger::Cron { timezone, .. } => {
                self.cron_schedule()?;
                Tz::from_str(timezone).map_err(|_| {
                    ScheduleError::InvalidTrigger(format!("unknown timezone: {}", timezone))
                })?;
                Ok(())
            }
            Trigger::Date { .. } => Ok(()),
        }
    }

    fn interval_period(&self) -> Option<Duration> {
        match self {
            Trigger::Interval {
                seconds,
                minutes,
                hours,
                days,
            } => {
                let total = seconds + minutes * 60 + hours * 3600 + days * 86400;
                (total >= 1).then(|| Duration::from_secs(total))
            }
            _ => None,
        }
    }

    fn cron_schedule(&self) -> Result<CronSchedule, ScheduleError> {
        match self {
            Trigger::Cron {
                minute,
                hour,
                day,
                month,
                day_of_week,
                ..
            } => {
                // The cron crate takes a seconds field; schedules fire on
                // the minute.
                let expression = format!("0 {} {} {} {} {}", minute, hour, day, month, day_of_week);
                CronSchedule::from_str(&expression).map_err(|e| {
                    ScheduleError::InvalidTrigger(format!(
                        "invalid cron expression '{}': {}",
                        expression, e
                    ))
                })
            }
            _ => Err(ScheduleError::InvalidTrigger("not a cron trigger".to_string())),
        }
    }

    /// The next fire instant after `now`, or `None` when the trigger is
    /// spent (one-shot date in the past).
    pub fn next_fire(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Interval { .. } => {
                let period = self.interval_period()?;
                Some(now + chrono::Duration::from_std(period).ok()?)
            }
            Trigger::Cron { timezone, .. } => {
                let schedule = self.cron_schedule().ok()?;
                let tz = Tz::from_str(timezone).ok()?;
                let next = schedule.after(&now.with_timezone(&tz)).next()?;
                Some(next.with_timezone(&Utc))
            }
            Trigger::Date { run_date } => (*run_date > now).then_some(*run_date),
        }
    }
}

/// Configuration for a scheduled test.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Test submitted on every fire.
    pub spec: TestSpec,
    pub trigger: Trigger,

    /// After this many fires the schedule disables itself.
    #[serde(default)]
    pub max_runs: Option<u64>,
    #[serde(default)]
    pub run_count: u64,

    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleConfig {
    pub fn new(name: impl Into<String>, spec: TestSpec, trigger: Trigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            description: None,
            enabled: true,
            spec,
            trigger,
            max_runs: None,
            run_count: 0,
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Outcome of one schedule fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleRunStatus {
    Triggered,
    Started,
    Failed,
}

/// Audit record of a schedule fire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleRun {
    pub id: Uuid,
    pub schedule_id: Uuid,
    pub run_id: Option<Uuid>,
    pub triggered_at: DateTime<Utc>,
    pub status: ScheduleRunStatus,
    pub error: Option<String>,
}

impl ScheduleRun {
    fn new(schedule_id: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            schedule_id,
            run_id: None,
            triggered_at: Utc::now(),
            status: ScheduleRunStatus::Triggered,
            error: None,
        }
    }
}

/// Point-in-time view of a schedule, including its next fire.
#[derive(Debug, Clone, Serialize)]
pub struct ScheduleStatus {
    pub id: Uuid,
    pub name: String,
    pub enabled: bool,
    pub paused: bool,
    pub next_run_time: Option<DateTime<Utc>>,
    pub trigger_type: &'static str,
    pub max_runs: Option<u64>,
    pub run_count: u64,
}

type FireCallback = Arc<dyn Fn(Uuid) + Send + Sync>;

struct Job {
    trigger: Trigger,
    callback: FireCallback,
    /// `None` while paused.
    handle: Option<JoinHandle<()>>,
}

/// Timer core: one tokio task per armed schedule, invoking the fire
/// callback at each trigger instant.
pub struct Scheduler {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
        }
    }

    /// Arm a trigger, replacing any existing job under the same id.
    pub fn add_job(&self, id: Uuid, trigger: Trigger, callback: FireCallback) {
        let handle = spawn_timer(id, trigger.clone(), callback.clone());
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(previous) = jobs.insert(
            id,
            Job {
                trigger,
                callback,
                handle: Some(handle),
            },
        ) {
            if let Some(handle) = previous.handle {
                handle.abort();
            }
        }
        debug!(schedule_id = %id, "Armed schedule trigger");
    }

    /// Disarm and forget a job.
    pub fn remove_job(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.remove(&id) {
            Some(job) => {
                if let Some(handle) = job.handle {
                    handle.abort();
                }
                debug!(schedule_id = %id, "Removed schedule trigger");
                true
            }
            None => false,
        }
    }

    /// Suspend firing without losing the armed state.
    pub fn pause_job(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) => {
                if let Some(handle) = job.handle.take() {
                    handle.abort();
                }
                true
            }
            None => false,
        }
    }

    /// Re-arm a paused job from now.
    pub fn resume_job(&self, id: Uuid) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.get_mut(&id) {
            Some(job) => {
                if job.handle.is_none() {
                    job.handle = Some(spawn_timer(id, job.trigger.clone(), job.callback.clone()));
                }
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.jobs.lock().unwrap().contains_key(&id)
    }

    /// Whether the job exists and is currently paused.
    pub fn is_paused(&self, id: Uuid) -> Option<bool> {
        self.jobs.lock().unwrap().get(&id).map(|job| job.handle.is_none())
    }

    /// The job's next fire instant; `None` for paused, spent, or unknown
    /// jobs.
    pub fn next_fire_time(&self, id: Uuid) -> Option<DateTime<Utc>> {
        let jobs = self.jobs.lock().unwrap();
        let job = jobs.get(&id)?;
        if job.handle.is_none() {
            return None;
        }
        job.trigger.next_fire(Utc::now())
    }

    /// Abort every timer task.
    pub fn shutdown(&self) {
        let mut jobs = self.jobs.lock().unwrap();
        for (_, job) in jobs.drain() {
            if let Some(handle) = job.handle {
                handle.abort();
            }
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_timer(id: Uuid, trigger: Trigger, callback: FireCallback) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let next = match trigger.next_fire(Utc::now()) {
                Some(next) => next,
                None => break,
            };
            let delay = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::ZERO);
            tokio::time::sleep(delay).await;

            callback(id);

            if matches!(trigger, Trigger::Date { .. }) {
                break;
            }
        }
    })
}

/// How many audit records are retained in memory.
const RECENT_RUNS_RETAINED: usize = 100;

struct ManagerInner {
    orchestrator: Arc<Orchestrator>,
    store: Arc<dyn ScheduleRepository>,
    schedules: Mutex<HashMap<Uuid, ScheduleConfig>>,
    recent_runs: Mutex<Vec<ScheduleRun>>,
    scheduler: Scheduler,
}

/// Holds schedule configs, arms their triggers, and routes fires into the
/// orchestrator's submit path.
pub struct ScheduleManager {
    inner: Arc<ManagerInner>,
}

impl ScheduleManager {
    pub fn new(orchestrator: Arc<Orchestrator>, store: Arc<dyn ScheduleRepository>) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                orchestrator,
                store,
                schedules: Mutex::new(HashMap::new()),
                recent_runs: Mutex::new(Vec::new()),
                scheduler: Scheduler::new(),
            }),
        }
    }

    /// Load persisted schedules and audit records, arming every enabled
    /// schedule.
    pub async fn start(&self) -> Result<(), ScheduleError> {
        let stored = self.inner.store.list_schedules().await?;
        let recent = self.inner.store.recent_runs(RECENT_RUNS_RETAINED).await?;
        info!(schedules = stored.len(), "Loaded schedules");

        *self.inner.recent_runs.lock().unwrap() = recent;
        for config in stored {
            let enabled = config.enabled;
            let id = config.id;
            let trigger = config.trigger.clone();
            self.inner.schedules.lock().unwrap().insert(id, config);
            if enabled {
                self.arm(id, trigger);
            }
        }
        Ok(())
    }

    /// Disarm every trigger. Configs stay loaded.
    pub fn stop(&self) {
        self.inner.scheduler.shutdown();
        info!("Scheduler stopped");
    }

    /// Add or replace a schedule; arms the trigger when enabled, persists
    /// either way.
    pub async fn add_schedule(&self, config: ScheduleConfig) -> Result<(), ScheduleError> {
        config.trigger.validate()?;

        let id = config.id;
        let enabled = config.enabled;
        let trigger = config.trigger.clone();
        self.inner.store.save_schedule(&config).await?;
        self.inner.schedules.lock().unwrap().insert(id, config);

        if enabled {
            self.arm(id, trigger);
        } else {
            self.inner.scheduler.remove_job(id);
            debug!(schedule_id = %id, "Schedule disabled, trigger not armed");
        }
        Ok(())
    }

    /// Remove a schedule from the scheduler and the store.
    pub async fn remove_schedule(&self, id: Uuid) -> Result<bool, ScheduleError> {
        let removed_config = self.inner.schedules.lock().unwrap().remove(&id).is_some();
        let removed_job = self.inner.scheduler.remove_job(id);
        let removed_store = self.inner.store.delete_schedule(id).await?;
        Ok(removed_config || removed_job || removed_store)
    }

    pub fn get_schedule(&self, id: Uuid) -> Option<ScheduleConfig> {
        self.inner.schedules.lock().unwrap().get(&id).cloned()
    }

    pub fn list_schedules(&self) -> Vec<ScheduleConfig> {
        let mut schedules: Vec<ScheduleConfig> =
            self.inner.schedules.lock().unwrap().values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        schedules
    }

    /// The most recent audit records, newest first.
    pub fn recent_runs(&self, limit: usize) -> Vec<ScheduleRun> {
        let runs = self.inner.recent_runs.lock().unwrap();
        runs.iter().take(limit).cloned().collect()
    }

    /// Status snapshot including pause state and next fire time.
    pub fn schedule_status(&self, id: Uuid) -> Option<ScheduleStatus> {
        let config = self.get_schedule(id)?;
        let paused = self.inner.scheduler.is_paused(id).unwrap_or(false);
        Some(ScheduleStatus {
            id,
            name: config.name.clone(),
            enabled: config.enabled,
            paused,
            next_run_time: self.inner.scheduler.next_fire_time(id),
            trigger_type: config.trigger.kind(),
            max_runs: config.max_runs,
            run_count: config.run_count,
        })
    }

    /// Suspend a schedule's next firing.
    pub fn pause_schedule(&self, id: Uuid) -> bool {
        let paused = self.inner.scheduler.pause_job(id);
        if paused {
            info!(schedule_id = %id, "Paused schedule");
        }
        paused
    }

    /// Re-arm a paused schedule.
    pub fn resume_schedule(&self, id: Uuid) -> bool {
        let resumed = self.inner.scheduler.resume_job(id);
        if resumed {
            info!(schedule_id = %id, "Resumed schedule");
        }
        resumed
    }

    fn arm(&self, id: Uuid, trigger: Trigger) {
        let weak = Arc::downgrade(&self.inner);
        let callback: FireCallback = Arc::new(move |schedule_id| {
            if let Some(inner) = weak.upgrade() {
                tokio::spawn(handle_fire(inner, schedule_id));
            }
        });
        self.inner.scheduler.add_job(id, trigger, callback);
    }
}

enum FireAction {
    Exhausted(ScheduleConfig),
    Submit(ScheduleConfig),
}

async fn handle_fire(inner: Arc<ManagerInner>, schedule_id: Uuid) {
    let action = {
        let mut schedules = inner.schedules.lock().unwrap();
        match schedules.get_mut(&schedule_id) {
            None => {
                warn!(schedule_id = %schedule_id, "Fired schedule not found");
                return;
            }
            Some(config) if config.max_runs.is_some_and(|max| config.run_count >= max) => {
                config.enabled = false;
                config.updated_at = Utc::now();
                FireAction::Exhausted(config.clone())
            }
            Some(config) => {
                config.run_count += 1;
                config.updated_at = Utc::now();
                FireAction::Submit(config.clone())
            }
        }
    };

    match action {
        FireAction::Exhausted(config) => {
            // The schedule is detached before any submission is attempted.
            info!(
                schedule = %config.name,
                max_runs = config.max_runs,
                "Schedule reached max_runs limit, disabling"
            );
            inner.scheduler.remove_job(schedule_id);
            if let Err(e) = inner.store.save_schedule(&config).await {
                error!(schedule_id = %schedule_id, error = %e, "Failed to persist disabled schedule");
            }
        }
        FireAction::Submit(config) => {
            info!(
                schedule = %config.name,
                run_count = config.run_count,
                "Executing scheduled test"
            );

            let mut record = ScheduleRun::new(schedule_id);
            match inner.orchestrator.submit(config.spec.clone()).await {
                Ok(run_id) => {
                    record.run_id = Some(run_id);
                    record.status = ScheduleRunStatus::Started;
                    info!(schedule = %config.name, run_id = %run_id, "Scheduled test started");
                }
                Err(e) => {
                    record.status = ScheduleRunStatus::Failed;
                    record.error = Some(e.to_string());
                    error!(schedule = %config.name, error = %e, "Failed to submit scheduled test");
                }
            }

            {
                let mut runs = inner.recent_runs.lock().unwrap();
                runs.insert(0, record.clone());
                runs.truncate(RECENT_RUNS_RETAINED);
            }
            if let Err(e) = inner.store.record_run(&record).await {
                error!(schedule_id = %schedule_id, error = %e, "Failed to persist schedule run record");
            }
            if let Err(e) = inner.store.save_schedule(&config).await {
                error!(schedule_id = %schedule_id, error = %e, "Failed to persist schedule state");
            }
        }
    }
}
