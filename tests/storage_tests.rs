//! JSON-file repository tests.

use chrono::Utc;
use tempfile::TempDir;
use uuid::Uuid;

use loadstorm::run::{RunResult, RunStatus, TestConfig};
use loadstorm::scheduler::{ScheduleConfig, ScheduleRun, ScheduleRunStatus, Trigger};
use loadstorm::spec::TestSpec;
use loadstorm::storage::{JsonFileRepository, RunQuery, RunRepository, ScheduleRepository};

fn spec_named(name: &str) -> TestSpec {
    serde_json::from_value(serde_json::json!({
        "name": name,
        "url": "https://example.com/api"
    }))
    .unwrap()
}

fn run_named(name: &str, status: RunStatus) -> RunResult {
    let mut run = RunResult::new(spec_named(name));
    run.status = status;
    run
}

fn repository() -> (JsonFileRepository, TempDir) {
    let dir = TempDir::new().unwrap();
    let repo = JsonFileRepository::new(dir.path()).unwrap();
    (repo, dir)
}

#[tokio::test]
async fn run_records_round_trip_through_files() {
    let (repo, dir) = repository();
    let mut run = run_named("persisted", RunStatus::Completed);
    run.metrics.total_requests = 10;
    run.metrics.status_code_counts.insert(200, 10);
    run.failure_reasons.push("P95 latency 120.0ms exceeds threshold 100ms".into());

    repo.save(&run).await.unwrap();
    assert!(dir.path().join("runs").join(format!("{}.json", run.id)).exists());

    let loaded = repo.load(run.id).await.unwrap().unwrap();
    assert_eq!(loaded.id, run.id);
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.metrics.status_code_counts.get(&200), Some(&10));
    assert_eq!(loaded.failure_reasons.len(), 1);
}

#[tokio::test]
async fn save_overwrites_existing_record() {
    let (repo, _dir) = repository();
    let mut run = run_named("evolving", RunStatus::Pending);
    repo.save(&run).await.unwrap();

    run.status = RunStatus::Completed;
    run.requests_completed = 100;
    repo.save(&run).await.unwrap();

    let loaded = repo.load(run.id).await.unwrap().unwrap();
    assert_eq!(loaded.status, RunStatus::Completed);
    assert_eq!(loaded.requests_completed, 100);
}

#[tokio::test]
async fn delete_returns_whether_removed() {
    let (repo, _dir) = repository();
    let run = run_named("doomed", RunStatus::Completed);
    repo.save(&run).await.unwrap();

    assert!(repo.delete(run.id).await.unwrap());
    assert!(!repo.delete(run.id).await.unwrap());
    assert!(repo.load(run.id).await.unwrap().is_none());
    assert!(repo.load(Uuid::new_v4()).await.unwrap().is_none());
}

#[tokio::test]
async fn list_filters_status_and_name() {
    let (repo, _dir) = repository();
    repo.save(&run_named("a", RunStatus::Completed)).await.unwrap();
    repo.save(&run_named("a", RunStatus::Failed)).await.unwrap();
    repo.save(&run_named("b", RunStatus::Completed)).await.unwrap();

    let (all, total) = repo.list(&RunQuery::default()).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(all.len(), 3);

    let (completed, total) = repo
        .list(&RunQuery {
            status: Some(RunStatus::Completed),
            ..RunQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(completed.iter().all(|r| r.status == RunStatus::Completed));

    let (named, total) = repo
        .list(&RunQuery {
            name: Some("a".to_string()),
            ..RunQuery::default()
        })
        .await
        .unwrap();
    assert_eq!(total, 2);
    assert!(named.iter().all(|r| r.spec.name == "a"));
}

#[tokio::test]
async fn corrupt_run_file_is_skipped() {
    let (repo, dir) = repository();
    repo.save(&run_named("good", RunStatus::Completed)).await.unwrap();
    std::fs::write(
        dir.path().join("runs").join(format!("{}.json", Uuid::new_v4())),
        "not json at all",
    )
    .unwrap();

    let (runs, total) = repo.list(&RunQuery::default()).await.unwrap();
    assert_eq!(total, 1);
    assert_eq!(runs[0].spec.name, "good");
}

#[tokio::test]
async fn test_configs_persist_across_instances() {
    let dir = TempDir::new().unwrap();
    {
        let repo = JsonFileRepository::new(dir.path()).unwrap();
        repo.save_test_config(&TestConfig::new(spec_named("api"))).await.unwrap();
    }

    let reopened = JsonFileRepository::new(dir.path()).unwrap();
    let config = reopened.get_test_config("api").await.unwrap().unwrap();
    assert_eq!(config.name, "api");
    assert!(config.enabled);

    assert!(reopened.set_test_enabled("api", false).await.unwrap());
    assert!(reopened.list_test_configs(true).await.unwrap().is_empty());
    assert_eq!(reopened.list_test_configs(false).await.unwrap().len(), 1);

    assert!(reopened.delete_test_config("api").await.unwrap());
    assert!(!reopened.delete_test_config("api").await.unwrap());
}

#[tokio::test]
async fn schedules_and_audit_trail_persist() {
    let (repo, _dir) = repository();
    let schedule = ScheduleConfig::new(
        "nightly",
        spec_named("api"),
        Trigger::Cron {
            minute: "0".into(),
            hour: "2".into(),
            day: "*".into(),
            month: "*".into(),
            day_of_week: "*".into(),
            timezone: "UTC".into(),
        },
    );
    let id = schedule.id;
    repo.save_schedule(&schedule).await.unwrap();

    let stored = repo.list_schedules().await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "nightly");

    let record = ScheduleRun {
        id: Uuid::new_v4(),
        schedule_id: id,
        run_id: Some(Uuid::new_v4()),
        triggered_at: Utc::now(),
        status: ScheduleRunStatus::Started,
        error: None,
    };
    repo.record_run(&record).await.unwrap();

    let recent = repo.recent_runs(10).await.unwrap();
    assert_eq!(recent.len(), 1);
    assert_eq!(recent[0].schedule_id, id);

    assert!(repo.delete_schedule(id).await.unwrap());
    assert!(!repo.delete_schedule(id).await.unwrap());
    assert!(repo.list_schedules().await.unwrap().is_empty());
}

#[tokio::test]
async fn recent_runs_newest_first_with_limit() {
    let (repo, _dir) = repository();
    let schedule_id = Uuid::new_v4();

    for _ in 0..5 {
        repo.record_run(&ScheduleRun {
            id: Uuid::new_v4(),
            schedule_id,
            run_id: None,
            triggered_at: Utc::now(),
            status: ScheduleRunStatus::Failed,
            error: Some("control API unreachable".into()),
        })
        .await
        .unwrap();
    }

    let limited = repo.recent_runs(3).await.unwrap();
    assert_eq!(limited.len(), 3);

    let all = repo.recent_runs(100).await.unwrap();
    assert_eq!(all.len(), 5);
    // Newest first.
    assert!(all.windows(2).all(|w| w[0].triggered_at >= w[1].triggered_at));
}
