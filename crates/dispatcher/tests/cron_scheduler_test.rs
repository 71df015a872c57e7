use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};

use qtask_core::config::ScheduledTaskConfig;
use qtask_core::hooks::HookRegistry;
use qtask_core::models::TaskState;
use qtask_core::services::QueuedTasks;
use qtask_core::traits::TaskRepository;
use qtask_dispatcher::{CronSchedule, PeriodicTaskScheduler};
use qtask_infrastructure::InMemoryTaskStore;
use qtask_testing_utils::FlakyTaskRepository;
use serde_json::json;

fn every_minute(name: &str) -> ScheduledTaskConfig {
    ScheduledTaskConfig {
        name: name.to_string(),
        cron: "0 * * * * *".to_string(),
        executable: "maintenance.cleanup".to_string(),
        args: vec![json!("logs")],
        kwargs: Default::default(),
        context: Default::default(),
        max_retries: Some(1),
        enabled: true,
    }
}

fn queued_tasks(store: &InMemoryTaskStore) -> QueuedTasks {
    QueuedTasks::new(
        Arc::new(store.clone()),
        Arc::new(HookRegistry::new()),
        0,
        StdDuration::from_millis(10),
    )
}

#[test]
fn test_cron_schedule_next_time() {
    let schedule = CronSchedule::new("0 0 * * * *").unwrap();
    let from = Utc.with_ymd_and_hms(2025, 1, 1, 10, 30, 0).unwrap();
    assert_eq!(
        schedule.next_execution_time(from),
        Some(Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap())
    );
    assert!(schedule.should_trigger(from, Utc.with_ymd_and_hms(2025, 1, 1, 11, 0, 0).unwrap()));
    assert!(!schedule.should_trigger(from, Utc.with_ymd_and_hms(2025, 1, 1, 10, 59, 59).unwrap()));
    assert_eq!(schedule.upcoming_times(from, 3).len(), 3);
}

#[test]
fn test_invalid_cron_is_rejected() {
    assert!(CronSchedule::new("not a cron").is_err());
}

#[tokio::test]
async fn test_tick_enqueues_and_skips_while_active() {
    let store = InMemoryTaskStore::new();
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap();
    let config = every_minute("cleanup");
    let mut scheduler =
        PeriodicTaskScheduler::new(queued_tasks(&store), [&config], start).unwrap();

    assert!(scheduler.tick(start + Duration::seconds(10)).await.is_empty());

    let created = scheduler.tick(start + Duration::seconds(30)).await;
    assert_eq!(created.len(), 1);
    let task = store.get_by_id(created[0]).await.unwrap().unwrap();
    assert_eq!(task.name, "cleanup");
    assert_eq!(task.args, vec![json!("logs")]);
    assert_eq!(task.max_retries, 1);

    // 上一次触发的任务仍是 pending，下一分钟不会重复创建
    assert!(scheduler.tick(start + Duration::seconds(90)).await.is_empty());

    store.request_cancel(task.id).await.unwrap();
    assert_eq!(
        store.get_by_id(task.id).await.unwrap().unwrap().state,
        TaskState::Cancelled
    );
    let created = scheduler.tick(start + Duration::seconds(150)).await;
    assert_eq!(created.len(), 1);
}

#[tokio::test]
async fn test_failed_trigger_is_retried_on_next_tick() {
    let store = InMemoryTaskStore::new();
    let flaky = Arc::new(FlakyTaskRepository::new(Arc::new(store.clone()), 1));
    let queued_tasks = QueuedTasks::new(
        flaky,
        Arc::new(HookRegistry::new()),
        0,
        StdDuration::from_millis(10),
    );
    let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 30).unwrap();
    let config = every_minute("cleanup");
    let mut scheduler = PeriodicTaskScheduler::new(queued_tasks, [&config], start).unwrap();

    // 存储暂时不可用，本次触发没有创建任务
    assert!(scheduler.tick(start + Duration::seconds(30)).await.is_empty());

    // 同一个触发点在下一次检查时补上，而不是等到下一分钟
    let created = scheduler.tick(start + Duration::seconds(31)).await;
    assert_eq!(created.len(), 1);
    let task = store.get_by_id(created[0]).await.unwrap().unwrap();
    assert_eq!(task.name, "cleanup");

    assert!(scheduler.tick(start + Duration::seconds(32)).await.is_empty());
}
