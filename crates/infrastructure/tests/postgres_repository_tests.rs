use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use futures::StreamExt;
use serde_json::{json, Map};

use qtask_core::models::{
    CancelOutcome, FailOutcome, NewTaskLogEntry, TaskFailure, TaskLogLevel, TaskState,
    WorkerHeartbeat, FAILURE_KIND_WORKER_LOST,
};
use qtask_core::traits::{Notifier, TaskLogRepository, TaskRepository, WorkerRepository};
use qtask_infrastructure::{
    PgNotifier, PostgresTaskLogRepository, PostgresTaskRepository, PostgresWorkerRepository,
};
use qtask_testing_utils::{DatabaseTestContainer, TaskBuilder, WorkerRegistrationBuilder};

async fn setup() -> Result<(DatabaseTestContainer, PostgresTaskRepository)> {
    let container = DatabaseTestContainer::new().await?;
    container.run_migrations().await?;
    let repo = PostgresTaskRepository::new(container.pool.clone());
    Ok((container, repo))
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_complete_unblocks_children() -> Result<()> {
    let (_container, repo) = setup().await?;

    let parent = repo.create(&TaskBuilder::import("tests.parent").build()).await?;
    let child = repo
        .create(
            &TaskBuilder::import("tests.child")
                .with_parent(parent.id)
                .build(),
        )
        .await?;
    assert_eq!(parent.state, TaskState::Pending);
    assert_eq!(child.state, TaskState::Blocked);

    // 子任务阻塞期间只能认领到父任务
    let claimed = repo.claim_next("pg-host").await?.unwrap();
    assert_eq!(claimed.id, parent.id);
    assert_eq!(claimed.state, TaskState::Running);
    assert_eq!(claimed.claimed_by.as_deref(), Some("pg-host"));
    assert!(repo.claim_next("pg-host").await?.is_none());

    let mut context = Map::new();
    context.insert("rows".to_string(), json!(42));
    let resolution = repo.complete(parent.id, &json!({"ok": true}), &context).await?;
    assert_eq!(resolution.unblocked, vec![child.id]);

    let parent = repo.get_by_id(parent.id).await?.unwrap();
    assert_eq!(parent.state, TaskState::Done);
    assert_eq!(parent.result, Some(json!({"ok": true})));
    assert_eq!(parent.context.get("rows"), Some(&json!(42)));
    assert!(parent.date_done.is_some());

    let child = repo.claim_next("pg-host").await?.unwrap();
    assert_eq!(child.parent_task_id, Some(parent.id));
    assert!(child.date_started >= parent.date_done);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_claim_clears_stale_cancel_flag() -> Result<()> {
    let (container, repo) = setup().await?;

    let task = repo.create(&TaskBuilder::import("tests.retried").build()).await?;
    sqlx::query("UPDATE queued_tasks SET cancel_requested = TRUE WHERE id = $1")
        .bind(task.id)
        .execute(&container.pool)
        .await?;

    let claimed = repo.claim_next("pg-host").await?.unwrap();
    assert_eq!(claimed.id, task.id);
    assert!(!claimed.cancel_requested);
    assert!(!repo.is_cancel_requested(task.id).await?);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_fail_retries_then_cascades_cancellation() -> Result<()> {
    let (container, repo) = setup().await?;

    let task = repo
        .create(&TaskBuilder::import("tests.flaky").with_max_retries(1).build())
        .await?;
    let child = repo
        .create(&TaskBuilder::import("tests.child").with_parent(task.id).build())
        .await?;
    let grandchild = repo
        .create(&TaskBuilder::import("tests.grandchild").with_parent(child.id).build())
        .await?;

    repo.claim_next("pg-host").await?.unwrap();
    let failure = TaskFailure::new("ValueError", "bad input");
    let outcome = repo
        .fail(task.id, &failure, Duration::from_secs(60), &Map::new())
        .await?;
    assert!(matches!(outcome, FailOutcome::Retrying { retries_done: 1, .. }));

    // 延迟重试到期前不可认领
    assert!(repo.claim_next("pg-host").await?.is_none());
    container.make_due(task.id).await?;
    let retried = repo.claim_next("pg-host").await?.unwrap();
    assert_eq!(retried.id, task.id);
    assert_eq!(retried.retries_done, 1);

    let outcome = repo
        .fail(task.id, &failure, Duration::ZERO, &Map::new())
        .await?;
    match outcome {
        FailOutcome::Failed {
            cancelled_descendants,
        } => {
            let cancelled: HashSet<_> = cancelled_descendants.into_iter().collect();
            assert_eq!(cancelled, HashSet::from([child.id, grandchild.id]));
        }
        other => panic!("期望最终失败，实际为 {other:?}"),
    }

    let failed = repo.get_by_id(task.id).await?.unwrap();
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.error_kind.as_deref(), Some("ValueError"));
    assert_eq!(failed.error_message.as_deref(), Some("bad input"));
    assert_eq!(
        repo.get_by_id(grandchild.id).await?.unwrap().state,
        TaskState::Cancelled
    );

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_request_cancel_by_state() -> Result<()> {
    let (_container, repo) = setup().await?;

    let running = repo.create(&TaskBuilder::import("tests.long").build()).await?;
    repo.claim_next("pg-host").await?.unwrap();
    let pending = repo.create(&TaskBuilder::import("tests.pending").build()).await?;
    let child = repo
        .create(&TaskBuilder::import("tests.child").with_parent(pending.id).build())
        .await?;

    let outcome = repo.request_cancel(pending.id).await?;
    assert_eq!(
        outcome,
        CancelOutcome::Cancelled {
            cancelled_descendants: vec![child.id]
        }
    );

    assert_eq!(repo.request_cancel(running.id).await?, CancelOutcome::Requested);
    assert!(repo.is_cancel_requested(running.id).await?);

    repo.mark_cancelled(running.id, &Map::new()).await?;
    assert_eq!(
        repo.request_cancel(running.id).await?,
        CancelOutcome::AlreadyFinished(TaskState::Cancelled)
    );

    // 父任务已取消，新建的子任务直接进入取消状态
    let late_child = repo
        .create(&TaskBuilder::import("tests.late").with_parent(pending.id).build())
        .await?;
    assert_eq!(late_child.state, TaskState::Cancelled);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_concurrent_claims_never_share_a_task() -> Result<()> {
    let (_container, repo) = setup().await?;
    let repo = Arc::new(repo);

    for i in 0..40 {
        repo.create(&TaskBuilder::import("tests.batch").with_arg(json!(i)).build())
            .await?;
    }

    let mut claimers = Vec::new();
    for worker in 0..4 {
        let repo = Arc::clone(&repo);
        claimers.push(tokio::spawn(async move {
            let server_name = format!("pg-host-{worker}");
            let mut claimed = Vec::new();
            while let Some(task) = repo.claim_next(&server_name).await? {
                claimed.push(task.id);
            }
            anyhow::Ok(claimed)
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await??);
    }
    let unique: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), 40);
    assert_eq!(unique.len(), 40);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_requeue_orphaned_counts_against_retries() -> Result<()> {
    let (_container, repo) = setup().await?;

    let retryable = repo
        .create(&TaskBuilder::import("tests.orphan").with_max_retries(2).build())
        .await?;
    repo.claim_next("dead-host").await?.unwrap();
    let exhausted = repo
        .create(&TaskBuilder::import("tests.orphan").with_max_retries(0).build())
        .await?;
    repo.claim_next("dead-host").await?.unwrap();

    let report = repo.requeue_orphaned("dead-host").await?;
    assert_eq!(report.requeued, vec![retryable.id]);
    assert_eq!(report.failed, vec![exhausted.id]);

    let requeued = repo.get_by_id(retryable.id).await?.unwrap();
    assert_eq!(requeued.state, TaskState::Pending);
    assert_eq!(requeued.retries_done, 1);
    assert_eq!(requeued.error_kind.as_deref(), Some(FAILURE_KIND_WORKER_LOST));

    let failed = repo.get_by_id(exhausted.id).await?.unwrap();
    assert_eq!(failed.state, TaskState::Failed);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_counts_clear_and_active_names() -> Result<()> {
    let (_container, repo) = setup().await?;

    let parent = repo
        .create(&TaskBuilder::import("tests.report").with_name("nightly").build())
        .await?;
    repo.create(&TaskBuilder::import("tests.child").with_parent(parent.id).build())
        .await?;
    assert!(repo.has_active_named("nightly").await?);

    let counts = repo.count_by_state().await?;
    assert_eq!(counts.pending, 1);
    assert_eq!(counts.blocked, 1);

    assert_eq!(repo.cancel_all_pending().await?, 2);
    let counts = repo.count_by_state().await?;
    assert_eq!(counts.cancelled, 2);
    assert_eq!(counts.total(), 2);
    assert!(!repo.has_active_named("nightly").await?);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_worker_registration_lifecycle() -> Result<()> {
    let (container, _repo) = setup().await?;
    let workers = PostgresWorkerRepository::new(container.pool.clone());

    workers
        .register(&WorkerRegistrationBuilder::new("host-a").with_max_workers(8).build())
        .await?;
    workers
        .register(&WorkerRegistrationBuilder::new("host-b").build())
        .await?;

    workers
        .heartbeat(
            "host-a",
            &WorkerHeartbeat {
                max_workers: 8,
                active_workers: 3,
                idle_workers: 2,
            },
        )
        .await?;
    let host_a = workers.get("host-a").await?.unwrap();
    assert_eq!(host_a.active_workers, 3);
    assert_eq!(host_a.idle_workers, 2);
    assert!(host_a.is_running);

    container.expire_heartbeat("host-b", 600).await?;
    let stale = workers
        .find_stale(Utc::now() - chrono::Duration::seconds(120))
        .await?;
    assert_eq!(stale.len(), 1);
    assert_eq!(stale[0].server_name, "host-b");

    workers.mark_stopped("host-b").await?;
    assert!(workers
        .find_stale(Utc::now() - chrono::Duration::seconds(120))
        .await?
        .is_empty());
    assert_eq!(workers.list_all().await?.len(), 2);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_register_exclusive_refuses_live_holder() -> Result<()> {
    let (container, _repo) = setup().await?;
    let workers = PostgresWorkerRepository::new(container.pool.clone());
    let cutoff = || Utc::now() - chrono::Duration::seconds(120);

    let holder = WorkerRegistrationBuilder::new("shared-host").with_max_workers(2).build();
    assert!(workers.register_exclusive(&holder, cutoff()).await?.is_some());

    let contender = WorkerRegistrationBuilder::new("shared-host").with_max_workers(6).build();
    assert!(workers.register_exclusive(&contender, cutoff()).await?.is_none());
    assert_eq!(workers.get("shared-host").await?.unwrap().max_workers, 2);

    container.expire_heartbeat("shared-host", 600).await?;
    let taken = workers.register_exclusive(&contender, cutoff()).await?.unwrap();
    assert_eq!(taken.max_workers, 6);
    assert!(taken.is_running);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_task_logs_append_and_list() -> Result<()> {
    let (container, repo) = setup().await?;
    let logs = PostgresTaskLogRepository::new(container.pool.clone());

    let task = repo.create(&TaskBuilder::import("tests.chatty").build()).await?;
    let entry = |level: TaskLogLevel, message: &str| NewTaskLogEntry {
        task_id: task.id,
        log_type: level,
        logged_at: Utc::now(),
        name: "tests::chatty".to_string(),
        message: message.to_string(),
        info: None,
    };

    logs.append(&[
        entry(TaskLogLevel::Info, "开始"),
        entry(TaskLogLevel::Warning, "跳过空行"),
        entry(TaskLogLevel::Error, "失败"),
    ])
    .await?;

    let stored = logs.list_for_task(task.id).await?;
    let messages: Vec<_> = stored.iter().map(|log| log.message.as_str()).collect();
    assert_eq!(messages, vec!["开始", "跳过空行", "失败"]);
    assert_eq!(stored[1].log_type, TaskLogLevel::Warning);

    Ok(())
}

#[tokio::test]
#[ignore] // 需要Docker环境
async fn test_pg_notifier_receives_signal_on_create() -> Result<()> {
    let container = DatabaseTestContainer::new().await?;
    container.run_migrations().await?;

    let channel = "qtask_test_channel";
    let repo = PostgresTaskRepository::new(container.pool.clone())
        .with_notify_channel(Some(channel.to_string()));
    let notifier = PgNotifier::new(container.pool.clone(), channel);

    let mut signals = notifier.subscribe().await?;
    let task = repo.create(&TaskBuilder::import("tests.notify").build()).await?;

    let signal = tokio::time::timeout(Duration::from_secs(5), signals.next())
        .await?
        .unwrap()?;
    assert_eq!(signal.task_id, Some(task.id));

    Ok(())
}
