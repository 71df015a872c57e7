use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use qtask_core::hooks::{HookPoint, HookRegistry};
use qtask_core::models::{Executable, RunOutcome, TaskState, FAILURE_KIND_TIMEOUT};
use qtask_core::traits::TaskRepository;
use qtask_core::QueueConfig;
use qtask_infrastructure::InMemoryTaskStore;
use qtask_testing_utils::{HookEvent, RecordingHook, TaskBuilder, TestEnv};
use qtask_worker::{
    ExecutionRuntime, ExecutorRegistry, TaskCancelled, TaskError, ECHO_TASK_PATH,
    FAILURE_KIND_PANIC,
};

const SERVER: &str = "runtime-test";

fn runtime_with(
    store: &InMemoryTaskStore,
    registry: ExecutorRegistry,
    hooks: HookRegistry,
    config: &QueueConfig,
) -> ExecutionRuntime {
    ExecutionRuntime::new(
        Arc::new(store.clone()),
        Arc::new(registry),
        Arc::new(hooks),
        SERVER,
        config,
    )
}

async fn claim(store: &InMemoryTaskStore, builder: TaskBuilder) -> qtask_core::models::Task {
    let created = store.create(&builder.build()).await.unwrap();
    let claimed = store.claim_next(SERVER).await.unwrap().unwrap();
    assert_eq!(claimed.id, created.id);
    claimed
}

#[tokio::test]
async fn test_successful_run_persists_result_and_runs_hooks() {
    let store = InMemoryTaskStore::new();
    let hook = RecordingHook::new();
    let mut hooks = HookRegistry::new();
    hooks.register(HookPoint::PreRun, Arc::new(hook.clone()));
    hooks.register(HookPoint::PostRun, Arc::new(hook.clone()));

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, ExecutorRegistry::with_builtins(), hooks, &config);

    let task = claim(
        &store,
        TaskBuilder::import(ECHO_TASK_PATH)
            .with_arg(json!("hello"))
            .with_kwarg("n", json!(3)),
    )
    .await;
    let report = runtime.execute(task.clone()).await.unwrap();

    let expected = json!({"args": ["hello"], "kwargs": {"n": 3}});
    assert_eq!(report.outcome, RunOutcome::Succeeded(expected.clone()));
    assert!(report.retry_at.is_none());

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Done);
    assert_eq!(stored.result, Some(expected.clone()));
    assert!(stored.date_done.is_some());

    assert_eq!(
        hook.events(),
        vec![
            HookEvent::PreRun(task.id),
            HookEvent::PostRun(task.id, RunOutcome::Succeeded(expected)),
        ]
    );
}

#[tokio::test]
async fn test_failure_with_retries_left_is_requeued() {
    let store = InMemoryTaskStore::new();
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("tests.fails", |_ctx, _args| async {
        Err(TaskError::new("ValueError", "invalid literal").into())
    });

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);

    let task = claim(&store, TaskBuilder::import("tests.fails").with_max_retries(1)).await;
    let report = runtime.execute(task.clone()).await.unwrap();
    assert!(report.retry_at.is_some());

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Pending);
    assert_eq!(stored.retries_done, 1);
    assert_eq!(stored.error_kind.as_deref(), Some("ValueError"));
    assert_eq!(stored.error_message.as_deref(), Some("invalid literal"));

    // 第二次失败后进入终态
    let task = store.claim_next(SERVER).await.unwrap().unwrap();
    let report = runtime.execute(task).await.unwrap();
    assert!(report.retry_at.is_none());
    let stored = store.get_by_id(stored.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Failed);
    assert_eq!(stored.retries_done, 1);
}

#[tokio::test]
async fn test_terminal_failure_cancels_descendants() {
    let store = InMemoryTaskStore::new();
    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(
        &store,
        ExecutorRegistry::with_builtins(),
        HookRegistry::new(),
        &config,
    );

    let parent = claim(
        &store,
        TaskBuilder::import(ECHO_TASK_PATH).with_kwarg("fail_with", json!("IOError")),
    )
    .await;
    let child = store
        .create(&TaskBuilder::import(ECHO_TASK_PATH).with_parent(parent.id).build())
        .await
        .unwrap();
    let grandchild = store
        .create(&TaskBuilder::import(ECHO_TASK_PATH).with_parent(child.id).build())
        .await
        .unwrap();
    assert_eq!(child.state, TaskState::Blocked);

    runtime.execute(parent.clone()).await.unwrap();

    for id in [child.id, grandchild.id] {
        let task = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(task.state, TaskState::Cancelled);
        assert!(task.date_started.is_none());
    }
}

#[tokio::test]
async fn test_timeout_is_recorded_as_failure_kind() {
    let store = InMemoryTaskStore::new();
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("tests.sleeps", |_ctx, _args| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(json!(null))
    });

    let config = QueueConfig {
        task_timeout_seconds: 1,
        ..TestEnv::fast_queue_config(SERVER)
    };
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);

    let task = claim(&store, TaskBuilder::import("tests.sleeps")).await;
    let report = runtime.execute(task.clone()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::TimedOut { seconds: 1 });

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Failed);
    assert_eq!(stored.error_kind.as_deref(), Some(FAILURE_KIND_TIMEOUT));
}

#[tokio::test]
async fn test_panicking_body_does_not_crash_worker() {
    let store = InMemoryTaskStore::new();
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("tests.panics", |_ctx, _args| async {
        if true {
            panic!("division by zero");
        }
        Ok(json!(null))
    });

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);

    let task = claim(&store, TaskBuilder::import("tests.panics")).await;
    let report = runtime.execute(task.clone()).await.unwrap();
    assert_eq!(
        report.outcome,
        RunOutcome::Failed {
            kind: FAILURE_KIND_PANIC.to_string(),
            message: "division by zero".to_string(),
        }
    );
    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Failed);
}

#[tokio::test]
async fn test_unknown_executable_fails_without_running() {
    let store = InMemoryTaskStore::new();
    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, ExecutorRegistry::new(), HookRegistry::new(), &config);

    let task = claim(&store, TaskBuilder::import("tests.not_registered")).await;
    runtime.execute(task.clone()).await.unwrap();
    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Failed);
    assert_eq!(stored.error_kind.as_deref(), Some("ExecutorNotFound"));

    let task = claim(
        &store,
        TaskBuilder::new().with_executable(Executable::closure("pickle", vec![0x80, 0x04])),
    )
    .await;
    runtime.execute(task.clone()).await.unwrap();
    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.error_kind.as_deref(), Some("ClosureCodecNotFound"));
}

#[tokio::test]
async fn test_running_task_observes_cancel_at_checkpoint() {
    let store = InMemoryTaskStore::new();
    let iterations = Arc::new(AtomicUsize::new(0));
    let mut registry = ExecutorRegistry::new();
    {
        let iterations = Arc::clone(&iterations);
        registry.register_fn("tests.loops", move |ctx, _args| {
            let iterations = Arc::clone(&iterations);
            async move {
                loop {
                    ctx.checkpoint()?;
                    iterations.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        });
    }

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);
    let task = claim(&store, TaskBuilder::import("tests.loops").with_max_retries(3)).await;
    let child = store
        .create(&TaskBuilder::import("tests.loops").with_parent(task.id).build())
        .await
        .unwrap();

    let execution = tokio::spawn({
        let runtime = runtime.clone();
        let task = task.clone();
        async move { runtime.execute(task).await }
    });
    assert!(
        TestEnv::wait_for(
            || {
                let started = iterations.load(Ordering::SeqCst) > 2;
                async move { started }
            },
            Duration::from_secs(2)
        )
        .await
    );
    store.request_cancel(task.id).await.unwrap();

    let report = tokio::time::timeout(Duration::from_secs(2), execution)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Cancelled);
    assert_eq!(stored.retries_done, 0);
    let child = store.get_by_id(child.id).await.unwrap().unwrap();
    assert_eq!(child.state, TaskState::Cancelled);
}

#[tokio::test]
async fn test_error_after_cancel_request_ends_cancelled() {
    let store = InMemoryTaskStore::new();
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("tests.ignores_cancel", |ctx, _args| async move {
        ctx.cancelled().await;
        // 没有返回 TaskCancelled，而是普通错误
        Err(anyhow::anyhow!("interrupted"))
    });

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);
    let task = claim(
        &store,
        TaskBuilder::import("tests.ignores_cancel").with_max_retries(5),
    )
    .await;

    let execution = tokio::spawn({
        let runtime = runtime.clone();
        let task = task.clone();
        async move { runtime.execute(task).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    store.request_cancel(task.id).await.unwrap();
    execution.await.unwrap().unwrap();

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Cancelled);
}

#[tokio::test]
async fn test_context_writes_are_visible_during_execution() {
    let store = InMemoryTaskStore::new();
    let observed = Arc::new(tokio::sync::Mutex::new(None));
    let mut registry = ExecutorRegistry::new();
    {
        let store = store.clone();
        let observed = Arc::clone(&observed);
        registry.register_fn("tests.progress", move |ctx, _args| {
            let store = store.clone();
            let observed = Arc::clone(&observed);
            async move {
                ctx.context().set("progress.percent", 50).await?;
                let snapshot = store.get_by_id(ctx.task_id()).await?;
                *observed.lock().await = snapshot.map(|task| task.context);

                ctx.context().set_deferred("progress.percent", 100)?;
                Ok(json!("done"))
            }
        });
    }

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);
    let task = claim(
        &store,
        TaskBuilder::import("tests.progress").with_context("step", json!("load")),
    )
    .await;
    runtime.execute(task.clone()).await.unwrap();

    let during = observed.lock().await.clone().unwrap();
    assert_eq!(during.get("step"), Some(&json!("load")));
    assert_eq!(during.get("progress"), Some(&json!({"percent": 50})));

    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.context.get("progress"), Some(&json!({"percent": 100})));
}

#[tokio::test]
async fn test_task_cancelled_error_is_not_retried() {
    let store = InMemoryTaskStore::new();
    let mut registry = ExecutorRegistry::new();
    registry.register_fn("tests.gives_up", |_ctx, _args| async {
        Err(TaskCancelled.into())
    });

    let config = TestEnv::fast_queue_config(SERVER);
    let runtime = runtime_with(&store, registry, HookRegistry::new(), &config);
    let task = claim(&store, TaskBuilder::import("tests.gives_up").with_max_retries(3)).await;

    let report = runtime.execute(task.clone()).await.unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    let stored = store.get_by_id(task.id).await.unwrap().unwrap();
    assert_eq!(stored.state, TaskState::Cancelled);
    assert_eq!(stored.retries_done, 0);
}
