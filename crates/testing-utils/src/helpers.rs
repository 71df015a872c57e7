//! Test helper utilities and common testing patterns

use std::time::Duration;

use qtask_core::config::QueueConfig;
use qtask_core::models::{Task, TaskState};
use qtask_core::traits::TaskRepository;
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Wait for a condition to be true with timeout
    pub async fn wait_for<F, Fut>(mut condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(Duration::from_millis(20)).await;
        }

        false
    }

    /// Queue configuration with short intervals so tests finish quickly
    pub fn fast_queue_config(server_name: &str) -> QueueConfig {
        QueueConfig {
            max_workers: 4,
            min_workers: 0,
            worker_idle_timeout_seconds: 1,
            polling_interval_seconds: 1,
            fallback_polling_interval_seconds: 1,
            task_timeout_seconds: 10,
            max_retries: 0,
            retry_backoff_base_ms: 0,
            retry_backoff_max_ms: 0,
            server_name: Some(server_name.to_string()),
            heartbeat_interval_seconds: 1,
            heartbeat_timeout_seconds: 5,
            drain_timeout_seconds: 2,
            cancel_check_interval_ms: 20,
            wait_poll_interval_ms: 20,
            ..QueueConfig::default()
        }
    }
}

/// Poll the store until the task reaches `state`
pub async fn wait_for_state(
    tasks: &dyn TaskRepository,
    task_id: i64,
    state: TaskState,
    timeout: Duration,
) -> Option<Task> {
    let start = std::time::Instant::now();

    while start.elapsed() < timeout {
        if let Ok(Some(task)) = tasks.get_by_id(task_id).await {
            if task.state == state {
                return Some(task);
            }
        }
        sleep(Duration::from_millis(20)).await;
    }

    None
}
