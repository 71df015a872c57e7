use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use qtask_core::{
    context::ContextTracker,
    hooks::{panic_message, HookRegistry},
    models::{FailOutcome, RunOutcome, Task, TaskFailure},
    traits::TaskRepository,
    QueueConfig, QueueError, QueueResult, RetryPolicy,
};

use crate::executor_registry::{ExecutorRegistry, TaskArgs, TaskError, DEFAULT_ERROR_KIND};
use crate::task_context::{CancellationFlag, TaskCancelled, TaskContext};
use crate::task_logger::TASK_SPAN_NAME;

/// 任务函数panic时记录的错误类别
pub const FAILURE_KIND_PANIC: &str = "Panic";

/// 一次执行尝试的结果
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionReport {
    pub task_id: i64,
    pub outcome: RunOutcome,
    /// 失败后重新入队时，下一次可被认领的时间
    pub retry_at: Option<DateTime<Utc>>,
    pub duration: Duration,
}

/// 已认领任务的执行流程
///
/// 依次执行 pre_run 钩子、任务函数(带超时与取消检查)、状态写回、post_run 钩子。
/// 任务函数在 `queued_task` span 内运行，期间的日志会被 `TaskLogLayer` 关联到任务。
#[derive(Clone)]
pub struct ExecutionRuntime {
    tasks: Arc<dyn TaskRepository>,
    registry: Arc<ExecutorRegistry>,
    hooks: Arc<HookRegistry>,
    server_name: Arc<str>,
    task_timeout: Duration,
    retry_policy: RetryPolicy,
    cancel_check_interval: Duration,
    auto_persist: bool,
}

impl ExecutionRuntime {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        registry: Arc<ExecutorRegistry>,
        hooks: Arc<HookRegistry>,
        server_name: &str,
        config: &QueueConfig,
    ) -> Self {
        Self {
            tasks,
            registry,
            hooks,
            server_name: Arc::from(server_name),
            task_timeout: config.task_timeout(),
            retry_policy: config.retry_policy(),
            cancel_check_interval: config.cancel_check_interval(),
            auto_persist: config.auto_persist_context,
        }
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// 执行一个已处于 `running` 的任务并写回最终状态
    ///
    /// 只有写回状态时的存储错误会返回 `Err`，任务函数本身的失败体现在 `outcome` 中。
    pub async fn execute(&self, task: Task) -> QueueResult<ExecutionReport> {
        let task = Arc::new(task);
        let task_id = task.id;
        let started = Instant::now();
        let span = info_span!(
            TASK_SPAN_NAME,
            task_id,
            task_name = %task.name,
            attempt = task.retries_done + 1
        );

        let context = ContextTracker::attached(
            task_id,
            task.context.clone(),
            Arc::clone(&self.tasks),
            self.auto_persist,
        );

        self.hooks
            .run_pre_run(&task, &context)
            .instrument(span.clone())
            .await;

        let outcome = self
            .run_body(&task, &context)
            .instrument(span.clone())
            .await;

        let retry_at = self
            .persist(&task, &context, &outcome)
            .instrument(span.clone())
            .await?;

        self.hooks
            .run_post_run(&task, &context, &outcome)
            .instrument(span)
            .await;

        let duration = started.elapsed();
        Self::record_metrics(&outcome, retry_at.is_some(), duration);

        Ok(ExecutionReport {
            task_id,
            outcome,
            retry_at,
            duration,
        })
    }

    async fn run_body(&self, task: &Arc<Task>, context: &ContextTracker) -> RunOutcome {
        let function = match self.registry.resolve(&task.executable) {
            Ok(function) => function,
            Err(e) => {
                error!("无法解析任务函数: {e}");
                return RunOutcome::Failed {
                    kind: resolution_error_kind(&e).to_string(),
                    message: e.to_string(),
                };
            }
        };

        let cancellation = CancellationFlag::new();
        if task.cancel_requested {
            cancellation.cancel();
        }
        let watcher = self.spawn_cancel_watcher(task.id, cancellation.clone());

        let ctx = TaskContext::new(
            Arc::clone(task),
            context.clone(),
            cancellation,
            &self.server_name,
        );
        let args = TaskArgs::new(task.args.clone(), task.kwargs.clone());

        info!("开始执行任务: {}", task.name);
        let body = AssertUnwindSafe(function.call(ctx, args)).catch_unwind();
        let outcome = match tokio::time::timeout(self.task_timeout, body).await {
            Ok(Ok(Ok(value))) => RunOutcome::Succeeded(value),
            Ok(Ok(Err(e))) => classify_error(e),
            Ok(Err(panic)) => RunOutcome::Failed {
                kind: FAILURE_KIND_PANIC.to_string(),
                message: panic_message(panic.as_ref()),
            },
            Err(_) => RunOutcome::TimedOut {
                seconds: self.task_timeout.as_secs(),
            },
        };
        watcher.abort();

        match &outcome {
            RunOutcome::Succeeded(_) => info!("任务执行成功"),
            RunOutcome::Cancelled => info!("任务观察到取消请求，已停止执行"),
            RunOutcome::TimedOut { seconds } => warn!("任务执行超时({}秒)", seconds),
            RunOutcome::Failed { kind, message } => error!(error_kind = %kind, "任务执行失败: {}", message),
        }
        outcome
    }

    /// 定期从存储读取取消标记
    fn spawn_cancel_watcher(&self, task_id: i64, flag: CancellationFlag) -> JoinHandle<()> {
        let tasks = Arc::clone(&self.tasks);
        let check_interval = self.cancel_check_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(check_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match tasks.is_cancel_requested(task_id).await {
                    Ok(true) => {
                        debug!(task_id, "收到取消请求");
                        flag.cancel();
                        break;
                    }
                    Ok(false) => {}
                    Err(e) => debug!(task_id, "读取取消标记失败: {}", e),
                }
            }
        })
    }

    async fn persist(
        &self,
        task: &Task,
        context: &ContextTracker,
        outcome: &RunOutcome,
    ) -> QueueResult<Option<DateTime<Utc>>> {
        let snapshot = context.snapshot();

        let written = match outcome {
            RunOutcome::Succeeded(value) => {
                self.tasks
                    .complete(task.id, value, &snapshot)
                    .await
                    .map(|resolution| {
                        if !resolution.unblocked.is_empty() {
                            info!("解除阻塞的子任务: {:?}", resolution.unblocked);
                        }
                        None
                    })
            }
            RunOutcome::Cancelled => {
                self.tasks
                    .mark_cancelled(task.id, &snapshot)
                    .await
                    .map(|resolution| {
                        if !resolution.cancelled.is_empty() {
                            info!("级联取消的后代任务: {:?}", resolution.cancelled);
                        }
                        None
                    })
            }
            RunOutcome::Failed { .. } | RunOutcome::TimedOut { .. } => {
                let (kind, message) = outcome.error().unwrap_or_else(|| {
                    (DEFAULT_ERROR_KIND.to_string(), String::new())
                });
                let failure = TaskFailure::new(kind, message);
                let delay = self.retry_policy.delay_for(task.retries_done);

                self.tasks
                    .fail(task.id, &failure, delay, &snapshot)
                    .await
                    .map(|fail_outcome| match fail_outcome {
                        FailOutcome::Retrying {
                            retries_done,
                            next_attempt_at,
                        } => {
                            info!(
                                "任务将在 {} 重试(已重试{}/{}次)",
                                next_attempt_at, retries_done, task.max_retries
                            );
                            Some(next_attempt_at)
                        }
                        FailOutcome::Failed {
                            cancelled_descendants,
                        } => {
                            warn!(
                                "任务最终失败，级联取消后代任务: {:?}",
                                cancelled_descendants
                            );
                            None
                        }
                        FailOutcome::Cancelled {
                            cancelled_descendants,
                        } => {
                            info!(
                                "任务运行期间被请求取消，不再重试，级联取消: {:?}",
                                cancelled_descendants
                            );
                            None
                        }
                    })
            }
        };

        match written {
            Ok(retry_at) => {
                context.mark_persisted();
                Ok(retry_at)
            }
            // 任务已被恢复流程接管
            Err(QueueError::InvalidStateTransition { id, from, to }) => {
                warn!("任务 {} 的状态已变为 {}，放弃写回 {}", id, from, to);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn record_metrics(outcome: &RunOutcome, retrying: bool, duration: Duration) {
        metrics::counter!("qtask_tasks_processed_total").increment(1);
        match outcome {
            RunOutcome::Succeeded(_) => {
                metrics::counter!("qtask_tasks_succeeded_total").increment(1);
            }
            RunOutcome::Cancelled => {
                metrics::counter!("qtask_tasks_cancelled_total").increment(1);
            }
            RunOutcome::TimedOut { .. } | RunOutcome::Failed { .. } => {
                metrics::counter!("qtask_tasks_failed_total").increment(1);
                if retrying {
                    metrics::counter!("qtask_tasks_retried_total").increment(1);
                }
            }
        }
        metrics::histogram!("qtask_task_duration_seconds").record(duration.as_secs_f64());
    }
}

fn resolution_error_kind(error: &QueueError) -> &'static str {
    match error {
        QueueError::ExecutorNotFound(_) => "ExecutorNotFound",
        QueueError::ClosureCodecNotFound(_) => "ClosureCodecNotFound",
        QueueError::Serialization(_) => "ClosureDecodeError",
        _ => DEFAULT_ERROR_KIND,
    }
}

/// 把任务函数返回的错误转换为执行结果
fn classify_error(error: anyhow::Error) -> RunOutcome {
    if error.downcast_ref::<TaskCancelled>().is_some() {
        return RunOutcome::Cancelled;
    }

    let kind = error
        .downcast_ref::<TaskError>()
        .map(|task_error| task_error.kind.clone())
        .unwrap_or_else(|| DEFAULT_ERROR_KIND.to_string());
    RunOutcome::Failed {
        kind,
        message: format!("{error:#}"),
    }
}
