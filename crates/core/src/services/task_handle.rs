use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::errors::{QueueError, QueueResult};
use crate::models::{CancelOutcome, Task, TaskState};
use crate::traits::TaskRepository;

/// `wait()` 的非成功结果
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskWaitError {
    #[error("任务执行失败 [{kind}]: {message}")]
    Failed { kind: String, message: String },

    #[error("任务已被取消")]
    Cancelled,
}

#[derive(Debug, Clone)]
enum IdSlot {
    Pending,
    Assigned(i64),
    Failed(String),
}

/// 生产者一侧用来回填任务ID的发送端
pub(crate) struct TaskIdSender(watch::Sender<IdSlot>);

impl TaskIdSender {
    pub(crate) fn assign(&self, id: i64) {
        let _ = self.0.send(IdSlot::Assigned(id));
    }

    pub(crate) fn fail(&self, message: impl Into<String>) {
        let _ = self.0.send(IdSlot::Failed(message.into()));
    }
}

/// 任务引用
///
/// 入队时立即返回，只是任务记录的一个视图：状态总是从存储中读取。
/// 任务ID在创建请求被处理后才会分配。
#[derive(Clone)]
pub struct TaskHandle {
    id_rx: watch::Receiver<IdSlot>,
    tasks: Arc<dyn TaskRepository>,
    poll_interval: Duration,
}

impl fmt::Debug for TaskHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskHandle")
            .field("id", &*self.id_rx.borrow())
            .finish()
    }
}

impl TaskHandle {
    pub(crate) fn pending(
        tasks: Arc<dyn TaskRepository>,
        poll_interval: Duration,
    ) -> (Self, TaskIdSender) {
        let (id_tx, id_rx) = watch::channel(IdSlot::Pending);
        (
            Self {
                id_rx,
                tasks,
                poll_interval,
            },
            TaskIdSender(id_tx),
        )
    }

    /// 为已存在的任务创建引用
    pub fn for_task(id: i64, tasks: Arc<dyn TaskRepository>, poll_interval: Duration) -> Self {
        let (_, id_rx) = watch::channel(IdSlot::Assigned(id));
        Self {
            id_rx,
            tasks,
            poll_interval,
        }
    }

    /// 已分配的任务ID，不等待
    pub fn id(&self) -> Option<i64> {
        match &*self.id_rx.borrow() {
            IdSlot::Assigned(id) => Some(*id),
            _ => None,
        }
    }

    /// 等待任务ID分配
    pub async fn get_task_id(&self) -> QueueResult<i64> {
        let mut id_rx = self.id_rx.clone();
        let slot = id_rx
            .wait_for(|slot| !matches!(slot, IdSlot::Pending))
            .await
            .map(|slot| slot.clone());

        match slot {
            Ok(IdSlot::Assigned(id)) => Ok(id),
            Ok(IdSlot::Failed(message)) => Err(QueueError::TaskCreation(message)),
            Ok(IdSlot::Pending) | Err(_) => Err(QueueError::TaskCreation(
                "任务创建请求在分配ID之前被丢弃".to_string(),
            )),
        }
    }

    pub async fn get_task(&self) -> QueueResult<Task> {
        let id = self.get_task_id().await?;
        self.tasks
            .get_by_id(id)
            .await?
            .ok_or(QueueError::TaskNotFound { id })
    }

    /// 从存储读取当前状态
    pub async fn get_state(&self) -> QueueResult<TaskState> {
        Ok(self.get_task().await?.state)
    }

    /// 发出取消请求，不等待结果
    pub fn cancel(&self) {
        let handle = self.clone();
        tokio::spawn(async move {
            match handle.cancel_and_confirm().await {
                Ok(outcome) => debug!("取消请求已处理: {outcome:?}"),
                Err(e) => warn!("取消任务失败: {e}"),
            }
        });
    }

    /// 发出取消请求并返回处理结果
    pub async fn cancel_and_confirm(&self) -> QueueResult<CancelOutcome> {
        let id = self.get_task_id().await?;
        self.tasks.request_cancel(id).await
    }

    /// 等待任务进入终态
    ///
    /// 成功时返回结果；存储访问的临时错误在内部重试，不会传给调用方。
    pub async fn wait(&self) -> Result<Value, TaskWaitError> {
        let id = self.get_task_id().await.map_err(|e| TaskWaitError::Failed {
            kind: "TaskCreation".to_string(),
            message: e.to_string(),
        })?;

        loop {
            match self.tasks.get_by_id(id).await {
                Ok(Some(task)) => match task.state {
                    TaskState::Done => return Ok(task.result.unwrap_or(Value::Null)),
                    TaskState::Failed => {
                        return Err(TaskWaitError::Failed {
                            kind: task.error_kind.unwrap_or_else(|| "Error".to_string()),
                            message: task.error_message.unwrap_or_default(),
                        })
                    }
                    TaskState::Cancelled => return Err(TaskWaitError::Cancelled),
                    _ => {}
                },
                Ok(None) => {
                    return Err(TaskWaitError::Failed {
                        kind: "TaskNotFound".to_string(),
                        message: QueueError::TaskNotFound { id }.to_string(),
                    })
                }
                Err(e) if e.is_transient() => {
                    warn!(task_id = id, "读取任务状态失败，稍后重试: {e}")
                }
                Err(e) => {
                    return Err(TaskWaitError::Failed {
                        kind: "StoreError".to_string(),
                        message: e.to_string(),
                    })
                }
            }

            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
