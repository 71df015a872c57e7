use std::sync::Arc;

use thiserror::Error;
use tokio::sync::watch;

use qtask_core::{context::ContextTracker, models::Task};

/// 任务函数观察到取消请求后返回的错误
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("任务已被取消")]
pub struct TaskCancelled;

/// 单次执行的取消标记
#[derive(Debug, Clone)]
pub struct CancellationFlag {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CancellationFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationFlag {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// 等待取消请求
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }
}

/// 传给任务函数的执行上下文
///
/// 每次执行尝试一个实例，克隆共享同一份上下文与取消标记。
#[derive(Debug, Clone)]
pub struct TaskContext {
    task: Arc<Task>,
    context: ContextTracker,
    cancellation: CancellationFlag,
    server_name: Arc<str>,
}

impl TaskContext {
    pub fn new(
        task: Arc<Task>,
        context: ContextTracker,
        cancellation: CancellationFlag,
        server_name: &str,
    ) -> Self {
        Self {
            task,
            context,
            cancellation,
            server_name: Arc::from(server_name),
        }
    }

    pub fn task_id(&self) -> i64 {
        self.task.id
    }

    pub fn task(&self) -> &Task {
        &self.task
    }

    /// 第几次执行，从1开始
    pub fn attempt(&self) -> i32 {
        self.task.retries_done + 1
    }

    pub fn context(&self) -> &ContextTracker {
        &self.context
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// 协作式取消检查点，收到取消请求时返回 `Err(TaskCancelled)`
    pub fn checkpoint(&self) -> Result<(), TaskCancelled> {
        if self.is_cancelled() {
            Err(TaskCancelled)
        } else {
            Ok(())
        }
    }

    /// 等待取消请求，可与任务自身的 future 一起 `select!`
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
