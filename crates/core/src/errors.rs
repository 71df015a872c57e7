use thiserror::Error;

use crate::models::TaskState;

/// 队列引擎错误类型定义
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移错误: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: i64 },

    #[error("Worker注册未找到: {server_name}")]
    WorkerNotFound { server_name: String },

    #[error("进程名称已被存活进程占用: {server_name}")]
    ServerNameInUse { server_name: String },

    #[error("无效的状态转换: 任务 {id} 从 {from} 到 {to}")]
    InvalidStateTransition {
        id: i64,
        from: TaskState,
        to: TaskState,
    },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("无效的上下文路径: {0}")]
    InvalidContextPath(String),

    #[error("未注册的任务函数: {0}")]
    ExecutorNotFound(String),

    #[error("未注册的闭包序列化方案: {0}")]
    ClosureCodecNotFound(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("任务执行超时: {seconds}秒")]
    ExecutionTimeout { seconds: u64 },

    #[error("通知通道错误: {0}")]
    Notifier(String),

    #[error("任务创建失败: {0}")]
    TaskCreation(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Serialization(err.to_string())
    }
}

impl QueueError {
    /// 是否为可以在本地重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            QueueError::Database(_) | QueueError::Notifier(_) | QueueError::Internal(_)
        )
    }
}

/// 统一的Result类型
pub type QueueResult<T> = std::result::Result<T, QueueError>;
