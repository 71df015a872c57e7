//! 数据仓储层接口定义
//!
//! - `TaskRepository` - 任务状态机：创建、认领、完成、失败重试、取消、依赖解析
//! - `TaskLogRepository` - 任务日志的追加与查询
//! - `WorkerRepository` - 进程注册与心跳
//!
//! 每一个会让任务进入 `pending` 的操作都必须向通知通道发布信号，
//! 每一个让任务进入终态的操作都必须在同一个事务内完成对子任务的解阻塞或级联取消。
//! PostgreSQL 实现与内存实现都遵循这一约定。

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::errors::QueueResult;
use crate::models::{
    CancelOutcome, ChildResolution, FailOutcome, NewTask, NewTaskLogEntry, OrphanRequeueReport,
    Task, TaskFailure, TaskLogEntry, TaskStateCounts, WorkerHeartbeat, WorkerRegistration,
};

/// 任务仓储接口
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 创建任务，初始状态由父任务状态决定:
    /// 无父任务或父任务 `done` 为 `pending`，父任务未结束为 `blocked`，
    /// 父任务 `failed`/`cancelled` 直接为 `cancelled`。
    async fn create(&self, task: &NewTask) -> QueueResult<Task>;

    async fn get_by_id(&self, id: i64) -> QueueResult<Option<Task>>;

    async fn list_children(&self, parent_id: i64) -> QueueResult<Vec<Task>>;

    /// 原子地认领最早入队且已到期的 `pending` 任务
    async fn claim_next(&self, server_name: &str) -> QueueResult<Option<Task>>;

    /// `running -> done`，并解阻塞所有直接子任务
    async fn complete(
        &self,
        id: i64,
        result: &Value,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution>;

    /// 记录一次失败：还有重试次数则延迟重新入队，否则进入终态并级联取消后代
    async fn fail(
        &self,
        id: i64,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: &Map<String, Value>,
    ) -> QueueResult<FailOutcome>;

    /// 执行体观察到取消请求后 `running -> cancelled`，并级联取消后代
    async fn mark_cancelled(
        &self,
        id: i64,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution>;

    /// 请求取消：未开始的任务直接取消，运行中的任务只做标记，终态任务不做修改
    async fn request_cancel(&self, id: i64) -> QueueResult<CancelOutcome>;

    async fn is_cancel_requested(&self, id: i64) -> QueueResult<bool>;

    async fn update_context(&self, id: i64, context: &Map<String, Value>) -> QueueResult<()>;

    /// 将指定进程认领但未完成的任务按失败(WorkerLost)处理，计入重试次数
    async fn requeue_orphaned(&self, server_name: &str) -> QueueResult<OrphanRequeueReport>;

    /// 已进入终态但仍有 `blocked` 子任务的父任务
    async fn find_unresolved_parents(&self, limit: i64) -> QueueResult<Vec<i64>>;

    /// 按父任务当前状态处理其子任务
    async fn resolve_children(&self, parent_id: i64) -> QueueResult<ChildResolution>;

    async fn count_by_state(&self) -> QueueResult<TaskStateCounts>;

    /// 取消所有尚未开始的任务，保留记录用于审计
    async fn cancel_all_pending(&self) -> QueueResult<u64>;

    /// 是否存在同名且未结束的任务
    async fn has_active_named(&self, name: &str) -> QueueResult<bool>;
}

/// 任务日志仓储接口
#[async_trait]
pub trait TaskLogRepository: Send + Sync {
    async fn append(&self, entries: &[NewTaskLogEntry]) -> QueueResult<()>;

    async fn list_for_task(&self, task_id: i64) -> QueueResult<Vec<TaskLogEntry>>;
}

/// Worker注册仓储接口
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 注册进程，`server_name` 已存在时覆盖并重新标记为运行中
    async fn register(&self, registration: &WorkerRegistration) -> QueueResult<WorkerRegistration>;

    /// 原子地占用 `server_name`
    ///
    /// 已有注册仍在运行且最后心跳不早于 `stale_before` 时不做修改并返回 `None`。
    async fn register_exclusive(
        &self,
        registration: &WorkerRegistration,
        stale_before: DateTime<Utc>,
    ) -> QueueResult<Option<WorkerRegistration>>;

    async fn heartbeat(&self, server_name: &str, heartbeat: &WorkerHeartbeat) -> QueueResult<()>;

    async fn mark_stopped(&self, server_name: &str) -> QueueResult<()>;

    async fn get(&self, server_name: &str) -> QueueResult<Option<WorkerRegistration>>;

    async fn list_all(&self) -> QueueResult<Vec<WorkerRegistration>>;

    /// 仍标记为运行中但最后心跳早于 `older_than` 的注册
    async fn find_stale(&self, older_than: DateTime<Utc>) -> QueueResult<Vec<WorkerRegistration>>;
}
