use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// 本地闭包任务的默认名称
pub const LOCAL_FUNCTION_NAME: &str = "local_function";

/// 队列任务
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: i64,
    pub name: String,
    pub executable: Executable,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub state: TaskState,
    pub parent_task_id: Option<i64>,
    pub context: Map<String, Value>,
    pub result: Option<Value>,
    pub error_message: Option<String>,
    /// 最近一次失败的类别，例如 `Timeout`、`WorkerLost` 或任务函数给出的错误类型
    pub error_kind: Option<String>,
    pub retries_done: i32,
    pub max_retries: i32,
    pub cancel_requested: bool,
    /// 认领该任务的进程(server_name)
    pub claimed_by: Option<String>,
    pub date_enqueued: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_done: Option<DateTime<Utc>>,
}

impl Task {
    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    /// 只有终态任务可以被重新创建执行
    pub fn can_be_restarted(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn has_retries_left(&self) -> bool {
        self.retries_done < self.max_retries
    }

    /// 基于当前任务构建一个重新执行用的新任务定义
    pub fn to_retry(&self) -> NewTask {
        NewTask {
            name: format!("{}_retry", self.name),
            executable: self.executable.clone(),
            args: self.args.clone(),
            kwargs: self.kwargs.clone(),
            parent_task_id: self.parent_task_id,
            max_retries: self.max_retries,
            context: self.context.clone(),
        }
    }
}

/// 待创建的任务定义
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewTask {
    pub name: String,
    pub executable: Executable,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
    pub parent_task_id: Option<i64>,
    pub max_retries: i32,
    pub context: Map<String, Value>,
}

impl NewTask {
    pub fn new(executable: Executable, max_retries: i32) -> Self {
        Self {
            name: executable.default_name(),
            executable,
            args: Vec::new(),
            kwargs: Map::new(),
            parent_task_id: None,
            max_retries,
            context: Map::new(),
        }
    }
}

/// 任务可执行体的引用
///
/// 导入路径必须在每个Worker进程的执行器注册表中存在；
/// 闭包以不透明字节加上声明的序列化方案保存，由对应的解码器还原。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Executable {
    ImportPath { path: String },
    SerializedClosure { scheme: String, blob: Vec<u8> },
}

impl Executable {
    pub fn import(path: impl Into<String>) -> Self {
        Executable::ImportPath { path: path.into() }
    }

    pub fn closure(scheme: impl Into<String>, blob: Vec<u8>) -> Self {
        Executable::SerializedClosure {
            scheme: scheme.into(),
            blob,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Executable::ImportPath { .. } => "import_path",
            Executable::SerializedClosure { .. } => "serialized_closure",
        }
    }

    /// 导入路径本身，闭包统一使用 `local_function`
    pub fn default_name(&self) -> String {
        match self {
            Executable::ImportPath { path } => path.clone(),
            Executable::SerializedClosure { .. } => LOCAL_FUNCTION_NAME.to_string(),
        }
    }

    /// 拆分为数据库列: (kind, path/scheme, blob)
    pub fn to_columns(&self) -> (&'static str, &str, Option<&[u8]>) {
        match self {
            Executable::ImportPath { path } => (self.kind(), path.as_str(), None),
            Executable::SerializedClosure { scheme, blob } => {
                (self.kind(), scheme.as_str(), Some(blob.as_slice()))
            }
        }
    }

    pub fn from_columns(kind: &str, reference: String, blob: Option<Vec<u8>>) -> Result<Self, String> {
        match kind {
            "import_path" => Ok(Executable::ImportPath { path: reference }),
            "serialized_closure" => Ok(Executable::SerializedClosure {
                scheme: reference,
                blob: blob.unwrap_or_default(),
            }),
            other => Err(format!("未知的可执行体类型: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Pending,
    Blocked,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl TaskState {
    pub const ALL: [TaskState; 6] = [
        TaskState::Pending,
        TaskState::Blocked,
        TaskState::Running,
        TaskState::Done,
        TaskState::Failed,
        TaskState::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "pending",
            TaskState::Blocked => "blocked",
            TaskState::Running => "running",
            TaskState::Done => "done",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// 终态中导致子任务级联取消的状态
    pub fn cascades_cancellation(&self) -> bool {
        matches!(self, TaskState::Failed | TaskState::Cancelled)
    }

    /// 状态机允许的转换
    ///
    /// `running -> pending` 表示失败后的自动重试(或孤儿任务重新入队)。
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (*self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Blocked, Pending)
                | (Blocked, Cancelled)
                | (Running, Done)
                | (Running, Failed)
                | (Running, Pending)
                | (Running, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskState::Pending),
            "blocked" => Ok(TaskState::Blocked),
            "running" => Ok(TaskState::Running),
            "done" => Ok(TaskState::Done),
            "failed" => Ok(TaskState::Failed),
            "cancelled" => Ok(TaskState::Cancelled),
            _ => Err(format!("Invalid task state: {s}")),
        }
    }
}

impl sqlx::Type<sqlx::Postgres> for TaskState {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        sqlx::postgres::PgTypeInfo::with_name("VARCHAR")
    }

    fn compatible(ty: &sqlx::postgres::PgTypeInfo) -> bool {
        <&str as sqlx::Type<sqlx::Postgres>>::compatible(ty)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Postgres> for TaskState {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Postgres>>::decode(value)?;
        Ok(s.parse::<TaskState>()?)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Postgres> for TaskState {
    fn encode_by_ref(
        &self,
        buf: &mut sqlx::postgres::PgArgumentBuffer,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Postgres>>::encode(self.as_str(), buf)
    }
}

/// 各状态的任务数量
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskStateCounts {
    pub pending: i64,
    pub blocked: i64,
    pub running: i64,
    pub done: i64,
    pub failed: i64,
    pub cancelled: i64,
}

impl TaskStateCounts {
    pub fn add(&mut self, state: TaskState, count: i64) {
        match state {
            TaskState::Pending => self.pending += count,
            TaskState::Blocked => self.blocked += count,
            TaskState::Running => self.running += count,
            TaskState::Done => self.done += count,
            TaskState::Failed => self.failed += count,
            TaskState::Cancelled => self.cancelled += count,
        }
    }

    pub fn get(&self, state: TaskState) -> i64 {
        match state {
            TaskState::Pending => self.pending,
            TaskState::Blocked => self.blocked,
            TaskState::Running => self.running,
            TaskState::Done => self.done,
            TaskState::Failed => self.failed,
            TaskState::Cancelled => self.cancelled,
        }
    }

    pub fn total(&self) -> i64 {
        TaskState::ALL.iter().map(|state| self.get(*state)).sum()
    }
}

/// 一次执行尝试的结果，传递给 post_run 钩子
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Succeeded(Value),
    Failed { kind: String, message: String },
    TimedOut { seconds: u64 },
    Cancelled,
}

impl RunOutcome {
    pub fn result(&self) -> Option<&Value> {
        match self {
            RunOutcome::Succeeded(value) => Some(value),
            _ => None,
        }
    }

    /// 失败时的 (kind, message)
    pub fn error(&self) -> Option<(String, String)> {
        match self {
            RunOutcome::Failed { kind, message } => Some((kind.clone(), message.clone())),
            RunOutcome::TimedOut { seconds } => Some((
                FAILURE_KIND_TIMEOUT.to_string(),
                format!("任务执行超时: {seconds}秒"),
            )),
            _ => None,
        }
    }
}

pub const FAILURE_KIND_TIMEOUT: &str = "Timeout";
pub const FAILURE_KIND_WORKER_LOST: &str = "WorkerLost";

/// 记录到任务上的失败信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub kind: String,
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    pub fn worker_lost(server_name: &str) -> Self {
        Self::new(
            FAILURE_KIND_WORKER_LOST,
            format!("执行该任务的进程 {server_name} 已失联"),
        )
    }
}

/// `fail` 的结果: 重新入队或进入终态失败
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    Retrying {
        retries_done: i32,
        next_attempt_at: DateTime<Utc>,
    },
    Failed {
        cancelled_descendants: Vec<i64>,
    },
    /// 运行期间已收到取消请求，失败后不再重试
    Cancelled {
        cancelled_descendants: Vec<i64>,
    },
}

/// 取消请求的结果
#[derive(Debug, Clone, PartialEq)]
pub enum CancelOutcome {
    /// 任务未开始执行，已直接取消(连同其后代)
    Cancelled { cancelled_descendants: Vec<i64> },
    /// 任务正在运行，已标记取消请求
    Requested,
    /// 任务已处于终态，未做任何修改
    AlreadyFinished(TaskState),
}

/// 父任务进入终态后对子任务的处理结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildResolution {
    pub unblocked: Vec<i64>,
    pub cancelled: Vec<i64>,
}

impl ChildResolution {
    pub fn is_empty(&self) -> bool {
        self.unblocked.is_empty() && self.cancelled.is_empty()
    }
}

/// 孤儿任务恢复结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrphanRequeueReport {
    pub requeued: Vec<i64>,
    pub failed: Vec<i64>,
    pub cancelled_descendants: Vec<i64>,
}

impl OrphanRequeueReport {
    pub fn total(&self) -> usize {
        self.requeued.len() + self.failed.len()
    }

    pub fn merge(&mut self, other: OrphanRequeueReport) {
        self.requeued.extend(other.requeued);
        self.failed.extend(other.failed);
        self.cancelled_descendants.extend(other.cancelled_descendants);
    }
}
