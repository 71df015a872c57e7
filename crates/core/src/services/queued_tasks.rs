use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument};

use crate::config::QueueConfig;
use crate::context::set_path;
use crate::errors::{QueueError, QueueResult};
use crate::hooks::HookRegistry;
use crate::models::{CancelOutcome, Executable, NewTask, Task, TaskState, TaskStateCounts};
use crate::services::task_handle::{TaskHandle, TaskIdSender};
use crate::traits::TaskRepository;

/// 入队请求
///
/// 参数在加入请求时即序列化，序列化失败会在 `enqueue` 时同步返回。
#[derive(Debug, Clone)]
pub struct EnqueueRequest {
    executable: Executable,
    name: Option<String>,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
    context: Map<String, Value>,
    parent: Option<TaskHandle>,
    max_retries: Option<i32>,
    invalid: Option<String>,
}

impl EnqueueRequest {
    pub fn new(executable: Executable) -> Self {
        Self {
            executable,
            name: None,
            args: Vec::new(),
            kwargs: Map::new(),
            context: Map::new(),
            parent: None,
            max_retries: None,
            invalid: None,
        }
    }

    /// 以导入路径引用任务函数
    pub fn import(path: impl Into<String>) -> Self {
        Self::new(Executable::import(path))
    }

    /// 以序列化闭包作为任务函数
    pub fn closure(scheme: impl Into<String>, blob: Vec<u8>) -> Self {
        Self::new(Executable::closure(scheme, blob))
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn arg<T: Serialize>(mut self, value: T) -> Self {
        match serde_json::to_value(value) {
            Ok(value) => self.args.push(value),
            Err(e) => self.record_invalid(format!("位置参数 {} 无法序列化: {e}", self.args.len())),
        }
        self
    }

    pub fn kwarg<T: Serialize>(mut self, key: impl Into<String>, value: T) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(value) => {
                self.kwargs.insert(key, value);
            }
            Err(e) => self.record_invalid(format!("关键字参数 {key} 无法序列化: {e}")),
        }
        self
    }

    /// 设置初始上下文，键支持点号路径
    pub fn context<T: Serialize>(mut self, path: &str, value: T) -> Self {
        let result = serde_json::to_value(value)
            .map_err(QueueError::from)
            .and_then(|value| set_path(&mut self.context, path, value));
        if let Err(e) = result {
            self.record_invalid(format!("上下文 {path} 无效: {e}"));
        }
        self
    }

    pub fn parent(mut self, parent: &TaskHandle) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn max_retries(mut self, max_retries: i32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    fn record_invalid(&mut self, message: String) {
        if self.invalid.is_none() {
            self.invalid = Some(message);
        }
    }

    fn into_parts(self, default_max_retries: i32) -> QueueResult<(NewTask, Option<TaskHandle>)> {
        if let Some(message) = self.invalid {
            return Err(QueueError::Serialization(message));
        }
        let max_retries = self.max_retries.unwrap_or(default_max_retries);
        if max_retries < 0 {
            return Err(QueueError::Configuration(format!(
                "max_retries不能为负数: {max_retries}"
            )));
        }

        let mut task = NewTask::new(self.executable, max_retries);
        if let Some(name) = self.name {
            task.name = name;
        }
        task.args = self.args;
        task.kwargs = self.kwargs;
        task.context = self.context;
        Ok((task, self.parent))
    }
}

struct CreationRequest {
    task: NewTask,
    parent: Option<TaskHandle>,
    id_tx: TaskIdSender,
}

/// 生产者服务
///
/// `enqueue` 不访问数据库：请求交给后台创建处理器，处理器先等待父任务ID，
/// 再执行 pre_create 钩子、写入任务、执行 post_create 钩子。
/// 必须在tokio运行时内构建。
#[derive(Clone)]
pub struct QueuedTasks {
    tasks: Arc<dyn TaskRepository>,
    hooks: Arc<HookRegistry>,
    creation_tx: mpsc::UnboundedSender<CreationRequest>,
    default_max_retries: i32,
    wait_poll_interval: Duration,
}

impl QueuedTasks {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        hooks: Arc<HookRegistry>,
        default_max_retries: i32,
        wait_poll_interval: Duration,
    ) -> Self {
        let (creation_tx, creation_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::run_creation_processor(
            creation_rx,
            Arc::clone(&tasks),
            Arc::clone(&hooks),
        ));

        Self {
            tasks,
            hooks,
            creation_tx,
            default_max_retries,
            wait_poll_interval,
        }
    }

    pub fn from_config(
        tasks: Arc<dyn TaskRepository>,
        hooks: Arc<HookRegistry>,
        config: &QueueConfig,
    ) -> Self {
        Self::new(
            tasks,
            hooks,
            config.max_retries,
            config.wait_poll_interval(),
        )
    }

    /// 入队任务，立即返回任务引用
    pub fn enqueue(&self, request: EnqueueRequest) -> QueueResult<TaskHandle> {
        let (task, parent) = request.into_parts(self.default_max_retries)?;
        let (handle, id_tx) = TaskHandle::pending(Arc::clone(&self.tasks), self.wait_poll_interval);

        self.creation_tx
            .send(CreationRequest {
                task,
                parent,
                id_tx,
            })
            .map_err(|_| QueueError::Internal("任务创建处理器已停止".to_string()))?;

        Ok(handle)
    }

    /// 入队并等待任务写入存储
    pub async fn enqueue_now(&self, request: EnqueueRequest) -> QueueResult<Task> {
        let (task, parent) = request.into_parts(self.default_max_retries)?;
        Self::create_task(&self.tasks, &self.hooks, task, parent).await
    }

    /// 为已存在的任务创建引用
    pub fn handle(&self, id: i64) -> TaskHandle {
        TaskHandle::for_task(id, Arc::clone(&self.tasks), self.wait_poll_interval)
    }

    pub async fn get_task(&self, id: i64) -> QueueResult<Task> {
        self.tasks
            .get_by_id(id)
            .await?
            .ok_or(QueueError::TaskNotFound { id })
    }

    /// 以终态任务为模板重新创建一个任务
    #[instrument(skip(self), fields(task_id = %id))]
    pub async fn retry_task(&self, id: i64) -> QueueResult<TaskHandle> {
        let task = self.get_task(id).await?;
        if !task.can_be_restarted() {
            return Err(QueueError::InvalidStateTransition {
                id,
                from: task.state,
                to: TaskState::Pending,
            });
        }

        let created = Self::create_task(&self.tasks, &self.hooks, task.to_retry(), None).await?;
        info!("任务 {} 已重新创建为任务 {}", id, created.id);
        Ok(self.handle(created.id))
    }

    pub async fn cancel(&self, id: i64) -> QueueResult<CancelOutcome> {
        self.tasks.request_cancel(id).await
    }

    pub async fn pending_count(&self) -> QueueResult<i64> {
        Ok(self.tasks.count_by_state().await?.pending)
    }

    pub async fn state_counts(&self) -> QueueResult<TaskStateCounts> {
        self.tasks.count_by_state().await
    }

    /// 是否存在同名且未结束的任务
    pub async fn has_active_named(&self, name: &str) -> QueueResult<bool> {
        self.tasks.has_active_named(name).await
    }

    /// 取消所有尚未开始的任务
    pub async fn cancel_all_pending(&self) -> QueueResult<u64> {
        self.tasks.cancel_all_pending().await
    }

    async fn run_creation_processor(
        mut creation_rx: mpsc::UnboundedReceiver<CreationRequest>,
        tasks: Arc<dyn TaskRepository>,
        hooks: Arc<HookRegistry>,
    ) {
        while let Some(request) = creation_rx.recv().await {
            let parent_pending = request
                .parent
                .as_ref()
                .is_some_and(|parent| parent.id().is_none());

            if parent_pending {
                // 父任务ID尚未分配时另起任务等待，避免阻塞后续请求
                let tasks = Arc::clone(&tasks);
                let hooks = Arc::clone(&hooks);
                tokio::spawn(async move { Self::process_request(&tasks, &hooks, request).await });
            } else {
                Self::process_request(&tasks, &hooks, request).await;
            }
        }
        debug!("任务创建处理器退出");
    }

    async fn process_request(
        tasks: &Arc<dyn TaskRepository>,
        hooks: &HookRegistry,
        request: CreationRequest,
    ) {
        let CreationRequest {
            task,
            parent,
            id_tx,
        } = request;

        match Self::create_task(tasks, hooks, task, parent).await {
            Ok(created) => id_tx.assign(created.id),
            Err(e) => {
                error!("创建任务失败: {e}");
                id_tx.fail(e.to_string());
            }
        }
    }

    async fn create_task(
        tasks: &Arc<dyn TaskRepository>,
        hooks: &HookRegistry,
        mut task: NewTask,
        parent: Option<TaskHandle>,
    ) -> QueueResult<Task> {
        if let Some(parent) = parent {
            let parent_id = parent
                .get_task_id()
                .await
                .map_err(|e| QueueError::TaskCreation(format!("父任务不可用: {e}")))?;
            task.parent_task_id = Some(parent_id);
        }

        hooks.run_pre_create(&mut task).await;
        let created = tasks.create(&task).await?;
        debug!(
            task_id = created.id,
            state = %created.state,
            "任务已创建: {}",
            created.name
        );
        hooks.run_post_create(&created).await;
        Ok(created)
    }
}
