//! 生命周期钩子注册表
//!
//! 在进程启动时构建一次，以 `Arc<HookRegistry>` 的形式交给生产者和Worker。
//! 钩子按注册顺序依次执行；返回错误或panic的钩子只记录日志并跳过，不影响后续钩子和任务本身。

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use crate::context::ContextTracker;
use crate::models::{NewTask, RunOutcome, Task};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    PreCreate,
    PostCreate,
    PreRun,
    PostRun,
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HookPoint::PreCreate => "pre_create",
            HookPoint::PostCreate => "post_create",
            HookPoint::PreRun => "pre_run",
            HookPoint::PostRun => "post_run",
        };
        f.write_str(name)
    }
}

/// 队列钩子
///
/// 只需实现关心的方法，其余保持默认的空实现。
#[async_trait]
pub trait QueueHook: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// 任务写入存储之前调用，可以修改任务定义
    async fn pre_create(&self, _task: &mut NewTask) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_create(&self, _task: &Task) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_run(&self, _task: &Task, _context: &ContextTracker) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_run(
        &self,
        _task: &Task,
        _context: &ContextTracker,
        _outcome: &RunOutcome,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

type BoxHookFuture<'a> = Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>;

/// 钩子注册表
#[derive(Default, Clone)]
pub struct HookRegistry {
    pre_create: Vec<Arc<dyn QueueHook>>,
    post_create: Vec<Arc<dyn QueueHook>>,
    pre_run: Vec<Arc<dyn QueueHook>>,
    post_run: Vec<Arc<dyn QueueHook>>,
}

impl fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HookRegistry")
            .field("pre_create", &self.pre_create.len())
            .field("post_create", &self.post_create.len())
            .field("pre_run", &self.pre_run.len())
            .field("post_run", &self.post_run.len())
            .finish()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 在指定生命周期点注册钩子
    pub fn register(&mut self, point: HookPoint, hook: Arc<dyn QueueHook>) -> &mut Self {
        self.hooks_mut(point).push(hook);
        self
    }

    /// 在钩子实现的所有生命周期点注册
    pub fn register_all(&mut self, hook: Arc<dyn QueueHook>) -> &mut Self {
        for point in [
            HookPoint::PreCreate,
            HookPoint::PostCreate,
            HookPoint::PreRun,
            HookPoint::PostRun,
        ] {
            self.register(point, Arc::clone(&hook));
        }
        self
    }

    pub fn len(&self, point: HookPoint) -> usize {
        self.hooks(point).len()
    }

    pub fn is_empty(&self) -> bool {
        self.pre_create.is_empty()
            && self.post_create.is_empty()
            && self.pre_run.is_empty()
            && self.post_run.is_empty()
    }

    fn hooks(&self, point: HookPoint) -> &[Arc<dyn QueueHook>] {
        match point {
            HookPoint::PreCreate => &self.pre_create,
            HookPoint::PostCreate => &self.post_create,
            HookPoint::PreRun => &self.pre_run,
            HookPoint::PostRun => &self.post_run,
        }
    }

    fn hooks_mut(&mut self, point: HookPoint) -> &mut Vec<Arc<dyn QueueHook>> {
        match point {
            HookPoint::PreCreate => &mut self.pre_create,
            HookPoint::PostCreate => &mut self.post_create,
            HookPoint::PreRun => &mut self.pre_run,
            HookPoint::PostRun => &mut self.post_run,
        }
    }

    pub async fn run_pre_create(&self, task: &mut NewTask) {
        for hook in &self.pre_create {
            Self::guard(HookPoint::PreCreate, hook.name(), hook.pre_create(task)).await;
        }
    }

    pub async fn run_post_create(&self, task: &Task) {
        for hook in &self.post_create {
            Self::guard(HookPoint::PostCreate, hook.name(), hook.post_create(task)).await;
        }
    }

    pub async fn run_pre_run(&self, task: &Task, context: &ContextTracker) {
        for hook in &self.pre_run {
            Self::guard(HookPoint::PreRun, hook.name(), hook.pre_run(task, context)).await;
        }
    }

    pub async fn run_post_run(&self, task: &Task, context: &ContextTracker, outcome: &RunOutcome) {
        for hook in &self.post_run {
            Self::guard(
                HookPoint::PostRun,
                hook.name(),
                hook.post_run(task, context, outcome),
            )
            .await;
        }
    }

    async fn guard(point: HookPoint, name: &str, fut: BoxHookFuture<'_>) {
        match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(())) => debug!(hook = name, %point, "钩子执行完成"),
            Ok(Err(e)) => warn!(hook = name, %point, "钩子执行失败，已跳过: {e:#}"),
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                warn!(hook = name, %point, "钩子执行panic，已跳过: {message}");
            }
        }
    }
}

/// 从panic负载中提取可读信息
pub fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "未知panic".to_string()
    }
}
