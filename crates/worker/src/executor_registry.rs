use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

use qtask_core::{models::Executable, QueueError, QueueResult};

use crate::task_context::TaskContext;

/// 未指定类别的任务失败使用的 `error_kind`
pub const DEFAULT_ERROR_KIND: &str = "Error";

/// 带类别的任务失败
///
/// 任务函数返回该错误时，`kind` 会记录到任务的 `error_kind` 上。
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: String,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }
}

/// 任务的位置参数与关键字参数
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskArgs {
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskArgs {
    pub fn new(args: Vec<Value>, kwargs: Map<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .args
            .get(index)
            .ok_or_else(|| TaskError::new("TypeError", format!("缺少位置参数 {index}")))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("位置参数 {index} 类型不匹配"))
    }

    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        self.kwargs
            .get(key)
            .map(|value| {
                serde_json::from_value(value.clone())
                    .with_context(|| format!("关键字参数 {key} 类型不匹配"))
            })
            .transpose()
    }

    pub fn kwarg_or<T: DeserializeOwned>(&self, key: &str, default: T) -> anyhow::Result<T> {
        Ok(self.kwarg(key)?.unwrap_or(default))
    }
}

/// 可被Worker执行的任务函数
#[async_trait]
pub trait TaskFunction: Send + Sync {
    async fn call(&self, ctx: TaskContext, args: TaskArgs) -> anyhow::Result<Value>;
}

/// 以异步闭包实现的任务函数
pub struct FnTask<F> {
    func: F,
}

impl<F> FnTask<F> {
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

#[async_trait]
impl<F, Fut> TaskFunction for FnTask<F>
where
    F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn call(&self, ctx: TaskContext, args: TaskArgs) -> anyhow::Result<Value> {
        (self.func)(ctx, args).await
    }
}

/// 把序列化闭包的字节还原为任务函数
pub trait ClosureCodec: Send + Sync {
    /// 对应 `Executable::SerializedClosure` 的 `scheme`
    fn scheme(&self) -> &str;

    fn decode(&self, blob: &[u8]) -> QueueResult<Arc<dyn TaskFunction>>;
}

/// 执行器注册表
///
/// 进程启动前构建完成，之后只读共享。
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    functions: HashMap<String, Arc<dyn TaskFunction>>,
    codecs: HashMap<String, Arc<dyn ClosureCodec>>,
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("functions", &self.function_paths())
            .field("codecs", &self.codecs.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册了内置任务函数和闭包方案的注册表
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::executors::register_builtins(&mut registry);
        registry
    }

    pub fn register(
        &mut self,
        path: impl Into<String>,
        function: Arc<dyn TaskFunction>,
    ) -> &mut Self {
        let path = path.into();
        info!("注册任务函数: {}", path);
        self.functions.insert(path, function);
        self
    }

    pub fn register_fn<F, Fut>(&mut self, path: impl Into<String>, func: F) -> &mut Self
    where
        F: Fn(TaskContext, TaskArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(path, Arc::new(FnTask::new(func)))
    }

    pub fn register_codec(&mut self, codec: Arc<dyn ClosureCodec>) -> &mut Self {
        info!("注册闭包序列化方案: {}", codec.scheme());
        self.codecs.insert(codec.scheme().to_string(), codec);
        self
    }

    pub fn contains(&self, path: &str) -> bool {
        self.functions.contains_key(path)
    }

    pub fn function_paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// 解析任务的可执行体
    pub fn resolve(&self, executable: &Executable) -> QueueResult<Arc<dyn TaskFunction>> {
        match executable {
            Executable::ImportPath { path } => self
                .functions
                .get(path)
                .cloned()
                .ok_or_else(|| QueueError::ExecutorNotFound(path.clone())),
            Executable::SerializedClosure { scheme, blob } => self
                .codecs
                .get(scheme)
                .ok_or_else(|| QueueError::ClosureCodecNotFound(scheme.clone()))?
                .decode(blob),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_argument_access() {
        let mut kwargs = Map::new();
        kwargs.insert("retries".to_string(), json!(3));
        let args = TaskArgs::new(vec![json!("report"), json!(42)], kwargs);

        assert_eq!(args.arg::<String>(0).unwrap(), "report");
        assert_eq!(args.arg::<i64>(1).unwrap(), 42);
        assert!(args.arg::<String>(1).is_err());
        assert!(args.arg::<String>(5).is_err());
        assert_eq!(args.kwarg::<u32>("retries").unwrap(), Some(3));
        assert_eq!(args.kwarg_or("missing", 7u32).unwrap(), 7);
    }

    #[test]
    fn test_resolve_reports_missing_entries() {
        let mut registry = ExecutorRegistry::new();
        registry.register_fn("jobs.ok", |_ctx, _args| async { Ok(json!("ok")) });

        assert!(registry.resolve(&Executable::import("jobs.ok")).is_ok());
        assert!(matches!(
            registry.resolve(&Executable::import("jobs.missing")),
            Err(QueueError::ExecutorNotFound(path)) if path == "jobs.missing"
        ));
        assert!(matches!(
            registry.resolve(&Executable::closure("pickle", vec![1])),
            Err(QueueError::ClosureCodecNotFound(scheme)) if scheme == "pickle"
        ));
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = ExecutorRegistry::with_builtins();
        assert!(registry.contains(crate::executors::ECHO_TASK_PATH));
        assert!(registry
            .resolve(&Executable::closure(
                crate::executors::SHELL_JSON_SCHEME,
                br#"{"command": "true"}"#.to_vec()
            ))
            .is_ok());
    }
}
