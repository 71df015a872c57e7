//! # qtask-core
//!
//! 队列任务引擎的核心抽象：数据模型与状态机、错误类型、配置、
//! 存储与通知接口、执行上下文、生命周期钩子，以及生产者服务和任务引用。
//!
//! 存储实现位于 `qtask-infrastructure`，Worker池与进程监督位于 `qtask-worker`。

pub mod config;
pub mod context;
pub mod dependency;
pub mod errors;
pub mod hooks;
pub mod models;
pub mod retry;
pub mod services;
pub mod traits;

pub use config::*;
pub use context::ContextTracker;
pub use errors::*;
pub use hooks::{HookPoint, HookRegistry, QueueHook};
pub use models::*;
pub use retry::RetryPolicy;
pub use services::*;
pub use traits::*;
