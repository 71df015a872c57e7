//! # 数据模型
//!
//! 队列任务引擎的核心数据结构：任务、任务日志、Worker注册信息。
//!
//! ## 任务状态流转
//!
//! ```text
//! pending ──claim──> running ──> done
//!    │                  │
//!    │                  ├──> failed (重试次数耗尽，终态)
//!    │                  ├──> pending (自动重试 / 孤儿任务重新入队)
//!    │                  └──> cancelled (执行体观察到取消请求)
//!    └──> cancelled
//!
//! blocked ──父任务 done──> pending
//!    └──父任务 failed/cancelled──> cancelled (级联)
//! ```
//!
//! `done`、`failed`、`cancelled` 为终态，进入后不再变化。
//!
//! ## 数据库映射
//!
//! - `queued_tasks` - 任务定义、状态、上下文、结果
//! - `queued_task_logs` - 执行期间产生的日志，只追加
//! - `queued_task_workers` - 每个进程一条注册记录，按 `server_name` 唯一
//!
//! 状态字段以 `VARCHAR` 存储，通过手动实现的 `sqlx::Type/Encode/Decode` 映射为枚举。

pub mod task;
pub mod task_log;
pub mod worker;

pub use task::*;
pub use task_log::*;
pub use worker::*;
