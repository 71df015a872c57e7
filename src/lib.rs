//! # qtask
//!
//! `qtask` 命令行程序的应用层：命令行参数、日志初始化、应用装配与优雅关闭。

pub mod app;
pub mod cli;
pub mod logging;
pub mod shutdown;

pub use app::{Application, QueueStats, QueueStatus, ServerStatus};
pub use cli::{Cli, Commands};
pub use shutdown::ShutdownManager;
