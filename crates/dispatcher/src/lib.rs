//! 队列的后台维护服务
//!
//! - `recovery_service` - 自身与失联进程的孤儿任务恢复
//! - `dependency_resolver` - 补偿处理父任务已结束但子任务仍阻塞的情况
//! - `cron_scheduler` - 按CRON表达式周期性入队任务

pub mod cron_scheduler;
pub mod dependency_resolver;
pub mod recovery_service;

pub use cron_scheduler::{CronSchedule, PeriodicTaskScheduler};
pub use dependency_resolver::DependencyResolver;
pub use recovery_service::{OrphanRecoveryService, RecoveryConfig, RecoveryReport, RecoveryService};
