use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tracing::{error, info, warn};

use qtask_core::{
    models::OrphanRequeueReport,
    traits::{TaskRepository, WorkerRepository},
    QueueResult,
};

/// 恢复服务配置
#[derive(Debug, Clone)]
pub struct RecoveryConfig {
    /// 当前进程的名称，不会被当作失联进程处理
    pub server_name: String,
    /// Worker池心跳超时时间
    pub heartbeat_timeout: Duration,
}

impl RecoveryConfig {
    pub fn new(server_name: impl Into<String>, heartbeat_timeout: Duration) -> Self {
        Self {
            server_name: server_name.into(),
            heartbeat_timeout,
        }
    }
}

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 启动时处理本进程上次运行遗留的 `running` 任务
    async fn recover_own_orphans(&self) -> QueueResult<OrphanRequeueReport>;

    /// 处理心跳超时进程认领的任务，并将这些进程标记为停止
    async fn recover_stale_servers(&self) -> QueueResult<RecoveryReport>;
}

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    pub stale_servers: Vec<String>,
    pub orphans: OrphanRequeueReport,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

impl RecoveryReport {
    pub fn is_empty(&self) -> bool {
        self.stale_servers.is_empty() && self.orphans.total() == 0 && self.errors.is_empty()
    }
}

/// 孤儿任务恢复服务
///
/// 孤儿任务按一次 `WorkerLost` 失败处理：计入重试次数，用完后进入 `failed` 并级联取消后代。
pub struct OrphanRecoveryService {
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    config: RecoveryConfig,
}

impl OrphanRecoveryService {
    pub fn new(
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            tasks,
            workers,
            config,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }
}

#[async_trait]
impl RecoveryService for OrphanRecoveryService {
    async fn recover_own_orphans(&self) -> QueueResult<OrphanRequeueReport> {
        let report = self.tasks.requeue_orphaned(&self.config.server_name).await?;
        if report.total() > 0 {
            info!(
                "恢复本进程遗留任务: 重新入队 {:?}, 终止 {:?}",
                report.requeued, report.failed
            );
        }
        Ok(report)
    }

    async fn recover_stale_servers(&self) -> QueueResult<RecoveryReport> {
        let start = Instant::now();
        let cutoff = Utc::now() - self.config.heartbeat_timeout;
        let stale = self.workers.find_stale(cutoff).await?;

        let mut report = RecoveryReport::default();
        for registration in stale {
            if registration.server_name == self.config.server_name {
                continue;
            }

            warn!(
                "进程 {} 心跳超时，最后心跳: {}",
                registration.server_name,
                registration.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
            );

            match self.tasks.requeue_orphaned(&registration.server_name).await {
                Ok(orphans) => {
                    report.orphans.merge(orphans);
                    if let Err(e) = self.workers.mark_stopped(&registration.server_name).await {
                        let error_msg =
                            format!("标记进程 {} 为停止失败: {}", registration.server_name, e);
                        error!("{}", error_msg);
                        report.errors.push(error_msg);
                    }
                    report.stale_servers.push(registration.server_name);
                }
                Err(e) => {
                    let error_msg =
                        format!("恢复进程 {} 的任务失败: {}", registration.server_name, e);
                    error!("{}", error_msg);
                    report.errors.push(error_msg);
                }
            }
        }

        report.recovery_duration_ms = start.elapsed().as_millis() as u64;
        if !report.stale_servers.is_empty() {
            info!(
                "失联进程恢复完成: 进程 {:?}, 重新入队 {} 个, 终止 {} 个, 耗时 {}ms",
                report.stale_servers,
                report.orphans.requeued.len(),
                report.orphans.failed.len(),
                report.recovery_duration_ms
            );
        }
        Ok(report)
    }
}
