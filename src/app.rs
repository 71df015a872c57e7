use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::info;

use qtask_core::{
    hooks::HookRegistry,
    models::{GlobalWorkerStats, NewTaskLogEntry, TaskStateCounts, WorkerRegistration},
    traits::{Notifier, TaskLogRepository, TaskRepository, WorkerRepository},
    AppConfig, QueuedTasks,
};
use qtask_dispatcher::PeriodicTaskScheduler;
use qtask_infrastructure::{DatabaseManager, InMemoryNotifier, InMemoryTaskStore, PgNotifier};
use qtask_worker::{ExecutorRegistry, QueueWorkerManager, TaskLogWriter};

/// 主应用程序
///
/// 持有存储、通知通道与钩子，为各个命令提供入口。
pub struct Application {
    config: AppConfig,
    database: Option<DatabaseManager>,
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    task_logs: Arc<dyn TaskLogRepository>,
    notifier: Option<Arc<dyn Notifier>>,
    hooks: Arc<HookRegistry>,
}

impl Application {
    /// 连接PostgreSQL
    pub async fn connect(config: AppConfig) -> Result<Self> {
        info!("连接数据库");
        let database = DatabaseManager::new(&config.database)
            .await
            .context("创建数据库连接池失败")?;

        let queue = &config.queue;
        let notify_channel = queue.use_push_notify.then(|| queue.notify_channel.clone());
        let notifier: Option<Arc<dyn Notifier>> = if queue.use_push_notify {
            Some(Arc::new(PgNotifier::new(
                database.pool().clone(),
                queue.notify_channel.clone(),
            )))
        } else {
            None
        };

        Ok(Self {
            tasks: Arc::new(database.task_repository(notify_channel)),
            workers: Arc::new(database.worker_repository()),
            task_logs: Arc::new(database.task_log_repository()),
            notifier,
            hooks: Arc::new(HookRegistry::new()),
            database: Some(database),
            config,
        })
    }

    /// 使用内存存储，数据随进程结束丢失
    pub fn in_memory(config: AppConfig) -> Self {
        let notifier = Arc::new(InMemoryNotifier::new(config.queue.notify_channel.clone()));
        let store = InMemoryTaskStore::with_notifier(Arc::clone(&notifier));

        Self {
            tasks: Arc::new(store.clone()),
            workers: Arc::new(store.clone()),
            task_logs: Arc::new(store),
            notifier: Some(notifier),
            hooks: Arc::new(HookRegistry::new()),
            database: None,
            config,
        }
    }

    pub fn with_hooks(mut self, hooks: HookRegistry) -> Self {
        self.hooks = Arc::new(hooks);
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::clone(&self.tasks)
    }

    pub fn task_log_repository(&self) -> Arc<dyn TaskLogRepository> {
        Arc::clone(&self.task_logs)
    }

    /// 生产者服务，需要在tokio运行时内调用
    pub fn queued_tasks(&self) -> QueuedTasks {
        QueuedTasks::from_config(
            Arc::clone(&self.tasks),
            Arc::clone(&self.hooks),
            &self.config.queue,
        )
    }

    /// 执行数据库迁移
    pub async fn migrate(&self) -> Result<()> {
        let database = self
            .database
            .as_ref()
            .context("内存存储模式没有可迁移的数据库")?;
        database.migrate().await.context("数据库迁移失败")?;
        Ok(())
    }

    pub async fn status(&self) -> Result<QueueStatus> {
        let counts = self
            .tasks
            .count_by_state()
            .await
            .context("查询任务数量失败")?;

        Ok(QueueStatus {
            pending: counts.pending,
            workers: self.global_worker_stats().await?,
        })
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let counts = self
            .tasks
            .count_by_state()
            .await
            .context("查询任务数量失败")?;

        Ok(QueueStats {
            counts,
            workers: self.global_worker_stats().await?,
        })
    }

    /// 所有注册过的进程，包括已失联和已停止的
    pub async fn servers(&self) -> Result<Vec<ServerStatus>> {
        let timeout = self.heartbeat_timeout();
        let now = Utc::now();
        let registrations = self
            .workers
            .list_all()
            .await
            .context("查询Worker注册信息失败")?;

        Ok(registrations
            .into_iter()
            .map(|registration| ServerStatus {
                alive: registration.is_alive(timeout, now),
                registration,
            })
            .collect())
    }

    /// 以终态任务为模板重新创建任务，返回新任务ID
    pub async fn retry(&self, id: i64) -> Result<i64> {
        let handle = self
            .queued_tasks()
            .retry_task(id)
            .await
            .with_context(|| format!("重试任务 {id} 失败"))?;
        Ok(handle.get_task_id().await?)
    }

    /// 取消所有 `pending`/`blocked` 任务，返回取消的数量
    pub async fn clear(&self) -> Result<u64> {
        let cancelled = self
            .tasks
            .cancel_all_pending()
            .await
            .context("取消待执行任务失败")?;
        info!("已取消 {} 个待执行任务", cancelled);
        Ok(cancelled)
    }

    /// 构建Worker管理器，启用周期任务时一并挂载调度器
    pub fn build_manager(&self, registry: ExecutorRegistry) -> Result<QueueWorkerManager> {
        let mut builder = QueueWorkerManager::builder(
            self.config.queue.clone(),
            Arc::clone(&self.tasks),
            Arc::clone(&self.workers),
        )
        .registry(registry)
        .hooks(Arc::clone(&self.hooks));

        if let Some(notifier) = &self.notifier {
            builder = builder.notifier(Arc::clone(notifier));
        }

        if self.config.scheduler.enabled {
            let scheduler = PeriodicTaskScheduler::new(
                self.queued_tasks(),
                self.config.scheduler.enabled_tasks(),
                Utc::now(),
            )
            .context("构建周期任务调度器失败")?;
            builder = builder.scheduler(scheduler);
        }

        Ok(builder.build())
    }

    /// 启动Worker管理器，收到关闭信号后停止
    pub async fn run(
        &self,
        registry: ExecutorRegistry,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let manager = self.build_manager(registry)?;
        manager.start().await.context("启动Worker管理器失败")?;
        info!(
            server_name = manager.server_name(),
            "Worker管理器已启动，最大Worker数: {}", self.config.queue.max_workers
        );

        let _ = shutdown_rx.recv().await;

        manager.stop().await.context("停止Worker管理器失败")?;
        info!(server_name = manager.server_name(), "Worker管理器已停止");
        Ok(())
    }

    /// 启动任务日志写入端
    pub fn spawn_task_log_writer(
        &self,
        receiver: mpsc::UnboundedReceiver<NewTaskLogEntry>,
    ) -> JoinHandle<()> {
        TaskLogWriter::new(Arc::clone(&self.task_logs)).spawn(receiver)
    }

    async fn global_worker_stats(&self) -> Result<GlobalWorkerStats> {
        let registrations = self
            .workers
            .list_all()
            .await
            .context("查询Worker注册信息失败")?;
        Ok(GlobalWorkerStats::from_registrations(
            &registrations,
            self.heartbeat_timeout(),
            Utc::now(),
        ))
    }

    fn heartbeat_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.queue.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(120))
    }
}

/// `qtask status` 的输出
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStatus {
    pub pending: i64,
    pub workers: GlobalWorkerStats,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "待执行任务: {}", self.pending)?;
        write_worker_stats(f, &self.workers)
    }
}

/// `qtask stats` 的输出
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub counts: TaskStateCounts,
    pub workers: GlobalWorkerStats,
}

impl fmt::Display for QueueStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pending:   {}", self.counts.pending)?;
        writeln!(f, "blocked:   {}", self.counts.blocked)?;
        writeln!(f, "running:   {}", self.counts.running)?;
        writeln!(f, "done:      {}", self.counts.done)?;
        writeln!(f, "failed:    {}", self.counts.failed)?;
        writeln!(f, "cancelled: {}", self.counts.cancelled)?;
        writeln!(f, "total:     {}", self.counts.total())?;
        write_worker_stats(f, &self.workers)
    }
}

fn write_worker_stats(f: &mut fmt::Formatter<'_>, stats: &GlobalWorkerStats) -> fmt::Result {
    writeln!(
        f,
        "存活进程: {}，Worker: {}/{}（执行中 {}，空闲 {}）",
        stats.servers,
        stats.total_workers(),
        stats.max_workers,
        stats.active_workers,
        stats.idle_workers
    )
}

/// `qtask servers` 的一行
#[derive(Debug, Clone, PartialEq)]
pub struct ServerStatus {
    pub registration: WorkerRegistration,
    /// 运行中且心跳未超时
    pub alive: bool,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registration = &self.registration;
        let liveness = match (registration.is_running, self.alive) {
            (false, _) => "stopped",
            (true, true) => "alive",
            (true, false) => "lost",
        };
        write!(
            f,
            "{} [{}] 执行中 {} / 空闲 {} / 上限 {}，最近心跳 {}，版本 {}",
            registration.server_name,
            liveness,
            registration.active_workers,
            registration.idle_workers,
            registration.max_workers,
            registration.last_heartbeat.to_rfc3339(),
            registration.version
        )
    }
}
