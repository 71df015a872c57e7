use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use qtask_core::{
    hooks::HookRegistry,
    models::WorkerRegistration,
    traits::{Notifier, TaskRepository, WorkerRepository},
    QueueConfig, QueueError, QueueResult,
};
use qtask_dispatcher::{
    DependencyResolver, OrphanRecoveryService, PeriodicTaskScheduler, RecoveryConfig,
    RecoveryService,
};

use crate::execution::ExecutionRuntime;
use crate::executor_registry::ExecutorRegistry;
use crate::pool::{PoolLimits, PoolStats, WorkerPool};

const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(30);
const INITIAL_RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(500);

/// 队列Worker管理器构建器
pub struct QueueWorkerManagerBuilder {
    config: QueueConfig,
    tasks: Arc<dyn TaskRepository>,
    workers: Arc<dyn WorkerRepository>,
    registry: ExecutorRegistry,
    hooks: Arc<HookRegistry>,
    notifier: Option<Arc<dyn Notifier>>,
    scheduler: Option<PeriodicTaskScheduler>,
}

impl QueueWorkerManagerBuilder {
    pub fn new(
        config: QueueConfig,
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
    ) -> Self {
        Self {
            config,
            tasks,
            workers,
            registry: ExecutorRegistry::with_builtins(),
            hooks: Arc::new(HookRegistry::new()),
            notifier: None,
            scheduler: None,
        }
    }

    pub fn registry(mut self, registry: ExecutorRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn hooks(mut self, hooks: Arc<HookRegistry>) -> Self {
        self.hooks = hooks;
        self
    }

    /// 设置推送通知通道，`use_push_notify = false` 时忽略
    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn scheduler(mut self, scheduler: PeriodicTaskScheduler) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn build(self) -> QueueWorkerManager {
        let server_name = self.config.resolve_server_name();
        let runtime = ExecutionRuntime::new(
            Arc::clone(&self.tasks),
            Arc::new(self.registry),
            self.hooks,
            &server_name,
            &self.config,
        );
        let pool = WorkerPool::new(
            runtime,
            Arc::clone(&self.tasks),
            PoolLimits::from_config(&self.config),
        );

        let heartbeat_timeout = chrono::Duration::from_std(self.config.heartbeat_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(120));
        let recovery = Arc::new(OrphanRecoveryService::new(
            Arc::clone(&self.tasks),
            Arc::clone(&self.workers),
            RecoveryConfig::new(server_name.clone(), heartbeat_timeout),
        ));
        let resolver = Arc::new(DependencyResolver::new(Arc::clone(&self.tasks)));

        let notifier = self.notifier.filter(|_| self.config.use_push_notify);
        let (shutdown_tx, _) = broadcast::channel(4);
        let (push_healthy_tx, _) = watch::channel(false);

        QueueWorkerManager {
            config: self.config,
            server_name,
            workers: self.workers,
            notifier,
            pool,
            recovery,
            resolver,
            scheduler: Mutex::new(self.scheduler),
            shutdown_tx,
            push_healthy: Arc::new(push_healthy_tx),
            background: Mutex::new(Vec::new()),
            is_running: AtomicBool::new(false),
        }
    }
}

/// 进程级的Worker池监督者
///
/// 负责进程注册与心跳、通知监听与兜底轮询、失联进程恢复、依赖补偿和周期任务，
/// 以及优雅停止。多个进程之间只通过共享存储和通知通道协调。
pub struct QueueWorkerManager {
    config: QueueConfig,
    server_name: String,
    workers: Arc<dyn WorkerRepository>,
    notifier: Option<Arc<dyn Notifier>>,
    pool: WorkerPool,
    recovery: Arc<OrphanRecoveryService>,
    resolver: Arc<DependencyResolver>,
    scheduler: Mutex<Option<PeriodicTaskScheduler>>,
    shutdown_tx: broadcast::Sender<()>,
    push_healthy: Arc<watch::Sender<bool>>,
    background: Mutex<Vec<JoinHandle<()>>>,
    is_running: AtomicBool,
}

impl QueueWorkerManager {
    pub fn builder(
        config: QueueConfig,
        tasks: Arc<dyn TaskRepository>,
        workers: Arc<dyn WorkerRepository>,
    ) -> QueueWorkerManagerBuilder {
        QueueWorkerManagerBuilder::new(config, tasks, workers)
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// 推送通知当前是否可用
    pub fn is_push_healthy(&self) -> bool {
        *self.push_healthy.borrow()
    }

    /// 启动Worker池与所有后台循环
    ///
    /// `server_name` 被另一个心跳未超时的进程占用时返回 [`QueueError::ServerNameInUse`]。
    pub async fn start(&self) -> QueueResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!("Worker管理器已在运行: {}", self.server_name);
            return Ok(());
        }
        info!(server_name = %self.server_name, "启动队列Worker管理器");

        if let Err(e) = self.claim_server_name().await {
            self.is_running.store(false, Ordering::SeqCst);
            return Err(e);
        }

        self.pool.start();
        self.pool.signal();

        let mut background = self.background.lock().await;
        if let Some(notifier) = &self.notifier {
            background.push(tokio::spawn(Self::run_listener(
                Arc::clone(notifier),
                self.pool.clone(),
                Arc::clone(&self.push_healthy),
                self.shutdown_tx.subscribe(),
            )));
        } else {
            info!("推送通知未启用，使用快速轮询");
        }

        background.push(tokio::spawn(Self::run_polling(
            self.pool.clone(),
            self.push_healthy.subscribe(),
            self.config.polling_interval(),
            self.config.fallback_polling_interval(),
            self.shutdown_tx.subscribe(),
        )));

        background.push(tokio::spawn(Self::run_heartbeat(
            Arc::clone(&self.workers),
            self.pool.clone(),
            self.server_name.clone(),
            self.config.heartbeat_interval(),
            self.shutdown_tx.subscribe(),
        )));

        background.push(tokio::spawn(Self::run_maintenance(
            Arc::clone(&self.recovery),
            Arc::clone(&self.resolver),
            self.pool.clone(),
            self.config.heartbeat_interval(),
            self.shutdown_tx.subscribe(),
        )));

        if let Some(scheduler) = self.scheduler.lock().await.take() {
            if !scheduler.is_empty() {
                background.push(tokio::spawn(scheduler.run(self.shutdown_tx.subscribe())));
            }
        }

        info!(
            "队列Worker管理器已启动: server_name={}, max_workers={}",
            self.server_name,
            self.pool.limits().max_workers
        );
        Ok(())
    }

    /// 优雅停止
    ///
    /// 停止认领新任务，在 `drain_timeout` 内等待执行中的任务结束；
    /// 超时被中止的任务按孤儿任务重新入队，最后把注册标记为停止。
    pub async fn stop(&self) -> QueueResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        info!(server_name = %self.server_name, "停止队列Worker管理器");

        let _ = self.shutdown_tx.send(());
        let aborted = self.pool.drain(self.config.drain_timeout()).await;

        let handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    error!("后台任务异常退出: {}", e);
                }
            }
        }

        if aborted > 0 {
            let report = self.recovery.recover_own_orphans().await?;
            warn!(
                "{}个Worker被中止，任务已重新入队: {:?}",
                aborted, report.requeued
            );
        }

        self.workers.mark_stopped(&self.server_name).await?;
        info!("队列Worker管理器已停止: {}", self.server_name);
        Ok(())
    }

    /// 独占注册 `server_name`，再恢复同名旧进程遗留的 `running` 任务
    async fn claim_server_name(&self) -> QueueResult<()> {
        let registration = WorkerRegistration::new(
            self.server_name.clone(),
            self.pool.limits().max_workers as i32,
        );
        let stale_before = chrono::Utc::now() - self.recovery.config().heartbeat_timeout;
        if self
            .workers
            .register_exclusive(&registration, stale_before)
            .await?
            .is_none()
        {
            error!("进程名称 {} 正被另一个存活进程使用", self.server_name);
            return Err(QueueError::ServerNameInUse {
                server_name: self.server_name.clone(),
            });
        }

        // 名称已归本进程所有，仍在运行的同名任务只可能来自已退出的旧进程
        let leftovers = match self.recovery.recover_own_orphans().await {
            Ok(leftovers) => leftovers,
            Err(e) => {
                if let Err(stop_err) = self.workers.mark_stopped(&self.server_name).await {
                    error!("释放进程名称失败: {}", stop_err);
                }
                return Err(e);
            }
        };
        if leftovers.total() > 0 {
            info!(
                "已恢复上次运行遗留的任务: 重新入队{:?}, 失败{:?}",
                leftovers.requeued, leftovers.failed
            );
        }
        Ok(())
    }

    async fn run_listener(
        notifier: Arc<dyn Notifier>,
        pool: WorkerPool,
        push_healthy: Arc<watch::Sender<bool>>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut backoff = INITIAL_RESUBSCRIBE_BACKOFF;

        loop {
            let subscription = tokio::select! {
                subscription = notifier.subscribe() => subscription,
                _ = shutdown_rx.recv() => break,
            };

            match subscription {
                Ok(mut stream) => {
                    info!("已订阅通知通道: {}", notifier.channel());
                    push_healthy.send_replace(true);
                    backoff = INITIAL_RESUBSCRIBE_BACKOFF;
                    // 断线期间的信号可能已经丢失
                    pool.signal();

                    loop {
                        tokio::select! {
                            item = stream.next() => match item {
                                Some(Ok(signal)) => {
                                    metrics::counter!("qtask_notifications_received_total").increment(1);
                                    debug!(task_id = ?signal.task_id, "收到任务通知");
                                    pool.signal();
                                }
                                Some(Err(e)) => {
                                    warn!("通知连接中断，降级为快速轮询: {}", e);
                                    break;
                                }
                                None => {
                                    warn!("通知流已结束，降级为快速轮询");
                                    break;
                                }
                            },
                            _ = shutdown_rx.recv() => {
                                push_healthy.send_replace(false);
                                return;
                            }
                        }
                    }
                }
                Err(e) => warn!("订阅通知通道失败: {}", e),
            }

            push_healthy.send_replace(false);
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown_rx.recv() => break,
            }
            backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
        }

        push_healthy.send_replace(false);
        debug!("通知监听已停止");
    }

    /// 兜底轮询，推送可用时用 `polling_interval`，否则用 `fallback_polling_interval`
    async fn run_polling(
        pool: WorkerPool,
        mut push_healthy: watch::Receiver<bool>,
        polling_interval: Duration,
        fallback_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            let period = if *push_healthy.borrow_and_update() {
                polling_interval
            } else {
                fallback_interval
            };

            tokio::select! {
                _ = tokio::time::sleep(period) => {
                    metrics::counter!("qtask_polling_cycles_total").increment(1);
                    pool.signal();
                }
                changed = push_healthy.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("轮询已停止");
    }

    async fn run_heartbeat(
        workers: Arc<dyn WorkerRepository>,
        pool: WorkerPool,
        server_name: String,
        heartbeat_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let stats = pool.stats();
                    match workers.heartbeat(&server_name, &stats.to_heartbeat()).await {
                        Ok(()) => debug!(
                            busy = stats.busy_workers,
                            live = stats.live_workers,
                            "心跳已更新"
                        ),
                        Err(QueueError::WorkerNotFound { .. }) => {
                            warn!("注册记录丢失，重新注册: {}", server_name);
                            let registration =
                                WorkerRegistration::new(server_name.clone(), stats.max_workers as i32);
                            if let Err(e) = workers.register(&registration).await {
                                error!("重新注册失败: {}", e);
                            }
                        }
                        Err(e) => error!("更新心跳失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("心跳已停止");
    }

    /// 定期恢复失联进程的任务，并补偿遗漏的子任务解阻塞
    async fn run_maintenance(
        recovery: Arc<OrphanRecoveryService>,
        resolver: Arc<DependencyResolver>,
        pool: WorkerPool,
        check_interval: Duration,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match recovery.recover_stale_servers().await {
                        Ok(report) if !report.orphans.requeued.is_empty() => pool.signal(),
                        Ok(_) => {}
                        Err(e) => error!("恢复失联进程任务失败: {}", e),
                    }
                    match resolver.reconcile().await {
                        Ok(resolution) if !resolution.unblocked.is_empty() => pool.signal(),
                        Ok(_) => {}
                        Err(e) => error!("依赖补偿失败: {}", e),
                    }
                }
                _ = shutdown_rx.recv() => break,
            }
        }
        debug!("维护任务已停止");
    }
}
