use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Notify};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use qtask_core::{models::WorkerHeartbeat, traits::TaskRepository, QueueConfig, QueueResult};

use crate::execution::{ExecutionReport, ExecutionRuntime};

/// Worker池规模参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    pub min_workers: usize,
    pub max_workers: usize,
    pub idle_timeout: Duration,
}

impl PoolLimits {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            min_workers: config.min_workers.min(config.max_workers),
            max_workers: config.max_workers.max(1),
            idle_timeout: config.worker_idle_timeout(),
        }
    }
}

/// Worker池的实时计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub max_workers: usize,
    pub live_workers: usize,
    pub busy_workers: usize,
    pub idle_workers: usize,
}

impl PoolStats {
    pub fn to_heartbeat(&self) -> WorkerHeartbeat {
        WorkerHeartbeat {
            max_workers: self.max_workers as i32,
            active_workers: self.busy_workers as i32,
            idle_workers: self.live_workers.saturating_sub(self.busy_workers) as i32,
        }
    }
}

struct PoolShared {
    runtime: ExecutionRuntime,
    tasks: Arc<dyn TaskRepository>,
    limits: PoolLimits,
    live: AtomicUsize,
    busy: AtomicUsize,
    idle: AtomicUsize,
    next_worker_id: AtomicUsize,
    accepting: AtomicBool,
    wakeup: Notify,
    shutdown_tx: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
}

impl PoolShared {
    fn workers(&self) -> MutexGuard<'_, JoinSet<()>> {
        self.workers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 在不低于下限时减少一个存活Worker
    fn try_retire(&self) -> bool {
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live > self.limits.min_workers).then(|| live - 1)
            })
            .is_ok()
    }
}

/// 进程内的Worker池
///
/// Worker是tokio任务，每个Worker一次只执行一个任务。收到信号时优先唤醒一个空闲Worker，
/// 没有空闲Worker且未达上限时新建一个；空闲超时且高于下限的Worker自行退出。
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    pub fn new(runtime: ExecutionRuntime, tasks: Arc<dyn TaskRepository>, limits: PoolLimits) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shared: Arc::new(PoolShared {
                runtime,
                tasks,
                limits,
                live: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(1),
                accepting: AtomicBool::new(true),
                wakeup: Notify::new(),
                shutdown_tx,
                workers: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn limits(&self) -> PoolLimits {
        self.shared.limits
    }

    /// 启动下限数量的常驻Worker
    pub fn start(&self) {
        for _ in 0..self.shared.limits.min_workers {
            self.try_spawn_worker();
        }
        info!(
            "Worker池已启动: min_workers={}, max_workers={}",
            self.shared.limits.min_workers, self.shared.limits.max_workers
        );
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::SeqCst)
    }

    /// 有任务可能可以认领
    pub fn signal(&self) {
        if !self.is_accepting() {
            return;
        }

        if self.shared.idle.load(Ordering::SeqCst) > 0 || !self.try_spawn_worker() {
            // 没有等待者时permit会保留，下一个进入空闲的Worker立即再次认领
            self.shared.wakeup.notify_one();
        }
    }

    /// 在 `at` 时刻发出信号，用于延迟重试的任务
    pub fn signal_at(&self, at: DateTime<Utc>) {
        let delay = (at - Utc::now()).to_std().unwrap_or_default();
        let pool = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            pool.signal();
        });
    }

    pub fn stats(&self) -> PoolStats {
        let live = self.shared.live.load(Ordering::SeqCst);
        let busy = self.shared.busy.load(Ordering::SeqCst);
        PoolStats {
            max_workers: self.shared.limits.max_workers,
            live_workers: live,
            busy_workers: busy,
            idle_workers: self.shared.idle.load(Ordering::SeqCst),
        }
    }

    /// 停止认领新任务，等待执行中的Worker结束
    ///
    /// 超时后中止剩余Worker并返回被中止的数量，这些Worker认领的任务仍处于 `running`，
    /// 需要由调用方按孤儿任务处理。
    pub async fn drain(&self, timeout: Duration) -> usize {
        self.shared.accepting.store(false, Ordering::SeqCst);
        self.shared.shutdown_tx.send_replace(true);

        let mut workers = std::mem::take(&mut *self.shared.workers());
        let busy = self.shared.busy.load(Ordering::SeqCst);
        info!("等待Worker结束: live={}, busy={}", workers.len(), busy);

        let drained = tokio::time::timeout(timeout, async {
            while workers.join_next().await.is_some() {}
        })
        .await;

        if drained.is_ok() {
            info!("所有Worker已结束");
            return 0;
        }

        let remaining = workers.len();
        warn!("等待超时，中止 {} 个Worker", remaining);
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        self.shared.live.store(0, Ordering::SeqCst);
        self.shared.busy.store(0, Ordering::SeqCst);
        self.shared.idle.store(0, Ordering::SeqCst);
        remaining
    }

    fn try_spawn_worker(&self) -> bool {
        let mut workers = self.shared.workers();
        if !self.is_accepting() {
            return false;
        }

        let max_workers = self.shared.limits.max_workers;
        let reserved = self
            .shared
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |live| {
                (live < max_workers).then(|| live + 1)
            })
            .is_ok();
        if !reserved {
            return false;
        }

        while workers.try_join_next().is_some() {}

        let worker_id = self.shared.next_worker_id.fetch_add(1, Ordering::SeqCst);
        let pool = self.clone();
        workers.spawn(async move { pool.run_worker(worker_id).await });
        debug!(worker_id, "启动新Worker");
        true
    }

    async fn run_worker(self, worker_id: usize) {
        let shared = Arc::clone(&self.shared);
        let server_name = shared.runtime.server_name().to_string();
        let mut shutdown_rx = shared.shutdown_tx.subscribe();

        loop {
            if !self.is_accepting() {
                break;
            }

            match shared.tasks.claim_next(&server_name).await {
                Ok(Some(task)) => {
                    debug!(worker_id, task_id = task.id, "认领任务");
                    // 积压的任务分摊给其他Worker
                    self.signal();

                    shared.busy.fetch_add(1, Ordering::SeqCst);
                    let result = shared.runtime.execute(task).await;
                    shared.busy.fetch_sub(1, Ordering::SeqCst);

                    self.handle_result(worker_id, result);
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!(worker_id, "认领任务失败: {}", e),
            }

            shared.idle.fetch_add(1, Ordering::SeqCst);
            let woken = tokio::select! {
                _ = shared.wakeup.notified() => true,
                _ = tokio::time::sleep(shared.limits.idle_timeout) => false,
                _ = shutdown_rx.wait_for(|stopping| *stopping) => false,
            };
            shared.idle.fetch_sub(1, Ordering::SeqCst);

            if !woken && self.is_accepting() && shared.try_retire() {
                debug!(worker_id, "Worker空闲超时，退出");
                return;
            }
        }

        shared.live.fetch_sub(1, Ordering::SeqCst);
        debug!(worker_id, "Worker退出");
    }

    fn handle_result(&self, worker_id: usize, result: QueueResult<ExecutionReport>) {
        match result {
            Ok(report) => {
                if let Some(retry_at) = report.retry_at {
                    self.signal_at(retry_at);
                }
            }
            Err(e) => error!(worker_id, "写回任务状态失败: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_heartbeat_counts() {
        let stats = PoolStats {
            max_workers: 8,
            live_workers: 5,
            busy_workers: 3,
            idle_workers: 2,
        };
        let heartbeat = stats.to_heartbeat();
        assert_eq!(heartbeat.max_workers, 8);
        assert_eq!(heartbeat.active_workers, 3);
        assert_eq!(heartbeat.idle_workers, 2);
    }

    #[test]
    fn test_limits_clamp_floor_to_ceiling() {
        let config = QueueConfig {
            max_workers: 2,
            min_workers: 5,
            ..QueueConfig::default()
        };
        let limits = PoolLimits::from_config(&config);
        assert_eq!(limits.min_workers, 2);
        assert_eq!(limits.max_workers, 2);
    }
}
