use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use qtask_core::{
    config::ScheduledTaskConfig,
    services::{EnqueueRequest, QueuedTasks},
    QueueError, QueueResult,
};

/// CRON表达式解析
#[derive(Debug, Clone)]
pub struct CronSchedule {
    schedule: Schedule,
}

impl CronSchedule {
    pub fn new(cron_expr: &str) -> QueueResult<Self> {
        let schedule = Schedule::from_str(cron_expr).map_err(|e| {
            QueueError::Configuration(format!("无效的CRON表达式 '{cron_expr}': {e}"))
        })?;

        Ok(Self { schedule })
    }

    /// 上次触发之后是否已经到了下一个触发点
    pub fn should_trigger(&self, last_run: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        match self.schedule.after(&last_run).next() {
            Some(next_time) => next_time <= now,
            None => {
                warn!(
                    "无法计算下一次执行时间，上次执行时间: {}",
                    last_run.format("%Y-%m-%d %H:%M:%S UTC")
                );
                false
            }
        }
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }
}

struct ScheduledEntry {
    config: ScheduledTaskConfig,
    schedule: CronSchedule,
    last_run: DateTime<Utc>,
}

impl ScheduledEntry {
    fn to_request(&self) -> EnqueueRequest {
        let mut request =
            EnqueueRequest::import(self.config.executable.clone()).name(self.config.name.clone());
        for arg in &self.config.args {
            request = request.arg(arg);
        }
        for (key, value) in &self.config.kwargs {
            request = request.kwarg(key.clone(), value);
        }
        for (key, value) in &self.config.context {
            request = request.context(key, value);
        }
        if let Some(max_retries) = self.config.max_retries {
            request = request.max_retries(max_retries);
        }
        request
    }
}

/// 周期任务调度器
///
/// 每个触发点入队一次；同名任务仍未结束时跳过本次触发。
pub struct PeriodicTaskScheduler {
    queued_tasks: QueuedTasks,
    entries: Vec<ScheduledEntry>,
    tick_interval: StdDuration,
}

impl PeriodicTaskScheduler {
    /// 从配置构建，第一次触发发生在 `start` 之后的第一个触发点
    pub fn new<'a>(
        queued_tasks: QueuedTasks,
        configs: impl IntoIterator<Item = &'a ScheduledTaskConfig>,
        start: DateTime<Utc>,
    ) -> QueueResult<Self> {
        let entries = configs
            .into_iter()
            .map(|config| {
                Ok(ScheduledEntry {
                    schedule: CronSchedule::new(&config.cron)?,
                    config: config.clone(),
                    last_run: start,
                })
            })
            .collect::<QueueResult<Vec<_>>>()?;

        Ok(Self {
            queued_tasks,
            entries,
            tick_interval: StdDuration::from_secs(1),
        })
    }

    pub fn with_tick_interval(mut self, tick_interval: StdDuration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 检查所有周期任务，返回本次创建的任务ID
    ///
    /// 单个任务入队失败时保留其上次触发时间，下一次检查会重新尝试。
    pub async fn tick(&mut self, now: DateTime<Utc>) -> Vec<i64> {
        let mut created = Vec::new();

        for entry in &mut self.entries {
            if !entry.schedule.should_trigger(entry.last_run, now) {
                continue;
            }

            match Self::trigger(&self.queued_tasks, entry).await {
                Ok(Some(task_id)) => created.push(task_id),
                Ok(None) => {}
                Err(e) => {
                    error!("周期任务 {} 入队失败，将在下次检查时重试: {}", entry.config.name, e);
                    continue;
                }
            }
            entry.last_run = now;
        }

        created
    }

    async fn trigger(queued_tasks: &QueuedTasks, entry: &ScheduledEntry) -> QueueResult<Option<i64>> {
        let name = entry.config.name.as_str();
        if queued_tasks.has_active_named(name).await? {
            debug!("周期任务 {} 的上一次执行尚未结束，跳过本次触发", name);
            return Ok(None);
        }

        let task = queued_tasks.enqueue_now(entry.to_request()).await?;
        info!("周期任务 {} 已入队，任务ID: {}", name, task.id);
        Ok(Some(task.id))
    }

    /// 持续运行直到收到停止信号
    pub async fn run(mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        if self.entries.is_empty() {
            return;
        }

        info!("周期任务调度器已启动，共 {} 个任务", self.entries.len());
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown_rx.recv() => {
                    info!("周期任务调度器停止");
                    break;
                }
            }
        }
    }
}
