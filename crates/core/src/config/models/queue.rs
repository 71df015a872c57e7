use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// 队列引擎配置
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueueConfig {
    /// 每个进程的Worker上限，默认为CPU核数
    pub max_workers: usize,
    /// 空闲Worker不会退出到该数量以下
    pub min_workers: usize,
    pub worker_idle_timeout_seconds: u64,
    /// 推送通知正常时的轮询间隔
    pub polling_interval_seconds: u64,
    /// 推送通知关闭或不可用时的轮询间隔
    pub fallback_polling_interval_seconds: u64,
    /// 单次执行的超时时间
    pub task_timeout_seconds: u64,
    pub max_retries: i32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    pub use_push_notify: bool,
    pub notify_channel: String,
    /// 进程注册名称，为空时使用 `主机名-进程号`；同一时刻只能有一个存活进程使用
    pub server_name: Option<String>,
    pub heartbeat_interval_seconds: u64,
    pub heartbeat_timeout_seconds: u64,
    /// 关闭时等待执行中任务的时间
    pub drain_timeout_seconds: u64,
    pub cancel_check_interval_ms: u64,
    pub wait_poll_interval_ms: u64,
    pub enable_db_logging: bool,
    pub auto_persist_context: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: 0,
            worker_idle_timeout_seconds: 60,
            polling_interval_seconds: 30,
            fallback_polling_interval_seconds: 2,
            task_timeout_seconds: 300,
            max_retries: 3,
            retry_backoff_base_ms: 1_000,
            retry_backoff_max_ms: 60_000,
            use_push_notify: true,
            notify_channel: "queued_new_task".to_string(),
            server_name: None,
            heartbeat_interval_seconds: 30,
            heartbeat_timeout_seconds: 120,
            drain_timeout_seconds: 30,
            cancel_check_interval_ms: 1_000,
            wait_poll_interval_ms: 500,
            enable_db_logging: true,
            auto_persist_context: true,
        }
    }
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl QueueConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow::anyhow!("max_workers必须大于0"));
        }

        if self.min_workers > self.max_workers {
            return Err(anyhow::anyhow!("min_workers不能大于max_workers"));
        }

        if self.worker_idle_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("worker_idle_timeout_seconds必须大于0"));
        }

        if self.polling_interval_seconds == 0 || self.fallback_polling_interval_seconds == 0 {
            return Err(anyhow::anyhow!("轮询间隔必须大于0"));
        }

        if self.task_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("任务超时时间必须大于0"));
        }

        if self.max_retries < 0 {
            return Err(anyhow::anyhow!("max_retries不能为负数"));
        }

        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return Err(anyhow::anyhow!("重试退避基础间隔不能大于最大间隔"));
        }

        if self.use_push_notify && !is_valid_channel_name(&self.notify_channel) {
            return Err(anyhow::anyhow!(
                "无效的通知通道名称: {}",
                self.notify_channel
            ));
        }

        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }

        if self.heartbeat_timeout_seconds <= self.heartbeat_interval_seconds {
            return Err(anyhow::anyhow!("心跳超时时间必须大于心跳间隔"));
        }

        if self.cancel_check_interval_ms == 0 || self.wait_poll_interval_ms == 0 {
            return Err(anyhow::anyhow!("检查间隔必须大于0"));
        }

        Ok(())
    }

    /// 配置的进程名称，未配置时取 `主机名-进程号`，同一主机上的多个进程互不冲突
    pub fn resolve_server_name(&self) -> String {
        match &self.server_name {
            Some(name) if !name.trim().is_empty() => name.clone(),
            _ => {
                let host = hostname::get()
                    .ok()
                    .and_then(|name| name.into_string().ok())
                    .unwrap_or_else(|| "localhost".to_string());
                format!("{}-{}", host, std::process::id())
            }
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_interval_ms: self.retry_backoff_base_ms,
            max_interval_ms: self.retry_backoff_max_ms,
            ..RetryPolicy::default()
        }
    }

    pub fn worker_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.worker_idle_timeout_seconds)
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_seconds)
    }

    pub fn fallback_polling_interval(&self) -> Duration {
        Duration::from_secs(self.fallback_polling_interval_seconds)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_seconds)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_seconds)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_seconds)
    }

    pub fn cancel_check_interval(&self) -> Duration {
        Duration::from_millis(self.cancel_check_interval_ms)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

/// PostgreSQL LISTEN/NOTIFY 通道名: 字母或下划线开头，只含字母数字下划线
fn is_valid_channel_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 63 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
