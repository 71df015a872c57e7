use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// 进程级Worker池注册信息，每个 `server_name` 一条
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRegistration {
    pub server_name: String,
    pub max_workers: i32,
    pub active_workers: i32,
    pub idle_workers: i32,
    pub is_running: bool,
    pub last_heartbeat: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub version: String,
}

impl WorkerRegistration {
    /// 创建新的注册信息
    pub fn new(server_name: impl Into<String>, max_workers: i32) -> Self {
        let now = Utc::now();
        Self {
            server_name: server_name.into(),
            max_workers,
            active_workers: 0,
            idle_workers: 0,
            is_running: true,
            last_heartbeat: now,
            started_at: now,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        now - self.last_heartbeat > timeout
    }

    /// 运行中且心跳未超时
    pub fn is_alive(&self, timeout: Duration, now: DateTime<Utc>) -> bool {
        self.is_running && !self.is_heartbeat_expired(timeout, now)
    }

    pub fn total_workers(&self) -> i32 {
        self.active_workers + self.idle_workers
    }
}

/// 心跳时上报的池内计数
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkerHeartbeat {
    pub max_workers: i32,
    pub active_workers: i32,
    pub idle_workers: i32,
}

/// 所有存活进程的汇总统计
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct GlobalWorkerStats {
    pub servers: usize,
    pub max_workers: i64,
    pub active_workers: i64,
    pub idle_workers: i64,
}

impl GlobalWorkerStats {
    pub fn from_registrations(
        registrations: &[WorkerRegistration],
        timeout: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        registrations
            .iter()
            .filter(|registration| registration.is_alive(timeout, now))
            .fold(Self::default(), |mut stats, registration| {
                stats.servers += 1;
                stats.max_workers += i64::from(registration.max_workers);
                stats.active_workers += i64::from(registration.active_workers);
                stats.idle_workers += i64::from(registration.idle_workers);
                stats
            })
    }

    pub fn total_workers(&self) -> i64 {
        self.active_workers + self.idle_workers
    }
}
