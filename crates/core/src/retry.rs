use std::time::Duration;

use serde::{Deserialize, Serialize};

/// 失败重新入队的退避策略
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 基础重试间隔（毫秒）
    pub base_interval_ms: u64,
    /// 最大重试间隔（毫秒）
    pub max_interval_ms: u64,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_interval_ms: 1_000,
            max_interval_ms: 60_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryPolicy {
    /// 不等待，立即重新入队
    pub fn immediate() -> Self {
        Self {
            base_interval_ms: 0,
            max_interval_ms: 0,
            backoff_multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// 计算第 `retries_done` 次失败之后的等待时间
    pub fn delay_for(&self, retries_done: i32) -> Duration {
        let base_interval = self.base_interval_ms as f64;
        let max_interval = self.max_interval_ms as f64;
        if base_interval <= 0.0 || max_interval <= 0.0 {
            return Duration::ZERO;
        }

        let exponential_interval = base_interval * self.backoff_multiplier.powi(retries_done.max(0));
        let capped_interval = exponential_interval.min(max_interval);

        // 随机抖动，避免多个任务同时重新入队
        let jitter = capped_interval * self.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0;
        let final_interval = (capped_interval + jitter).clamp(0.0, max_interval);

        Duration::from_millis(final_interval as u64)
    }
}
