use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::errors::QueueResult;

/// 通道上传递的派发信号
///
/// 信号只用于唤醒空闲Worker，丢失或重复都不影响正确性。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSignal {
    pub task_id: Option<i64>,
}

impl TaskSignal {
    pub fn for_task(task_id: i64) -> Self {
        Self {
            task_id: Some(task_id),
        }
    }

    /// 通道负载即任务ID的十进制文本，空负载表示"有任务可认领"
    pub fn to_payload(&self) -> String {
        self.task_id.map(|id| id.to_string()).unwrap_or_default()
    }

    pub fn from_payload(payload: &str) -> Self {
        Self {
            task_id: payload.trim().parse().ok(),
        }
    }
}

/// 订阅一侧的通知通道
///
/// 信号由存储在状态变更的同一事务内发出，这里只负责接收。
#[async_trait]
pub trait Notifier: Send + Sync {
    fn channel(&self) -> &str;

    /// 订阅通道。流中出现错误表示连接已断开，调用方应降级到快速轮询并重新订阅
    async fn subscribe(&self) -> QueueResult<BoxStream<'static, QueueResult<TaskSignal>>>;
}
