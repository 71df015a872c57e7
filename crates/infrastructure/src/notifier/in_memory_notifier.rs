use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use qtask_core::{
    errors::{QueueError, QueueResult},
    traits::{Notifier, TaskSignal},
};
use tokio::sync::broadcast;

/// 进程内通知通道
///
/// 可以模拟连接断开，用于验证轮询降级。
pub struct InMemoryNotifier {
    channel: String,
    // None 表示连接断开
    sender: broadcast::Sender<Option<TaskSignal>>,
    available: AtomicBool,
}

impl InMemoryNotifier {
    pub fn new(channel: impl Into<String>) -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            channel: channel.into(),
            sender,
            available: AtomicBool::new(true),
        }
    }

    /// 同步发送信号，断开期间的信号直接丢弃
    pub fn notify(&self, signal: TaskSignal) {
        if self.available.load(Ordering::SeqCst) {
            let _ = self.sender.send(Some(signal));
        }
    }

    /// 断开所有订阅者，之后的订阅在 `reconnect` 之前都会失败
    pub fn disconnect(&self) {
        self.available.store(false, Ordering::SeqCst);
        let _ = self.sender.send(None);
    }

    pub fn reconnect(&self) {
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryNotifier {
    fn default() -> Self {
        Self::new("queued_new_task")
    }
}

#[async_trait]
impl Notifier for InMemoryNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn subscribe(&self) -> QueueResult<BoxStream<'static, QueueResult<TaskSignal>>> {
        if !self.is_available() {
            return Err(QueueError::Notifier(format!("通道 {} 不可用", self.channel)));
        }

        let channel = self.channel.clone();
        let signals = stream::unfold(Some(self.sender.subscribe()), move |receiver| {
            let channel = channel.clone();
            async move {
                let mut receiver = receiver?;
                match receiver.recv().await {
                    Ok(Some(signal)) => Some((Ok(signal), Some(receiver))),
                    // 落后的订阅者只需要知道"有任务"
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        Some((Ok(TaskSignal::default()), Some(receiver)))
                    }
                    Ok(None) | Err(broadcast::error::RecvError::Closed) => Some((
                        Err(QueueError::Notifier(format!("通道 {channel} 的连接已断开"))),
                        None,
                    )),
                }
            }
        });

        Ok(signals.boxed())
    }
}
