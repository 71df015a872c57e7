use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use qtask_core::{
    errors::{QueueError, QueueResult},
    traits::{Notifier, TaskSignal},
};
use sqlx::postgres::PgListener;
use sqlx::PgPool;
use tracing::{debug, info, warn};

/// 基于 PostgreSQL LISTEN/NOTIFY 的通知通道
pub struct PgNotifier {
    pool: PgPool,
    channel: String,
}

impl PgNotifier {
    pub fn new(pool: PgPool, channel: impl Into<String>) -> Self {
        Self {
            pool,
            channel: channel.into(),
        }
    }
}

#[async_trait]
impl Notifier for PgNotifier {
    fn channel(&self) -> &str {
        &self.channel
    }

    async fn subscribe(&self) -> QueueResult<BoxStream<'static, QueueResult<TaskSignal>>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(&self.channel).await?;
        info!("已订阅通知通道: {}", self.channel);

        // 连接断开期间的通知会丢失，因此断开时以错误结束流，由调用方降级轮询后重新订阅
        let channel = self.channel.clone();
        let signals = stream::unfold(Some(listener), move |listener| {
            let channel = channel.clone();
            async move {
                let mut listener = listener?;
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        debug!("收到通知: {}", notification.payload());
                        Some((
                            Ok(TaskSignal::from_payload(notification.payload())),
                            Some(listener),
                        ))
                    }
                    Ok(None) => {
                        warn!("通知通道 {} 的连接已断开", channel);
                        Some((
                            Err(QueueError::Notifier(format!("通道 {channel} 的连接已断开"))),
                            None,
                        ))
                    }
                    Err(e) => Some((Err(QueueError::Database(e)), None)),
                }
            }
        });

        Ok(signals.boxed())
    }
}
