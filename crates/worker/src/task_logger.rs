//! 任务执行期间的日志捕获
//!
//! 任务函数在名为 `queued_task` 的 span 内运行。`TaskLogLayer` 把该 span 内产生的 tracing 事件
//! 转换为 `NewTaskLogEntry`，`TaskLogWriter` 在后台批量写入任务日志表。

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::span::{Attributes, Id};
use tracing::{warn, Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

use qtask_core::{
    models::{NewTaskLogEntry, TaskLogLevel},
    traits::TaskLogRepository,
};

/// 执行任务函数的 span 名称
pub const TASK_SPAN_NAME: &str = "queued_task";

const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
struct TaskLogSpan {
    task_id: i64,
}

#[derive(Default)]
struct TaskIdVisitor {
    task_id: Option<i64>,
}

impl Visit for TaskIdVisitor {
    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "task_id" {
            self.task_id = Some(value);
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        if field.name() == "task_id" {
            self.task_id = i64::try_from(value).ok();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "task_id" {
            self.task_id = format!("{value:?}").parse().ok();
        }
    }
}

#[derive(Default)]
struct EventVisitor {
    message: Option<String>,
    fields: Map<String, Value>,
}

impl EventVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        self.fields.insert(field.name().to_string(), value);
    }
}

impl Visit for EventVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.insert(field, Value::from(value));
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = Some(format!("{value:?}"));
        } else {
            self.insert(field, Value::from(format!("{value:?}")));
        }
    }
}

/// 捕获任务 span 内日志事件的 tracing layer
#[derive(Clone)]
pub struct TaskLogLayer {
    sender: mpsc::UnboundedSender<NewTaskLogEntry>,
}

impl TaskLogLayer {
    /// 创建 layer 以及接收日志条目的通道
    pub fn new() -> (Self, mpsc::UnboundedReceiver<NewTaskLogEntry>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl<S> Layer<S> for TaskLogLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, ctx: Context<'_, S>) {
        if attrs.metadata().name() != TASK_SPAN_NAME {
            return;
        }

        let mut visitor = TaskIdVisitor::default();
        attrs.record(&mut visitor);
        if let (Some(task_id), Some(span)) = (visitor.task_id, ctx.span(id)) {
            span.extensions_mut().insert(TaskLogSpan { task_id });
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let Some(scope) = ctx.event_scope(event) else {
            return;
        };
        let Some(task_id) = scope
            .into_iter()
            .find_map(|span| span.extensions().get::<TaskLogSpan>().map(|s| s.task_id))
        else {
            return;
        };

        let mut visitor = EventVisitor::default();
        event.record(&mut visitor);
        let metadata = event.metadata();

        let entry = NewTaskLogEntry {
            task_id,
            log_type: TaskLogLevel::from(metadata.level()),
            logged_at: Utc::now(),
            name: metadata.target().to_string(),
            message: visitor.message.unwrap_or_default(),
            info: (!visitor.fields.is_empty()).then(|| Value::Object(visitor.fields)),
        };
        // 写入端已停止时丢弃
        let _ = self.sender.send(entry);
    }
}

/// 批量写入任务日志的后台任务
pub struct TaskLogWriter {
    repository: Arc<dyn TaskLogRepository>,
    batch_size: usize,
    flush_interval: Duration,
}

impl TaskLogWriter {
    pub fn new(repository: Arc<dyn TaskLogRepository>) -> Self {
        Self {
            repository,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }

    pub fn with_flush_interval(mut self, flush_interval: Duration) -> Self {
        self.flush_interval = flush_interval;
        self
    }

    /// 运行到通道关闭为止，关闭前写入剩余条目
    pub fn spawn(self, mut receiver: mpsc::UnboundedReceiver<NewTaskLogEntry>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buffer: Vec<NewTaskLogEntry> = Vec::with_capacity(self.batch_size);
            let mut ticker = tokio::time::interval(self.flush_interval);

            loop {
                tokio::select! {
                    entry = receiver.recv() => match entry {
                        Some(entry) => {
                            buffer.push(entry);
                            if buffer.len() >= self.batch_size {
                                self.flush(&mut buffer).await;
                            }
                        }
                        None => {
                            self.flush(&mut buffer).await;
                            break;
                        }
                    },
                    _ = ticker.tick() => self.flush(&mut buffer).await,
                }
            }
        })
    }

    async fn flush(&self, buffer: &mut Vec<NewTaskLogEntry>) {
        if buffer.is_empty() {
            return;
        }
        if let Err(e) = self.repository.append(buffer).await {
            // 根事件，不会被 TaskLogLayer 再次捕获
            warn!(parent: None, "写入任务日志失败({}条): {}", buffer.len(), e);
        }
        buffer.clear();
    }
}
