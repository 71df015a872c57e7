//! 任务执行上下文追踪
//!
//! 每次执行尝试持有一个 [`ContextTracker`]，以显式参数的形式交给任务函数和钩子。
//! 键使用点号分隔的路径(`"progress.percent"`)访问嵌套对象。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use crate::errors::{QueueError, QueueResult};
use crate::traits::TaskRepository;

/// 按点号路径读取嵌套值
pub fn get_path<'a>(context: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = context.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

/// 按点号路径写入嵌套值，自动创建缺失的中间对象
///
/// 中间节点已存在但不是对象时返回 `InvalidContextPath`。
pub fn set_path(context: &mut Map<String, Value>, path: &str, value: Value) -> QueueResult<()> {
    let segments: Vec<&str> = path.split('.').collect();
    if segments.iter().any(|segment| segment.is_empty()) {
        return Err(QueueError::InvalidContextPath(path.to_string()));
    }

    let (last, parents) = segments
        .split_last()
        .ok_or_else(|| QueueError::InvalidContextPath(path.to_string()))?;

    let mut current = context;
    for segment in parents {
        let entry = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        current = entry
            .as_object_mut()
            .ok_or_else(|| QueueError::InvalidContextPath(path.to_string()))?;
    }
    current.insert(last.to_string(), value);
    Ok(())
}

struct TrackerState {
    values: Map<String, Value>,
    dirty: bool,
}

/// 单次执行尝试的上下文
///
/// 同一任务同一时刻只有一个Worker在执行，因此这里只需要进程内的互斥。
/// 克隆得到的是同一份上下文的句柄。
#[derive(Clone)]
pub struct ContextTracker {
    task_id: i64,
    state: Arc<Mutex<TrackerState>>,
    store: Option<Arc<dyn TaskRepository>>,
    auto_persist: Arc<AtomicBool>,
}

impl std::fmt::Debug for ContextTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextTracker")
            .field("task_id", &self.task_id)
            .field("values", &self.snapshot())
            .field("attached", &self.store.is_some())
            .finish()
    }
}

impl ContextTracker {
    /// 不关联存储的上下文，只在内存中生效
    pub fn detached(task_id: i64, initial: Map<String, Value>) -> Self {
        Self {
            task_id,
            state: Arc::new(Mutex::new(TrackerState {
                values: initial,
                dirty: false,
            })),
            store: None,
            auto_persist: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 关联任务存储的上下文
    pub fn attached(
        task_id: i64,
        initial: Map<String, Value>,
        store: Arc<dyn TaskRepository>,
        auto_persist: bool,
    ) -> Self {
        let mut tracker = Self::detached(task_id, initial);
        tracker.store = Some(store);
        tracker.auto_persist.store(auto_persist, Ordering::SeqCst);
        tracker
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    pub fn auto_persist(&self) -> bool {
        self.auto_persist.load(Ordering::SeqCst)
    }

    /// 高频更新时可以关闭自动持久化，改为显式 `flush`
    pub fn set_auto_persist(&self, enabled: bool) {
        self.auto_persist.store(enabled, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        // 持锁期间不会panic，中毒时直接取回数据
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        get_path(&self.lock().values, path).cloned()
    }

    pub fn get_or(&self, path: &str, default: Value) -> Value {
        self.get(path).unwrap_or(default)
    }

    /// 写入一个值；开启自动持久化时立即写回存储
    pub async fn set<T: Serialize>(&self, path: &str, value: T) -> QueueResult<()> {
        self.set_deferred(path, value)?;
        if self.auto_persist() {
            self.flush().await?;
        }
        Ok(())
    }

    /// 只修改内存中的值，等待下一次 `flush`
    pub fn set_deferred<T: Serialize>(&self, path: &str, value: T) -> QueueResult<()> {
        let value = serde_json::to_value(value)?;
        let mut state = self.lock();
        set_path(&mut state.values, path, value)?;
        state.dirty = true;
        Ok(())
    }

    /// 整体替换上下文
    pub async fn replace(&self, values: Map<String, Value>) -> QueueResult<()> {
        {
            let mut state = self.lock();
            state.values = values;
            state.dirty = true;
        }
        if self.auto_persist() {
            self.flush().await?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> Map<String, Value> {
        self.lock().values.clone()
    }

    pub fn is_dirty(&self) -> bool {
        self.lock().dirty
    }

    /// 将未持久化的修改写回任务记录
    pub async fn flush(&self) -> QueueResult<()> {
        let Some(store) = &self.store else {
            self.lock().dirty = false;
            return Ok(());
        };

        let snapshot = {
            let mut state = self.lock();
            if !state.dirty {
                return Ok(());
            }
            state.dirty = false;
            state.values.clone()
        };

        if let Err(e) = store.update_context(self.task_id, &snapshot).await {
            self.lock().dirty = true;
            return Err(e);
        }
        debug!(task_id = self.task_id, "任务上下文已持久化");
        Ok(())
    }

    /// 由最终状态写入携带上下文后调用，清除未持久化标记
    pub fn mark_persisted(&self) {
        self.lock().dirty = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_get_path_nested() {
        let context = map(json!({"progress": {"percent": 40}, "step": "load"}));
        assert_eq!(get_path(&context, "progress.percent"), Some(&json!(40)));
        assert_eq!(get_path(&context, "step"), Some(&json!("load")));
        assert_eq!(get_path(&context, "progress.missing"), None);
        assert_eq!(get_path(&context, "step.inner"), None);
    }

    #[test]
    fn test_set_path_creates_intermediate_objects() {
        let mut context = Map::new();
        set_path(&mut context, "a.b.c", json!(1)).unwrap();
        assert_eq!(Value::Object(context), json!({"a": {"b": {"c": 1}}}));
    }

    #[test]
    fn test_set_path_rejects_invalid_paths() {
        let mut context = map(json!({"step": "load"}));
        assert!(matches!(
            set_path(&mut context, "step.inner", json!(1)),
            Err(QueueError::InvalidContextPath(_))
        ));
        assert!(set_path(&mut context, "", json!(1)).is_err());
        assert!(set_path(&mut context, "a..b", json!(1)).is_err());
    }

    #[tokio::test]
    async fn test_detached_tracker_set_and_flush() {
        let tracker = ContextTracker::detached(1, Map::new());
        tracker.set("progress.percent", 50).await.unwrap();
        assert_eq!(tracker.get("progress.percent"), Some(json!(50)));
        assert!(tracker.is_dirty());

        tracker.flush().await.unwrap();
        assert!(!tracker.is_dirty());
    }

    #[test]
    fn test_clones_share_state() {
        let tracker = ContextTracker::detached(1, Map::new());
        let clone = tracker.clone();
        clone.set_deferred("step", "transform").unwrap();
        assert_eq!(tracker.get("step"), Some(json!("transform")));
        assert_eq!(tracker.get_or("missing", json!(0)), json!(0));
    }
}
