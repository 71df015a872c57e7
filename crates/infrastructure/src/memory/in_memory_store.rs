use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qtask_core::{
    dependency::{blocked_child_transition, collect_descendants, initial_state},
    errors::{QueueError, QueueResult},
    models::{
        CancelOutcome, ChildResolution, FailOutcome, NewTask, NewTaskLogEntry,
        OrphanRequeueReport, Task, TaskFailure, TaskLogEntry, TaskState, TaskStateCounts,
        WorkerHeartbeat, WorkerRegistration,
    },
    traits::{TaskLogRepository, TaskRepository, TaskSignal, WorkerRepository},
};
use serde_json::{Map, Value};
use tracing::debug;

use crate::notifier::InMemoryNotifier;

const CASCADE_CANCEL_MESSAGE: &str = "父任务失败或被取消，任务未执行";

#[derive(Default)]
struct MemoryState {
    tasks: BTreeMap<i64, Task>,
    next_task_id: i64,
    logs: Vec<TaskLogEntry>,
    next_log_id: i64,
    workers: HashMap<String, WorkerRegistration>,
}

impl MemoryState {
    fn task_mut(&mut self, id: i64) -> QueueResult<&mut Task> {
        self.tasks.get_mut(&id).ok_or(QueueError::TaskNotFound { id })
    }

    fn children_of(&self, parent_id: i64) -> Vec<i64> {
        self.tasks
            .values()
            .filter(|task| task.parent_task_id == Some(parent_id))
            .map(|task| task.id)
            .collect()
    }

    /// 取消全部尚未开始的后代，返回被取消的ID
    fn cascade_cancel(&mut self, root: i64, now: DateTime<Utc>) -> Vec<i64> {
        let descendants = collect_descendants(root, |id| self.children_of(id));
        let mut cancelled = Vec::new();
        for id in descendants {
            if let Some(task) = self.tasks.get_mut(&id) {
                if matches!(task.state, TaskState::Pending | TaskState::Blocked) {
                    task.state = TaskState::Cancelled;
                    task.date_done = Some(now);
                    task.error_message = Some(CASCADE_CANCEL_MESSAGE.to_string());
                    cancelled.push(id);
                }
            }
        }
        cancelled
    }

    fn resolve_children(&mut self, parent_id: i64, now: DateTime<Utc>) -> QueueResult<ChildResolution> {
        let parent_state = self
            .tasks
            .get(&parent_id)
            .map(|task| task.state)
            .ok_or(QueueError::TaskNotFound { id: parent_id })?;

        match blocked_child_transition(parent_state) {
            Some(TaskState::Pending) => {
                let mut unblocked = Vec::new();
                for child_id in self.children_of(parent_id) {
                    if let Some(child) = self.tasks.get_mut(&child_id) {
                        if child.state == TaskState::Blocked {
                            child.state = TaskState::Pending;
                            unblocked.push(child_id);
                        }
                    }
                }
                Ok(ChildResolution {
                    unblocked,
                    cancelled: Vec::new(),
                })
            }
            Some(TaskState::Cancelled) => Ok(ChildResolution {
                unblocked: Vec::new(),
                cancelled: self.cascade_cancel(parent_id, now),
            }),
            _ => Ok(ChildResolution::default()),
        }
    }

    fn require_running(&self, id: i64, to: TaskState) -> QueueResult<()> {
        match self.tasks.get(&id) {
            Some(task) if task.state == TaskState::Running => Ok(()),
            Some(task) => Err(QueueError::InvalidStateTransition {
                id,
                from: task.state,
                to,
            }),
            None => Err(QueueError::TaskNotFound { id }),
        }
    }

    /// 对运行中的任务应用重试规则，返回结果与需要通知的任务
    fn apply_failure(
        &mut self,
        id: i64,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: Option<&Map<String, Value>>,
        now: DateTime<Utc>,
    ) -> QueueResult<(FailOutcome, Vec<i64>)> {
        let delay = chrono::Duration::from_std(retry_delay)
            .map_err(|e| QueueError::Internal(format!("无效的重试间隔: {e}")))?;

        let task = self.task_mut(id)?;
        task.error_message = Some(failure.message.clone());
        task.error_kind = Some(failure.kind.clone());
        if let Some(context) = context {
            task.context = context.clone();
        }

        if task.cancel_requested {
            task.state = TaskState::Cancelled;
            task.date_done = Some(now);
            let cancelled_descendants = self.cascade_cancel(id, now);
            return Ok((
                FailOutcome::Cancelled {
                    cancelled_descendants,
                },
                Vec::new(),
            ));
        }

        if task.has_retries_left() {
            let next_attempt_at = now + delay;
            task.retries_done += 1;
            task.state = TaskState::Pending;
            task.date_enqueued = next_attempt_at;
            task.claimed_by = None;
            return Ok((
                FailOutcome::Retrying {
                    retries_done: task.retries_done,
                    next_attempt_at,
                },
                vec![id],
            ));
        }

        task.state = TaskState::Failed;
        task.date_done = Some(now);
        let cancelled_descendants = self.cascade_cancel(id, now);
        Ok((
            FailOutcome::Failed {
                cancelled_descendants,
            },
            Vec::new(),
        ))
    }
}

/// 内存存储
///
/// 与PostgreSQL实现遵循相同的状态机与依赖规则，所有操作在一把锁内完成。
/// 用于测试和不需要持久化的嵌入场景。
#[derive(Clone, Default)]
pub struct InMemoryTaskStore {
    state: Arc<Mutex<MemoryState>>,
    notifier: Option<Arc<InMemoryNotifier>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 任务进入 `pending` 时通过该通道发送信号
    pub fn with_notifier(notifier: Arc<InMemoryNotifier>) -> Self {
        Self {
            state: Arc::default(),
            notifier: Some(notifier),
        }
    }

    fn lock(&self) -> QueueResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| QueueError::Internal("内存存储锁已中毒".to_string()))
    }

    fn notify(&self, task_ids: &[i64]) {
        if let Some(notifier) = &self.notifier {
            for id in task_ids {
                notifier.notify(TaskSignal::for_task(*id));
            }
        }
    }

    /// 直接修改心跳时间，用于模拟失联进程
    pub fn set_last_heartbeat(&self, server_name: &str, at: DateTime<Utc>) -> QueueResult<()> {
        let mut state = self.lock()?;
        let registration =
            state
                .workers
                .get_mut(server_name)
                .ok_or_else(|| QueueError::WorkerNotFound {
                    server_name: server_name.to_string(),
                })?;
        registration.last_heartbeat = at;
        Ok(())
    }

    /// 让重试等待中的任务立即到期
    pub fn make_due(&self, id: i64) -> QueueResult<()> {
        let mut state = self.lock()?;
        state.task_mut(id)?.date_enqueued = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for InMemoryTaskStore {
    async fn create(&self, new_task: &NewTask) -> QueueResult<Task> {
        let now = Utc::now();
        let task = {
            let mut state = self.lock()?;
            let parent_state = match new_task.parent_task_id {
                Some(parent_id) => Some(
                    state
                        .tasks
                        .get(&parent_id)
                        .map(|parent| parent.state)
                        .ok_or(QueueError::TaskNotFound { id: parent_id })?,
                ),
                None => None,
            };

            state.next_task_id += 1;
            let task_state = initial_state(parent_state);
            let cancelled = task_state == TaskState::Cancelled;
            let task = Task {
                id: state.next_task_id,
                name: new_task.name.clone(),
                executable: new_task.executable.clone(),
                args: new_task.args.clone(),
                kwargs: new_task.kwargs.clone(),
                state: task_state,
                parent_task_id: new_task.parent_task_id,
                context: new_task.context.clone(),
                result: None,
                error_message: cancelled.then(|| CASCADE_CANCEL_MESSAGE.to_string()),
                error_kind: None,
                retries_done: 0,
                max_retries: new_task.max_retries,
                cancel_requested: false,
                claimed_by: None,
                date_enqueued: now,
                date_started: None,
                date_done: cancelled.then_some(now),
            };
            state.tasks.insert(task.id, task.clone());
            task
        };

        if task.state == TaskState::Pending {
            self.notify(&[task.id]);
        }
        debug!(task_id = task.id, state = %task.state, "任务已写入内存存储");
        Ok(task)
    }

    async fn get_by_id(&self, id: i64) -> QueueResult<Option<Task>> {
        Ok(self.lock()?.tasks.get(&id).cloned())
    }

    async fn list_children(&self, parent_id: i64) -> QueueResult<Vec<Task>> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .filter(|task| task.parent_task_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn claim_next(&self, server_name: &str) -> QueueResult<Option<Task>> {
        let now = Utc::now();
        let mut state = self.lock()?;

        let next_id = state
            .tasks
            .values()
            .filter(|task| task.state == TaskState::Pending && task.date_enqueued <= now)
            .min_by_key(|task| (task.date_enqueued, task.id))
            .map(|task| task.id);

        let Some(id) = next_id else {
            return Ok(None);
        };

        let task = state.task_mut(id)?;
        task.state = TaskState::Running;
        task.date_started = Some(now);
        task.claimed_by = Some(server_name.to_string());
        task.cancel_requested = false;
        Ok(Some(task.clone()))
    }

    async fn complete(
        &self,
        id: i64,
        result: &Value,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        let now = Utc::now();
        let resolution = {
            let mut state = self.lock()?;
            state.require_running(id, TaskState::Done)?;

            let task = state.task_mut(id)?;
            task.state = TaskState::Done;
            task.result = Some(result.clone());
            task.context = context.clone();
            task.date_done = Some(now);
            task.error_message = None;
            task.error_kind = None;

            state.resolve_children(id, now)?
        };

        self.notify(&resolution.unblocked);
        Ok(resolution)
    }

    async fn fail(
        &self,
        id: i64,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: &Map<String, Value>,
    ) -> QueueResult<FailOutcome> {
        let (outcome, to_notify) = {
            let mut state = self.lock()?;
            state.require_running(id, TaskState::Failed)?;
            state.apply_failure(id, failure, retry_delay, Some(context), Utc::now())?
        };

        self.notify(&to_notify);
        Ok(outcome)
    }

    async fn mark_cancelled(
        &self,
        id: i64,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        let now = Utc::now();
        let mut state = self.lock()?;
        state.require_running(id, TaskState::Cancelled)?;

        let task = state.task_mut(id)?;
        task.state = TaskState::Cancelled;
        task.context = context.clone();
        task.date_done = Some(now);

        Ok(ChildResolution {
            unblocked: Vec::new(),
            cancelled: state.cascade_cancel(id, now),
        })
    }

    async fn request_cancel(&self, id: i64) -> QueueResult<CancelOutcome> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let task = state.task_mut(id)?;

        match task.state {
            TaskState::Pending | TaskState::Blocked => {
                task.state = TaskState::Cancelled;
                task.cancel_requested = true;
                task.date_done = Some(now);
                Ok(CancelOutcome::Cancelled {
                    cancelled_descendants: state.cascade_cancel(id, now),
                })
            }
            TaskState::Running => {
                task.cancel_requested = true;
                Ok(CancelOutcome::Requested)
            }
            terminal => Ok(CancelOutcome::AlreadyFinished(terminal)),
        }
    }

    async fn is_cancel_requested(&self, id: i64) -> QueueResult<bool> {
        self.lock()?
            .tasks
            .get(&id)
            .map(|task| task.cancel_requested)
            .ok_or(QueueError::TaskNotFound { id })
    }

    async fn update_context(&self, id: i64, context: &Map<String, Value>) -> QueueResult<()> {
        self.lock()?.task_mut(id)?.context = context.clone();
        Ok(())
    }

    async fn requeue_orphaned(&self, server_name: &str) -> QueueResult<OrphanRequeueReport> {
        let now = Utc::now();
        let failure = TaskFailure::worker_lost(server_name);
        let mut report = OrphanRequeueReport::default();
        let mut to_notify = Vec::new();

        {
            let mut state = self.lock()?;
            let orphans: Vec<i64> = state
                .tasks
                .values()
                .filter(|task| {
                    task.state == TaskState::Running
                        && task.claimed_by.as_deref() == Some(server_name)
                })
                .map(|task| task.id)
                .collect();

            for id in orphans {
                let (outcome, notify) =
                    state.apply_failure(id, &failure, Duration::ZERO, None, now)?;
                to_notify.extend(notify);
                match outcome {
                    FailOutcome::Retrying { .. } => report.requeued.push(id),
                    FailOutcome::Failed {
                        cancelled_descendants,
                    }
                    | FailOutcome::Cancelled {
                        cancelled_descendants,
                    } => {
                        report.failed.push(id);
                        report.cancelled_descendants.extend(cancelled_descendants);
                    }
                }
            }
        }

        self.notify(&to_notify);
        Ok(report)
    }

    async fn find_unresolved_parents(&self, limit: i64) -> QueueResult<Vec<i64>> {
        let state = self.lock()?;
        let mut parents: Vec<i64> = state
            .tasks
            .values()
            .filter(|child| child.state == TaskState::Blocked)
            .filter_map(|child| child.parent_task_id)
            .filter(|parent_id| {
                state
                    .tasks
                    .get(parent_id)
                    .is_some_and(|parent| parent.state.is_terminal())
            })
            .collect();
        parents.sort_unstable();
        parents.dedup();
        parents.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(parents)
    }

    async fn resolve_children(&self, parent_id: i64) -> QueueResult<ChildResolution> {
        let resolution = self.lock()?.resolve_children(parent_id, Utc::now())?;
        self.notify(&resolution.unblocked);
        Ok(resolution)
    }

    async fn count_by_state(&self) -> QueueResult<TaskStateCounts> {
        let state = self.lock()?;
        let mut counts = TaskStateCounts::default();
        for task in state.tasks.values() {
            counts.add(task.state, 1);
        }
        Ok(counts)
    }

    async fn cancel_all_pending(&self) -> QueueResult<u64> {
        let now = Utc::now();
        let mut state = self.lock()?;
        let mut cancelled = 0;
        for task in state.tasks.values_mut() {
            if matches!(task.state, TaskState::Pending | TaskState::Blocked) {
                task.state = TaskState::Cancelled;
                task.cancel_requested = true;
                task.date_done = Some(now);
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn has_active_named(&self, name: &str) -> QueueResult<bool> {
        Ok(self
            .lock()?
            .tasks
            .values()
            .any(|task| task.name == name && !task.is_finished()))
    }
}

#[async_trait]
impl TaskLogRepository for InMemoryTaskStore {
    async fn append(&self, entries: &[NewTaskLogEntry]) -> QueueResult<()> {
        let mut state = self.lock()?;
        for entry in entries {
            state.next_log_id += 1;
            let id = state.next_log_id;
            state.logs.push(TaskLogEntry {
                id,
                task_id: entry.task_id,
                log_type: entry.log_type,
                logged_at: entry.logged_at,
                name: entry.name.clone(),
                message: entry.message.clone(),
                info: entry.info.clone(),
            });
        }
        Ok(())
    }

    async fn list_for_task(&self, task_id: i64) -> QueueResult<Vec<TaskLogEntry>> {
        let mut entries: Vec<TaskLogEntry> = self
            .lock()?
            .logs
            .iter()
            .filter(|entry| entry.task_id == task_id)
            .cloned()
            .collect();
        entries.sort_by_key(|entry| (entry.logged_at, entry.id));
        Ok(entries)
    }
}

#[async_trait]
impl WorkerRepository for InMemoryTaskStore {
    async fn register(&self, registration: &WorkerRegistration) -> QueueResult<WorkerRegistration> {
        let mut registration = registration.clone();
        registration.is_running = true;
        self.lock()?
            .workers
            .insert(registration.server_name.clone(), registration.clone());
        Ok(registration)
    }

    async fn register_exclusive(
        &self,
        registration: &WorkerRegistration,
        stale_before: DateTime<Utc>,
    ) -> QueueResult<Option<WorkerRegistration>> {
        let mut state = self.lock()?;
        if let Some(existing) = state.workers.get(&registration.server_name) {
            if existing.is_running && existing.last_heartbeat >= stale_before {
                return Ok(None);
            }
        }

        let mut registration = registration.clone();
        registration.is_running = true;
        state
            .workers
            .insert(registration.server_name.clone(), registration.clone());
        Ok(Some(registration))
    }

    async fn heartbeat(&self, server_name: &str, heartbeat: &WorkerHeartbeat) -> QueueResult<()> {
        let mut state = self.lock()?;
        let registration =
            state
                .workers
                .get_mut(server_name)
                .ok_or_else(|| QueueError::WorkerNotFound {
                    server_name: server_name.to_string(),
                })?;
        registration.max_workers = heartbeat.max_workers;
        registration.active_workers = heartbeat.active_workers;
        registration.idle_workers = heartbeat.idle_workers;
        registration.is_running = true;
        registration.last_heartbeat = Utc::now();
        Ok(())
    }

    async fn mark_stopped(&self, server_name: &str) -> QueueResult<()> {
        if let Some(registration) = self.lock()?.workers.get_mut(server_name) {
            registration.is_running = false;
            registration.active_workers = 0;
            registration.idle_workers = 0;
        }
        Ok(())
    }

    async fn get(&self, server_name: &str) -> QueueResult<Option<WorkerRegistration>> {
        Ok(self.lock()?.workers.get(server_name).cloned())
    }

    async fn list_all(&self) -> QueueResult<Vec<WorkerRegistration>> {
        let mut registrations: Vec<WorkerRegistration> =
            self.lock()?.workers.values().cloned().collect();
        registrations.sort_by(|a, b| a.server_name.cmp(&b.server_name));
        Ok(registrations)
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> QueueResult<Vec<WorkerRegistration>> {
        let mut stale: Vec<WorkerRegistration> = self
            .lock()?
            .workers
            .values()
            .filter(|registration| registration.is_running && registration.last_heartbeat < older_than)
            .cloned()
            .collect();
        stale.sort_by_key(|registration| registration.last_heartbeat);
        Ok(stale)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use qtask_core::models::{Executable, FAILURE_KIND_WORKER_LOST};
    use qtask_core::traits::Notifier;
    use serde_json::json;

    fn new_task(path: &str, max_retries: i32) -> NewTask {
        NewTask::new(Executable::import(path), max_retries)
    }

    fn child_of(parent: &Task, path: &str) -> NewTask {
        let mut task = new_task(path, 0);
        task.parent_task_id = Some(parent.id);
        task
    }

    #[tokio::test]
    async fn test_claim_is_fifo_and_exclusive() {
        let store = InMemoryTaskStore::new();
        let first = store.create(&new_task("jobs.a", 0)).await.unwrap();
        let second = store.create(&new_task("jobs.b", 0)).await.unwrap();

        let claimed = store.claim_next("host-a").await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.state, TaskState::Running);
        assert_eq!(claimed.claimed_by.as_deref(), Some("host-a"));

        let claimed = store.claim_next("host-b").await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);
        assert!(store.claim_next("host-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_claim_clears_stale_cancel_flag() {
        let store = InMemoryTaskStore::new();
        let task = store.create(&new_task("jobs.retried", 1)).await.unwrap();
        store.lock().unwrap().task_mut(task.id).unwrap().cancel_requested = true;

        let claimed = store.claim_next("host").await.unwrap().unwrap();
        assert!(!claimed.cancel_requested);
        assert!(!store.is_cancel_requested(task.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_resolve_children_waits_for_terminal_parent() {
        let store = InMemoryTaskStore::new();
        let parent = store.create(&new_task("jobs.parent", 0)).await.unwrap();
        let child = store.create(&child_of(&parent, "jobs.child")).await.unwrap();
        store.claim_next("host").await.unwrap();

        // 父任务仍在运行，子任务保持阻塞
        let resolution = store.resolve_children(parent.id).await.unwrap();
        assert_eq!(resolution, ChildResolution::default());
        assert_eq!(
            store.get_by_id(child.id).await.unwrap().unwrap().state,
            TaskState::Blocked
        );

        store
            .fail(parent.id, &TaskFailure::new("Error", "x"), Duration::ZERO, &Map::new())
            .await
            .unwrap();
        assert_eq!(
            store.get_by_id(child.id).await.unwrap().unwrap().state,
            TaskState::Cancelled
        );
        assert_eq!(
            store.resolve_children(parent.id).await.unwrap().unblocked,
            Vec::<i64>::new()
        );
    }

    #[tokio::test]
    async fn test_child_state_follows_parent() {
        let store = InMemoryTaskStore::new();
        let parent = store.create(&new_task("jobs.parent", 0)).await.unwrap();
        let child = store.create(&child_of(&parent, "jobs.child")).await.unwrap();
        assert_eq!(child.state, TaskState::Blocked);

        store.claim_next("host").await.unwrap();
        let resolution = store.complete(parent.id, &json!(1), &Map::new()).await.unwrap();
        assert_eq!(resolution.unblocked, vec![child.id]);

        let late_child = store.create(&child_of(&parent, "jobs.late")).await.unwrap();
        assert_eq!(late_child.state, TaskState::Pending);
    }

    #[tokio::test]
    async fn test_missing_parent_is_rejected() {
        let store = InMemoryTaskStore::new();
        let mut task = new_task("jobs.orphan", 0);
        task.parent_task_id = Some(404);
        assert!(matches!(
            store.create(&task).await,
            Err(QueueError::TaskNotFound { id: 404 })
        ));
    }

    #[tokio::test]
    async fn test_failure_retries_then_cascades() {
        let store = InMemoryTaskStore::new();
        let parent = store.create(&new_task("jobs.flaky", 1)).await.unwrap();
        let child = store.create(&child_of(&parent, "jobs.child")).await.unwrap();
        let grandchild = store.create(&child_of(&child, "jobs.grandchild")).await.unwrap();
        let failure = TaskFailure::new("ValueError", "boom");

        store.claim_next("host").await.unwrap();
        let outcome = store
            .fail(parent.id, &failure, Duration::ZERO, &Map::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Retrying { retries_done: 1, .. }));

        store.claim_next("host").await.unwrap();
        let outcome = store
            .fail(parent.id, &failure, Duration::ZERO, &Map::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Failed {
                cancelled_descendants: vec![child.id, grandchild.id]
            }
        );

        let parent = store.get_by_id(parent.id).await.unwrap().unwrap();
        assert_eq!(parent.state, TaskState::Failed);
        assert_eq!(parent.retries_done, 1);
        assert_eq!(parent.error_kind.as_deref(), Some("ValueError"));
        assert!(parent.date_done.is_some());
    }

    #[tokio::test]
    async fn test_retry_delay_postpones_claim() {
        let store = InMemoryTaskStore::new();
        let task = store.create(&new_task("jobs.later", 2)).await.unwrap();
        store.claim_next("host").await.unwrap();
        store
            .fail(
                task.id,
                &TaskFailure::new("Error", "retry later"),
                Duration::from_secs(3600),
                &Map::new(),
            )
            .await
            .unwrap();

        assert!(store.claim_next("host").await.unwrap().is_none());
        store.make_due(task.id).unwrap();
        assert!(store.claim_next("host").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_request_cancel_by_state() {
        let store = InMemoryTaskStore::new();
        let running = store.create(&new_task("jobs.running", 0)).await.unwrap();
        let pending = store.create(&new_task("jobs.pending", 0)).await.unwrap();
        store.claim_next("host").await.unwrap();

        assert_eq!(
            store.request_cancel(running.id).await.unwrap(),
            CancelOutcome::Requested
        );
        assert!(store.is_cancel_requested(running.id).await.unwrap());

        assert!(matches!(
            store.request_cancel(pending.id).await.unwrap(),
            CancelOutcome::Cancelled { .. }
        ));
        assert_eq!(
            store.request_cancel(pending.id).await.unwrap(),
            CancelOutcome::AlreadyFinished(TaskState::Cancelled)
        );

        // 运行中收到取消请求后失败，不再重试
        let outcome = store
            .fail(running.id, &TaskFailure::new("Error", "x"), Duration::ZERO, &Map::new())
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_terminal_task_cannot_be_completed_again() {
        let store = InMemoryTaskStore::new();
        let task = store.create(&new_task("jobs.once", 0)).await.unwrap();
        store.claim_next("host").await.unwrap();
        store.complete(task.id, &json!("ok"), &Map::new()).await.unwrap();

        let err = store
            .complete(task.id, &json!("again"), &Map::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidStateTransition {
                from: TaskState::Done,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_requeue_orphaned_counts_retries() {
        let store = InMemoryTaskStore::new();
        let retryable = store.create(&new_task("jobs.retryable", 1)).await.unwrap();
        let exhausted = store.create(&new_task("jobs.exhausted", 0)).await.unwrap();
        store.claim_next("dead-host").await.unwrap();
        store.claim_next("dead-host").await.unwrap();

        let report = store.requeue_orphaned("dead-host").await.unwrap();
        assert_eq!(report.requeued, vec![retryable.id]);
        assert_eq!(report.failed, vec![exhausted.id]);

        let exhausted = store.get_by_id(exhausted.id).await.unwrap().unwrap();
        assert_eq!(exhausted.state, TaskState::Failed);
        assert_eq!(exhausted.error_kind.as_deref(), Some(FAILURE_KIND_WORKER_LOST));
    }

    #[tokio::test]
    async fn test_pending_transitions_are_signalled() {
        let notifier = Arc::new(InMemoryNotifier::default());
        let store = InMemoryTaskStore::with_notifier(Arc::clone(&notifier));
        let mut signals = notifier.subscribe().await.unwrap();

        let parent = store.create(&new_task("jobs.parent", 0)).await.unwrap();
        let child = store.create(&child_of(&parent, "jobs.child")).await.unwrap();
        assert_eq!(signals.next().await.unwrap().unwrap().task_id, Some(parent.id));

        store.claim_next("host").await.unwrap();
        store.complete(parent.id, &Value::Null, &Map::new()).await.unwrap();
        assert_eq!(signals.next().await.unwrap().unwrap().task_id, Some(child.id));
    }

    #[tokio::test]
    async fn test_find_stale_workers() {
        let store = InMemoryTaskStore::new();
        store.register(&WorkerRegistration::new("host-a", 2)).await.unwrap();
        store.register(&WorkerRegistration::new("host-b", 2)).await.unwrap();
        store
            .set_last_heartbeat("host-a", Utc::now() - chrono::Duration::minutes(10))
            .unwrap();

        let stale = store
            .find_stale(Utc::now() - chrono::Duration::minutes(2))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].server_name, "host-a");

        assert!(matches!(
            store.heartbeat("host-z", &WorkerHeartbeat::default()).await,
            Err(QueueError::WorkerNotFound { .. })
        ));
    }
    #[tokio::test]
    async fn test_register_exclusive_respects_live_holder() {
        let store = InMemoryTaskStore::new();
        let cutoff = || Utc::now() - chrono::Duration::seconds(120);

        let first = store
            .register_exclusive(&WorkerRegistration::new("shared", 2), cutoff())
            .await
            .unwrap();
        assert!(first.is_some());
        assert!(store
            .register_exclusive(&WorkerRegistration::new("shared", 4), cutoff())
            .await
            .unwrap()
            .is_none());
        assert_eq!(store.get("shared").await.unwrap().unwrap().max_workers, 2);

        // 停止或心跳超时后可以被接管
        store.mark_stopped("shared").await.unwrap();
        assert!(store
            .register_exclusive(&WorkerRegistration::new("shared", 4), cutoff())
            .await
            .unwrap()
            .is_some());
        store
            .set_last_heartbeat("shared", Utc::now() - chrono::Duration::seconds(600))
            .unwrap();
        let taken = store
            .register_exclusive(&WorkerRegistration::new("shared", 8), cutoff())
            .await
            .unwrap()
            .unwrap();
        assert!(taken.is_running);
        assert_eq!(taken.max_workers, 8);
    }
}
