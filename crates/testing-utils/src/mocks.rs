//! Test doubles for hooks and repositories

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use qtask_core::context::ContextTracker;
use qtask_core::errors::{QueueError, QueueResult};
use qtask_core::hooks::QueueHook;
use qtask_core::models::{
    CancelOutcome, ChildResolution, FailOutcome, NewTask, OrphanRequeueReport, RunOutcome, Task,
    TaskFailure, TaskStateCounts,
};
use qtask_core::traits::TaskRepository;
use serde_json::{Map, Value};

/// One recorded hook invocation
#[derive(Debug, Clone, PartialEq)]
pub enum HookEvent {
    PreCreate(String),
    PostCreate(i64),
    PreRun(i64),
    PostRun(i64, RunOutcome),
}

/// Hook that records every invocation in order
#[derive(Default, Clone)]
pub struct RecordingHook {
    events: Arc<Mutex<Vec<HookEvent>>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    fn record(&self, event: HookEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

#[async_trait]
impl QueueHook for RecordingHook {
    fn name(&self) -> &str {
        "recording"
    }

    async fn pre_create(&self, task: &mut NewTask) -> anyhow::Result<()> {
        self.record(HookEvent::PreCreate(task.name.clone()));
        Ok(())
    }

    async fn post_create(&self, task: &Task) -> anyhow::Result<()> {
        self.record(HookEvent::PostCreate(task.id));
        Ok(())
    }

    async fn pre_run(&self, task: &Task, _context: &ContextTracker) -> anyhow::Result<()> {
        self.record(HookEvent::PreRun(task.id));
        Ok(())
    }

    async fn post_run(
        &self,
        task: &Task,
        _context: &ContextTracker,
        outcome: &RunOutcome,
    ) -> anyhow::Result<()> {
        self.record(HookEvent::PostRun(task.id, outcome.clone()));
        Ok(())
    }
}

/// Task repository whose reads fail a fixed number of times before delegating
pub struct FlakyTaskRepository {
    inner: Arc<dyn TaskRepository>,
    remaining_failures: AtomicUsize,
}

impl FlakyTaskRepository {
    pub fn new(inner: Arc<dyn TaskRepository>, failures: usize) -> Self {
        Self {
            inner,
            remaining_failures: AtomicUsize::new(failures),
        }
    }

    fn maybe_fail(&self) -> QueueResult<()> {
        let consumed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(QueueError::Internal("simulated store outage".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl TaskRepository for FlakyTaskRepository {
    async fn create(&self, task: &NewTask) -> QueueResult<Task> {
        self.inner.create(task).await
    }

    async fn get_by_id(&self, id: i64) -> QueueResult<Option<Task>> {
        self.maybe_fail()?;
        self.inner.get_by_id(id).await
    }

    async fn list_children(&self, parent_id: i64) -> QueueResult<Vec<Task>> {
        self.inner.list_children(parent_id).await
    }

    async fn claim_next(&self, server_name: &str) -> QueueResult<Option<Task>> {
        self.inner.claim_next(server_name).await
    }

    async fn complete(
        &self,
        id: i64,
        result: &Value,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        self.inner.complete(id, result, context).await
    }

    async fn fail(
        &self,
        id: i64,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: &Map<String, Value>,
    ) -> QueueResult<FailOutcome> {
        self.inner.fail(id, failure, retry_delay, context).await
    }

    async fn mark_cancelled(
        &self,
        id: i64,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        self.inner.mark_cancelled(id, context).await
    }

    async fn request_cancel(&self, id: i64) -> QueueResult<CancelOutcome> {
        self.inner.request_cancel(id).await
    }

    async fn is_cancel_requested(&self, id: i64) -> QueueResult<bool> {
        self.inner.is_cancel_requested(id).await
    }

    async fn update_context(&self, id: i64, context: &Map<String, Value>) -> QueueResult<()> {
        self.inner.update_context(id, context).await
    }

    async fn requeue_orphaned(&self, server_name: &str) -> QueueResult<OrphanRequeueReport> {
        self.inner.requeue_orphaned(server_name).await
    }

    async fn find_unresolved_parents(&self, limit: i64) -> QueueResult<Vec<i64>> {
        self.inner.find_unresolved_parents(limit).await
    }

    async fn resolve_children(&self, parent_id: i64) -> QueueResult<ChildResolution> {
        self.inner.resolve_children(parent_id).await
    }

    async fn count_by_state(&self) -> QueueResult<TaskStateCounts> {
        self.inner.count_by_state().await
    }

    async fn cancel_all_pending(&self) -> QueueResult<u64> {
        self.inner.cancel_all_pending().await
    }

    async fn has_active_named(&self, name: &str) -> QueueResult<bool> {
        self.maybe_fail()?;
        self.inner.has_active_named(name).await
    }
}
