//! Test data builders

use chrono::{DateTime, Utc};
use qtask_core::models::{Executable, NewTask, WorkerRegistration};
use serde_json::Value;

/// Builder for `NewTask` definitions
pub struct TaskBuilder {
    task: NewTask,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: NewTask::new(Executable::import("tests.noop"), 0),
        }
    }

    /// Task referencing an import path, named after the path
    pub fn import(path: &str) -> Self {
        Self {
            task: NewTask::new(Executable::import(path), 0),
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_executable(mut self, executable: Executable) -> Self {
        self.task.executable = executable;
        self
    }

    pub fn with_arg(mut self, value: Value) -> Self {
        self.task.args.push(value);
        self
    }

    pub fn with_kwarg(mut self, key: &str, value: Value) -> Self {
        self.task.kwargs.insert(key.to_string(), value);
        self
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.task.context.insert(key.to_string(), value);
        self
    }

    pub fn with_parent(mut self, parent_id: i64) -> Self {
        self.task.parent_task_id = Some(parent_id);
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn build(self) -> NewTask {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for worker pool registrations
pub struct WorkerRegistrationBuilder {
    registration: WorkerRegistration,
}

impl WorkerRegistrationBuilder {
    pub fn new(server_name: &str) -> Self {
        Self {
            registration: WorkerRegistration::new(server_name, 4),
        }
    }

    pub fn with_max_workers(mut self, max_workers: i32) -> Self {
        self.registration.max_workers = max_workers;
        self
    }

    pub fn with_counts(mut self, active: i32, idle: i32) -> Self {
        self.registration.active_workers = active;
        self.registration.idle_workers = idle;
        self
    }

    pub fn with_last_heartbeat(mut self, at: DateTime<Utc>) -> Self {
        self.registration.last_heartbeat = at;
        self
    }

    pub fn stopped(mut self) -> Self {
        self.registration.is_running = false;
        self
    }

    pub fn build(self) -> WorkerRegistration {
        self.registration
    }
}
