pub mod queued_tasks;
pub mod task_handle;

pub use queued_tasks::{EnqueueRequest, QueuedTasks};
pub use task_handle::{TaskHandle, TaskWaitError};
