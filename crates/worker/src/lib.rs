//! # qtask-worker
//!
//! 任务执行侧：执行器注册表、任务执行上下文、Worker池与进程监督者，
//! 以及把任务执行期间的日志写入任务日志表的 tracing layer。

pub mod execution;
pub mod executor_registry;
pub mod executors;
pub mod manager;
pub mod pool;
pub mod task_context;
pub mod task_logger;

pub use execution::{ExecutionReport, ExecutionRuntime, FAILURE_KIND_PANIC};
pub use executor_registry::{
    ClosureCodec, ExecutorRegistry, FnTask, TaskArgs, TaskError, TaskFunction, DEFAULT_ERROR_KIND,
};
pub use executors::{ShellCommand, ECHO_TASK_PATH, SHELL_JSON_SCHEME};
pub use manager::{QueueWorkerManager, QueueWorkerManagerBuilder};
pub use pool::{PoolLimits, PoolStats, WorkerPool};
pub use task_context::{CancellationFlag, TaskCancelled, TaskContext};
pub use task_logger::{TaskLogLayer, TaskLogWriter, TASK_SPAN_NAME};
