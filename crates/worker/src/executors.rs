use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use qtask_core::{QueueError, QueueResult};

use crate::executor_registry::{ClosureCodec, ExecutorRegistry, TaskArgs, TaskError, TaskFunction};
use crate::task_context::{TaskCancelled, TaskContext};

pub const ECHO_TASK_PATH: &str = "qtask.builtin.echo";
pub const SHELL_JSON_SCHEME: &str = "shell+json";

pub(crate) fn register_builtins(registry: &mut ExecutorRegistry) {
    registry.register(ECHO_TASK_PATH, Arc::new(EchoTask));
    registry.register_codec(Arc::new(ShellJsonCodec));
}

/// 返回收到的参数
///
/// 关键字参数 `sleep_ms` 让任务在返回前等待(期间响应取消)，
/// `fail_with` 让任务以该字符串作为错误类别失败。
pub struct EchoTask;

#[async_trait]
impl TaskFunction for EchoTask {
    async fn call(&self, ctx: TaskContext, args: TaskArgs) -> anyhow::Result<Value> {
        info!("echo任务执行: 第{}次尝试", ctx.attempt());

        if let Some(sleep_ms) = args.kwarg::<u64>("sleep_ms")? {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(sleep_ms)) => {}
                _ = ctx.cancelled() => return Err(TaskCancelled.into()),
            }
        }

        if let Some(kind) = args.kwarg::<String>("fail_with")? {
            return Err(TaskError::new(kind, "echo任务按要求失败").into());
        }

        Ok(json!({
            "args": args.args,
            "kwargs": args.kwargs,
        }))
    }
}

/// Shell命令闭包，以JSON保存
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShellCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// 编码为闭包字节
    pub fn to_blob(&self) -> QueueResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// `shell+json` 方案的解码器
pub struct ShellJsonCodec;

impl ClosureCodec for ShellJsonCodec {
    fn scheme(&self) -> &str {
        SHELL_JSON_SCHEME
    }

    fn decode(&self, blob: &[u8]) -> QueueResult<Arc<dyn TaskFunction>> {
        let command: ShellCommand = serde_json::from_slice(blob)
            .map_err(|e| QueueError::Serialization(format!("解析Shell命令失败: {e}")))?;
        Ok(Arc::new(ShellTask { command }))
    }
}

/// 执行一条Shell命令，输出逐行写入任务日志
pub struct ShellTask {
    command: ShellCommand,
}

#[async_trait]
impl TaskFunction for ShellTask {
    async fn call(&self, ctx: TaskContext, _args: TaskArgs) -> anyhow::Result<Value> {
        let start_time = Instant::now();
        let shell = &self.command;
        info!("执行Shell命令: command={}, args={:?}", shell.command, shell.args);

        let mut cmd = Command::new(&shell.command);
        cmd.args(&shell.args)
            .envs(&shell.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &shell.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| TaskError::new("ShellSpawn", format!("启动Shell命令失败: {e}")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TaskError::new("ShellSpawn", "无法获取stdout"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TaskError::new("ShellSpawn", "无法获取stderr"))?;

        let stdout_task = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                info!(stream = "stdout", "{}", line);
                collected.push(line);
            }
            collected
        };
        let stderr_task = async {
            let mut lines = BufReader::new(stderr).lines();
            let mut collected = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(stream = "stderr", "{}", line);
                collected.push(line);
            }
            collected
        };

        let (stdout_lines, stderr_lines, exit_status) = tokio::select! {
            (stdout_lines, stderr_lines, exit_status) = async {
                tokio::join!(stdout_task, stderr_task, child.wait())
            } => (stdout_lines, stderr_lines, exit_status),
            _ = ctx.cancelled() => {
                // kill_on_drop 会在 child 释放时结束进程
                return Err(TaskCancelled.into());
            }
        };

        let exit_status = exit_status
            .map_err(|e| TaskError::new("ShellWait", format!("等待进程结束失败: {e}")))?;
        let exit_code = exit_status.code();
        info!(
            "Shell命令执行完成: exit_code={:?}, duration={}ms",
            exit_code,
            start_time.elapsed().as_millis()
        );

        if !exit_status.success() {
            let detail = stderr_lines.last().cloned().unwrap_or_default();
            return Err(TaskError::new(
                "ShellExit",
                format!("命令执行失败，退出码: {exit_code:?} {detail}"),
            )
            .into());
        }

        Ok(json!({
            "exit_code": exit_code,
            "stdout": stdout_lines.join("\n"),
        }))
    }
}
