use clap::{Parser, Subcommand};

use qtask_core::AppConfig;

/// 持久化、依赖感知的队列任务执行引擎
#[derive(Debug, Parser)]
#[command(name = "qtask", version, about)]
pub struct Cli {
    /// 配置文件路径，未指定时按默认位置查找
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(
        short,
        long,
        global = true,
        value_name = "LEVEL",
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, global = true, value_name = "FORMAT", value_parser = ["json", "pretty"])]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand, PartialEq, Eq)]
pub enum Commands {
    /// 启动Worker池，直到收到SIGINT/SIGTERM
    Start {
        /// 覆盖 queue.max_workers
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// 待执行任务数与全局Worker统计
    Status,
    /// 各状态任务数与全局Worker统计
    Stats,
    /// 列出所有已注册的进程
    Servers,
    /// 以终态任务为模板重新创建任务
    Retry {
        #[arg(required = true, value_name = "ID")]
        ids: Vec<i64>,
    },
    /// 取消所有尚未开始的任务
    Clear,
    /// 执行数据库迁移
    Migrate,
}

impl Cli {
    /// 把命令行参数合并进已加载的配置
    pub fn apply_overrides(&self, config: &mut AppConfig) {
        if let Some(level) = &self.log_level {
            config.observability.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.observability.log_format = format.clone();
        }
        if let Commands::Start {
            workers: Some(workers),
        } = self.command
        {
            config.queue.max_workers = workers;
            config.queue.min_workers = config.queue.min_workers.min(workers);
        }
    }

    /// 只有 `start` 会执行任务，其他命令不需要任务日志写入端
    pub fn runs_workers(&self) -> bool {
        matches!(self.command, Commands::Start { .. })
    }
}
