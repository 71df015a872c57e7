use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use qtask::app::Application;
use qtask::cli::{Cli, Commands};
use qtask::logging::init_logging;
use qtask::shutdown::{wait_for_shutdown_signal, ShutdownManager};
use qtask_core::AppConfig;
use qtask_worker::{ExecutorRegistry, TaskLogLayer};

/// 在 drain_timeout 之外额外等待的时间
const SHUTDOWN_GRACE_SECONDS: u64 = 10;
const TASK_LOG_FLUSH_WAIT: std::time::Duration = std::time::Duration::from_secs(1);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    cli.apply_overrides(&mut config);
    config.validate()?;

    let (task_log_layer, task_log_receiver) =
        if cli.runs_workers() && config.queue.enable_db_logging {
            let (layer, receiver) = TaskLogLayer::new();
            (Some(layer), Some(receiver))
        } else {
            (None, None)
        };
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
        task_log_layer,
    )?;

    let app = Application::connect(config).await?;

    match cli.command {
        Commands::Start { .. } => {
            let writer = task_log_receiver.map(|receiver| app.spawn_task_log_writer(receiver));
            run_until_signal(app).await?;
            if writer.is_some() {
                // 全局subscriber持有发送端，只能等写入端的下一次定时刷新
                tokio::time::sleep(TASK_LOG_FLUSH_WAIT).await;
            }
        }
        Commands::Status => print!("{}", app.status().await?),
        Commands::Stats => print!("{}", app.stats().await?),
        Commands::Servers => {
            let servers = app.servers().await?;
            if servers.is_empty() {
                println!("没有已注册的进程");
            }
            for server in servers {
                println!("{server}");
            }
        }
        Commands::Retry { ids } => {
            let total = ids.len();
            let mut failed = 0;
            for id in ids {
                match app.retry(id).await {
                    Ok(new_id) => println!("任务 {id} 已重新创建为任务 {new_id}"),
                    Err(e) => {
                        failed += 1;
                        eprintln!("{e:#}");
                    }
                }
            }
            println!("成功重试 {}/{} 个任务", total - failed, total);
            if failed > 0 {
                return Err(anyhow::anyhow!("{failed} 个任务重试失败"));
            }
        }
        Commands::Clear => println!("已取消 {} 个待执行任务", app.clear().await?),
        Commands::Migrate => {
            app.migrate().await?;
            println!("数据库迁移完成");
        }
    }

    Ok(())
}

async fn run_until_signal(app: Application) -> Result<()> {
    let shutdown_manager = ShutdownManager::new();
    let shutdown_timeout =
        app.config().queue.drain_timeout() + std::time::Duration::from_secs(SHUTDOWN_GRACE_SECONDS);

    let app = Arc::new(app);
    let mut app_handle = {
        let shutdown_rx = shutdown_manager.subscribe().await;
        let app = Arc::clone(&app);
        tokio::spawn(async move { app.run(ExecutorRegistry::with_builtins(), shutdown_rx).await })
    };

    tokio::select! {
        _ = wait_for_shutdown_signal() => {}
        result = &mut app_handle => {
            // 启动失败时不再等待信号
            return result.context("应用任务异常退出")?;
        }
    }

    info!("开始优雅关闭");
    shutdown_manager.shutdown().await;

    match tokio::time::timeout(shutdown_timeout, app_handle).await {
        Ok(Ok(Ok(()))) => info!("应用已正常关闭"),
        Ok(Ok(Err(e))) => {
            error!("应用运行失败: {e:#}");
            return Err(e);
        }
        Ok(Err(e)) => error!("应用任务异常退出: {e}"),
        Err(_) => warn!("应用关闭超时，强制退出"),
    }

    Ok(())
}
