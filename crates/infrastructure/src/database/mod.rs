pub mod postgres;

pub use postgres::{PostgresTaskLogRepository, PostgresTaskRepository, PostgresWorkerRepository};

use qtask_core::{config::DatabaseConfig, errors::QueueResult};
use sqlx::{PgPool, Pool, Postgres};
use std::time::Duration;
use tracing::info;

/// 数据库连接池管理器
pub struct DatabaseManager {
    pool: PgPool,
}

impl DatabaseManager {
    /// 创建新的数据库管理器
    pub async fn new(config: &DatabaseConfig) -> QueueResult<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .max_lifetime(Duration::from_secs(1800)) // 30分钟默认生命周期
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    /// 使用已有的连接池
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 获取数据库连接池
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("数据库迁移完成");
        Ok(())
    }

    /// 检查数据库连接健康状态
    pub async fn health_check(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 任务仓储，`notify_channel` 为空时不发送通知
    pub fn task_repository(&self, notify_channel: Option<String>) -> PostgresTaskRepository {
        PostgresTaskRepository::new(self.pool.clone()).with_notify_channel(notify_channel)
    }

    pub fn worker_repository(&self) -> PostgresWorkerRepository {
        PostgresWorkerRepository::new(self.pool.clone())
    }

    pub fn task_log_repository(&self) -> PostgresTaskLogRepository {
        PostgresTaskLogRepository::new(self.pool.clone())
    }

    /// 关闭数据库连接池
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// 数据库连接池类型别名
pub type DbPool = Pool<Postgres>;
