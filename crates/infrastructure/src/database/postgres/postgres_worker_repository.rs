use async_trait::async_trait;
use chrono::{DateTime, Utc};
use qtask_core::{
    errors::{QueueError, QueueResult},
    models::{WorkerHeartbeat, WorkerRegistration},
    traits::WorkerRepository,
};
use sqlx::{PgPool, Row};
use tracing::debug;

/// PostgreSQL Worker注册仓储实现
pub struct PostgresWorkerRepository {
    pool: PgPool,
}

impl PostgresWorkerRepository {
    /// 创建新的PostgreSQL Worker仓储
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 将数据库行转换为WorkerRegistration模型
    fn row_to_registration(row: &sqlx::postgres::PgRow) -> QueueResult<WorkerRegistration> {
        Ok(WorkerRegistration {
            server_name: row.try_get("server_name")?,
            max_workers: row.try_get("max_workers")?,
            active_workers: row.try_get("active_workers")?,
            idle_workers: row.try_get("idle_workers")?,
            is_running: row.try_get("is_running")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
            started_at: row.try_get("started_at")?,
            version: row.try_get("version")?,
        })
    }
}

#[async_trait]
impl WorkerRepository for PostgresWorkerRepository {
    async fn register(&self, registration: &WorkerRegistration) -> QueueResult<WorkerRegistration> {
        let row = sqlx::query(
            r#"
            INSERT INTO queued_task_workers (server_name, max_workers, active_workers, idle_workers,
                                             is_running, last_heartbeat, started_at, version)
            VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7)
            ON CONFLICT (server_name) DO UPDATE SET
                max_workers = EXCLUDED.max_workers,
                active_workers = EXCLUDED.active_workers,
                idle_workers = EXCLUDED.idle_workers,
                is_running = TRUE,
                last_heartbeat = EXCLUDED.last_heartbeat,
                started_at = EXCLUDED.started_at,
                version = EXCLUDED.version
            RETURNING *
            "#,
        )
        .bind(&registration.server_name)
        .bind(registration.max_workers)
        .bind(registration.active_workers)
        .bind(registration.idle_workers)
        .bind(registration.last_heartbeat)
        .bind(registration.started_at)
        .bind(&registration.version)
        .fetch_one(&self.pool)
        .await?;

        debug!("注册Worker池成功: {}", registration.server_name);
        Self::row_to_registration(&row)
    }

    async fn register_exclusive(
        &self,
        registration: &WorkerRegistration,
        stale_before: DateTime<Utc>,
    ) -> QueueResult<Option<WorkerRegistration>> {
        let row = sqlx::query(
            r#"
            INSERT INTO queued_task_workers (server_name, max_workers, active_workers, idle_workers,
                                             is_running, last_heartbeat, started_at, version)
            VALUES ($1, $2, $3, $4, TRUE, $5, $6, $7)
            ON CONFLICT (server_name) DO UPDATE SET
                max_workers = EXCLUDED.max_workers,
                active_workers = EXCLUDED.active_workers,
                idle_workers = EXCLUDED.idle_workers,
                is_running = TRUE,
                last_heartbeat = EXCLUDED.last_heartbeat,
                started_at = EXCLUDED.started_at,
                version = EXCLUDED.version
            WHERE NOT queued_task_workers.is_running
               OR queued_task_workers.last_heartbeat < $8
            RETURNING *
            "#,
        )
        .bind(&registration.server_name)
        .bind(registration.max_workers)
        .bind(registration.active_workers)
        .bind(registration.idle_workers)
        .bind(registration.last_heartbeat)
        .bind(registration.started_at)
        .bind(&registration.version)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                debug!("独占注册Worker池成功: {}", registration.server_name);
                Self::row_to_registration(&row).map(Some)
            }
            None => Ok(None),
        }
    }

    async fn heartbeat(&self, server_name: &str, heartbeat: &WorkerHeartbeat) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE queued_task_workers
            SET max_workers = $2, active_workers = $3, idle_workers = $4,
                is_running = TRUE, last_heartbeat = NOW()
            WHERE server_name = $1
            "#,
        )
        .bind(server_name)
        .bind(heartbeat.max_workers)
        .bind(heartbeat.active_workers)
        .bind(heartbeat.idle_workers)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::WorkerNotFound {
                server_name: server_name.to_string(),
            });
        }

        debug!("更新Worker池心跳: {}", server_name);
        Ok(())
    }

    async fn mark_stopped(&self, server_name: &str) -> QueueResult<()> {
        sqlx::query(
            r#"
            UPDATE queued_task_workers
            SET is_running = FALSE, active_workers = 0, idle_workers = 0
            WHERE server_name = $1
            "#,
        )
        .bind(server_name)
        .execute(&self.pool)
        .await?;

        debug!("Worker池已标记为停止: {}", server_name);
        Ok(())
    }

    async fn get(&self, server_name: &str) -> QueueResult<Option<WorkerRegistration>> {
        let row = sqlx::query("SELECT * FROM queued_task_workers WHERE server_name = $1")
            .bind(server_name)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_registration).transpose()
    }

    async fn list_all(&self) -> QueueResult<Vec<WorkerRegistration>> {
        let rows = sqlx::query("SELECT * FROM queued_task_workers ORDER BY server_name")
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_registration).collect()
    }

    async fn find_stale(&self, older_than: DateTime<Utc>) -> QueueResult<Vec<WorkerRegistration>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM queued_task_workers
            WHERE is_running AND last_heartbeat < $1
            ORDER BY last_heartbeat
            "#,
        )
        .bind(older_than)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_registration).collect()
    }
}
