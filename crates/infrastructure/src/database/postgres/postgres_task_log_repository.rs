use async_trait::async_trait;
use qtask_core::{
    errors::QueueResult,
    models::{NewTaskLogEntry, TaskLogEntry},
    traits::TaskLogRepository,
};
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

/// PostgreSQL任务日志仓储实现，只追加
pub struct PostgresTaskLogRepository {
    pool: PgPool,
}

impl PostgresTaskLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_entry(row: &sqlx::postgres::PgRow) -> QueueResult<TaskLogEntry> {
        let info: Option<Json<serde_json::Value>> = row.try_get("info")?;
        Ok(TaskLogEntry {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            log_type: row.try_get("log_type")?,
            logged_at: row.try_get("logged_at")?,
            name: row.try_get("name")?,
            message: row.try_get("message")?,
            info: info.map(|Json(value)| value),
        })
    }
}

#[async_trait]
impl TaskLogRepository for PostgresTaskLogRepository {
    async fn append(&self, entries: &[NewTaskLogEntry]) -> QueueResult<()> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "INSERT INTO queued_task_logs (task_id, log_type, logged_at, name, message, info) ",
        );
        builder.push_values(entries, |mut row, entry| {
            row.push_bind(entry.task_id)
                .push_bind(entry.log_type)
                .push_bind(entry.logged_at)
                .push_bind(&entry.name)
                .push_bind(&entry.message)
                .push_bind(entry.info.as_ref().map(Json));
        });

        builder.build().execute(&self.pool).await?;
        Ok(())
    }

    async fn list_for_task(&self, task_id: i64) -> QueueResult<Vec<TaskLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM queued_task_logs WHERE task_id = $1 ORDER BY logged_at, id",
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_entry).collect()
    }
}
