use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use qtask_core::{
    dependency::{blocked_child_transition, initial_state},
    errors::{QueueError, QueueResult},
    models::{
        CancelOutcome, ChildResolution, Executable, FailOutcome, NewTask, OrphanRequeueReport,
        Task, TaskFailure, TaskState, TaskStateCounts,
    },
    traits::{TaskRepository, TaskSignal},
};
use serde_json::{Map, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info, instrument, warn};

const CASCADE_CANCEL_MESSAGE: &str = "父任务失败或被取消，任务未执行";

/// PostgreSQL任务仓储实现
///
/// 所有状态转换都是带条件的单行更新；父任务进入终态时，子任务的处理在同一事务内完成。
/// 配置了通知通道时，任务进入 `pending` 会在事务内调用 `pg_notify`，随事务一起提交。
pub struct PostgresTaskRepository {
    pool: PgPool,
    notify_channel: Option<String>,
}

/// 失败处理需要的任务字段
struct FailureTarget {
    id: i64,
    retries_done: i32,
    max_retries: i32,
    cancel_requested: bool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            notify_channel: None,
        }
    }

    /// 任务进入 `pending` 时向该通道发送通知
    pub fn with_notify_channel(mut self, channel: Option<String>) -> Self {
        self.notify_channel = channel;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_task(row: &PgRow) -> QueueResult<Task> {
        let kind: String = row.try_get("executable_kind")?;
        let reference: String = row.try_get("executable_ref")?;
        let blob: Option<Vec<u8>> = row.try_get("executable_blob")?;
        let executable =
            Executable::from_columns(&kind, reference, blob).map_err(QueueError::Serialization)?;

        let Json(args): Json<Vec<Value>> = row.try_get("args")?;
        let Json(kwargs): Json<Map<String, Value>> = row.try_get("kwargs")?;
        let Json(context): Json<Map<String, Value>> = row.try_get("context")?;
        let result: Option<Json<Value>> = row.try_get("result")?;

        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            executable,
            args,
            kwargs,
            state: row.try_get("state")?,
            parent_task_id: row.try_get("parent_task_id")?,
            context,
            result: result.map(|Json(value)| value),
            error_message: row.try_get("error_message")?,
            error_kind: row.try_get("error_kind")?,
            retries_done: row.try_get("retries_done")?,
            max_retries: row.try_get("max_retries")?,
            cancel_requested: row.try_get("cancel_requested")?,
            claimed_by: row.try_get("claimed_by")?,
            date_enqueued: row.try_get("date_enqueued")?,
            date_started: row.try_get("date_started")?,
            date_done: row.try_get("date_done")?,
        })
    }

    async fn notify(
        tx: &mut Transaction<'_, Postgres>,
        channel: Option<&str>,
        task_ids: &[i64],
    ) -> QueueResult<()> {
        let Some(channel) = channel else {
            return Ok(());
        };
        for task_id in task_ids {
            sqlx::query("SELECT pg_notify($1, $2)")
                .bind(channel)
                .bind(TaskSignal::for_task(*task_id).to_payload())
                .execute(&mut **tx)
                .await?;
        }
        Ok(())
    }

    /// 条件更新未命中时，区分任务不存在与状态不允许
    async fn transition_error(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
        to: TaskState,
    ) -> QueueError {
        let state = sqlx::query("SELECT state FROM queued_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&mut **tx)
            .await
            .and_then(|row| row.map(|row| row.try_get::<TaskState, _>("state")).transpose());

        match state {
            Ok(Some(from)) => QueueError::InvalidStateTransition { id, from, to },
            Ok(None) => QueueError::TaskNotFound { id },
            Err(e) => QueueError::Database(e),
        }
    }

    /// 父任务进入终态后处理其子任务
    async fn resolve_children_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        channel: Option<&str>,
        parent_id: i64,
        parent_state: TaskState,
    ) -> QueueResult<ChildResolution> {
        match blocked_child_transition(parent_state) {
            Some(TaskState::Pending) => {
                let unblocked: Vec<i64> = sqlx::query_scalar(
                    r#"
                    UPDATE queued_tasks
                    SET state = 'pending'
                    WHERE parent_task_id = $1 AND state = 'blocked'
                    RETURNING id
                    "#,
                )
                .bind(parent_id)
                .fetch_all(&mut **tx)
                .await?;

                Self::notify(tx, channel, &unblocked).await?;
                if !unblocked.is_empty() {
                    debug!(parent_id, "解除阻塞的子任务: {:?}", unblocked);
                }
                Ok(ChildResolution {
                    unblocked,
                    cancelled: Vec::new(),
                })
            }
            Some(TaskState::Cancelled) => {
                let cancelled = Self::cascade_cancel(tx, parent_id).await?;
                Ok(ChildResolution {
                    unblocked: Vec::new(),
                    cancelled,
                })
            }
            _ => Ok(ChildResolution::default()),
        }
    }

    /// 取消全部尚未开始的后代任务
    async fn cascade_cancel(
        tx: &mut Transaction<'_, Postgres>,
        parent_id: i64,
    ) -> QueueResult<Vec<i64>> {
        let cancelled: Vec<i64> = sqlx::query_scalar(
            r#"
            WITH RECURSIVE descendants AS (
                SELECT id FROM queued_tasks WHERE parent_task_id = $1
                UNION
                SELECT child.id
                FROM queued_tasks child
                JOIN descendants d ON child.parent_task_id = d.id
            )
            UPDATE queued_tasks
            SET state = 'cancelled', date_done = NOW(), error_message = $2
            WHERE id IN (SELECT id FROM descendants)
              AND state IN ('pending', 'blocked')
            RETURNING id
            "#,
        )
        .bind(parent_id)
        .bind(CASCADE_CANCEL_MESSAGE)
        .fetch_all(&mut **tx)
        .await?;

        if !cancelled.is_empty() {
            info!(parent_id, "级联取消后代任务: {:?}", cancelled);
        }
        Ok(cancelled)
    }

    async fn lock_failure_target(
        tx: &mut Transaction<'_, Postgres>,
        id: i64,
    ) -> QueueResult<FailureTarget> {
        let row = sqlx::query(
            r#"
            SELECT id, state, retries_done, max_retries, cancel_requested
            FROM queued_tasks
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(QueueError::TaskNotFound { id })?;

        let state: TaskState = row.try_get("state")?;
        if state != TaskState::Running {
            return Err(QueueError::InvalidStateTransition {
                id,
                from: state,
                to: TaskState::Failed,
            });
        }

        Ok(FailureTarget {
            id,
            retries_done: row.try_get("retries_done")?,
            max_retries: row.try_get("max_retries")?,
            cancel_requested: row.try_get("cancel_requested")?,
        })
    }

    /// 对已锁定的运行中任务应用重试规则
    async fn apply_failure(
        tx: &mut Transaction<'_, Postgres>,
        channel: Option<&str>,
        target: &FailureTarget,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: Option<&Map<String, Value>>,
    ) -> QueueResult<FailOutcome> {
        let context = context.map(Json);

        if target.cancel_requested {
            sqlx::query(
                r#"
                UPDATE queued_tasks
                SET state = 'cancelled', date_done = NOW(), error_message = $2, error_kind = $3,
                    context = COALESCE($4, context)
                WHERE id = $1
                "#,
            )
            .bind(target.id)
            .bind(&failure.message)
            .bind(&failure.kind)
            .bind(context)
            .execute(&mut **tx)
            .await?;

            let cancelled_descendants = Self::cascade_cancel(tx, target.id).await?;
            return Ok(FailOutcome::Cancelled {
                cancelled_descendants,
            });
        }

        if target.retries_done < target.max_retries {
            let delay = chrono::Duration::from_std(retry_delay)
                .map_err(|e| QueueError::Internal(format!("无效的重试间隔: {e}")))?;
            let next_attempt_at = Utc::now() + delay;
            let retries_done = target.retries_done + 1;

            sqlx::query(
                r#"
                UPDATE queued_tasks
                SET state = 'pending', retries_done = $2, error_message = $3, error_kind = $4,
                    context = COALESCE($5, context), date_enqueued = $6, claimed_by = NULL
                WHERE id = $1
                "#,
            )
            .bind(target.id)
            .bind(retries_done)
            .bind(&failure.message)
            .bind(&failure.kind)
            .bind(context)
            .bind(next_attempt_at)
            .execute(&mut **tx)
            .await?;

            Self::notify(tx, channel, &[target.id]).await?;
            return Ok(FailOutcome::Retrying {
                retries_done,
                next_attempt_at,
            });
        }

        sqlx::query(
            r#"
            UPDATE queued_tasks
            SET state = 'failed', date_done = NOW(), error_message = $2, error_kind = $3,
                context = COALESCE($4, context)
            WHERE id = $1
            "#,
        )
        .bind(target.id)
        .bind(&failure.message)
        .bind(&failure.kind)
        .bind(context)
        .execute(&mut **tx)
        .await?;

        let cancelled_descendants = Self::cascade_cancel(tx, target.id).await?;
        Ok(FailOutcome::Failed {
            cancelled_descendants,
        })
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(skip(self, task), fields(task_name = %task.name, parent_task_id = ?task.parent_task_id))]
    async fn create(&self, task: &NewTask) -> QueueResult<Task> {
        let mut tx = self.pool.begin().await?;

        // 锁住父任务行，父任务的终态写入会等待本事务提交后再处理子任务
        let parent_state = match task.parent_task_id {
            Some(parent_id) => {
                let row = sqlx::query("SELECT state FROM queued_tasks WHERE id = $1 FOR SHARE")
                    .bind(parent_id)
                    .fetch_optional(&mut *tx)
                    .await?
                    .ok_or(QueueError::TaskNotFound { id: parent_id })?;
                Some(row.try_get::<TaskState, _>("state")?)
            }
            None => None,
        };

        let state = initial_state(parent_state);
        let (kind, reference, blob) = task.executable.to_columns();
        let (date_done, error_message) = if state == TaskState::Cancelled {
            (Some(Utc::now()), Some(CASCADE_CANCEL_MESSAGE))
        } else {
            (None, None)
        };

        let row = sqlx::query(
            r#"
            INSERT INTO queued_tasks (name, executable_kind, executable_ref, executable_blob, args, kwargs,
                                      state, parent_task_id, context, max_retries, date_done, error_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING *
            "#,
        )
        .bind(&task.name)
        .bind(kind)
        .bind(reference)
        .bind(blob)
        .bind(Json(&task.args))
        .bind(Json(&task.kwargs))
        .bind(state)
        .bind(task.parent_task_id)
        .bind(Json(&task.context))
        .bind(task.max_retries)
        .bind(date_done)
        .bind(error_message)
        .fetch_one(&mut *tx)
        .await?;

        let created = Self::row_to_task(&row)?;
        if created.state == TaskState::Pending {
            Self::notify(&mut tx, self.notify_channel.as_deref(), &[created.id]).await?;
        }
        tx.commit().await?;

        debug!(task_id = created.id, state = %created.state, "任务已写入");
        Ok(created)
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get_by_id(&self, id: i64) -> QueueResult<Option<Task>> {
        let row = sqlx::query("SELECT * FROM queued_tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(Self::row_to_task).transpose()
    }

    #[instrument(skip(self), fields(parent_id = %parent_id))]
    async fn list_children(&self, parent_id: i64) -> QueueResult<Vec<Task>> {
        let rows = sqlx::query("SELECT * FROM queued_tasks WHERE parent_task_id = $1 ORDER BY id")
            .bind(parent_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self), fields(server_name = %server_name))]
    async fn claim_next(&self, server_name: &str) -> QueueResult<Option<Task>> {
        let row = sqlx::query(
            r#"
            WITH next_task AS (
                SELECT id
                FROM queued_tasks
                WHERE state = 'pending' AND date_enqueued <= NOW()
                ORDER BY date_enqueued, id
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE queued_tasks t
            SET state = 'running', date_started = NOW(), claimed_by = $1, cancel_requested = FALSE
            FROM next_task
            WHERE t.id = next_task.id AND t.state = 'pending'
            RETURNING t.*
            "#,
        )
        .bind(server_name)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let task = Self::row_to_task(&row)?;
                debug!(task_id = task.id, "任务已认领");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    #[instrument(skip(self, result, context), fields(task_id = %id))]
    async fn complete(
        &self,
        id: i64,
        result: &Value,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE queued_tasks
            SET state = 'done', result = $2, context = $3, date_done = NOW(),
                error_message = NULL, error_kind = NULL
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(Json(result))
        .bind(Json(context))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let err = Self::transition_error(&mut tx, id, TaskState::Done).await;
            tx.rollback().await?;
            return Err(err);
        }

        let resolution = Self::resolve_children_in_tx(
            &mut tx,
            self.notify_channel.as_deref(),
            id,
            TaskState::Done,
        )
        .await?;
        tx.commit().await?;
        Ok(resolution)
    }

    #[instrument(skip(self, failure, context), fields(task_id = %id, kind = %failure.kind))]
    async fn fail(
        &self,
        id: i64,
        failure: &TaskFailure,
        retry_delay: Duration,
        context: &Map<String, Value>,
    ) -> QueueResult<FailOutcome> {
        let mut tx = self.pool.begin().await?;
        let target = Self::lock_failure_target(&mut tx, id).await?;
        let outcome = Self::apply_failure(
            &mut tx,
            self.notify_channel.as_deref(),
            &target,
            failure,
            retry_delay,
            Some(context),
        )
        .await?;
        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self, context), fields(task_id = %id))]
    async fn mark_cancelled(
        &self,
        id: i64,
        context: &Map<String, Value>,
    ) -> QueueResult<ChildResolution> {
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE queued_tasks
            SET state = 'cancelled', context = $2, date_done = NOW()
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id)
        .bind(Json(context))
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let err = Self::transition_error(&mut tx, id, TaskState::Cancelled).await;
            tx.rollback().await?;
            return Err(err);
        }

        let cancelled = Self::cascade_cancel(&mut tx, id).await?;
        tx.commit().await?;
        Ok(ChildResolution {
            unblocked: Vec::new(),
            cancelled,
        })
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn request_cancel(&self, id: i64) -> QueueResult<CancelOutcome> {
        let mut tx = self.pool.begin().await?;

        let state: TaskState = sqlx::query("SELECT state FROM queued_tasks WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(QueueError::TaskNotFound { id })?
            .try_get("state")?;

        let outcome = match state {
            TaskState::Pending | TaskState::Blocked => {
                sqlx::query(
                    r#"
                    UPDATE queued_tasks
                    SET state = 'cancelled', cancel_requested = TRUE, date_done = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id)
                .execute(&mut *tx)
                .await?;

                let cancelled_descendants = Self::cascade_cancel(&mut tx, id).await?;
                CancelOutcome::Cancelled {
                    cancelled_descendants,
                }
            }
            TaskState::Running => {
                sqlx::query("UPDATE queued_tasks SET cancel_requested = TRUE WHERE id = $1")
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                CancelOutcome::Requested
            }
            terminal => CancelOutcome::AlreadyFinished(terminal),
        };

        tx.commit().await?;
        debug!("取消请求结果: {:?}", outcome);
        Ok(outcome)
    }

    async fn is_cancel_requested(&self, id: i64) -> QueueResult<bool> {
        let requested: Option<bool> =
            sqlx::query_scalar("SELECT cancel_requested FROM queued_tasks WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        requested.ok_or(QueueError::TaskNotFound { id })
    }

    #[instrument(skip(self, context), fields(task_id = %id))]
    async fn update_context(&self, id: i64, context: &Map<String, Value>) -> QueueResult<()> {
        let updated = sqlx::query("UPDATE queued_tasks SET context = $2 WHERE id = $1")
            .bind(id)
            .bind(Json(context))
            .execute(&self.pool)
            .await?
            .rows_affected();

        if updated == 0 {
            return Err(QueueError::TaskNotFound { id });
        }
        Ok(())
    }

    #[instrument(skip(self), fields(server_name = %server_name))]
    async fn requeue_orphaned(&self, server_name: &str) -> QueueResult<OrphanRequeueReport> {
        let mut tx = self.pool.begin().await?;

        let rows = sqlx::query(
            r#"
            SELECT id, retries_done, max_retries, cancel_requested
            FROM queued_tasks
            WHERE state = 'running' AND claimed_by = $1
            ORDER BY id
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(server_name)
        .fetch_all(&mut *tx)
        .await?;

        let failure = TaskFailure::worker_lost(server_name);
        let mut report = OrphanRequeueReport::default();
        for row in rows {
            let target = FailureTarget {
                id: row.try_get("id")?,
                retries_done: row.try_get("retries_done")?,
                max_retries: row.try_get("max_retries")?,
                cancel_requested: row.try_get("cancel_requested")?,
            };

            match Self::apply_failure(
                &mut tx,
                self.notify_channel.as_deref(),
                &target,
                &failure,
                Duration::ZERO,
                None,
            )
            .await?
            {
                FailOutcome::Retrying { .. } => report.requeued.push(target.id),
                FailOutcome::Failed {
                    cancelled_descendants,
                }
                | FailOutcome::Cancelled {
                    cancelled_descendants,
                } => {
                    report.failed.push(target.id);
                    report.cancelled_descendants.extend(cancelled_descendants);
                }
            }
        }

        tx.commit().await?;
        if report.total() > 0 {
            warn!(
                "进程 {} 的孤儿任务已处理: 重新入队 {:?}, 终止 {:?}",
                server_name, report.requeued, report.failed
            );
        }
        Ok(report)
    }

    async fn find_unresolved_parents(&self, limit: i64) -> QueueResult<Vec<i64>> {
        let parents: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT parent.id
            FROM queued_tasks child
            JOIN queued_tasks parent ON child.parent_task_id = parent.id
            WHERE child.state = 'blocked'
              AND parent.state IN ('done', 'failed', 'cancelled')
            ORDER BY parent.id
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(parents)
    }

    #[instrument(skip(self), fields(parent_id = %parent_id))]
    async fn resolve_children(&self, parent_id: i64) -> QueueResult<ChildResolution> {
        let mut tx = self.pool.begin().await?;

        let parent_state: TaskState =
            sqlx::query("SELECT state FROM queued_tasks WHERE id = $1 FOR UPDATE")
                .bind(parent_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or(QueueError::TaskNotFound { id: parent_id })?
                .try_get("state")?;

        let resolution = Self::resolve_children_in_tx(
            &mut tx,
            self.notify_channel.as_deref(),
            parent_id,
            parent_state,
        )
        .await?;
        tx.commit().await?;
        Ok(resolution)
    }

    async fn count_by_state(&self) -> QueueResult<TaskStateCounts> {
        let rows = sqlx::query("SELECT state, COUNT(*) AS total FROM queued_tasks GROUP BY state")
            .fetch_all(&self.pool)
            .await?;

        let mut counts = TaskStateCounts::default();
        for row in rows {
            counts.add(row.try_get("state")?, row.try_get("total")?);
        }
        Ok(counts)
    }

    async fn cancel_all_pending(&self) -> QueueResult<u64> {
        let cancelled = sqlx::query(
            r#"
            UPDATE queued_tasks
            SET state = 'cancelled', cancel_requested = TRUE, date_done = NOW()
            WHERE state IN ('pending', 'blocked')
            "#,
        )
        .execute(&self.pool)
        .await?
        .rows_affected();

        info!("已取消 {} 个未开始的任务", cancelled);
        Ok(cancelled)
    }

    async fn has_active_named(&self, name: &str) -> QueueResult<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queued_tasks
                WHERE name = $1 AND state IN ('pending', 'blocked', 'running')
            )
            "#,
        )
        .bind(name)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }
}
