//! PostgreSQL implementation of TaskStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic claiming with FOR UPDATE SKIP LOCKED in a single statement
//! - Per-organization exclusivity backed by a partial unique index
//! - Log and error lines in child tables, aggregated into each returned task
//!
//! All time comparisons use the database clock so that workers on different
//! hosts agree on ages, delays and liveness.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::{debug, error, instrument};
use uuid::Uuid;

use super::store::*;
use crate::reliability::RetryPolicy;
use crate::task::{NewTask, Task, TaskLogEntry, TaskStatus, TaskType};

/// Columns selected for a full task, including aggregated logs and errors.
/// Expects the task table to be aliased as `t`.
const TASK_COLUMNS: &str = r#"
    t.id, t.task_type, t.organization_id, t.payload, t.priority,
    t.scheduled_start, t.created_at, t.updated_at, t.retries,
    t.being_processed_by, t.start_time, t.finish_time, t.is_complete, t.failed,
    (
        SELECT COALESCE(
            json_agg(json_build_object('message', l.message, 'createdAt', l.created_at)
                     ORDER BY l.created_at, l.id),
            '[]'::json)
        FROM queue_task_logs l WHERE l.task_id = t.id
    ) AS log_messages,
    (
        SELECT COALESCE(
            json_agg(json_build_object('message', e.message, 'createdAt', e.created_at)
                     ORDER BY e.created_at, e.id),
            '[]'::json)
        FROM queue_task_errors e WHERE e.task_id = t.id
    ) AS errors
"#;

/// PostgreSQL implementation of TaskStore
///
/// Uses a connection pool shared by the dispatcher, executors and
/// maintenance loops.
///
/// # Example
///
/// ```ignore
/// use shelfsync_task_queue::PostgresTaskStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/shelfsync").await?;
/// let store = PostgresTaskStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the queue schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run task queue migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    // =========================================================================
    // Producer Operations
    // =========================================================================

    #[instrument(skip(self, task), fields(task_type = %task.task_type))]
    async fn enqueue(&self, task: NewTask) -> Result<Task, StoreError> {
        let task_id = Uuid::now_v7();
        let payload = serde_json::to_value(&task.payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let sql = format!(
            r#"
            INSERT INTO queue_tasks AS t
                (id, task_type, organization_id, payload, priority, scheduled_start)
            VALUES ($1, $2, $3, $4, $5,
                    CASE WHEN $6::float8 > 0 THEN NOW() + make_interval(secs => $6) END)
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(task_id)
            .bind(task.task_type.as_str())
            .bind(&task.organization_id)
            .bind(&payload)
            .bind(task.priority)
            .bind(task.delay.as_secs_f64())
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to enqueue task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        debug!(%task_id, "enqueued task");
        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn find_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM queue_tasks t WHERE t.id = $1");

        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        row.as_ref().map(task_from_row).transpose()
    }

    #[instrument(skip(self))]
    async fn find_pending_by_org_and_type(
        &self,
        organization_id: &str,
        task_type: TaskType,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM queue_tasks t
            WHERE t.organization_id = $1
              AND t.task_type = $2
              AND NOT t.is_complete AND NOT t.failed
              AND (t.being_processed_by IS NULL OR t.start_time IS NULL)
            ORDER BY t.created_at, t.id
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(organization_id)
            .bind(task_type.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find pending tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn has_queued_task_by_type(&self, task_type: TaskType) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM queue_tasks
                WHERE task_type = $1 AND NOT is_complete AND NOT failed
            ) AS queued
            "#,
        )
        .bind(task_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to check queued tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(row.get("queued"))
    }

    #[instrument(skip(self))]
    async fn list_tasks(
        &self,
        filter: &TaskFilter,
        pagination: Pagination,
    ) -> Result<TaskPage, StoreError> {
        let mut count_query = QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM queue_tasks t");
        push_filter(&mut count_query, filter);

        let total: i64 = count_query
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to count tasks: {}", e);
                StoreError::Database(e.to_string())
            })?
            .get("total");

        let mut list_query = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TASK_COLUMNS} FROM queue_tasks t"
        ));
        push_filter(&mut list_query, filter);
        list_query
            .push(" ORDER BY t.created_at DESC, t.id DESC LIMIT ")
            .push_bind(i64::from(pagination.limit))
            .push(" OFFSET ")
            .push_bind(i64::from(pagination.offset));

        let rows = list_query
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to list tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(TaskPage {
            tasks: rows.iter().map(task_from_row).collect::<Result<_, _>>()?,
            total: total as u64,
            pagination,
        })
    }

    #[instrument(skip(self))]
    async fn task_counts(&self, task_type: Option<TaskType>) -> Result<TaskCounts, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE failed) AS failed,
                COUNT(*) FILTER (WHERE is_complete AND NOT failed) AS complete,
                COUNT(*) FILTER (WHERE NOT is_complete AND NOT failed
                                   AND being_processed_by IS NOT NULL
                                   AND start_time IS NOT NULL) AS in_progress,
                COUNT(*) FILTER (WHERE NOT is_complete AND NOT failed
                                   AND (being_processed_by IS NULL OR start_time IS NULL)) AS pending
            FROM queue_tasks
            WHERE $1::text IS NULL OR task_type = $1
            "#,
        )
        .bind(task_type.map(|t| t.as_str()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to count tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(TaskCounts {
            pending: row.get::<i64, _>("pending") as u64,
            in_progress: row.get::<i64, _>("in_progress") as u64,
            complete: row.get::<i64, _>("complete") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }

    // =========================================================================
    // Claiming
    // =========================================================================

    #[instrument(skip(self, request), fields(task_type = %request.task_type, worker_id = %request.worker_id))]
    async fn claim_next(&self, request: &ClaimRequest) -> Result<Option<Task>, StoreError> {
        // Candidate selection and ownership happen in one statement:
        // 1. Open rows of this type that are unowned or whose owner went quiet
        // 2. Old enough, not deferred, retries left
        // 3. For exclusive queues, no other owned row of the same organization
        // 4. Best priority, then oldest; SKIP LOCKED so concurrent claimers
        //    never wait on each other or pick the same row
        let sql = format!(
            r#"
            WITH candidate AS (
                SELECT c.id
                FROM queue_tasks c
                WHERE c.task_type = $1
                  AND (c.being_processed_by IS NULL
                       OR c.updated_at < NOW() - make_interval(secs => $4))
                  AND c.retries < $3
                  AND NOT c.is_complete
                  AND NOT c.failed
                  AND c.created_at <= NOW() - make_interval(secs => $5)
                  AND (c.scheduled_start IS NULL OR c.scheduled_start <= NOW())
                  AND (NOT $6 OR c.organization_id IS NULL OR NOT EXISTS (
                        SELECT 1 FROM queue_tasks o
                        WHERE o.task_type = c.task_type
                          AND o.organization_id = c.organization_id
                          AND o.being_processed_by IS NOT NULL
                          AND o.id <> c.id))
                ORDER BY c.priority DESC, c.created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE queue_tasks t
            SET being_processed_by = $2,
                exclusive_claim = $6,
                start_time = NOW(),
                finish_time = NULL,
                updated_at = NOW()
            FROM candidate
            WHERE t.id = candidate.id
            RETURNING {TASK_COLUMNS}
            "#
        );

        let result = sqlx::query(&sql)
            .bind(request.task_type.as_str())
            .bind(&request.worker_id)
            .bind(i64::from(request.max_retries))
            .bind(request.liveness_timeout.as_secs_f64())
            .bind(request.min_age.as_secs_f64())
            .bind(request.exclusive)
            .fetch_optional(&self.pool)
            .await;

        let row = match result {
            Ok(row) => row,
            // Another process won the exclusive slot for this organization
            Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
                debug!("exclusive claim lost to a concurrent worker");
                return Ok(None);
            }
            Err(e) => {
                error!("Failed to claim task: {}", e);
                return Err(StoreError::Database(e.to_string()));
            }
        };

        let task = row.as_ref().map(task_from_row).transpose()?;
        if let Some(task) = &task {
            debug!(task_id = %task.id, "claimed task");
        }
        Ok(task)
    }

    // =========================================================================
    // Execution Mutators
    // =========================================================================

    #[instrument(skip(self))]
    async fn mark_started(&self, task_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_tasks SET start_time = NOW(), updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark task started: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)
    }

    #[instrument(skip(self))]
    async fn mark_complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET is_complete = TRUE,
                failed = FALSE,
                finish_time = NOW(),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark task complete: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)?;
        debug!(%task_id, "task complete");
        Ok(())
    }

    #[instrument(skip(self, error, policy))]
    async fn mark_retry_needed(
        &self,
        task_id: Uuid,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<RetryOutcome, StoreError> {
        self.record_failure(task_id, None, error, policy)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    #[instrument(skip(self, error))]
    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            WITH failed_task AS (
                UPDATE queue_tasks
                SET failed = TRUE,
                    is_complete = FALSE,
                    finish_time = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO queue_task_errors (task_id, message)
            SELECT id, $2 FROM failed_task
            "#,
        )
        .bind(task_id)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to mark task failed: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)
    }

    #[instrument(skip(self))]
    async fn reschedule(&self, task_id: Uuid, at: DateTime<Utc>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_tasks SET scheduled_start = $2, updated_at = NOW() WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reschedule task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)
    }

    #[instrument(skip(self, message))]
    async fn append_log(&self, task_id: Uuid, message: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            WITH touched AS (
                UPDATE queue_tasks SET updated_at = NOW() WHERE id = $1 RETURNING id
            )
            INSERT INTO queue_task_logs (task_id, message)
            SELECT id, $2 FROM touched
            "#,
        )
        .bind(task_id)
        .bind(message)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to append task log: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)
    }

    #[instrument(skip(self))]
    async fn set_owner(&self, task_id: Uuid, owner: Option<&str>) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET being_processed_by = $2::text,
                start_time = CASE WHEN $2::text IS NULL THEN start_time
                                  ELSE COALESCE(start_time, NOW()) END,
                exclusive_claim = CASE WHEN $2::text IS NULL THEN FALSE
                                       ELSE exclusive_claim END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(task_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to set task owner: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)
    }

    // =========================================================================
    // Owner-Guarded Mutators
    // =========================================================================

    #[instrument(skip(self))]
    async fn complete_owned(&self, task_id: Uuid, owner: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE queue_tasks
            SET is_complete = TRUE,
                failed = FALSE,
                finish_time = NOW(),
                being_processed_by = NULL,
                exclusive_claim = FALSE,
                updated_at = NOW()
            WHERE id = $1 AND being_processed_by = $2
            "#,
        )
        .bind(task_id)
        .bind(owner)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to complete owned task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() == 0 {
            self.require_task(task_id).await?;
            return Ok(false);
        }
        debug!(%task_id, "task complete");
        Ok(true)
    }

    #[instrument(skip(self, error, policy))]
    async fn retry_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        let outcome = self
            .record_failure(task_id, Some(owner), error, policy)
            .await?;
        if outcome.is_none() {
            self.require_task(task_id).await?;
        }
        Ok(outcome)
    }

    #[instrument(skip(self, note))]
    async fn release_owned(
        &self,
        task_id: Uuid,
        owner: &str,
        note: Option<&str>,
    ) -> Result<bool, StoreError> {
        let released = sqlx::query(
            r#"
            WITH released AS (
                UPDATE queue_tasks
                SET being_processed_by = NULL,
                    exclusive_claim = FALSE,
                    updated_at = NOW()
                WHERE id = $1 AND being_processed_by = $2
                RETURNING id
            ),
            noted AS (
                INSERT INTO queue_task_logs (task_id, message)
                SELECT id, $3::text FROM released WHERE $3::text IS NOT NULL
            )
            SELECT id FROM released
            "#,
        )
        .bind(task_id)
        .bind(owner)
        .bind(note)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to release owned task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if released.is_none() {
            self.require_task(task_id).await?;
            return Ok(false);
        }
        Ok(true)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    #[instrument(skip(self))]
    async fn prune_older_than(&self, retention: Duration) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_tasks
            WHERE (is_complete OR failed)
              AND finish_time < NOW() - make_interval(secs => $1)
            "#,
        )
        .bind(retention.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to prune tasks: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn find_stuck(&self, timeout: Duration) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM queue_tasks t
            WHERE t.being_processed_by IS NOT NULL
              AND t.updated_at < NOW() - make_interval(secs => $1)
            ORDER BY t.updated_at, t.id
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(timeout.as_secs_f64())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find stuck tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self, note))]
    async fn reclaim_stuck(
        &self,
        task_id: Uuid,
        timeout: Duration,
        priority_boost: i32,
        note: &str,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            WITH reset AS (
                UPDATE queue_tasks
                SET being_processed_by = NULL,
                    exclusive_claim = FALSE,
                    retries = 0,
                    start_time = NULL,
                    finish_time = NULL,
                    is_complete = FALSE,
                    failed = FALSE,
                    priority = priority + $3,
                    updated_at = NOW()
                WHERE id = $1
                  AND being_processed_by IS NOT NULL
                  AND updated_at < NOW() - make_interval(secs => $2)
                RETURNING id
            ), cleared AS (
                DELETE FROM queue_task_errors WHERE task_id IN (SELECT id FROM reset)
            )
            INSERT INTO queue_task_logs (task_id, message)
            SELECT id, $4 FROM reset
            "#,
        )
        .bind(task_id)
        .bind(timeout.as_secs_f64())
        .bind(priority_boost)
        .bind(note)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to reclaim stuck task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn find_owned_by(&self, owner: &str) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM queue_tasks t
            WHERE t.being_processed_by = $1
            ORDER BY t.created_at, t.id
            "#
        );

        let rows = sqlx::query(&sql)
            .bind(owner)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find owned tasks: {}", e);
                StoreError::Database(e.to_string())
            })?;

        rows.iter().map(task_from_row).collect()
    }

    // =========================================================================
    // Administrative Operations
    // =========================================================================

    #[instrument(skip(self))]
    async fn delete_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            DELETE FROM queue_tasks WHERE id = $1 AND (is_complete OR failed)
            "#,
        )
        .bind(task_id)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to delete task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.rejection(task_id, "delete").await)
    }

    #[instrument(skip(self))]
    async fn promote_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let sql = format!(
            r#"
            UPDATE queue_tasks t
            SET priority = priority + 1, updated_at = NOW()
            WHERE t.id = $1
            RETURNING {TASK_COLUMNS}
            "#
        );

        let row = sqlx::query(&sql)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to promote task: {}", e);
                StoreError::Database(e.to_string())
            })?
            .ok_or(StoreError::TaskNotFound(task_id))?;

        task_from_row(&row)
    }

    #[instrument(skip(self))]
    async fn restart_task(&self, task_id: Uuid) -> Result<Task, StoreError> {
        let result = sqlx::query(
            r#"
            WITH reset AS (
                UPDATE queue_tasks
                SET being_processed_by = NULL,
                    exclusive_claim = FALSE,
                    retries = 0,
                    start_time = NULL,
                    finish_time = NULL,
                    scheduled_start = NULL,
                    is_complete = FALSE,
                    failed = FALSE,
                    updated_at = NOW()
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO queue_task_logs (task_id, message)
            SELECT id, $2 FROM reset
            "#,
        )
        .bind(task_id)
        .bind(RESTART_NOTE)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to restart task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        require_row(result.rows_affected(), task_id)?;
        self.find_task(task_id)
            .await?
            .ok_or(StoreError::TaskNotFound(task_id))
    }

    #[instrument(skip(self, reason))]
    async fn cancel_task(&self, task_id: Uuid, reason: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            WITH cancelled AS (
                UPDATE queue_tasks
                SET is_complete = TRUE,
                    finish_time = NOW(),
                    updated_at = NOW()
                WHERE id = $1
                  AND NOT is_complete
                  AND NOT failed
                  AND being_processed_by IS NULL
                RETURNING id
            )
            INSERT INTO queue_task_logs (task_id, message)
            SELECT id, $2 FROM cancelled
            "#,
        )
        .bind(task_id)
        .bind(cancel_note(reason))
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to cancel task: {}", e);
            StoreError::Database(e.to_string())
        })?;

        if result.rows_affected() > 0 {
            return Ok(());
        }
        Err(self.rejection(task_id, "cancel").await)
    }
}

impl PostgresTaskStore {
    /// Record a failed attempt, optionally only while `owner` holds the task
    ///
    /// Locks the row first so the error record and the counter update agree
    /// on ownership. `None` means no row matched.
    async fn record_failure(
        &self,
        task_id: Uuid,
        owner: Option<&str>,
        error: &str,
        policy: &RetryPolicy,
    ) -> Result<Option<RetryOutcome>, StoreError> {
        let row = sqlx::query(
            r#"
            WITH target AS (
                SELECT id FROM queue_tasks
                WHERE id = $1 AND ($4::text IS NULL OR being_processed_by = $4::text)
                FOR UPDATE
            ),
            recorded AS (
                INSERT INTO queue_task_errors (task_id, message)
                SELECT id, $2 FROM target
            )
            UPDATE queue_tasks t
            SET retries = t.retries + 1,
                being_processed_by = NULL,
                exclusive_claim = FALSE,
                updated_at = NOW(),
                failed = (t.retries + 1 >= $3),
                is_complete = CASE WHEN t.retries + 1 >= $3 THEN FALSE ELSE t.is_complete END,
                finish_time = CASE WHEN t.retries + 1 >= $3 THEN NOW() END,
                start_time = CASE WHEN t.retries + 1 >= $3 THEN t.start_time END
            FROM target
            WHERE t.id = target.id
            RETURNING t.retries, t.failed
            "#,
        )
        .bind(task_id)
        .bind(error)
        .bind(i64::from(policy.max_retries))
        .bind(owner)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record task failure: {}", e);
            StoreError::Database(e.to_string())
        })?;

        let Some(row) = row else {
            return Ok(None);
        };
        let retries: i32 = row.get("retries");
        let failed: bool = row.get("failed");

        debug!(%task_id, retries, failed, "recorded task failure");
        Ok(Some(if failed {
            RetryOutcome::Failed { retries }
        } else {
            RetryOutcome::WillRetry { retries }
        }))
    }

    /// Distinguish a task held by another owner from a missing one
    async fn require_task(&self, task_id: Uuid) -> Result<(), StoreError> {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM queue_tasks WHERE id = $1)")
                .bind(task_id)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| {
                    error!("Failed to look up task: {}", e);
                    StoreError::Database(e.to_string())
                })?;

        if exists {
            Ok(())
        } else {
            Err(StoreError::TaskNotFound(task_id))
        }
    }

    /// Explain why a conditional admin statement touched no row
    async fn rejection(&self, task_id: Uuid, operation: &'static str) -> StoreError {
        match self.find_task(task_id).await {
            Ok(Some(task)) => StoreError::InvalidState {
                id: task_id,
                status: task.status(),
                operation,
            },
            Ok(None) => StoreError::TaskNotFound(task_id),
            Err(e) => e,
        }
    }
}

fn require_row(rows_affected: u64, task_id: Uuid) -> Result<(), StoreError> {
    if rows_affected == 0 {
        Err(StoreError::TaskNotFound(task_id))
    } else {
        Ok(())
    }
}

fn push_filter(query: &mut QueryBuilder<'_, Postgres>, filter: &TaskFilter) {
    query.push(" WHERE TRUE");

    if let Some(task_type) = filter.task_type {
        query.push(" AND t.task_type = ").push_bind(task_type.as_str());
    }
    if let Some(org) = &filter.organization_id {
        query.push(" AND t.organization_id = ").push_bind(org.clone());
    }
    if let Some(status) = filter.status {
        query.push(match status {
            TaskStatus::Failed => " AND t.failed",
            TaskStatus::Complete => " AND t.is_complete AND NOT t.failed",
            TaskStatus::InProgress => {
                " AND NOT t.is_complete AND NOT t.failed \
                 AND t.being_processed_by IS NOT NULL AND t.start_time IS NOT NULL"
            }
            TaskStatus::Pending => {
                " AND NOT t.is_complete AND NOT t.failed \
                 AND (t.being_processed_by IS NULL OR t.start_time IS NULL)"
            }
        });
    }
}

fn task_from_row(row: &PgRow) -> Result<Task, StoreError> {
    let task_type: String = row.get("task_type");
    let payload: serde_json::Value = row.get("payload");
    let log_messages: serde_json::Value = row.get("log_messages");
    let errors: serde_json::Value = row.get("errors");

    Ok(Task {
        id: row.get("id"),
        task_type: task_type
            .parse()
            .map_err(|e: crate::task::UnknownTaskType| StoreError::Serialization(e.to_string()))?,
        organization_id: row.get("organization_id"),
        payload: serde_json::from_value(payload)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        priority: row.get("priority"),
        scheduled_start: row.get("scheduled_start"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        retries: row.get("retries"),
        being_processed_by: row.get("being_processed_by"),
        start_time: row.get("start_time"),
        finish_time: row.get("finish_time"),
        is_complete: row.get("is_complete"),
        failed: row.get("failed"),
        log_messages: parse_entries(log_messages)?,
        errors: parse_entries(errors)?,
    })
}

fn parse_entries(value: serde_json::Value) -> Result<Vec<TaskLogEntry>, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Serialization(e.to_string()))
}
