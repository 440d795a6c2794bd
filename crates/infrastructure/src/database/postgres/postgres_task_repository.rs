use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::PgPool;
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{
    DueTaskQuery, Task, TaskClaim, TaskRepository, TaskState, TaskStatus,
};
use tracing::{debug, instrument};

use crate::{
    database::{mapping::MappingHelpers, queries},
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    task_context,
};

pub struct PostgresTaskRepository {
    pool: PgPool,
}

impl PostgresTaskRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(database_url: &str, max_connections: u32) -> SchedulerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Self::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn run_migrations(pool: &PgPool) -> SchedulerResult<()> {
        debug!("Running PostgreSQL database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress DOUBLE PRECISION NOT NULL DEFAULT 0.0,
                state JSONB NOT NULL DEFAULT '{"type":"empty"}',
                error_message TEXT,
                max_runtime INTEGER NOT NULL DEFAULT 50,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_interval INTEGER NOT NULL DEFAULT 300,
                next_run_after TIMESTAMPTZ,
                timeout_after TIMESTAMPTZ,
                last_run_at TIMESTAMPTZ,
                completed_at TIMESTAMPTZ,
                claim_token TEXT,
                broadcast_id TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                CONSTRAINT tasks_pkey PRIMARY KEY (workspace_id, id),
                CONSTRAINT tasks_retry_bounds CHECK (retry_count >= 0 AND retry_count <= max_retries),
                CONSTRAINT tasks_progress_range CHECK (progress >= 0.0 AND progress <= 1.0)
            )
            "#,
        )
        .execute(pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        for index_sql in queries::INDEXES {
            sqlx::query(index_sql)
                .execute(pool)
                .await
                .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;
        }

        debug!("Successfully completed PostgreSQL database migrations");
        Ok(())
    }
}

#[async_trait]
impl TaskRepository for PostgresTaskRepository {
    #[instrument(skip(self, task), fields(
        task_id = %task.id,
        workspace_id = %task.workspace_id,
        task_type = %task.task_type,
    ))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        task.validate()?;
        let context = task_context!(
            RepositoryOperation::Create,
            workspace_id = &task.workspace_id,
            task_id = &task.id
        )
        .with_task_type(&task.task_type);

        sqlx::query(queries::INSERT_TASK)
            .bind(&task.id)
            .bind(&task.workspace_id)
            .bind(&task.task_type)
            .bind(task.progress)
            .bind(Json(&task.state))
            .bind(task.max_runtime)
            .bind(task.max_retries)
            .bind(task.retry_count)
            .bind(task.retry_interval)
            .bind(task.next_run_after)
            .bind(task.created_at)
            .bind(&task.broadcast_id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context.clone(), e))?;

        debug!("创建任务成功: {}", task.entity_description());
        self.get(&task.workspace_id, &task.id)
            .await?
            .ok_or_else(|| SchedulerError::task_not_found(&task.workspace_id, &task.id))
    }

    #[instrument(skip(self))]
    async fn get(&self, workspace_id: &str, task_id: &str) -> SchedulerResult<Option<Task>> {
        let context = task_context!(
            RepositoryOperation::Read,
            workspace_id = workspace_id,
            task_id = task_id
        );
        let row = sqlx::query(&queries::select_by_id())
            .bind(workspace_id)
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        row.as_ref()
            .map(MappingHelpers::task_from_postgres_row)
            .transpose()
    }

    #[instrument(skip(self))]
    async fn get_by_broadcast_id(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        let context = task_context!(RepositoryOperation::Read, workspace_id = workspace_id)
            .with_additional_info(format!("broadcast_id={broadcast_id}"));
        let row = sqlx::query(&queries::select_by_broadcast_id())
            .bind(workspace_id)
            .bind(broadcast_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        row.as_ref()
            .map(MappingHelpers::task_from_postgres_row)
            .transpose()
    }

    #[instrument(skip(self), fields(limit = query.limit))]
    async fn list_due(&self, query: &DueTaskQuery) -> SchedulerResult<Vec<Task>> {
        let context = task_context!(RepositoryOperation::Query)
            .with_additional_info(format!("limit={}", query.limit));
        let sql = queries::select_due();
        let pool = &self.pool;
        MappingHelpers::collect_due_pages(
            query.limit,
            |offset| {
                let context = context.clone();
                let sql = sql.as_str();
                async move {
                    sqlx::query(sql)
                        .bind(query.now)
                        .bind(query.abandoned_before)
                        .bind(query.limit)
                        .bind(offset)
                        .fetch_all(pool)
                        .await
                        .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))
                }
            },
            MappingHelpers::task_from_postgres_row,
        )
        .await
    }

    #[instrument(skip(self, claim))]
    async fn mark_running(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim: &TaskClaim,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Claim,
            workspace_id = workspace_id,
            task_id = task_id
        );
        let result = sqlx::query(queries::CLAIM_TASK)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim.timeout_after)
            .bind(claim.now)
            .bind(&claim.claim_token)
            .bind(claim.abandoned_before)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token, state))]
    async fn save_state(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        progress: f64,
        state: &TaskState,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Checkpoint,
            workspace_id = workspace_id,
            task_id = task_id
        );
        let result = sqlx::query(queries::SAVE_STATE)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(progress.clamp(0.0, 1.0))
            .bind(Json(state))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token, final_state))]
    async fn mark_completed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        final_state: &TaskState,
        completed_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("completed");
        let result = sqlx::query(queries::MARK_COMPLETED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(Json(final_state))
            .bind(completed_at)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token))]
    async fn mark_failed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("failed");
        let result = sqlx::query(queries::MARK_FAILED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(error_message)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token, state))]
    async fn mark_paused(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        next_run_after: DateTime<Utc>,
        progress: f64,
        state: &TaskState,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("paused");
        let result = sqlx::query(queries::MARK_PAUSED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(next_run_after)
            .bind(progress.clamp(0.0, 1.0))
            .bind(Json(state))
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token))]
    async fn schedule_retry(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        retry_count: i32,
        next_run_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info(format!("retry #{retry_count}"));
        let result = sqlx::query(queries::SCHEDULE_RETRY)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(retry_count)
            .bind(next_run_after)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, claim_token))]
    async fn release_claim(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        if !status.is_waiting() {
            return Err(SchedulerError::validation_error(format!(
                "放弃认领只能回到 pending 或 paused，实际为 {status}"
            )));
        }
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("release");
        let result = sqlx::query(queries::RELEASE_CLAIM)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(status)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn fail_abandoned(
        &self,
        workspace_id: &str,
        task_id: &str,
        abandoned_before: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("abandoned");
        let result = sqlx::query(queries::FAIL_ABANDONED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(abandoned_before)
            .bind(error_message)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self))]
    async fn wake(
        &self,
        workspace_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        let context = task_context!(
            RepositoryOperation::Transition,
            workspace_id = workspace_id,
            task_id = task_id
        )
        .with_additional_info("wake");
        let result = sqlx::query(queries::WAKE_TASK)
            .bind(workspace_id)
            .bind(task_id)
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::task_database_error(context, e))?;

        Ok(result.rows_affected() == 1)
    }
}
