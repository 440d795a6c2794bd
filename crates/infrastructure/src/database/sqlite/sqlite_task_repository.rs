use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{
    DueTaskQuery, Task, TaskClaim, TaskRepository, TaskState, TaskStatus,
};
use tracing::{debug, instrument};

use crate::{
    database::{mapping::MappingHelpers, queries},
    error_handling::{RepositoryErrorHelpers, RepositoryOperation, TaskOperationContext},
    task_context,
};

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// 创建嵌入式SQLite任务仓库，自动建库并完成迁移
    pub async fn new_embedded(database_url: &str, max_connections: u32) -> SchedulerResult<Self> {
        debug!("Creating embedded SQLite task repository at: {}", database_url);

        let connect_options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(10));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .min_connections(1)
            .connect_with(connect_options)
            .await?;

        Self::run_migrations(&pool).await?;

        debug!("Successfully created embedded SQLite task repository");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 运行数据库迁移，可重复执行
    pub async fn run_migrations(pool: &SqlitePool) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");
        let context = task_context!(RepositoryOperation::Migrate);

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT NOT NULL,
                workspace_id TEXT NOT NULL,
                type TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'pending',
                progress REAL NOT NULL DEFAULT 0.0,
                state TEXT NOT NULL DEFAULT '{"type":"empty"}',
                error_message TEXT,
                max_runtime INTEGER NOT NULL DEFAULT 50,
                max_retries INTEGER NOT NULL DEFAULT 3,
                retry_count INTEGER NOT NULL DEFAULT 0,
                retry_interval INTEGER NOT NULL DEFAULT 300,
                next_run_after TEXT,
                timeout_after TEXT,
                last_run_at TEXT,
                completed_at TEXT,
                claim_token TEXT,
                broadcast_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (workspace_id, id),
                CHECK (retry_count >= 0 AND retry_count <= max_retries),
                CHECK (progress >= 0.0 AND progress <= 1.0)
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

        debug!("Successfully completed SQLite database migrations");
        Ok(())
    }

    fn encode_state(context: &TaskOperationContext, state: &TaskState) -> SchedulerResult<String> {
        serde_json::to_string(state)
            .map_err(|e| RepositoryErrorHelpers::task_serialization_error(context.clone(), e))
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
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
        let state_json = Self::encode_state(&context, &task.state)?;

        sqlx::query(queries::INSERT_TASK)
            .bind(&task.id)
            .bind(&task.workspace_id)
            .bind(&task.task_type)
            .bind(task.progress)
            .bind(state_json)
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
        self.get(&task.workspace_id, &task.id).await?.ok_or_else(|| {
            SchedulerError::task_not_found(&task.workspace_id, &task.id)
        })
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
            .map(MappingHelpers::task_from_sqlite_row)
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
            .map(MappingHelpers::task_from_sqlite_row)
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
            MappingHelpers::task_from_sqlite_row,
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
        let state_json = Self::encode_state(&context, state)?;
        let result = sqlx::query(queries::SAVE_STATE)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(progress.clamp(0.0, 1.0))
            .bind(state_json)
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
        let state_json = Self::encode_state(&context, final_state)?;
        let result = sqlx::query(queries::MARK_COMPLETED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(state_json)
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
        let state_json = Self::encode_state(&context, state)?;
        let result = sqlx::query(queries::MARK_PAUSED)
            .bind(workspace_id)
            .bind(task_id)
            .bind(claim_token)
            .bind(next_run_after)
            .bind(progress.clamp(0.0, 1.0))
            .bind(state_json)
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
