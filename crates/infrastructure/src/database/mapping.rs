//! 数据库行到任务实体的映射
//!
//! `state` 列在 PostgreSQL 中是 JSONB，在 SQLite 中是 JSON 文本，其余列两边一致。

use std::future::Future;

use sqlx::Row;
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{Task, TaskState};

pub struct MappingHelpers;

macro_rules! task_from_row {
    ($row:expr, $state:expr) => {
        Task {
            id: $row.try_get("id")?,
            workspace_id: $row.try_get("workspace_id")?,
            task_type: $row.try_get("type")?,
            status: $row.try_get("status")?,
            progress: $row.try_get("progress")?,
            state: $state,
            error_message: $row.try_get("error_message")?,
            max_runtime: $row.try_get("max_runtime")?,
            max_retries: $row.try_get("max_retries")?,
            retry_count: $row.try_get("retry_count")?,
            retry_interval: $row.try_get("retry_interval")?,
            next_run_after: $row.try_get("next_run_after")?,
            timeout_after: $row.try_get("timeout_after")?,
            last_run_at: $row.try_get("last_run_at")?,
            completed_at: $row.try_get("completed_at")?,
            claim_token: $row.try_get("claim_token")?,
            broadcast_id: $row.try_get("broadcast_id")?,
            created_at: $row.try_get("created_at")?,
            updated_at: $row.try_get("updated_at")?,
        }
    };
}

impl MappingHelpers {
    pub fn parse_state_postgres(
        row: &sqlx::postgres::PgRow,
        field_name: &str,
    ) -> SchedulerResult<TaskState> {
        let value: serde_json::Value = row.try_get(field_name)?;
        serde_json::from_value(value)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务状态失败: {e}")))
    }

    pub fn parse_state_sqlite(
        row: &sqlx::sqlite::SqliteRow,
        field_name: &str,
    ) -> SchedulerResult<TaskState> {
        let json_str: String = row.try_get(field_name)?;
        serde_json::from_str(&json_str)
            .map_err(|e| SchedulerError::Serialization(format!("解析任务状态失败: {e}")))
    }

    pub fn task_from_postgres_row(row: &sqlx::postgres::PgRow) -> SchedulerResult<Task> {
        let state = Self::parse_state_postgres(row, "state")?;
        Ok(task_from_row!(row, state))
    }

    pub fn task_from_sqlite_row(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let state = Self::parse_state_sqlite(row, "state")?;
        Ok(task_from_row!(row, state))
    }

    /// 分页读取到期任务，直到凑满 `limit` 个可解析的任务或没有更多行。
    ///
    /// 无法解析的行（例如较新版本写入的未知状态类型）不占用名额。
    pub async fn collect_due_pages<R, F, Fut>(
        limit: i64,
        mut fetch_page: F,
        map: impl Fn(&R) -> SchedulerResult<Task>,
    ) -> SchedulerResult<Vec<Task>>
    where
        F: FnMut(i64) -> Fut,
        Fut: Future<Output = SchedulerResult<Vec<R>>>,
    {
        let wanted = usize::try_from(limit).unwrap_or(0);
        let mut tasks: Vec<Task> = Vec::with_capacity(wanted);
        let mut offset: i64 = 0;

        while wanted > 0 {
            let rows = fetch_page(offset).await?;
            let fetched = rows.len();
            // 翻页期间有新行插入时，上一页末尾的行可能再次出现
            for task in Self::collect_tasks(rows, &map) {
                if !tasks
                    .iter()
                    .any(|t| t.workspace_id == task.workspace_id && t.id == task.id)
                {
                    tasks.push(task);
                }
            }
            if tasks.len() >= wanted || fetched < wanted {
                break;
            }
            offset += i64::try_from(fetched).unwrap_or(i64::MAX);
        }

        tasks.truncate(wanted);
        Ok(tasks)
    }

    /// 逐行映射；无法解析的行记录告警后跳过，不阻塞其他任务
    pub fn collect_tasks<R>(
        rows: Vec<R>,
        map: impl Fn(&R) -> SchedulerResult<Task>,
    ) -> Vec<Task> {
        rows.iter()
            .filter_map(|row| match map(row) {
                Ok(task) => Some(task),
                Err(e) => {
                    tracing::warn!(error = %e, "跳过无法解析的任务行");
                    None
                }
            })
            .collect()
    }
}
