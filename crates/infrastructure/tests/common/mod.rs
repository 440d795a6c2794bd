#![allow(dead_code)]

use anyhow::Result;
use chrono::{DateTime, Duration, TimeZone, Utc};
use taskengine_domain::{TaskClaim, TaskRepository};
use taskengine_infrastructure::SqliteTaskRepository;
use tempfile::TempDir;
use uuid::Uuid;

/// 基于临时文件的SQLite任务库，TempDir 必须与仓储同生命周期
pub async fn sqlite_repository() -> Result<(TempDir, SqliteTaskRepository)> {
    let dir = tempfile::tempdir()?;
    let url = format!("sqlite://{}", dir.path().join("tasks.db").display());
    let repo = SqliteTaskRepository::new_embedded(&url, 5).await?;
    Ok((dir, repo))
}

/// 整秒时间，便于跨后端比较
pub fn at(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
}

pub fn claim_at(now: DateTime<Utc>, runtime_seconds: i64) -> TaskClaim {
    TaskClaim {
        now,
        timeout_after: now + Duration::seconds(runtime_seconds),
        abandoned_before: now - Duration::seconds(30),
        claim_token: Uuid::new_v4().to_string(),
    }
}

pub async fn claim(
    repo: &dyn TaskRepository,
    workspace_id: &str,
    task_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<TaskClaim>> {
    let claim = claim_at(now, 50);
    Ok(repo
        .mark_running(workspace_id, task_id, &claim)
        .await?
        .then_some(claim))
}
