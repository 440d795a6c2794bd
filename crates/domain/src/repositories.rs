//! 领域仓储抽象
//!
//! 任务存储是唯一的共享可变资源，所有状态转换都在这里以单条条件更新原子提交。
//! 返回 `bool` 的操作表示条件是否命中（受影响行数为 1）。

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use taskengine_core::SchedulerResult;

use crate::entities::{Task, TaskStatus};
use crate::state::TaskState;

/// 到期任务查询条件
#[derive(Debug, Clone)]
pub struct DueTaskQuery {
    pub now: DateTime<Utc>,
    /// 超时时间早于此刻的 running 任务视为被遗弃
    pub abandoned_before: DateTime<Utc>,
    pub limit: i64,
}

/// 一次认领的参数
#[derive(Debug, Clone)]
pub struct TaskClaim {
    pub now: DateTime<Utc>,
    pub timeout_after: DateTime<Utc>,
    pub abandoned_before: DateTime<Utc>,
    /// 本次认领的栅栏令牌，后续状态转换都必须携带
    pub claim_token: String,
}

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// 插入新任务，状态为 pending（可带未来的 next_run_after）
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    async fn get(&self, workspace_id: &str, task_id: &str) -> SchedulerResult<Option<Task>>;

    /// 最近一次为该群发创建的任务
    async fn get_by_broadcast_id(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<Option<Task>>;

    /// 到期的 pending/paused 任务与被遗弃的 running 任务，最早到期的在前
    async fn list_due(&self, query: &DueTaskQuery) -> SchedulerResult<Vec<Task>>;

    /// 认领：单条条件更新，命中返回 true；被遗弃任务的重新认领会使 retry_count 加一
    async fn mark_running(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim: &TaskClaim,
    ) -> SchedulerResult<bool>;

    /// 执行中写检查点，不改变状态；返回 false 表示认领已失效
    async fn save_state(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        progress: f64,
        state: &TaskState,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn mark_completed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        final_state: &TaskState,
        completed_at: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 终态失败，只在重试策略判定不再重试后调用
    async fn mark_failed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    async fn mark_paused(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        next_run_after: DateTime<Utc>,
        progress: f64,
        state: &TaskState,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 可重试失败：回到 pending 并设置退避时间，保留最后一次检查点
    async fn schedule_retry(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        retry_count: i32,
        next_run_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 放弃本次认领且不改变任务状态：行回到认领前的 `status`，检查点与重试次数保持不变。
    /// 用于执行过程中遇到存储错误的情况，任务在下一轮分发时仍然可被认领。
    async fn release_claim(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 重试次数已用尽的被遗弃任务直接置为终态失败
    async fn fail_abandoned(
        &self,
        workspace_id: &str,
        task_id: &str,
        abandoned_before: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;

    /// 让 paused 任务立即到期
    async fn wake(
        &self,
        workspace_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
}
