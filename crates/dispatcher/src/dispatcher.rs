//! 任务分发
//!
//! `execute_pending` 是无状态、可重入的：所有协调都依赖任务库中的单行条件更新，
//! 多个进程同时调用时，同一任务只会被其中一个认领。

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use metrics::{counter, histogram};
use serde::Serialize;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use taskengine_core::config::DispatcherConfig;
use taskengine_core::{Clock, SchedulerError, SchedulerResult};
use taskengine_domain::{DueTaskQuery, Task, TaskClaim, TaskRepository, TaskStatus};

use crate::handler::{ExecutionContext, TaskLease};
use crate::handler_registry::HandlerRegistry;
use crate::retry_service::{AbandonedDisposition, RetryPolicy, Transition};

/// 单个候选任务在本次调用中的结果
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum ExecutionResult {
    Completed,
    Paused {
        next_run_after: DateTime<Utc>,
    },
    RetryScheduled {
        retry_count: i32,
        next_run_after: DateTime<Utc>,
    },
    Failed {
        error: String,
    },
    /// 认领竞争失败或认领在执行中失效，属于正常情况
    ClaimLost,
    /// 任务库错误，本次尝试放弃，任务保持原状等待下一轮
    InfrastructureError {
        error: String,
    },
}

impl ExecutionResult {
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionResult::Completed => "completed",
            ExecutionResult::Paused { .. } => "paused",
            ExecutionResult::RetryScheduled { .. } => "retry_scheduled",
            ExecutionResult::Failed { .. } => "failed",
            ExecutionResult::ClaimLost => "claim_lost",
            ExecutionResult::InfrastructureError { .. } => "infrastructure_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskExecutionRecord {
    pub workspace_id: String,
    pub task_id: String,
    pub task_type: String,
    #[serde(flatten)]
    pub result: ExecutionResult,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DispatchReport {
    /// 本次取到的候选任务数
    pub attempted: usize,
    pub records: Vec<TaskExecutionRecord>,
}

impl DispatchReport {
    pub fn count(&self, label: &str) -> usize {
        self.records
            .iter()
            .filter(|r| r.result.label() == label)
            .count()
    }

    /// 真正被本次调用执行（认领成功且未丢失）的任务数
    pub fn executed(&self) -> usize {
        self.records
            .iter()
            .filter(|r| {
                !matches!(
                    r.result,
                    ExecutionResult::ClaimLost | ExecutionResult::InfrastructureError { .. }
                )
            })
            .count()
    }
}

pub struct TaskDispatcher {
    store: Arc<dyn TaskRepository>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    retry_policy: RetryPolicy,
    config: DispatcherConfig,
}

impl TaskDispatcher {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
        retry_policy: RetryPolicy,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            store,
            registry,
            clock,
            retry_policy,
            config,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    fn grace(&self) -> Duration {
        Duration::seconds(self.config.abandonment_grace_seconds)
    }

    /// 选出最多 `max_tasks` 个到期任务，逐个认领、执行并提交结果
    #[instrument(skip(self))]
    pub async fn execute_pending(&self, max_tasks: usize) -> SchedulerResult<DispatchReport> {
        if max_tasks == 0 {
            return Ok(DispatchReport::default());
        }

        let now = self.clock.now();
        let query = DueTaskQuery {
            now,
            abandoned_before: now - self.grace(),
            limit: i64::try_from(max_tasks).unwrap_or(i64::MAX),
        };
        let candidates = self.store.list_due(&query).await?;
        let attempted = candidates.len();
        debug!("找到 {} 个到期任务", attempted);

        let concurrency = self.config.max_concurrency.max(1);
        let records: Vec<TaskExecutionRecord> = stream::iter(candidates)
            .map(|task| self.process_candidate(task))
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let report = DispatchReport { attempted, records };
        if attempted > 0 {
            info!(
                attempted,
                executed = report.executed(),
                claim_lost = report.count("claim_lost"),
                "本轮任务分发完成"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self, candidate), fields(
        workspace_id = %candidate.workspace_id,
        task_id = %candidate.id,
        task_type = %candidate.task_type,
    ))]
    async fn process_candidate(&self, candidate: Task) -> TaskExecutionRecord {
        let result = self.run_candidate(&candidate).await;
        counter!("taskengine_task_outcomes_total", "outcome" => result.label()).increment(1);

        match &result {
            ExecutionResult::Failed { error } => warn!("任务失败: {}", error),
            ExecutionResult::InfrastructureError { error } => error!("任务库错误: {}", error),
            other => debug!("任务结果: {}", other.label()),
        }

        TaskExecutionRecord {
            workspace_id: candidate.workspace_id,
            task_id: candidate.id,
            task_type: candidate.task_type,
            result,
        }
    }

    async fn run_candidate(&self, candidate: &Task) -> ExecutionResult {
        let now = self.clock.now();
        let abandoned_before = now - self.grace();

        if candidate.status == TaskStatus::Running
            && self.retry_policy.abandoned_disposition(candidate) == AbandonedDisposition::Fail
        {
            return self.fail_abandoned(candidate, abandoned_before).await;
        }

        let claim = TaskClaim {
            now,
            timeout_after: candidate.claim_deadline(now),
            abandoned_before,
            claim_token: Uuid::new_v4().to_string(),
        };
        match self
            .store
            .mark_running(&candidate.workspace_id, &candidate.id, &claim)
            .await
        {
            Ok(true) => {
                counter!("taskengine_tasks_claimed_total").increment(1);
                if candidate.status == TaskStatus::Running {
                    info!("回收被遗弃的任务，重试次数 {}", candidate.retry_count + 1);
                }
            }
            Ok(false) => {
                counter!("taskengine_claims_lost_total").increment(1);
                debug!("任务已被其他执行者认领，跳过");
                return ExecutionResult::ClaimLost;
            }
            Err(e) => {
                return ExecutionResult::InfrastructureError {
                    error: e.to_string(),
                }
            }
        }

        let lease = TaskLease {
            claim_token: claim.claim_token,
            claimed_at: claim.now,
            timeout_after: claim.timeout_after,
            release_status: candidate.status.released(),
        };

        // 候选快照可能已过期，以认领后的行为准
        let task = match self
            .store
            .get(&candidate.workspace_id, &candidate.id)
            .await
        {
            Ok(Some(task)) => task,
            Ok(None) => return ExecutionResult::ClaimLost,
            Err(e) => return self.release(candidate, &lease, e.to_string()).await,
        };

        self.execute_claimed(task, lease).await
    }

    async fn execute_claimed(&self, task: Task, lease: TaskLease) -> ExecutionResult {
        let Some(handler) = self.registry.get(&task.task_type).await else {
            let error = SchedulerError::HandlerNotFound(task.task_type.clone()).to_string();
            return self.commit(&task, &lease, Transition::Fail { error }).await;
        };

        let margin = Duration::seconds(self.config.deadline_safety_margin_seconds);
        let deadline = (lease.timeout_after - margin).max(lease.claimed_at);
        let ctx = ExecutionContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &task,
            lease.clone(),
            deadline,
        );

        let started = Instant::now();
        let outcome = handler.execute(&task, &ctx).await;
        histogram!("taskengine_task_execution_seconds", "task_type" => task.task_type.clone())
            .record(started.elapsed().as_secs_f64());
        debug!(
            outcome = outcome.kind(),
            checkpoints = ctx.checkpoint_count(),
            "处理器返回"
        );

        if ctx.claim_lost() {
            counter!("taskengine_claims_lost_total").increment(1);
            return ExecutionResult::ClaimLost;
        }
        if let Some(error) = ctx.store_error() {
            return self.release(&task, &lease, error.to_string()).await;
        }

        let transition = self.retry_policy.decide(&task, outcome, self.clock.now());
        self.commit(&task, &lease, transition).await
    }

    async fn commit(
        &self,
        task: &Task,
        lease: &TaskLease,
        transition: Transition,
    ) -> ExecutionResult {
        let ws = task.workspace_id.as_str();
        let id = task.id.as_str();
        let token = lease.claim_token.as_str();
        let now = self.clock.now();

        let (committed, result) = match transition {
            Transition::Complete { final_state } => (
                self.store
                    .mark_completed(ws, id, token, &final_state, now)
                    .await,
                ExecutionResult::Completed,
            ),
            Transition::Pause {
                next_run_after,
                progress,
                state,
            } => (
                self.store
                    .mark_paused(ws, id, token, next_run_after, progress, &state, now)
                    .await,
                ExecutionResult::Paused { next_run_after },
            ),
            Transition::Retry {
                retry_count,
                next_run_after,
            } => (
                self.store
                    .schedule_retry(ws, id, token, retry_count, next_run_after, now)
                    .await,
                ExecutionResult::RetryScheduled {
                    retry_count,
                    next_run_after,
                },
            ),
            Transition::Fail { error } => (
                self.store.mark_failed(ws, id, token, &error, now).await,
                ExecutionResult::Failed { error },
            ),
        };

        match committed {
            Ok(true) => result,
            Ok(false) => {
                counter!("taskengine_claims_lost_total").increment(1);
                warn!("提交结果时认领已失效，结果被丢弃");
                ExecutionResult::ClaimLost
            }
            Err(e) => self.release(task, lease, e.to_string()).await,
        }
    }

    /// 认领之后遇到存储错误：本次执行作废，任务回到认领前的状态，不消耗重试次数。
    /// 放弃认领本身失败时，任务保持 running，直到超时后被回收。
    async fn release(&self, task: &Task, lease: &TaskLease, error: String) -> ExecutionResult {
        match self
            .store
            .release_claim(
                &task.workspace_id,
                &task.id,
                &lease.claim_token,
                lease.release_status,
                self.clock.now(),
            )
            .await
        {
            Ok(true) => debug!("已放弃认领，任务回到 {}", lease.release_status),
            Ok(false) => debug!("放弃认领时认领已失效"),
            Err(e) => warn!(error = %e, "放弃认领失败，任务将在超时后被回收"),
        }
        ExecutionResult::InfrastructureError { error }
    }

    async fn fail_abandoned(
        &self,
        task: &Task,
        abandoned_before: DateTime<Utc>,
    ) -> ExecutionResult {
        let error = format!(
            "任务执行超时被遗弃，已达到最大重试次数 {}",
            task.max_retries
        );
        match self
            .store
            .fail_abandoned(
                &task.workspace_id,
                &task.id,
                abandoned_before,
                &error,
                self.clock.now(),
            )
            .await
        {
            Ok(true) => ExecutionResult::Failed { error },
            Ok(false) => ExecutionResult::ClaimLost,
            Err(e) => ExecutionResult::InfrastructureError {
                error: e.to_string(),
            },
        }
    }
}
