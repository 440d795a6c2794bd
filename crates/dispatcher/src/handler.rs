//! 任务处理器契约
//!
//! 处理器在一次认领内运行，按自身的安全边界（例如每发送完一批收件人）检查截止时间，
//! 并在截止前以 `Paused` 让出；引擎不会强制中断正在运行的处理器。
//! 处理器必须可恢复：从已持久化的检查点继续时不得重复已确认的副作用。

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use taskengine_core::{Clock, SchedulerError, SchedulerResult};
use taskengine_domain::{Task, TaskRepository, TaskState, TaskStatus};

/// 一次执行的结果
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(TaskState),
    /// 写入检查点，`next_run_after` 之后重新进入认领池
    Paused {
        next_run_after: DateTime<Utc>,
        progress: f64,
        state: TaskState,
    },
    Failed { error: String, retryable: bool },
}

impl TaskOutcome {
    pub fn retryable(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
            retryable: true,
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        TaskOutcome::Failed {
            error: error.into(),
            retryable: false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TaskOutcome::Completed(_) => "completed",
            TaskOutcome::Paused { .. } => "paused",
            TaskOutcome::Failed {
                retryable: true, ..
            } => "failed_retryable",
            TaskOutcome::Failed {
                retryable: false, ..
            } => "failed_permanent",
        }
    }
}

impl From<SchedulerError> for TaskOutcome {
    fn from(error: SchedulerError) -> Self {
        TaskOutcome::Failed {
            retryable: error.is_retryable(),
            error: error.to_string(),
        }
    }
}

/// 一次成功认领的凭据
#[derive(Debug, Clone)]
pub struct TaskLease {
    pub claim_token: String,
    pub claimed_at: DateTime<Utc>,
    pub timeout_after: DateTime<Utc>,
    /// 放弃本次认领时任务回到的状态
    pub release_status: TaskStatus,
}

/// 处理器可见的执行上下文：时间预算与检查点写入
pub struct ExecutionContext {
    store: Arc<dyn TaskRepository>,
    clock: Arc<dyn Clock>,
    workspace_id: String,
    task_id: String,
    lease: TaskLease,
    deadline: DateTime<Utc>,
    claim_lost: AtomicBool,
    store_error: OnceLock<String>,
    checkpoints: AtomicU32,
}

impl ExecutionContext {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        clock: Arc<dyn Clock>,
        task: &Task,
        lease: TaskLease,
        deadline: DateTime<Utc>,
    ) -> Self {
        Self {
            store,
            clock,
            workspace_id: task.workspace_id.clone(),
            task_id: task.id.clone(),
            lease,
            deadline,
            claim_lost: AtomicBool::new(false),
            store_error: OnceLock::new(),
            checkpoints: AtomicU32::new(0),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// 处理器必须在此之前返回
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        (self.deadline - self.now()).max(Duration::zero())
    }

    /// 预计还需 `reserve` 才能完成下一个工作单元时，是否应当让出
    pub fn should_yield(&self, reserve: Duration) -> bool {
        reserve >= self.remaining()
    }

    pub fn lease(&self) -> &TaskLease {
        &self.lease
    }

    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// 写入执行中的检查点，状态保持 running。
    ///
    /// 返回 `false` 表示认领已失效（被回收或外部取消），处理器应立即停止，
    /// 其返回的结果不会被提交。存储错误同样使本次执行的结果作废，
    /// 任务保持原状态等待下一轮分发。
    pub async fn checkpoint(&self, progress: f64, state: &TaskState) -> SchedulerResult<bool> {
        let written = self
            .store
            .save_state(
                &self.workspace_id,
                &self.task_id,
                &self.lease.claim_token,
                progress,
                state,
                self.now(),
            )
            .await;
        let saved = match written {
            Ok(saved) => saved,
            Err(e) => {
                warn!(
                    workspace_id = %self.workspace_id,
                    task_id = %self.task_id,
                    error = %e,
                    "检查点写入失败"
                );
                let _ = self.store_error.set(e.to_string());
                return Err(e);
            }
        };
        if saved {
            self.checkpoints.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!(
                workspace_id = %self.workspace_id,
                task_id = %self.task_id,
                "检查点写入未命中，认领已失效"
            );
            self.claim_lost.store(true, Ordering::Release);
        }
        Ok(saved)
    }

    pub fn claim_lost(&self) -> bool {
        self.claim_lost.load(Ordering::Acquire)
    }

    /// 本次执行中第一次检查点写入失败的错误
    pub fn store_error(&self) -> Option<&str> {
        self.store_error.get().map(String::as_str)
    }

    pub fn checkpoint_count(&self) -> u32 {
        self.checkpoints.load(Ordering::Relaxed)
    }
}

#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome;
}
