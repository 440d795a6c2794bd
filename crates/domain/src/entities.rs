use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use taskengine_core::{SchedulerError, SchedulerResult};

use crate::state::TaskState;

/// 任务默认执行参数
pub mod defaults {
    /// 单次认领后允许运行的最长时间（秒）
    pub const MAX_RUNTIME_SECONDS: i32 = 50;
    pub const MAX_RETRIES: i32 = 3;
    /// 重试退避基数（秒）
    pub const RETRY_INTERVAL_SECONDS: i32 = 300;
}

/// 任务：一个工作空间内可调度的最小工作单元
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub workspace_id: String,
    #[serde(rename = "type")]
    pub task_type: String,
    pub status: TaskStatus,
    pub progress: f64,
    pub state: TaskState,
    pub error_message: Option<String>,
    /// 单次执行允许的最长时间（秒）
    pub max_runtime: i32,
    pub max_retries: i32,
    pub retry_count: i32,
    /// 重试间隔（秒）
    pub retry_interval: i32,
    pub next_run_after: Option<DateTime<Utc>>,
    /// 当前认领的超时时间，仅在 running 状态下有意义
    pub timeout_after: Option<DateTime<Utc>>,
    pub last_run_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_token: Option<String>,
    pub broadcast_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// 等待认领的状态
    pub fn is_waiting(&self) -> bool {
        matches!(self, TaskStatus::Pending | TaskStatus::Paused)
    }

    /// 放弃认领时任务回到的状态；被遗弃后重新认领的任务回到 pending
    pub fn released(&self) -> TaskStatus {
        match self {
            TaskStatus::Paused => TaskStatus::Paused,
            _ => TaskStatus::Pending,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "paused" => Ok(TaskStatus::Paused),
            "completed" => Ok(TaskStatus::Completed),
            "failed" => Ok(TaskStatus::Failed),
            _ => Err(SchedulerError::validation_error(format!(
                "Invalid task status: {s}"
            ))),
        }
    }
}

impl Task {
    pub fn new(workspace_id: impl Into<String>, task_type: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            workspace_id: workspace_id.into(),
            task_type: task_type.into(),
            status: TaskStatus::Pending,
            progress: 0.0,
            state: TaskState::Empty,
            error_message: None,
            max_runtime: defaults::MAX_RUNTIME_SECONDS,
            max_retries: defaults::MAX_RETRIES,
            retry_count: 0,
            retry_interval: defaults::RETRY_INTERVAL_SECONDS,
            next_run_after: None,
            timeout_after: None,
            last_run_at: None,
            completed_at: None,
            claim_token: None,
            broadcast_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.state = state;
        self
    }

    pub fn with_max_runtime(mut self, seconds: i32) -> Self {
        self.max_runtime = seconds;
        self
    }

    pub fn with_retry_policy(mut self, max_retries: i32, retry_interval: i32) -> Self {
        self.max_retries = max_retries;
        self.retry_interval = retry_interval;
        self
    }

    /// 延迟到指定时间之后才允许执行
    pub fn scheduled_at(mut self, next_run_after: DateTime<Utc>) -> Self {
        self.next_run_after = Some(next_run_after);
        self
    }

    pub fn with_broadcast_id(mut self, broadcast_id: impl Into<String>) -> Self {
        self.broadcast_id = Some(broadcast_id.into());
        self
    }

    /// 校验新建任务的必填字段与取值范围
    pub fn validate(&self) -> SchedulerResult<()> {
        if self.workspace_id.trim().is_empty() {
            return Err(SchedulerError::validation_error("workspace_id 不能为空"));
        }
        if self.task_type.trim().is_empty() {
            return Err(SchedulerError::validation_error("任务类型不能为空"));
        }
        if self.max_runtime <= 0 {
            return Err(SchedulerError::validation_error("max_runtime 必须大于0"));
        }
        if self.max_retries < 0 || self.retry_interval < 0 {
            return Err(SchedulerError::validation_error(
                "max_retries 与 retry_interval 不能为负数",
            ));
        }
        if self.retry_count < 0 || self.retry_count > self.max_retries {
            return Err(SchedulerError::validation_error(format!(
                "retry_count={} 超出范围 [0, {}]",
                self.retry_count, self.max_retries
            )));
        }
        if !(0.0..=1.0).contains(&self.progress) {
            return Err(SchedulerError::validation_error(format!(
                "progress={} 必须在 [0, 1] 之间",
                self.progress
            )));
        }
        if !self.state.matches_type(&self.task_type) {
            return Err(SchedulerError::validation_error(format!(
                "任务状态类型 {:?} 与任务类型 {} 不匹配",
                self.state.task_type(),
                self.task_type
            )));
        }
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// running 且超时时间早于 `abandoned_before` 的任务视为被遗弃
    pub fn is_abandoned(&self, abandoned_before: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Running
            && self
                .timeout_after
                .map(|deadline| deadline < abandoned_before)
                .unwrap_or(true)
    }

    pub fn is_due(&self, now: DateTime<Utc>, abandoned_before: DateTime<Utc>) -> bool {
        match self.status {
            TaskStatus::Pending | TaskStatus::Paused => {
                self.next_run_after.map(|at| at <= now).unwrap_or(true)
            }
            TaskStatus::Running => self.is_abandoned(abandoned_before),
            TaskStatus::Completed | TaskStatus::Failed => false,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// 以 `now` 为认领时间计算本次执行的超时时间
    pub fn claim_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::seconds(i64::from(self.max_runtime))
    }

    /// 调度排序键：越早到期越优先
    pub fn due_at(&self) -> DateTime<Utc> {
        match self.status {
            TaskStatus::Running => self.timeout_after.unwrap_or(self.created_at),
            _ => self.next_run_after.unwrap_or(self.created_at),
        }
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 (ID: {}, 工作空间: {}, 类型: {})",
            self.id, self.workspace_id, self.task_type
        )
    }
}
