//! Test data builders

use chrono::{DateTime, Utc};
use taskengine_domain::{
    task_types, BroadcastTaskState, BuildSegmentState, Task, TaskState, TaskStatus,
};

/// Builder for creating test Task entities
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new(workspace_id: &str, task_type: &str) -> Self {
        Self {
            task: Task::new(workspace_id, task_type),
        }
    }

    pub fn broadcast(workspace_id: &str, broadcast_id: &str) -> Self {
        Self::new(workspace_id, task_types::SEND_BROADCAST)
            .with_state(TaskState::SendBroadcast(BroadcastTaskState::new(
                broadcast_id,
            )))
            .with_broadcast_id(broadcast_id)
    }

    pub fn build_segment(workspace_id: &str, segment_id: &str, version: i64) -> Self {
        Self::new(workspace_id, task_types::BUILD_SEGMENT).with_state(TaskState::BuildSegment(
            BuildSegmentState::new(segment_id, version),
        ))
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.task.status = status;
        self
    }

    pub fn with_state(mut self, state: TaskState) -> Self {
        self.task.state = state;
        self
    }

    pub fn with_max_runtime(mut self, seconds: i32) -> Self {
        self.task.max_runtime = seconds;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i32) -> Self {
        self.task.max_retries = max_retries;
        self
    }

    pub fn with_retry_count(mut self, retry_count: i32) -> Self {
        self.task.retry_count = retry_count;
        self
    }

    pub fn with_retry_interval(mut self, seconds: i32) -> Self {
        self.task.retry_interval = seconds;
        self
    }

    pub fn with_next_run_after(mut self, at: DateTime<Utc>) -> Self {
        self.task.next_run_after = Some(at);
        self
    }

    pub fn with_timeout_after(mut self, at: DateTime<Utc>) -> Self {
        self.task.timeout_after = Some(at);
        self
    }

    pub fn with_claim_token(mut self, token: &str) -> Self {
        self.task.claim_token = Some(token.to_string());
        self
    }

    pub fn with_broadcast_id(mut self, broadcast_id: &str) -> Self {
        self.task.broadcast_id = Some(broadcast_id.to_string());
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.task.created_at = at;
        self.task.updated_at = at;
        self
    }

    /// A row left `running` by a worker that never came back
    pub fn abandoned(self, timeout_after: DateTime<Utc>) -> Self {
        self.with_status(TaskStatus::Running)
            .with_timeout_after(timeout_after)
            .with_claim_token("lost-worker")
    }

    pub fn build(self) -> Task {
        self.task
    }
}
