//! In-memory repository mocks
//!
//! `MockTaskRepository` evaluates every transition under a single lock using the
//! same predicates as the SQL statements, so dispatcher tests exercise real claim,
//! fencing and progress-clamp behavior without a database.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{
    DueTaskQuery, Task, TaskClaim, TaskRepository, TaskState, TaskStatus,
};

type TaskKey = (String, String);

fn key(workspace_id: &str, task_id: &str) -> TaskKey {
    (workspace_id.to_string(), task_id.to_string())
}

#[derive(Debug, Clone, Default)]
pub struct MockTaskRepository {
    tasks: Arc<Mutex<HashMap<TaskKey, Task>>>,
    fail_operations: Arc<Mutex<bool>>,
    fail_next: Arc<Mutex<HashMap<&'static str, usize>>>,
    claim_attempts: Arc<Mutex<usize>>,
}

impl MockTaskRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores the row as-is, bypassing `create` validation (e.g. to seed a `running` row)
    pub fn insert(&self, task: Task) {
        self.tasks
            .lock()
            .unwrap()
            .insert(key(&task.workspace_id, &task.id), task);
    }

    pub fn task(&self, workspace_id: &str, task_id: &str) -> Option<Task> {
        self.tasks
            .lock()
            .unwrap()
            .get(&key(workspace_id, task_id))
            .cloned()
    }

    pub fn get_all_tasks(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.lock().unwrap().values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        tasks
    }

    pub fn tasks_of_type(&self, task_type: &str) -> Vec<Task> {
        self.get_all_tasks()
            .into_iter()
            .filter(|t| t.task_type == task_type)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    pub fn clear(&self) {
        self.tasks.lock().unwrap().clear();
    }

    /// Makes every subsequent operation fail with a retryable database error
    pub fn set_fail_operations(&self, fail: bool) {
        *self.fail_operations.lock().unwrap() = fail;
    }

    /// Makes the next `times` calls of `operation` (the trait method name) fail
    pub fn fail_next(&self, operation: &'static str, times: usize) {
        self.fail_next.lock().unwrap().insert(operation, times);
    }

    pub fn claim_attempts(&self) -> usize {
        *self.claim_attempts.lock().unwrap()
    }

    fn check_available(&self, operation: &'static str) -> SchedulerResult<()> {
        if *self.fail_operations.lock().unwrap() {
            return Err(SchedulerError::database_error("mock database unavailable"));
        }
        let mut fail_next = self.fail_next.lock().unwrap();
        if let Some(remaining) = fail_next.get_mut(operation) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SchedulerError::database_error(format!(
                    "mock {operation} failed"
                )));
            }
        }
        Ok(())
    }

    /// Applies `update` only when the row is running under `claim_token`
    fn update_claimed(
        &self,
        operation: &'static str,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        update: impl FnOnce(&mut Task) -> bool,
    ) -> SchedulerResult<bool> {
        self.check_available(operation)?;
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&key(workspace_id, task_id)) {
            Some(task)
                if task.status == TaskStatus::Running
                    && task.claim_token.as_deref() == Some(claim_token) =>
            {
                Ok(update(task))
            }
            _ => Ok(false),
        }
    }
}

fn release_claim(task: &mut Task) {
    task.timeout_after = None;
    task.claim_token = None;
}

#[async_trait]
impl TaskRepository for MockTaskRepository {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        self.check_available("create")?;
        task.validate()?;
        let mut tasks = self.tasks.lock().unwrap();
        let task_key = key(&task.workspace_id, &task.id);
        if tasks.contains_key(&task_key) {
            return Err(SchedulerError::database_error(format!(
                "任务ID {} 已存在",
                task.id
            )));
        }

        let mut stored = task.clone();
        stored.status = TaskStatus::Pending;
        stored.error_message = None;
        stored.timeout_after = None;
        stored.last_run_at = None;
        stored.completed_at = None;
        stored.claim_token = None;
        stored.updated_at = stored.created_at;
        tasks.insert(task_key, stored.clone());
        Ok(stored)
    }

    async fn get(&self, workspace_id: &str, task_id: &str) -> SchedulerResult<Option<Task>> {
        self.check_available("get")?;
        Ok(self.task(workspace_id, task_id))
    }

    async fn get_by_broadcast_id(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        self.check_available("get_by_broadcast_id")?;
        Ok(self
            .get_all_tasks()
            .into_iter()
            .filter(|t| {
                t.workspace_id == workspace_id && t.broadcast_id.as_deref() == Some(broadcast_id)
            })
            .max_by_key(|t| t.created_at))
    }

    async fn list_due(&self, query: &DueTaskQuery) -> SchedulerResult<Vec<Task>> {
        self.check_available("list_due")?;
        let mut due: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|t| t.is_due(query.now, query.abandoned_before))
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.due_at()
                .cmp(&b.due_at())
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(usize::try_from(query.limit).unwrap_or(0));
        Ok(due)
    }

    async fn mark_running(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim: &TaskClaim,
    ) -> SchedulerResult<bool> {
        self.check_available("mark_running")?;
        *self.claim_attempts.lock().unwrap() += 1;
        let mut tasks = self.tasks.lock().unwrap();
        let Some(task) = tasks.get_mut(&key(workspace_id, task_id)) else {
            return Ok(false);
        };

        let claimable = match task.status {
            TaskStatus::Pending | TaskStatus::Paused => {
                task.next_run_after.map(|at| at <= claim.now).unwrap_or(true)
            }
            TaskStatus::Running => task.is_abandoned(claim.abandoned_before) && task.can_retry(),
            TaskStatus::Completed | TaskStatus::Failed => false,
        };
        if !claimable {
            return Ok(false);
        }

        if task.status == TaskStatus::Running {
            task.retry_count += 1;
        }
        task.status = TaskStatus::Running;
        task.timeout_after = Some(claim.timeout_after);
        task.last_run_at = Some(claim.now);
        task.claim_token = Some(claim.claim_token.clone());
        task.updated_at = claim.now;
        Ok(true)
    }

    async fn save_state(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        progress: f64,
        state: &TaskState,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.update_claimed("save_state", workspace_id, task_id, claim_token, |task| {
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
            task.state = state.clone();
            task.updated_at = now;
            true
        })
    }

    async fn mark_completed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        final_state: &TaskState,
        completed_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.update_claimed("mark_completed", workspace_id, task_id, claim_token, |task| {
            task.status = TaskStatus::Completed;
            task.progress = 1.0;
            task.state = final_state.clone();
            task.error_message = None;
            task.completed_at = Some(completed_at);
            task.updated_at = completed_at;
            task.next_run_after = None;
            release_claim(task);
            true
        })
    }

    async fn mark_failed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.update_claimed("mark_failed", workspace_id, task_id, claim_token, |task| {
            task.status = TaskStatus::Failed;
            task.error_message = Some(error_message.to_string());
            task.updated_at = now;
            task.next_run_after = None;
            release_claim(task);
            true
        })
    }

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
        self.update_claimed("mark_paused", workspace_id, task_id, claim_token, |task| {
            task.status = TaskStatus::Paused;
            task.next_run_after = Some(next_run_after);
            task.progress = task.progress.max(progress.clamp(0.0, 1.0));
            task.state = state.clone();
            task.updated_at = now;
            release_claim(task);
            true
        })
    }

    async fn schedule_retry(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        retry_count: i32,
        next_run_after: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.update_claimed("schedule_retry", workspace_id, task_id, claim_token, |task| {
            if retry_count > task.max_retries {
                return false;
            }
            task.status = TaskStatus::Pending;
            task.retry_count = retry_count;
            task.next_run_after = Some(next_run_after);
            task.updated_at = now;
            release_claim(task);
            true
        })
    }

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
                "cannot release a claim into {status}"
            )));
        }
        self.update_claimed("release_claim", workspace_id, task_id, claim_token, |task| {
            task.status = status;
            task.updated_at = now;
            release_claim(task);
            true
        })
    }

    async fn fail_abandoned(
        &self,
        workspace_id: &str,
        task_id: &str,
        abandoned_before: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check_available("fail_abandoned")?;
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&key(workspace_id, task_id)) {
            Some(task) if task.is_abandoned(abandoned_before) && !task.can_retry() => {
                task.status = TaskStatus::Failed;
                task.error_message = Some(error_message.to_string());
                task.updated_at = now;
                task.next_run_after = None;
                release_claim(task);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn wake(
        &self,
        workspace_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.check_available("wake")?;
        let mut tasks = self.tasks.lock().unwrap();
        match tasks.get_mut(&key(workspace_id, task_id)) {
            Some(task) if task.status == TaskStatus::Paused => {
                task.next_run_after = Some(now);
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
