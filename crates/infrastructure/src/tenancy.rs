//! 按工作空间路由的任务库
//!
//! 每个工作空间拥有独立的任务库。路由器本身实现 `TaskRepository`，
//! 按 `workspace_id` 把调用转发给对应的库；扫描到期任务时对所有库扇出后合并。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use taskengine_core::{SchedulerError, SchedulerResult};
use taskengine_domain::{
    DueTaskQuery, Task, TaskClaim, TaskRepository, TaskState, TaskStatus,
};

#[derive(Default)]
pub struct WorkspaceStoreRouter {
    stores: RwLock<HashMap<String, Arc<dyn TaskRepository>>>,
    /// 未显式注册的工作空间使用的共享库
    fallback: Option<Arc<dyn TaskRepository>>,
}

impl WorkspaceStoreRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 单库部署：所有工作空间共用同一个库，仍可为个别工作空间注册独立库
    pub fn with_fallback(store: Arc<dyn TaskRepository>) -> Self {
        Self {
            stores: RwLock::new(HashMap::new()),
            fallback: Some(store),
        }
    }

    pub async fn register(&self, workspace_id: impl Into<String>, store: Arc<dyn TaskRepository>) {
        let workspace_id = workspace_id.into();
        debug!(workspace_id = %workspace_id, "注册工作空间任务库");
        self.stores.write().await.insert(workspace_id, store);
    }

    pub async fn workspaces(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    async fn store_for(&self, workspace_id: &str) -> SchedulerResult<Arc<dyn TaskRepository>> {
        if let Some(store) = self.stores.read().await.get(workspace_id) {
            return Ok(Arc::clone(store));
        }
        self.fallback
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| SchedulerError::WorkspaceNotFound {
                id: workspace_id.to_string(),
            })
    }

    /// 按底层库去重：共享同一个库的工作空间只查询一次
    async fn store_groups(&self) -> Vec<(Arc<dyn TaskRepository>, StoreScope)> {
        let stores = self.stores.read().await;
        let mut groups: Vec<(Arc<dyn TaskRepository>, StoreScope)> = Vec::new();

        for (workspace_id, store) in stores.iter() {
            match groups.iter_mut().find(|(s, _)| same_store(s, store)) {
                Some((_, StoreScope::Workspaces(ids))) => ids.push(workspace_id.clone()),
                Some((_, StoreScope::AllExcept(_))) => {}
                None => groups.push((
                    Arc::clone(store),
                    StoreScope::Workspaces(vec![workspace_id.clone()]),
                )),
            }
        }

        if let Some(fallback) = &self.fallback {
            let registered: Vec<String> = stores
                .iter()
                .filter(|(_, store)| !same_store(store, fallback))
                .map(|(id, _)| id.clone())
                .collect();
            groups.retain(|(s, _)| !same_store(s, fallback));
            groups.push((Arc::clone(fallback), StoreScope::AllExcept(registered)));
        }

        groups
    }
}

enum StoreScope {
    Workspaces(Vec<String>),
    AllExcept(Vec<String>),
}

impl StoreScope {
    fn admits(&self, workspace_id: &str) -> bool {
        match self {
            StoreScope::Workspaces(ids) => ids.iter().any(|id| id == workspace_id),
            StoreScope::AllExcept(ids) => !ids.iter().any(|id| id == workspace_id),
        }
    }
}

/// 库中还存有本组不负责的工作空间的行时，它们会占用 LIMIT 名额；
/// 逐步放大 LIMIT，直到凑满名额或库中没有更多到期行
async fn list_due_in_scope(
    store: &dyn TaskRepository,
    scope: &StoreScope,
    query: &DueTaskQuery,
) -> SchedulerResult<Vec<Task>> {
    let wanted = usize::try_from(query.limit).unwrap_or(0);
    let mut page = query.clone();
    loop {
        let rows = store.list_due(&page).await?;
        let exhausted = rows.len() < usize::try_from(page.limit).unwrap_or(usize::MAX);
        let admitted: Vec<Task> = rows
            .into_iter()
            .filter(|task| scope.admits(&task.workspace_id))
            .collect();
        if admitted.len() >= wanted || exhausted {
            return Ok(admitted);
        }
        debug!(limit = page.limit, admitted = admitted.len(), "扩大到期任务扫描范围");
        page.limit = page.limit.saturating_mul(2);
    }
}

fn same_store(a: &Arc<dyn TaskRepository>, b: &Arc<dyn TaskRepository>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

#[async_trait]
impl TaskRepository for WorkspaceStoreRouter {
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        self.store_for(&task.workspace_id).await?.create(task).await
    }

    async fn get(&self, workspace_id: &str, task_id: &str) -> SchedulerResult<Option<Task>> {
        self.store_for(workspace_id)
            .await?
            .get(workspace_id, task_id)
            .await
    }

    async fn get_by_broadcast_id(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<Option<Task>> {
        self.store_for(workspace_id)
            .await?
            .get_by_broadcast_id(workspace_id, broadcast_id)
            .await
    }

    #[instrument(skip(self), fields(limit = query.limit))]
    async fn list_due(&self, query: &DueTaskQuery) -> SchedulerResult<Vec<Task>> {
        let mut due = Vec::new();
        for (store, scope) in self.store_groups().await {
            match list_due_in_scope(store.as_ref(), &scope, query).await {
                Ok(tasks) => due.extend(tasks),
                Err(e) => warn!(error = %e, "扫描工作空间任务库失败，跳过"),
            }
        }

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
        self.store_for(workspace_id)
            .await?
            .mark_running(workspace_id, task_id, claim)
            .await
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
        self.store_for(workspace_id)
            .await?
            .save_state(workspace_id, task_id, claim_token, progress, state, now)
            .await
    }

    async fn mark_completed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        final_state: &TaskState,
        completed_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.store_for(workspace_id)
            .await?
            .mark_completed(workspace_id, task_id, claim_token, final_state, completed_at)
            .await
    }

    async fn mark_failed(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.store_for(workspace_id)
            .await?
            .mark_failed(workspace_id, task_id, claim_token, error_message, now)
            .await
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
        self.store_for(workspace_id)
            .await?
            .mark_paused(
                workspace_id,
                task_id,
                claim_token,
                next_run_after,
                progress,
                state,
                now,
            )
            .await
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
        self.store_for(workspace_id)
            .await?
            .schedule_retry(
                workspace_id,
                task_id,
                claim_token,
                retry_count,
                next_run_after,
                now,
            )
            .await
    }

    async fn release_claim(
        &self,
        workspace_id: &str,
        task_id: &str,
        claim_token: &str,
        status: TaskStatus,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.store_for(workspace_id)
            .await?
            .release_claim(workspace_id, task_id, claim_token, status, now)
            .await
    }

    async fn fail_abandoned(
        &self,
        workspace_id: &str,
        task_id: &str,
        abandoned_before: DateTime<Utc>,
        error_message: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.store_for(workspace_id)
            .await?
            .fail_abandoned(workspace_id, task_id, abandoned_before, error_message, now)
            .await
    }

    async fn wake(
        &self,
        workspace_id: &str,
        task_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        self.store_for(workspace_id)
            .await?
            .wake(workspace_id, task_id, now)
            .await
    }
}
