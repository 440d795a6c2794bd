use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Duration;
use tracing::info;

use taskengine_core::{AppConfig, Clock, SystemClock};
use taskengine_dispatcher::{
    register_builtin, BuiltinCollaborators, DispatchReport, HandlerRegistry, RetryPolicy,
    TaskDispatcher,
};
use taskengine_domain::{
    BroadcastGateway, DueTaskQuery, Notifier, SegmentDirectory, Task, TaskRepository,
};
use taskengine_infrastructure::{DatabaseManager, WorkspaceStoreRouter};

/// 宿主提供的外部协作方，内置处理器通过它们完成实际投递与分群求值
#[derive(Clone)]
pub struct HostCollaborators {
    pub broadcasts: Arc<dyn BroadcastGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub segments: Arc<dyn SegmentDirectory>,
}

/// 组合根：任务库、处理器注册表与分发器
pub struct Application {
    config: AppConfig,
    database: DatabaseManager,
    router: Arc<WorkspaceStoreRouter>,
    registry: Arc<HandlerRegistry>,
    dispatcher: TaskDispatcher,
    clock: Arc<dyn Clock>,
}

impl Application {
    pub async fn connect(config: AppConfig) -> Result<Self> {
        Self::connect_with_clock(config, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        info!("初始化任务引擎");

        let database = DatabaseManager::connect(&config.database)
            .await
            .context("连接任务数据库失败")?;
        database.migrate().await.context("执行数据库迁移失败")?;
        info!("任务数据库就绪: {:?}", database.database_type());

        let router = Arc::new(WorkspaceStoreRouter::with_fallback(
            database.task_repository(),
        ));
        let registry = Arc::new(HandlerRegistry::new());
        let store: Arc<dyn TaskRepository> = router.clone();
        let dispatcher = TaskDispatcher::new(
            store,
            Arc::clone(&registry),
            Arc::clone(&clock),
            RetryPolicy::new(config.retry.clone()),
            config.dispatcher.clone(),
        );

        Ok(Self {
            config,
            database,
            router,
            registry,
            dispatcher,
            clock,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// 按工作空间路由的任务库
    pub fn store(&self) -> Arc<dyn TaskRepository> {
        self.router.clone()
    }

    pub fn registry(&self) -> Arc<HandlerRegistry> {
        Arc::clone(&self.registry)
    }

    /// 为工作空间挂载独立的任务库，未挂载的工作空间使用配置中的数据库
    pub async fn register_workspace(&self, workspace_id: &str, store: Arc<dyn TaskRepository>) {
        self.router.register(workspace_id, store).await;
    }

    pub async fn register_builtin_handlers(&self, host: HostCollaborators) -> Result<()> {
        register_builtin(
            &self.registry,
            BuiltinCollaborators {
                store: self.store(),
                broadcasts: host.broadcasts,
                notifier: host.notifier,
                segments: host.segments,
                broadcast_config: self.config.broadcast.clone(),
                segment_config: self.config.segments.clone(),
            },
        )
        .await
        .context("注册内置任务处理器失败")?;
        Ok(())
    }

    pub async fn enqueue(&self, task: &Task) -> Result<Task> {
        let created = self
            .router
            .create(task)
            .await
            .with_context(|| format!("创建任务失败: {}", task.entity_description()))?;
        info!(
            workspace_id = %created.workspace_id,
            task_id = %created.id,
            task_type = %created.task_type,
            "任务已入队"
        );
        Ok(created)
    }

    pub async fn get_task(&self, workspace_id: &str, task_id: &str) -> Result<Option<Task>> {
        Ok(self.router.get(workspace_id, task_id).await?)
    }

    /// 当前到期的任务（只读，不认领）
    pub async fn due_tasks(&self, limit: usize) -> Result<Vec<Task>> {
        let now = self.clock.now();
        let query = DueTaskQuery {
            now,
            abandoned_before: now
                - Duration::seconds(self.config.dispatcher.abandonment_grace_seconds),
            limit: i64::try_from(limit).unwrap_or(i64::MAX),
        };
        Ok(self.router.list_due(&query).await?)
    }

    /// 外部定时器或 HTTP 入口调用的触发操作，未指定数量时使用配置的批次大小
    pub async fn run_pending_tasks(&self, max_tasks: Option<usize>) -> Result<DispatchReport> {
        let max_tasks = max_tasks.unwrap_or(self.config.dispatcher.default_batch_size);
        let report = self
            .dispatcher
            .execute_pending(max_tasks)
            .await
            .context("执行到期任务失败")?;
        Ok(report)
    }

    pub async fn health_check(&self) -> Result<()> {
        self.database
            .health_check()
            .await
            .context("任务数据库健康检查失败")?;
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.database.close().await;
        info!("任务引擎已关闭");
    }
}
