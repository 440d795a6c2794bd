use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use taskengine_core::{SchedulerError, SchedulerResult};

use crate::handler::TaskHandler;

/// 任务类型到处理器的映射，启动时填充，按类型字符串精确匹配
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn TaskHandler>>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(
        &self,
        task_type: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> SchedulerResult<()> {
        let task_type = task_type.into();
        if task_type.trim().is_empty() {
            return Err(SchedulerError::validation_error("任务类型不能为空"));
        }
        let mut handlers = self.handlers.write().await;
        if handlers.contains_key(&task_type) {
            return Err(SchedulerError::DuplicateHandler(task_type));
        }
        info!(task_type = %task_type, "注册任务处理器");
        handlers.insert(task_type, handler);
        Ok(())
    }

    pub async fn register_batch(
        &self,
        handlers: Vec<(String, Arc<dyn TaskHandler>)>,
    ) -> SchedulerResult<()> {
        for (task_type, handler) in handlers {
            self.register(task_type, handler).await?;
        }
        Ok(())
    }

    pub async fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.read().await.get(task_type).cloned()
    }

    pub async fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ExecutionContext, TaskOutcome};
    use async_trait::async_trait;
    use taskengine_domain::Task;

    struct NoopHandler;

    #[async_trait]
    impl TaskHandler for NoopHandler {
        async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> TaskOutcome {
            TaskOutcome::Completed(task.state.clone())
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup_by_exact_type() {
        let registry = HandlerRegistry::new();
        registry
            .register("send_broadcast", Arc::new(NoopHandler))
            .await
            .unwrap();

        assert!(registry.get("send_broadcast").await.is_some());
        assert!(registry.get("Send_Broadcast").await.is_none());
        assert!(registry.get("send").await.is_none());
        assert_eq!(registry.task_types().await, vec!["send_broadcast"]);
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_rejected() {
        let registry = HandlerRegistry::new();
        registry.register("noop", Arc::new(NoopHandler)).await.unwrap();

        let err = registry
            .register("noop", Arc::new(NoopHandler))
            .await
            .unwrap_err();
        assert!(matches!(err, SchedulerError::DuplicateHandler(t) if t == "noop"));
    }

    #[tokio::test]
    async fn test_empty_task_type_is_rejected() {
        let registry = HandlerRegistry::new();
        assert!(registry.register(" ", Arc::new(NoopHandler)).await.is_err());
    }
}
