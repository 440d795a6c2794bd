//! 内置任务处理器

use std::sync::Arc;

use taskengine_core::config::{BroadcastConfig, SegmentConfig};
use taskengine_core::SchedulerResult;
use taskengine_domain::{task_types, BroadcastGateway, Notifier, SegmentDirectory, TaskRepository};

use crate::handler::TaskHandler;
use crate::handler_registry::HandlerRegistry;

/// 写检查点；认领失效时立即返回，返回值不会被提交
macro_rules! checkpoint_or_stop {
    ($ctx:expr, $progress:expr, $state:expr) => {
        if !$ctx.checkpoint($progress, $state).await? {
            return Ok($crate::handler::TaskOutcome::permanent("认领已失效，停止执行"));
        }
    };
}

pub mod broadcast;
pub mod build_segment;
pub mod segment_recompute;

pub use broadcast::BroadcastHandler;
pub use build_segment::BuildSegmentHandler;
pub use segment_recompute::SegmentRecomputeHandler;

/// 内置处理器依赖的外部协作方
#[derive(Clone)]
pub struct BuiltinCollaborators {
    pub store: Arc<dyn TaskRepository>,
    pub broadcasts: Arc<dyn BroadcastGateway>,
    pub notifier: Arc<dyn Notifier>,
    pub segments: Arc<dyn SegmentDirectory>,
    pub broadcast_config: BroadcastConfig,
    pub segment_config: SegmentConfig,
}

/// 注册 `send_broadcast`、`check_segment_recompute`、`build_segment`
pub async fn register_builtin(
    registry: &HandlerRegistry,
    collaborators: BuiltinCollaborators,
) -> SchedulerResult<()> {
    let handlers: Vec<(String, Arc<dyn TaskHandler>)> = vec![
        (
            task_types::SEND_BROADCAST.to_string(),
            Arc::new(BroadcastHandler::new(
                collaborators.broadcasts,
                collaborators.notifier,
                collaborators.broadcast_config,
            )),
        ),
        (
            task_types::CHECK_SEGMENT_RECOMPUTE.to_string(),
            Arc::new(SegmentRecomputeHandler::new(
                collaborators.store,
                Arc::clone(&collaborators.segments),
                collaborators.segment_config.clone(),
            )),
        ),
        (
            task_types::BUILD_SEGMENT.to_string(),
            Arc::new(BuildSegmentHandler::new(
                collaborators.segments,
                collaborators.segment_config,
            )),
        ),
    ];
    registry.register_batch(handlers).await
}
