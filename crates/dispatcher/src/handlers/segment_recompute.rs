//! 周期性分群重算检查
//!
//! 每个工作空间一个长期存在的检查任务：找出 `recompute_after` 已过期的分群，
//! 为每个分群创建一个 `build_segment` 任务，然后以 `Paused` 把自己推迟到下一个检查周期。
//! 先建任务、后标记分群，失败重试时最多重复创建一次构建任务。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument};

use taskengine_core::config::SegmentConfig;
use taskengine_core::SchedulerResult;
use taskengine_domain::{
    task_types, BuildSegmentState, SegmentDirectory, SegmentRecomputeState, Task, TaskRepository,
    TaskState,
};

use crate::handler::{ExecutionContext, TaskHandler, TaskOutcome};

pub struct SegmentRecomputeHandler {
    store: Arc<dyn TaskRepository>,
    segments: Arc<dyn SegmentDirectory>,
    config: SegmentConfig,
}

impl SegmentRecomputeHandler {
    pub fn new(
        store: Arc<dyn TaskRepository>,
        segments: Arc<dyn SegmentDirectory>,
        config: SegmentConfig,
    ) -> Self {
        Self {
            store,
            segments,
            config,
        }
    }

    #[instrument(skip_all, fields(workspace_id = %task.workspace_id, task_id = %task.id))]
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> SchedulerResult<TaskOutcome> {
        let ws = task.workspace_id.as_str();
        let mut state = match &task.state {
            TaskState::CheckSegmentRecompute(state) => state.clone(),
            TaskState::Empty => SegmentRecomputeState::default(),
            other => {
                return Ok(TaskOutcome::permanent(format!(
                    "分群检查任务的状态类型不匹配: {:?}",
                    other.task_type()
                )));
            }
        };

        let now = ctx.now();
        let due = self
            .segments
            .segments_due(ws, now, self.config.max_segments_per_check.max(1))
            .await?;
        debug!("{} 个分群需要重算", due.len());

        let mut scheduled = Vec::with_capacity(due.len());
        for segment in due {
            let mut build = Task::new(ws, task_types::BUILD_SEGMENT)
                .with_state(TaskState::BuildSegment(BuildSegmentState::new(
                    segment.segment_id.clone(),
                    segment.version,
                )))
                .with_max_runtime(task.max_runtime)
                .with_retry_policy(task.max_retries, task.retry_interval);
            build.created_at = now;
            build.updated_at = now;

            let build = self.store.create(&build).await?;
            self.segments
                .mark_build_scheduled(ws, &segment.segment_id, segment.version)
                .await?;
            info!(
                segment_id = %segment.segment_id,
                version = segment.version,
                build_task_id = %build.id,
                "已调度分群构建任务"
            );
            scheduled.push(segment.segment_id);
        }

        state.last_check_at = Some(now);
        state.checks_performed += 1;
        state.builds_scheduled += scheduled.len() as i64;
        state.last_scheduled_segments = scheduled;

        Ok(TaskOutcome::Paused {
            next_run_after: now + Duration::seconds(self.config.check_interval_seconds),
            progress: 0.0,
            state: TaskState::CheckSegmentRecompute(state),
        })
    }
}

#[async_trait]
impl TaskHandler for SegmentRecomputeHandler {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        self.run(task, ctx).await.unwrap_or_else(TaskOutcome::from)
    }
}
