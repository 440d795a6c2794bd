//! 分群构建：按联系人偏移游标分批求值，每批后写检查点

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use tracing::{debug, info, instrument};

use taskengine_core::config::SegmentConfig;
use taskengine_core::SchedulerResult;
use taskengine_domain::{SegmentDirectory, Task, TaskState};

use crate::handler::{ExecutionContext, TaskHandler, TaskOutcome};

pub struct BuildSegmentHandler {
    segments: Arc<dyn SegmentDirectory>,
    config: SegmentConfig,
}

impl BuildSegmentHandler {
    pub fn new(segments: Arc<dyn SegmentDirectory>, config: SegmentConfig) -> Self {
        Self { segments, config }
    }

    #[instrument(skip_all, fields(workspace_id = %task.workspace_id, task_id = %task.id))]
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> SchedulerResult<TaskOutcome> {
        let ws = task.workspace_id.as_str();
        let mut state = match &task.state {
            TaskState::BuildSegment(state) if !state.segment_id.trim().is_empty() => state.clone(),
            _ => return Ok(TaskOutcome::permanent("分群构建任务缺少 segment_id")),
        };
        let segment_id = state.segment_id.clone();

        if !state.initialized {
            state.total_contacts = self.segments.count_contacts(ws, &segment_id).await?.max(0);
            state.initialized = true;
            debug!(segment_id = %segment_id, total = state.total_contacts, "分群构建初始化");
            checkpoint_or_stop!(ctx, state.progress(), &TaskState::BuildSegment(state.clone()));
        }

        let batch_size = self.config.build_batch_size.max(1);
        let mut batches_run = 0u32;
        let mut last_batch = Duration::zero();

        while state.contact_offset < state.total_contacts {
            if batches_run > 0 && ctx.should_yield(last_batch) {
                debug!(offset = state.contact_offset, "执行时间即将用尽，让出");
                return Ok(TaskOutcome::Paused {
                    next_run_after: ctx.now(),
                    progress: state.progress(),
                    state: TaskState::BuildSegment(state),
                });
            }

            let started = ctx.now();
            let limit = batch_size.min(state.total_contacts - state.contact_offset);
            let evaluation = self
                .segments
                .evaluate_batch(ws, &segment_id, state.version, state.contact_offset, limit)
                .await?;
            state.processed_count += evaluation.processed;
            state.matched_count += evaluation.matched;
            state.contact_offset += limit;

            checkpoint_or_stop!(ctx, state.progress(), &TaskState::BuildSegment(state.clone()));
            batches_run += 1;
            last_batch = ctx.now() - started;
        }

        self.segments
            .finish_build(ws, &segment_id, state.version, state.matched_count)
            .await?;
        info!(
            segment_id = %segment_id,
            version = state.version,
            matched = state.matched_count,
            "分群构建完成"
        );
        Ok(TaskOutcome::Completed(TaskState::BuildSegment(state)))
    }
}

#[async_trait]
impl TaskHandler for BuildSegmentHandler {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        self.run(task, ctx).await.unwrap_or_else(TaskOutcome::from)
    }
}
