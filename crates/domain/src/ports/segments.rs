use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskengine_core::SchedulerResult;

/// recompute_after 已过期、需要重新构建的分群
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentRef {
    pub segment_id: String,
    /// 新一轮构建的版本号
    pub version: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchEvaluation {
    pub processed: i64,
    pub matched: i64,
}

/// 分群的外部协作方，成员条件的求值不属于核心
#[async_trait]
pub trait SegmentDirectory: Send + Sync {
    async fn segments_due(
        &self,
        workspace_id: &str,
        now: DateTime<Utc>,
        limit: i64,
    ) -> SchedulerResult<Vec<SegmentRef>>;

    /// 标记已为该分群调度构建，并由分群自身推进 recompute_after
    async fn mark_build_scheduled(
        &self,
        workspace_id: &str,
        segment_id: &str,
        version: i64,
    ) -> SchedulerResult<()>;

    async fn count_contacts(&self, workspace_id: &str, segment_id: &str) -> SchedulerResult<i64>;

    async fn evaluate_batch(
        &self,
        workspace_id: &str,
        segment_id: &str,
        version: i64,
        offset: i64,
        limit: i64,
    ) -> SchedulerResult<BatchEvaluation>;

    async fn finish_build(
        &self,
        workspace_id: &str,
        segment_id: &str,
        version: i64,
        matched: i64,
    ) -> SchedulerResult<()>;
}
