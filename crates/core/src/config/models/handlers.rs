use serde::{Deserialize, Serialize};

use super::MAX_INTERVAL_SECONDS;

/// 群发任务处理器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
    /// 每批发送的收件人数
    pub batch_size: i64,
    /// 触发发送额度上限后的暂停时长（秒）
    pub sending_limit_backoff_seconds: i64,
    /// 等待 A/B 测试胜出版本时的轮询间隔（秒）
    pub winner_poll_interval_seconds: i64,
    /// 群发被人工暂停时的轮询间隔（秒）
    pub broadcast_paused_poll_seconds: i64,
}

impl Default for BroadcastConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            sending_limit_backoff_seconds: 3600,
            winner_poll_interval_seconds: 300,
            broadcast_paused_poll_seconds: 300,
        }
    }
}

impl BroadcastConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.batch_size <= 0 {
            return Err(anyhow::anyhow!("群发批次大小必须大于0"));
        }

        let intervals = [
            self.sending_limit_backoff_seconds,
            self.winner_poll_interval_seconds,
            self.broadcast_paused_poll_seconds,
        ];
        if intervals
            .iter()
            .any(|seconds| !(1..=MAX_INTERVAL_SECONDS).contains(seconds))
        {
            return Err(anyhow::anyhow!(
                "群发轮询与退避间隔必须在1到{}秒之间",
                MAX_INTERVAL_SECONDS
            ));
        }

        Ok(())
    }
}

/// 分群重算任务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentConfig {
    /// 周期检查任务的执行间隔（秒）
    pub check_interval_seconds: i64,
    /// 分群构建时每批评估的联系人数
    pub build_batch_size: i64,
    /// 单次检查最多调度的分群数
    pub max_segments_per_check: i64,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: 300,
            build_batch_size: 500,
            max_segments_per_check: 50,
        }
    }
}

impl SegmentConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=MAX_INTERVAL_SECONDS).contains(&self.check_interval_seconds) {
            return Err(anyhow::anyhow!(
                "分群检查间隔必须在1到{}秒之间: {}",
                MAX_INTERVAL_SECONDS,
                self.check_interval_seconds
            ));
        }

        if self.build_batch_size <= 0 || self.max_segments_per_check <= 0 {
            return Err(anyhow::anyhow!("分群批次参数必须大于0"));
        }

        Ok(())
    }
}
