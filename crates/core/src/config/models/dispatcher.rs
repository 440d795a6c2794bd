use serde::{Deserialize, Serialize};

use super::MAX_INTERVAL_SECONDS;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// 触发方未指定时每次调度处理的最大任务数
    pub default_batch_size: usize,
    /// 单次调度内并发执行的任务数
    pub max_concurrency: usize,
    /// 超过 timeout_after 多久后认为任务被遗弃（秒）
    pub abandonment_grace_seconds: i64,
    /// 交给处理器的截止时间比 timeout_after 提前的秒数
    pub deadline_safety_margin_seconds: i64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 10,
            max_concurrency: 1,
            abandonment_grace_seconds: 30,
            deadline_safety_margin_seconds: 5,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_batch_size == 0 {
            return Err(anyhow::anyhow!("默认批次大小必须大于0"));
        }

        if self.max_concurrency == 0 {
            return Err(anyhow::anyhow!("最大并发数必须大于0"));
        }

        if !(0..=MAX_INTERVAL_SECONDS).contains(&self.abandonment_grace_seconds) {
            return Err(anyhow::anyhow!(
                "遗弃宽限时间必须在0到{}秒之间: {}",
                MAX_INTERVAL_SECONDS,
                self.abandonment_grace_seconds
            ));
        }

        if !(0..=MAX_INTERVAL_SECONDS).contains(&self.deadline_safety_margin_seconds) {
            return Err(anyhow::anyhow!(
                "截止时间安全余量必须在0到{}秒之间: {}",
                MAX_INTERVAL_SECONDS,
                self.deadline_safety_margin_seconds
            ));
        }

        Ok(())
    }
}
