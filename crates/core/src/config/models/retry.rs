use serde::{Deserialize, Serialize};

use super::MAX_INTERVAL_SECONDS;

/// 重试退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// 每次都等待任务自身的 retry_interval
    Fixed,
    /// retry_interval * multiplier^(n-1)，受 max_interval_seconds 限制
    Exponential,
}

/// 重试策略配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: BackoffStrategy,
    /// 指数退避倍数
    pub backoff_multiplier: f64,
    /// 最大重试间隔（秒）
    pub max_interval_seconds: u64,
    /// 重试间隔的随机抖动范围（0.0-1.0）
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            backoff_multiplier: 2.0,
            max_interval_seconds: 3600,
            jitter_factor: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数必须是不小于1.0的有限数"));
        }

        if self.max_interval_seconds == 0
            || self.max_interval_seconds > MAX_INTERVAL_SECONDS as u64
        {
            return Err(anyhow::anyhow!(
                "最大重试间隔必须在1到{}秒之间: {}",
                MAX_INTERVAL_SECONDS,
                self.max_interval_seconds
            ));
        }

        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(anyhow::anyhow!(
                "抖动因子必须在0.0到1.0之间: {}",
                self.jitter_factor
            ));
        }

        Ok(())
    }
}
