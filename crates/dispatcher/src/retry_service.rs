//! 重试与回收策略
//!
//! 纯决策逻辑：给定处理器结果（或一个被遗弃的认领），计算下一个持久化状态与 `next_run_after`。
//! 重试在 `retry_count < max_retries` 时批准，批准的重试使 `retry_count` 加一；
//! 否则进入终态 failed。不可重试的失败无论剩余次数多少都直接终止。

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};

use taskengine_core::config::{BackoffStrategy, RetryConfig};
use taskengine_domain::{Task, TaskState};

use crate::handler::TaskOutcome;

/// 策略给出的下一步状态转换
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Complete {
        final_state: TaskState,
    },
    Pause {
        next_run_after: DateTime<Utc>,
        progress: f64,
        state: TaskState,
    },
    Retry {
        retry_count: i32,
        next_run_after: DateTime<Utc>,
    },
    Fail {
        error: String,
    },
}

/// 被遗弃任务的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbandonedDisposition {
    /// 重新认领，认领语句本身使 retry_count 加一
    Reclaim,
    /// 重试次数已用尽，直接终态失败
    Fail,
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn decide(&self, task: &Task, outcome: TaskOutcome, now: DateTime<Utc>) -> Transition {
        match outcome {
            TaskOutcome::Completed(final_state) => Transition::Complete { final_state },
            TaskOutcome::Paused {
                next_run_after,
                progress,
                state,
            } => Transition::Pause {
                next_run_after,
                progress,
                state,
            },
            TaskOutcome::Failed {
                error,
                retryable: false,
            } => {
                debug!(task_id = %task.id, "不可重试的失败，直接终止: {}", error);
                Transition::Fail { error }
            }
            TaskOutcome::Failed {
                error,
                retryable: true,
            } => {
                if !task.can_retry() {
                    info!(
                        task_id = %task.id,
                        "任务已达到最大重试次数 {}，不再重试",
                        task.max_retries
                    );
                    return Transition::Fail { error };
                }
                let retry_count = task.retry_count + 1;
                let next_run_after = self.next_retry_time(task, retry_count, now);
                info!(
                    task_id = %task.id,
                    "任务第 {} 次重试，下次执行时间: {}",
                    retry_count,
                    next_run_after.format("%Y-%m-%d %H:%M:%S UTC")
                );
                Transition::Retry {
                    retry_count,
                    next_run_after,
                }
            }
        }
    }

    pub fn abandoned_disposition(&self, task: &Task) -> AbandonedDisposition {
        if task.can_retry() {
            AbandonedDisposition::Reclaim
        } else {
            AbandonedDisposition::Fail
        }
    }

    /// 第 `attempt` 次重试（从 1 开始）的退避间隔
    pub fn retry_delay(&self, task: &Task, attempt: i32) -> Duration {
        let base = f64::from(task.retry_interval.max(0));
        let interval = match self.config.strategy {
            BackoffStrategy::Fixed => base,
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).max(0);
                (base * self.config.backoff_multiplier.powi(exponent))
                    .min(self.config.max_interval_seconds as f64)
            }
        };

        let jitter = if self.config.jitter_factor > 0.0 {
            interval * self.config.jitter_factor * (rand::random::<f64>() - 0.5) * 2.0
        } else {
            0.0
        };

        Duration::milliseconds(((interval + jitter).max(0.0) * 1000.0) as i64)
    }

    pub fn next_retry_time(&self, task: &Task, attempt: i32, now: DateTime<Utc>) -> DateTime<Utc> {
        now + self.retry_delay(task, attempt)
    }
}
