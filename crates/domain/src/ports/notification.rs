use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use taskengine_core::SchedulerResult;

/// 需要通知运营人员的事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OperatorAlert {
    /// 群发因发送额度耗尽被自动暂停
    BroadcastAutoPaused {
        broadcast_id: String,
        reason: String,
    },
    /// A/B 测试结束，等待人工选择胜出版本
    WinnerSelectionRequired { broadcast_id: String },
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, workspace_id: &str, alert: &OperatorAlert) -> SchedulerResult<()>;
}
