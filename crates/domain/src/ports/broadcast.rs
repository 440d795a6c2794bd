use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use taskengine_core::SchedulerResult;

/// 群发状态（由群发管理方持有）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastStatus {
    Draft,
    Scheduled,
    Sending,
    Testing,
    TestCompleted,
    WinnerSelected,
    Paused,
    Sent,
    Cancelled,
}

/// A/B 测试胜出指标
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WinnerMetric {
    OpenRate,
    ClickRate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbTestSettings {
    /// 测试阶段抽样比例（1-100）
    pub sample_percentage: u8,
    /// 测试结束后是否自动按指标选出胜出版本
    pub auto_send_winner: bool,
    pub winner_metric: WinnerMetric,
    pub test_duration_hours: i64,
}

/// 处理器执行时读取的群发快照
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BroadcastSnapshot {
    pub id: String,
    pub status: BroadcastStatus,
    pub channel_type: String,
    /// 内容版本（模板）标识，单版本发送时取第一个
    pub variants: Vec<String>,
    pub ab_testing: Option<AbTestSettings>,
    /// 人工选定的胜出版本
    pub winning_variant: Option<String>,
}

impl BroadcastSnapshot {
    pub fn ab_testing_enabled(&self) -> bool {
        self.ab_testing.is_some() && self.variants.len() > 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub contact_id: String,
    pub address: String,
}

/// 单个收件人的投递失败
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// 永久失败（地址无效、内容被拒），计入 failed_count 后继续
    #[error("投递被拒绝: {0}")]
    Rejected(String),
    /// 瞬时失败（限流、网络抖动），整个任务走重试
    #[error("瞬时投递失败: {0}")]
    Transient(String),
    /// 服务商发送额度耗尽，属于运营层面的退避而非错误
    #[error("发送额度耗尽: {0}")]
    SendingLimitReached(String),
}

/// 群发相关的外部协作方
#[async_trait]
pub trait BroadcastGateway: Send + Sync {
    async fn get_broadcast(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
    ) -> SchedulerResult<BroadcastSnapshot>;

    async fn count_recipients(&self, workspace_id: &str, broadcast_id: &str)
        -> SchedulerResult<i64>;

    /// 按稳定顺序分页读取收件人
    async fn fetch_recipients(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
        offset: i64,
        limit: i64,
    ) -> SchedulerResult<Vec<Recipient>>;

    async fn send(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
        recipient: &Recipient,
        variant: Option<&str>,
    ) -> Result<(), DeliveryError>;

    /// 按指标自动选出胜出版本，数据不足时返回 None
    async fn select_winner(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
        metric: WinnerMetric,
    ) -> SchedulerResult<Option<String>>;

    async fn update_status(
        &self,
        workspace_id: &str,
        broadcast_id: &str,
        status: BroadcastStatus,
    ) -> SchedulerResult<()>;
}
