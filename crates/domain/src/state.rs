//! 按任务类型区分的检查点状态
//!
//! 所有类型共用 `tasks.state` 一列，序列化为 `{"type": ..., "payload": ...}` 信封，
//! 只有对应类型的处理器会解读其中的 payload。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 内置任务类型标签
pub mod task_types {
    pub const SEND_BROADCAST: &str = "send_broadcast";
    pub const CHECK_SEGMENT_RECOMPUTE: &str = "check_segment_recompute";
    pub const BUILD_SEGMENT: &str = "build_segment";
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum TaskState {
    /// 尚未写入任何检查点
    #[default]
    Empty,
    SendBroadcast(BroadcastTaskState),
    CheckSegmentRecompute(SegmentRecomputeState),
    BuildSegment(BuildSegmentState),
}

impl TaskState {
    /// 状态对应的任务类型标签，`Empty` 不绑定任何类型
    pub fn task_type(&self) -> Option<&'static str> {
        match self {
            TaskState::Empty => None,
            TaskState::SendBroadcast(_) => Some(task_types::SEND_BROADCAST),
            TaskState::CheckSegmentRecompute(_) => Some(task_types::CHECK_SEGMENT_RECOMPUTE),
            TaskState::BuildSegment(_) => Some(task_types::BUILD_SEGMENT),
        }
    }

    pub fn matches_type(&self, task_type: &str) -> bool {
        self.task_type().map(|t| t == task_type).unwrap_or(true)
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TaskState::Empty)
    }
}

/// 群发发送阶段
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastPhase {
    /// 直接发送给全部受众
    #[default]
    Single,
    /// A/B 测试：只发送给抽样部分
    Test,
    /// 胜出版本发送给剩余受众
    Winner,
}

/// 任务暂停原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    /// 本次执行时间用尽，检查点后让出
    Deadline,
    /// 测试阶段结束，等待选出胜出版本
    AwaitingWinner,
    /// 发送服务商额度耗尽
    SendingLimit,
    /// 群发被人工暂停
    BroadcastPaused,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastTaskState {
    pub broadcast_id: String,
    pub channel_type: String,
    pub total_recipients: i64,
    pub sent_count: i64,
    pub failed_count: i64,
    /// 恢复游标：下一个待发送收件人的绝对位置
    pub recipient_offset: i64,
    pub phase: BroadcastPhase,
    pub initialized: bool,
    pub test_phase_completed: bool,
    pub test_phase_recipient_count: i64,
    pub winner_phase_recipient_count: i64,
    pub test_phase_completed_at: Option<DateTime<Utc>>,
    pub winning_variant: Option<String>,
    pub pause_reason: Option<PauseReason>,
    pub cancelled: bool,
}

impl BroadcastTaskState {
    pub fn new(broadcast_id: impl Into<String>) -> Self {
        Self {
            broadcast_id: broadcast_id.into(),
            ..Default::default()
        }
    }

    /// 当前阶段的发送终点（不含）
    pub fn phase_end(&self) -> i64 {
        match self.phase {
            BroadcastPhase::Test => self.test_phase_recipient_count,
            BroadcastPhase::Single | BroadcastPhase::Winner => self.total_recipients,
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_recipients <= 0 {
            return if self.initialized { 1.0 } else { 0.0 };
        }
        (self.recipient_offset as f64 / self.total_recipients as f64).clamp(0.0, 1.0)
    }
}

/// 周期性分群重算检查任务的状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentRecomputeState {
    pub last_check_at: Option<DateTime<Utc>>,
    pub checks_performed: i64,
    pub builds_scheduled: i64,
    pub last_scheduled_segments: Vec<String>,
}

/// 分群构建任务的状态
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildSegmentState {
    pub segment_id: String,
    pub version: i64,
    pub initialized: bool,
    pub total_contacts: i64,
    pub processed_count: i64,
    pub matched_count: i64,
    pub contact_offset: i64,
}

impl BuildSegmentState {
    pub fn new(segment_id: impl Into<String>, version: i64) -> Self {
        Self {
            segment_id: segment_id.into(),
            version,
            ..Default::default()
        }
    }

    pub fn progress(&self) -> f64 {
        if self.total_contacts <= 0 {
            return if self.initialized { 1.0 } else { 0.0 };
        }
        (self.contact_offset as f64 / self.total_contacts as f64).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_envelope_shape() {
        let mut state = BroadcastTaskState::new("b_42");
        state.phase = BroadcastPhase::Test;
        state.recipient_offset = 37;

        let json = serde_json::to_value(TaskState::SendBroadcast(state)).unwrap();
        assert_eq!(json["type"], "send_broadcast");
        assert_eq!(json["payload"]["broadcast_id"], "b_42");
        assert_eq!(json["payload"]["phase"], "test");
        assert_eq!(json["payload"]["recipient_offset"], 37);

        let empty = serde_json::to_value(TaskState::Empty).unwrap();
        assert_eq!(empty["type"], "empty");
    }

    #[test]
    fn test_checkpoint_survives_serialization() {
        let mut state = BroadcastTaskState::new("b_1");
        state.initialized = true;
        state.phase = BroadcastPhase::Winner;
        state.total_recipients = 1000;
        state.recipient_offset = 640;
        state.test_phase_completed = true;
        state.test_phase_recipient_count = 100;
        state.winning_variant = Some("tpl_b".to_string());
        state.pause_reason = Some(PauseReason::Deadline);
        let original = TaskState::SendBroadcast(state);

        let text = serde_json::to_string(&original).unwrap();
        let restored: TaskState = serde_json::from_str(&text).unwrap();
        assert_eq!(restored, original);
        match restored {
            TaskState::SendBroadcast(s) => {
                assert_eq!(s.recipient_offset, 640);
                assert_eq!(s.phase, BroadcastPhase::Winner);
            }
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn test_missing_payload_fields_default() {
        let restored: TaskState = serde_json::from_str(
            r#"{"type":"build_segment","payload":{"segment_id":"seg_1","version":3}}"#,
        )
        .unwrap();
        assert_eq!(
            restored,
            TaskState::BuildSegment(BuildSegmentState::new("seg_1", 3))
        );
    }

    #[test]
    fn test_type_matching() {
        assert!(TaskState::Empty.matches_type("anything"));
        let state = TaskState::BuildSegment(BuildSegmentState::new("seg_1", 1));
        assert!(state.matches_type(task_types::BUILD_SEGMENT));
        assert!(!state.matches_type(task_types::SEND_BROADCAST));
    }

    #[test]
    fn test_broadcast_progress() {
        let mut state = BroadcastTaskState::new("b_1");
        assert_eq!(state.progress(), 0.0);
        state.initialized = true;
        assert_eq!(state.progress(), 1.0);
        state.total_recipients = 200;
        state.recipient_offset = 50;
        assert_eq!(state.progress(), 0.25);
    }
}
