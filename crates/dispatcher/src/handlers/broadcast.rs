//! 群发发送处理器
//!
//! `recipient_offset` 是恢复游标，只在投递确认后前移；每批结束写一次检查点。
//! A/B 测试时先以轮换的版本发送抽样部分（`test` 阶段），抽样发完后等待胜出版本，
//! 再以胜出版本发送剩余受众（`winner` 阶段）。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, instrument, warn};

use taskengine_core::config::BroadcastConfig;
use taskengine_core::SchedulerResult;
use taskengine_domain::{
    BroadcastGateway, BroadcastPhase, BroadcastSnapshot, BroadcastStatus, BroadcastTaskState,
    DeliveryError, Notifier, OperatorAlert, PauseReason, Task, TaskState,
};

use crate::handler::{ExecutionContext, TaskHandler, TaskOutcome};

pub struct BroadcastHandler {
    gateway: Arc<dyn BroadcastGateway>,
    notifier: Arc<dyn Notifier>,
    config: BroadcastConfig,
}

impl BroadcastHandler {
    pub fn new(
        gateway: Arc<dyn BroadcastGateway>,
        notifier: Arc<dyn Notifier>,
        config: BroadcastConfig,
    ) -> Self {
        Self {
            gateway,
            notifier,
            config,
        }
    }

    fn paused(next_run_after: DateTime<Utc>, state: BroadcastTaskState) -> TaskOutcome {
        TaskOutcome::Paused {
            next_run_after,
            progress: state.progress(),
            state: TaskState::SendBroadcast(state),
        }
    }

    /// 测试阶段对应 `testing`，其余阶段对应 `sending`
    fn sending_status(state: &BroadcastTaskState) -> BroadcastStatus {
        match state.phase {
            BroadcastPhase::Test => BroadcastStatus::Testing,
            BroadcastPhase::Single | BroadcastPhase::Winner => BroadcastStatus::Sending,
        }
    }

    fn variant_for<'a>(
        snapshot: &'a BroadcastSnapshot,
        state: &'a BroadcastTaskState,
        position: i64,
    ) -> Option<&'a str> {
        match state.phase {
            BroadcastPhase::Test if !snapshot.variants.is_empty() => {
                let index = position.rem_euclid(snapshot.variants.len() as i64) as usize;
                snapshot.variants.get(index).map(String::as_str)
            }
            BroadcastPhase::Winner => state
                .winning_variant
                .as_deref()
                .or_else(|| snapshot.variants.first().map(String::as_str)),
            _ => snapshot.variants.first().map(String::as_str),
        }
    }

    async fn notify(&self, workspace_id: &str, alert: OperatorAlert) {
        if let Err(e) = self.notifier.notify(workspace_id, &alert).await {
            warn!("发送运营通知失败: {}", e);
        }
    }

    /// 群发被外部取消或人工暂停时的结果
    fn external_stop(
        &self,
        status: BroadcastStatus,
        state: &mut BroadcastTaskState,
        now: DateTime<Utc>,
    ) -> Option<TaskOutcome> {
        match status {
            BroadcastStatus::Cancelled => {
                info!(broadcast_id = %state.broadcast_id, "群发已取消，停止发送");
                state.cancelled = true;
                state.pause_reason = None;
                Some(TaskOutcome::Completed(TaskState::SendBroadcast(state.clone())))
            }
            BroadcastStatus::Paused => {
                info!(broadcast_id = %state.broadcast_id, "群发已被人工暂停");
                state.pause_reason = Some(PauseReason::BroadcastPaused);
                let next = now + Duration::seconds(self.config.broadcast_paused_poll_seconds);
                Some(Self::paused(next, state.clone()))
            }
            _ => None,
        }
    }

    #[instrument(skip_all, fields(workspace_id = %task.workspace_id, task_id = %task.id))]
    async fn run(&self, task: &Task, ctx: &ExecutionContext) -> SchedulerResult<TaskOutcome> {
        let ws = task.workspace_id.as_str();
        let mut state = match (&task.state, &task.broadcast_id) {
            (TaskState::SendBroadcast(state), _) => state.clone(),
            (TaskState::Empty, Some(broadcast_id)) => BroadcastTaskState::new(broadcast_id.clone()),
            (TaskState::Empty, None) => {
                return Ok(TaskOutcome::permanent("群发任务缺少 broadcast_id"));
            }
            (other, _) => {
                return Ok(TaskOutcome::permanent(format!(
                    "群发任务的状态类型不匹配: {:?}",
                    other.task_type()
                )));
            }
        };
        if state.broadcast_id.trim().is_empty() {
            return Ok(TaskOutcome::permanent("群发任务缺少 broadcast_id"));
        }
        let broadcast_id = state.broadcast_id.clone();
        let bid = broadcast_id.as_str();

        let snapshot = self.gateway.get_broadcast(ws, bid).await?;
        match snapshot.status {
            BroadcastStatus::Sent => {
                debug!("群发已标记为发送完成");
                state.pause_reason = None;
                return Ok(TaskOutcome::Completed(TaskState::SendBroadcast(state)));
            }
            BroadcastStatus::Paused if state.pause_reason == Some(PauseReason::SendingLimit) => {
                // 额度暂停由本处理器发起，到期后自行恢复
                info!(broadcast_id = bid, "发送额度暂停到期，恢复发送");
                self.gateway
                    .update_status(ws, bid, Self::sending_status(&state))
                    .await?;
            }
            status => {
                if let Some(outcome) = self.external_stop(status, &mut state, ctx.now()) {
                    return Ok(outcome);
                }
            }
        }
        state.pause_reason = None;

        if !state.initialized {
            self.initialize(ws, &snapshot, &mut state).await?;
            checkpoint_or_stop!(ctx, state.progress(), &TaskState::SendBroadcast(state.clone()));
        }

        let batch_size = self.config.batch_size.max(1);
        let mut batches_run = 0u32;
        let mut last_batch = Duration::zero();

        loop {
            let end = state.phase_end();
            if state.recipient_offset >= end {
                if state.phase != BroadcastPhase::Test {
                    break;
                }
                if state.winner_phase_recipient_count <= 0 {
                    // 抽样已覆盖全部受众
                    break;
                }
                match self
                    .finish_test_phase(ws, ctx, &snapshot, &mut state)
                    .await?
                {
                    Some(outcome) => return Ok(outcome),
                    None => continue,
                }
            }

            if batches_run > 0 {
                if ctx.should_yield(last_batch) {
                    debug!(offset = state.recipient_offset, "执行时间即将用尽，让出");
                    state.pause_reason = Some(PauseReason::Deadline);
                    return Ok(Self::paused(ctx.now(), state));
                }
                let current = self.gateway.get_broadcast(ws, bid).await?;
                if let Some(outcome) = self.external_stop(current.status, &mut state, ctx.now()) {
                    return Ok(outcome);
                }
            }

            let started = ctx.now();
            let limit = batch_size.min(end - state.recipient_offset);
            let recipients = self
                .gateway
                .fetch_recipients(ws, bid, state.recipient_offset, limit)
                .await?;
            if recipients.is_empty() {
                warn!(
                    offset = state.recipient_offset,
                    end, "收件人列表提前结束，跳到阶段末尾"
                );
                state.recipient_offset = end;
                continue;
            }

            for recipient in &recipients {
                let variant = Self::variant_for(&snapshot, &state, state.recipient_offset)
                    .map(str::to_owned);
                match self
                    .gateway
                    .send(ws, bid, recipient, variant.as_deref())
                    .await
                {
                    Ok(()) => state.sent_count += 1,
                    Err(DeliveryError::Rejected(reason)) => {
                        debug!(contact_id = %recipient.contact_id, "投递被拒绝: {}", reason);
                        state.failed_count += 1;
                    }
                    Err(DeliveryError::Transient(reason)) => {
                        checkpoint_or_stop!(
                            ctx,
                            state.progress(),
                            &TaskState::SendBroadcast(state.clone())
                        );
                        return Ok(TaskOutcome::retryable(format!("瞬时投递失败: {reason}")));
                    }
                    Err(DeliveryError::SendingLimitReached(reason)) => {
                        return self.pause_for_sending_limit(ws, ctx, state, reason).await;
                    }
                }
                state.recipient_offset += 1;
            }

            checkpoint_or_stop!(ctx, state.progress(), &TaskState::SendBroadcast(state.clone()));
            batches_run += 1;
            last_batch = ctx.now() - started;
        }

        self.gateway
            .update_status(ws, bid, BroadcastStatus::Sent)
            .await?;
        info!(
            sent = state.sent_count,
            failed = state.failed_count,
            "群发发送完成"
        );
        Ok(TaskOutcome::Completed(TaskState::SendBroadcast(state)))
    }

    async fn initialize(
        &self,
        ws: &str,
        snapshot: &BroadcastSnapshot,
        state: &mut BroadcastTaskState,
    ) -> SchedulerResult<()> {
        let total = self
            .gateway
            .count_recipients(ws, &state.broadcast_id)
            .await?
            .max(0);
        state.channel_type = snapshot.channel_type.clone();
        state.total_recipients = total;
        state.recipient_offset = 0;

        match snapshot.ab_testing.as_ref() {
            Some(ab) if snapshot.ab_testing_enabled() => {
                let percentage = i64::from(ab.sample_percentage.clamp(1, 100));
                let test_count = ((total * percentage + 99) / 100).min(total);
                state.phase = BroadcastPhase::Test;
                state.test_phase_recipient_count = test_count;
                state.winner_phase_recipient_count = total - test_count;
            }
            _ => {
                state.phase = BroadcastPhase::Single;
                state.test_phase_recipient_count = 0;
                state.winner_phase_recipient_count = 0;
            }
        }
        state.initialized = true;

        info!(
            broadcast_id = %state.broadcast_id,
            total,
            phase = ?state.phase,
            test_recipients = state.test_phase_recipient_count,
            "群发任务初始化完成"
        );
        self.gateway
            .update_status(ws, &state.broadcast_id, Self::sending_status(state))
            .await
    }

    /// 抽样发送完毕：标记测试阶段结束并尝试确定胜出版本。
    /// 返回 `None` 表示已进入 winner 阶段，可以继续发送。
    async fn finish_test_phase(
        &self,
        ws: &str,
        ctx: &ExecutionContext,
        snapshot: &BroadcastSnapshot,
        state: &mut BroadcastTaskState,
    ) -> SchedulerResult<Option<TaskOutcome>> {
        let now = ctx.now();
        let bid = state.broadcast_id.clone();
        let ab = snapshot.ab_testing.clone();
        let auto = ab.as_ref().map(|ab| ab.auto_send_winner).unwrap_or(false);

        if !state.test_phase_completed {
            state.test_phase_completed = true;
            state.test_phase_completed_at = Some(now);
            self.gateway
                .update_status(ws, &bid, BroadcastStatus::TestCompleted)
                .await?;
            info!(broadcast_id = %bid, sent = state.sent_count, "A/B 测试阶段发送完成");
            if !auto {
                self.notify(
                    ws,
                    OperatorAlert::WinnerSelectionRequired {
                        broadcast_id: bid.clone(),
                    },
                )
                .await;
            }
            if !ctx
                .checkpoint(state.progress(), &TaskState::SendBroadcast(state.clone()))
                .await?
            {
                return Ok(Some(TaskOutcome::permanent("认领已失效，停止执行")));
            }
        }

        let completed_at = state.test_phase_completed_at.unwrap_or(now);
        let auto_deadline = ab
            .as_ref()
            .filter(|ab| ab.auto_send_winner)
            .map(|ab| completed_at + Duration::hours(ab.test_duration_hours.max(0)));

        let winner = match (&snapshot.winning_variant, &ab, auto_deadline) {
            (Some(variant), _, _) => Some(variant.clone()),
            (None, Some(ab), Some(deadline)) if now >= deadline => self
                .gateway
                .select_winner(ws, &bid, ab.winner_metric)
                .await?
                .or_else(|| snapshot.variants.first().cloned()),
            _ => None,
        };

        let Some(winner) = winner else {
            let mut next = now + Duration::seconds(self.config.winner_poll_interval_seconds);
            if let Some(deadline) = auto_deadline {
                next = next.min(deadline);
            }
            debug!(broadcast_id = %bid, "等待胜出版本，下次检查: {}", next);
            state.pause_reason = Some(PauseReason::AwaitingWinner);
            return Ok(Some(Self::paused(next, state.clone())));
        };

        info!(broadcast_id = %bid, winner = %winner, "进入胜出版本发送阶段");
        state.winning_variant = Some(winner);
        state.phase = BroadcastPhase::Winner;
        state.recipient_offset = state.test_phase_recipient_count;
        self.gateway
            .update_status(ws, &bid, BroadcastStatus::WinnerSelected)
            .await?;
        if !ctx
            .checkpoint(state.progress(), &TaskState::SendBroadcast(state.clone()))
            .await?
        {
            return Ok(Some(TaskOutcome::permanent("认领已失效，停止执行")));
        }
        Ok(None)
    }

    async fn pause_for_sending_limit(
        &self,
        ws: &str,
        ctx: &ExecutionContext,
        mut state: BroadcastTaskState,
        reason: String,
    ) -> SchedulerResult<TaskOutcome> {
        warn!(
            broadcast_id = %state.broadcast_id,
            offset = state.recipient_offset,
            "发送额度耗尽，暂停群发: {}",
            reason
        );
        state.pause_reason = Some(PauseReason::SendingLimit);
        checkpoint_or_stop!(ctx, state.progress(), &TaskState::SendBroadcast(state.clone()));

        self.gateway
            .update_status(ws, &state.broadcast_id, BroadcastStatus::Paused)
            .await?;
        self.notify(
            ws,
            OperatorAlert::BroadcastAutoPaused {
                broadcast_id: state.broadcast_id.clone(),
                reason,
            },
        )
        .await;

        let next = ctx.now() + Duration::seconds(self.config.sending_limit_backoff_seconds);
        Ok(Self::paused(next, state))
    }
}

#[async_trait]
impl TaskHandler for BroadcastHandler {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        self.run(task, ctx).await.unwrap_or_else(TaskOutcome::from)
    }
}
