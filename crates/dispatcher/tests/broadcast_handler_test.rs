use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use mockall::mock;
use taskengine_core::config::{BroadcastConfig, DispatcherConfig, SegmentConfig};
use taskengine_core::{Clock, SchedulerResult};
use taskengine_dispatcher::{
    register_builtin, BuiltinCollaborators, ExecutionResult, HandlerRegistry, RetryPolicy,
    TaskDispatcher,
};
use taskengine_domain::{
    AbTestSettings, BroadcastPhase, BroadcastStatus, BroadcastTaskState, DeliveryError, Notifier,
    OperatorAlert, PauseReason, Task, TaskRepository, TaskState, TaskStatus, WinnerMetric,
};
use taskengine_testing_utils::{
    FakeBroadcastGateway, FakeSegmentDirectory, ManualClock, MockTaskRepository,
    RecordingNotifier, TaskBuilder,
};

const WS: &str = "ws_1";

mock! {
    pub AlertSink {}

    #[async_trait]
    impl Notifier for AlertSink {
        async fn notify(&self, workspace_id: &str, alert: &OperatorAlert) -> SchedulerResult<()>;
    }
}

struct Fixture {
    clock: ManualClock,
    store: MockTaskRepository,
    gateway: FakeBroadcastGateway,
    dispatcher: TaskDispatcher,
}

impl Fixture {
    async fn new(notifier: Arc<dyn Notifier>) -> Self {
        let clock = ManualClock::at_epoch();
        let store = MockTaskRepository::new();
        let gateway = FakeBroadcastGateway::new();

        let registry = HandlerRegistry::new();
        register_builtin(
            &registry,
            BuiltinCollaborators {
                store: Arc::new(store.clone()),
                broadcasts: Arc::new(gateway.clone()),
                notifier,
                segments: Arc::new(FakeSegmentDirectory::new()),
                broadcast_config: BroadcastConfig {
                    batch_size: 25,
                    ..BroadcastConfig::default()
                },
                segment_config: SegmentConfig::default(),
            },
        )
        .await
        .unwrap();

        let dispatcher = TaskDispatcher::new(
            Arc::new(store.clone()),
            Arc::new(registry),
            Arc::new(clock.clone()),
            RetryPolicy::default(),
            DispatcherConfig::default(),
        );

        Self {
            clock,
            store,
            gateway,
            dispatcher,
        }
    }

    async fn enqueue(&self, broadcast_id: &str) -> Task {
        let task = TaskBuilder::broadcast(WS, broadcast_id).build();
        self.store.create(&task).await.unwrap()
    }

    fn task(&self, task: &Task) -> Task {
        self.store.task(WS, &task.id).unwrap()
    }

    fn state(&self, task: &Task) -> BroadcastTaskState {
        match self.task(task).state {
            TaskState::SendBroadcast(state) => state,
            other => panic!("unexpected state: {other:?}"),
        }
    }

    /// 反复触发分发，直到任务进入给定状态
    async fn run_until(&self, task: &Task, status: TaskStatus) -> usize {
        let mut invocations = 0;
        while self.task(task).status != status {
            self.dispatcher.execute_pending(10).await.unwrap();
            invocations += 1;
            assert!(invocations <= 200, "task stuck in {:?}", self.task(task).status);
        }
        invocations
    }
}

fn ab_settings(auto_send_winner: bool) -> AbTestSettings {
    AbTestSettings {
        sample_percentage: 10,
        auto_send_winner,
        winner_metric: WinnerMetric::OpenRate,
        test_duration_hours: 2,
    }
}

#[tokio::test]
async fn test_ab_broadcast_sends_sample_then_winner_to_remaining_audience() {
    let notifier = RecordingNotifier::new();
    let fx = Fixture::new(Arc::new(notifier.clone())).await;
    fx.gateway.add_ab_broadcast("b_1", 1000, ab_settings(false));
    fx.gateway
        .advance_clock_per_send(fx.clock.clone(), Duration::seconds(1));
    let task = fx.enqueue("b_1").await;

    // 测试阶段：每次执行约 25 封后让出，抽样共 100 封
    let invocations = fx.run_until(&task, TaskStatus::Paused).await;
    assert_eq!(invocations, 1);
    assert_eq!(fx.state(&task).pause_reason, Some(PauseReason::Deadline));

    let mut invocations = 0;
    while fx.state(&task).pause_reason != Some(PauseReason::AwaitingWinner) {
        fx.dispatcher.execute_pending(10).await.unwrap();
        invocations += 1;
        assert!(invocations < 20);
    }

    let state = fx.state(&task);
    assert_eq!(state.phase, BroadcastPhase::Test);
    assert_eq!(state.total_recipients, 1000);
    assert_eq!(state.test_phase_recipient_count, 100);
    assert_eq!(state.winner_phase_recipient_count, 900);
    assert!(state.test_phase_completed);
    assert_eq!(state.sent_count, 100);
    assert_eq!(state.recipient_offset, 100);
    assert_eq!(fx.gateway.send_count(), 100);
    assert_eq!(fx.gateway.status("b_1"), Some(BroadcastStatus::TestCompleted));

    let sends = fx.gateway.sends();
    let tpl_a = sends
        .iter()
        .filter(|s| s.variant.as_deref() == Some("tpl_a"))
        .count();
    assert_eq!(tpl_a, 50);

    assert_eq!(
        notifier.alerts(),
        vec![(
            WS.to_string(),
            OperatorAlert::WinnerSelectionRequired {
                broadcast_id: "b_1".to_string()
            }
        )]
    );

    // 未选出胜出版本前不会再次执行
    let stored = fx.task(&task);
    assert_eq!(stored.status, TaskStatus::Paused);
    assert!(stored.next_run_after.unwrap() > fx.clock.now());
    assert_eq!(fx.dispatcher.execute_pending(10).await.unwrap().attempted, 0);

    // 人工选择胜出版本并唤醒任务
    fx.gateway.choose_winner("b_1", "tpl_b");
    assert!(fx.store.wake(WS, &task.id, fx.clock.now()).await.unwrap());

    fx.run_until(&task, TaskStatus::Completed).await;

    let state = fx.state(&task);
    assert_eq!(state.phase, BroadcastPhase::Winner);
    assert_eq!(state.winning_variant.as_deref(), Some("tpl_b"));
    assert_eq!(state.sent_count, 1000);
    assert_eq!(state.recipient_offset, 1000);
    assert_eq!(fx.task(&task).progress, 1.0);

    let sends = fx.gateway.sends();
    assert_eq!(sends.len(), 1000);
    assert!(sends[100..]
        .iter()
        .all(|s| s.variant.as_deref() == Some("tpl_b")));
    let unique: HashSet<&str> = sends.iter().map(|s| s.contact_id.as_str()).collect();
    assert_eq!(unique.len(), 1000);

    let statuses: Vec<BroadcastStatus> = fx
        .gateway
        .status_updates()
        .into_iter()
        .map(|(_, status)| status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            BroadcastStatus::Testing,
            BroadcastStatus::TestCompleted,
            BroadcastStatus::WinnerSelected,
            BroadcastStatus::Sent,
        ]
    );
}

#[tokio::test]
async fn test_auto_winner_is_selected_after_test_duration() {
    let notifier = RecordingNotifier::new();
    let fx = Fixture::new(Arc::new(notifier.clone())).await;
    fx.gateway.add_ab_broadcast("b_auto", 100, ab_settings(true));
    fx.gateway.set_auto_winner(Some("tpl_a"));
    let task = fx.enqueue("b_auto").await;

    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::Paused { .. }
    ));
    let state = fx.state(&task);
    assert!(state.test_phase_completed);
    assert_eq!(state.sent_count, 10);
    assert_eq!(state.pause_reason, Some(PauseReason::AwaitingWinner));
    assert!(notifier.alerts().is_empty());

    // 测试时长未到，轮询时不选出胜出版本
    fx.clock.advance_secs(300);
    fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(fx.state(&task).phase, BroadcastPhase::Test);

    fx.clock.advance(Duration::hours(2));
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);

    let state = fx.state(&task);
    assert_eq!(state.winning_variant.as_deref(), Some("tpl_a"));
    assert_eq!(state.sent_count, 100);
    let sends = fx.gateway.sends();
    assert!(sends[10..]
        .iter()
        .all(|s| s.variant.as_deref() == Some("tpl_a")));
}

#[tokio::test]
async fn test_cancelled_broadcast_completes_without_further_sends() {
    let fx = Fixture::new(Arc::new(RecordingNotifier::new())).await;
    fx.gateway.add_broadcast("b_2", 200);
    fx.gateway
        .advance_clock_per_send(fx.clock.clone(), Duration::seconds(1));
    let task = fx.enqueue("b_2").await;

    fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(fx.task(&task).status, TaskStatus::Paused);
    assert_eq!(fx.gateway.send_count(), 25);

    fx.gateway.set_status("b_2", BroadcastStatus::Cancelled);
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);

    let state = fx.state(&task);
    assert!(state.cancelled);
    assert_eq!(state.sent_count, 25);
    assert_eq!(fx.gateway.send_count(), 25);
    assert_eq!(fx.task(&task).status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_operator_pause_is_polled() {
    let fx = Fixture::new(Arc::new(RecordingNotifier::new())).await;
    fx.gateway.add_broadcast("b_3", 50);
    fx.gateway.set_status("b_3", BroadcastStatus::Paused);
    let task = fx.enqueue("b_3").await;

    let started = fx.clock.now();
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(
        report.records[0].result,
        ExecutionResult::Paused {
            next_run_after: started + Duration::seconds(300)
        }
    );
    assert_eq!(fx.gateway.send_count(), 0);
    assert_eq!(
        fx.state(&task).pause_reason,
        Some(PauseReason::BroadcastPaused)
    );

    fx.gateway.set_status("b_3", BroadcastStatus::Scheduled);
    fx.clock.advance_secs(300);
    fx.run_until(&task, TaskStatus::Completed).await;
    assert_eq!(fx.gateway.send_count(), 50);
}

#[tokio::test]
async fn test_sending_limit_pauses_broadcast_and_alerts_operator() {
    let mut sink = MockAlertSink::new();
    sink.expect_notify()
        .withf(|workspace_id, alert| {
            workspace_id.to_string() == WS
                && matches!(
                    alert,
                    OperatorAlert::BroadcastAutoPaused { broadcast_id, .. } if broadcast_id == "b_4"
                )
        })
        .times(1)
        .returning(|_, _| Ok(()));

    let fx = Fixture::new(Arc::new(sink)).await;
    fx.gateway.add_broadcast("b_4", 60);
    fx.gateway.limit_sends_to(Some(30));
    let task = fx.enqueue("b_4").await;

    let started = fx.clock.now();
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(
        report.records[0].result,
        ExecutionResult::Paused {
            next_run_after: started + Duration::seconds(3600)
        }
    );

    let state = fx.state(&task);
    assert_eq!(state.pause_reason, Some(PauseReason::SendingLimit));
    assert_eq!(state.recipient_offset, 30);
    assert_eq!(state.sent_count, 30);
    assert_eq!(state.failed_count, 0);
    assert_eq!(fx.gateway.status("b_4"), Some(BroadcastStatus::Paused));
    assert_eq!(fx.task(&task).retry_count, 0);

    // 额度恢复后从游标处继续
    fx.gateway.limit_sends_to(None);
    fx.clock.advance_secs(3600);
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);

    let sends = fx.gateway.sends();
    assert_eq!(sends.len(), 60);
    let unique: HashSet<&str> = sends.iter().map(|s| s.contact_id.as_str()).collect();
    assert_eq!(unique.len(), 60);
    assert_eq!(fx.gateway.status("b_4"), Some(BroadcastStatus::Sent));
}

#[tokio::test]
async fn test_transient_failure_retries_from_checkpoint() {
    let fx = Fixture::new(Arc::new(RecordingNotifier::new())).await;
    fx.gateway.add_broadcast("b_5", 60);
    fx.gateway.fail_recipient(
        "c_0030",
        DeliveryError::Transient("connection reset".to_string()),
    );
    fx.gateway
        .fail_recipient("c_0003", DeliveryError::Rejected("bad address".to_string()));
    let task = fx.enqueue("b_5").await;

    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::RetryScheduled { retry_count: 1, .. }
    ));
    let state = fx.state(&task);
    assert_eq!(state.recipient_offset, 30);
    assert_eq!(state.sent_count, 29);
    assert_eq!(state.failed_count, 1);

    fx.gateway.clear_failures();
    fx.clock.advance_secs(300);
    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);

    let state = fx.state(&task);
    assert_eq!(state.sent_count, 59);
    assert_eq!(state.failed_count, 1);
    let sends = fx.gateway.sends();
    let unique: HashSet<&str> = sends.iter().map(|s| s.contact_id.as_str()).collect();
    assert_eq!(unique.len(), sends.len());
    assert!(!unique.contains("c_0003"));
}

#[tokio::test]
async fn test_task_without_broadcast_fails_permanently() {
    let fx = Fixture::new(Arc::new(RecordingNotifier::new())).await;
    let task = TaskBuilder::new(WS, taskengine_domain::task_types::SEND_BROADCAST).build();
    fx.store.create(&task).await.unwrap();

    let report = fx.dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::Failed { .. }
    ));
    assert_eq!(fx.task(&task).retry_count, 0);
}
