use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::Duration;
use taskengine_core::config::DispatcherConfig;
use taskengine_core::Clock;
use taskengine_dispatcher::{
    ExecutionContext, ExecutionResult, HandlerRegistry, RetryPolicy, TaskDispatcher, TaskHandler,
    TaskOutcome,
};
use taskengine_domain::{
    task_types, BuildSegmentState, Task, TaskRepository, TaskState, TaskStatus,
};
use taskengine_testing_utils::{ManualClock, MockTaskRepository, TaskBuilder};

const WS: &str = "ws_1";

/// 每次执行都返回可重试失败
struct AlwaysFails {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl TaskHandler for AlwaysFails {
    async fn execute(&self, _task: &Task, _ctx: &ExecutionContext) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        TaskOutcome::retryable("provider unavailable")
    }
}

/// 直接完成，可选地睡眠以制造并发重叠
struct Completes {
    calls: Arc<AtomicUsize>,
    running: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    sleep: Option<StdDuration>,
}

impl Completes {
    fn new() -> Self {
        Self {
            calls: Arc::new(AtomicUsize::new(0)),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            sleep: None,
        }
    }

    fn sleeping(duration: StdDuration) -> Self {
        Self {
            sleep: Some(duration),
            ..Self::new()
        }
    }
}

#[async_trait]
impl TaskHandler for Completes {
    async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> TaskOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now_running, Ordering::SeqCst);
        if let Some(duration) = self.sleep {
            tokio::time::sleep(duration).await;
        }
        self.running.fetch_sub(1, Ordering::SeqCst);
        TaskOutcome::Completed(task.state.clone())
    }
}

/// 按单元推进游标，每个单元耗时 10 秒（推进手动时钟），每单元写检查点
struct ChunkedWork {
    clock: ManualClock,
    processed: Arc<std::sync::Mutex<Vec<i64>>>,
}

#[async_trait]
impl TaskHandler for ChunkedWork {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        let TaskState::BuildSegment(mut state) = task.state.clone() else {
            return TaskOutcome::permanent("unexpected state");
        };
        let unit = Duration::seconds(10);
        while state.contact_offset < state.total_contacts {
            if ctx.should_yield(unit) {
                return TaskOutcome::Paused {
                    next_run_after: ctx.now(),
                    progress: state.progress(),
                    state: TaskState::BuildSegment(state),
                };
            }
            self.clock.advance(unit);
            self.processed.lock().unwrap().push(state.contact_offset);
            state.contact_offset += 1;
            match ctx
                .checkpoint(state.progress(), &TaskState::BuildSegment(state.clone()))
                .await
            {
                Ok(true) => {}
                Ok(false) => return TaskOutcome::permanent("claim lost"),
                Err(e) => return e.into(),
            }
        }
        TaskOutcome::Completed(TaskState::BuildSegment(state))
    }
}

/// 执行中模拟另一个执行者接管了认领
struct LosesClaim {
    store: MockTaskRepository,
}

#[async_trait]
impl TaskHandler for LosesClaim {
    async fn execute(&self, task: &Task, ctx: &ExecutionContext) -> TaskOutcome {
        let mut stolen = self.store.task(&task.workspace_id, &task.id).unwrap();
        stolen.claim_token = Some("rival-worker".to_string());
        self.store.insert(stolen);

        let saved = ctx.checkpoint(0.5, &task.state).await.unwrap();
        assert!(!saved);
        TaskOutcome::Completed(task.state.clone())
    }
}

/// 结果提交前任务库变得不可用
struct StoreGoesDown {
    store: MockTaskRepository,
}

#[async_trait]
impl TaskHandler for StoreGoesDown {
    async fn execute(&self, task: &Task, _ctx: &ExecutionContext) -> TaskOutcome {
        self.store.set_fail_operations(true);
        TaskOutcome::Completed(task.state.clone())
    }
}

fn dispatcher_with(
    store: &MockTaskRepository,
    clock: &ManualClock,
    registry: Arc<HandlerRegistry>,
    config: DispatcherConfig,
) -> TaskDispatcher {
    TaskDispatcher::new(
        Arc::new(store.clone()),
        registry,
        Arc::new(clock.clone()),
        RetryPolicy::default(),
        config,
    )
}

async fn registry_with(task_type: &str, handler: Arc<dyn TaskHandler>) -> Arc<HandlerRegistry> {
    let registry = HandlerRegistry::new();
    registry.register(task_type, handler).await.unwrap();
    Arc::new(registry)
}

#[tokio::test]
async fn test_retryable_failures_back_off_then_fail_terminally() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "flaky")
        .with_max_retries(3)
        .with_retry_interval(60)
        .build();
    store.create(&task).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let registry = registry_with(
        "flaky",
        Arc::new(AlwaysFails {
            calls: Arc::clone(&calls),
        }),
    )
    .await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    for attempt in 1..=3 {
        let started = clock.now();
        let report = dispatcher.execute_pending(10).await.unwrap();
        assert_eq!(report.attempted, 1);
        assert_eq!(
            report.records[0].result,
            ExecutionResult::RetryScheduled {
                retry_count: attempt,
                next_run_after: started + Duration::seconds(60),
            }
        );

        let stored = store.task(WS, &task.id).unwrap();
        assert_eq!(stored.status, TaskStatus::Pending);
        assert_eq!(stored.retry_count, attempt);
        assert_eq!(stored.next_run_after, Some(started + Duration::seconds(60)));

        // 退避期间不会再次执行
        let report = dispatcher.execute_pending(10).await.unwrap();
        assert_eq!(report.attempted, 0);
        clock.advance_secs(60);
    }

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::Failed { .. }
    ));

    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 3);
    assert!(!stored.error_message.unwrap_or_default().is_empty());
    assert_eq!(calls.load(Ordering::SeqCst), 4);

    clock.advance_secs(3600);
    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.attempted, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_dispatchers_claim_a_task_once() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "slow").build();
    store.create(&task).await.unwrap();

    let handler = Arc::new(Completes::sleeping(StdDuration::from_millis(50)));
    let calls = Arc::clone(&handler.calls);
    let registry = registry_with("slow", handler).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let dispatcher = dispatcher_with(
            &store,
            &clock,
            Arc::clone(&registry),
            DispatcherConfig::default(),
        );
        handles.push(tokio::spawn(
            async move { dispatcher.execute_pending(5).await },
        ));
    }

    let mut completed = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        for record in report.records {
            match record.result {
                ExecutionResult::Completed => completed += 1,
                ExecutionResult::ClaimLost => {}
                other => panic!("unexpected result: {other:?}"),
            }
        }
    }

    assert_eq!(completed, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(
        store.task(WS, &task.id).unwrap().status,
        TaskStatus::Completed
    );
}

#[tokio::test]
async fn test_abandoned_task_is_reclaimed_after_grace() {
    let clock = ManualClock::at_epoch();
    let now = clock.now();
    let store = MockTaskRepository::new();
    let recent = TaskBuilder::new(WS, "work")
        .with_id("recent")
        .abandoned(now - Duration::seconds(10))
        .build();
    let stale = TaskBuilder::new(WS, "work")
        .with_id("stale")
        .abandoned(now - Duration::seconds(120))
        .build();
    store.insert(recent);
    store.insert(stale);

    let handler = Arc::new(Completes::new());
    let calls = Arc::clone(&handler.calls);
    let registry = registry_with("work", handler).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.records[0].task_id, "stale");
    assert_eq!(report.records[0].result, ExecutionResult::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let stale = store.task(WS, "stale").unwrap();
    assert_eq!(stale.status, TaskStatus::Completed);
    assert_eq!(stale.retry_count, 1);

    // 仍在宽限期内的认领不受影响
    let recent = store.task(WS, "recent").unwrap();
    assert_eq!(recent.status, TaskStatus::Running);
    assert_eq!(recent.claim_token.as_deref(), Some("lost-worker"));
}

#[tokio::test]
async fn test_abandoned_task_with_exhausted_retries_fails() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "work")
        .with_max_retries(2)
        .with_retry_count(2)
        .abandoned(clock.now() - Duration::minutes(5))
        .build();
    store.insert(task.clone());

    let handler = Arc::new(Completes::new());
    let calls = Arc::clone(&handler.calls);
    let registry = registry_with("work", handler).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::Failed { .. }
    ));
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 2);
    assert!(stored.error_message.is_some());
    assert!(stored.claim_token.is_none());
}

#[tokio::test]
async fn test_work_resumes_from_checkpoint_across_invocations() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let mut state = BuildSegmentState::new("seg_1", 1);
    state.initialized = true;
    state.total_contacts = 12;
    let task = TaskBuilder::new(WS, task_types::BUILD_SEGMENT)
        .with_state(TaskState::BuildSegment(state))
        .with_max_runtime(50)
        .build();
    store.create(&task).await.unwrap();

    let processed = Arc::new(std::sync::Mutex::new(Vec::new()));
    let registry = registry_with(
        task_types::BUILD_SEGMENT,
        Arc::new(ChunkedWork {
            clock: clock.clone(),
            processed: Arc::clone(&processed),
        }),
    )
    .await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    // 截止时间 = 50s - 5s 安全边界，每次执行最多 4 个 10 秒单元
    let report = dispatcher.execute_pending(1).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::Paused { .. }
    ));
    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    match &stored.state {
        TaskState::BuildSegment(s) => assert_eq!(s.contact_offset, 4),
        other => panic!("unexpected state: {other:?}"),
    }
    let first_progress = stored.progress;
    assert!(first_progress > 0.0);

    let mut invocations = 1;
    while store.task(WS, &task.id).unwrap().status != TaskStatus::Completed {
        dispatcher.execute_pending(1).await.unwrap();
        invocations += 1;
        assert!(invocations < 10, "task never completed");
    }

    assert_eq!(invocations, 3);
    assert_eq!(*processed.lock().unwrap(), (0..12).collect::<Vec<i64>>());
    assert_eq!(store.task(WS, &task.id).unwrap().progress, 1.0);
}

#[tokio::test]
async fn test_unregistered_task_type_fails_terminally() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "mystery").build();
    store.create(&task).await.unwrap();

    let dispatcher = dispatcher_with(
        &store,
        &clock,
        Arc::new(HandlerRegistry::new()),
        DispatcherConfig::default(),
    );
    let report = dispatcher.execute_pending(10).await.unwrap();

    match &report.records[0].result {
        ExecutionResult::Failed { error } => assert!(error.contains("mystery")),
        other => panic!("unexpected result: {other:?}"),
    }
    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert_eq!(stored.retry_count, 0);
}

#[tokio::test]
async fn test_lost_claim_result_is_discarded() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "contested").build();
    store.create(&task).await.unwrap();

    let registry = registry_with(
        "contested",
        Arc::new(LosesClaim {
            store: store.clone(),
        }),
    )
    .await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::ClaimLost);
    assert_eq!(report.executed(), 0);

    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    assert_eq!(stored.claim_token.as_deref(), Some("rival-worker"));
    assert_eq!(stored.progress, 0.0);
}

#[tokio::test]
async fn test_store_errors_are_reported() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "fragile").build();
    store.create(&task).await.unwrap();

    let registry = registry_with(
        "fragile",
        Arc::new(StoreGoesDown {
            store: store.clone(),
        }),
    )
    .await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::InfrastructureError { .. }
    ));

    // 选取阶段失败则整个调用失败
    assert!(dispatcher.execute_pending(10).await.is_err());

    // 恢复后，未提交的认领在超时与宽限期过后被回收
    store.set_fail_operations(false);
    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Running);
    clock.advance_secs(i64::from(stored.max_runtime) + 31);
    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.attempted, 1);
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::InfrastructureError { .. }
    ));
    assert_eq!(store.task(WS, &task.id).unwrap().retry_count, 1);
}

#[tokio::test]
async fn test_failed_commit_releases_claim_without_consuming_retry() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "work")
        .with_status(TaskStatus::Paused)
        .with_next_run_after(clock.now())
        .with_max_retries(0)
        .build();
    store.insert(task.clone());

    let handler = Arc::new(Completes::new());
    let registry = registry_with("work", handler.clone()).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    store.fail_next("mark_completed", 1);
    let report = dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::InfrastructureError { .. }
    ));

    // 回到认领前的状态，重试次数不变
    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.claim_token.is_none());
    assert!(stored.timeout_after.is_none());
    assert_eq!(stored.updated_at, clock.now());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_failed_reload_after_claim_releases_claim() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "work").with_max_retries(0).build();
    store.create(&task).await.unwrap();

    let handler = Arc::new(Completes::new());
    let registry = registry_with("work", handler.clone()).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    store.fail_next("get", 1);
    let report = dispatcher.execute_pending(10).await.unwrap();
    assert!(matches!(
        report.records[0].result,
        ExecutionResult::InfrastructureError { .. }
    ));
    assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

    let stored = store.task(WS, &task.id).unwrap();
    assert_eq!(stored.status, TaskStatus::Pending);
    assert_eq!(stored.retry_count, 0);
    assert!(stored.claim_token.is_none());

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.records[0].result, ExecutionResult::Completed);
}

#[tokio::test]
async fn test_batch_limit_and_oldest_first() {
    let clock = ManualClock::at_epoch();
    let now = clock.now();
    let store = MockTaskRepository::new();
    for (id, age) in [("t_new", 1), ("t_old", 30), ("t_mid", 10)] {
        let task = TaskBuilder::new(WS, "work")
            .with_id(id)
            .with_next_run_after(now - Duration::minutes(age))
            .build();
        store.create(&task).await.unwrap();
    }

    let registry = registry_with("work", Arc::new(Completes::new())).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());

    assert_eq!(dispatcher.execute_pending(0).await.unwrap().attempted, 0);

    let report = dispatcher.execute_pending(2).await.unwrap();
    assert_eq!(report.attempted, 2);
    let mut ids: Vec<&str> = report.records.iter().map(|r| r.task_id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, vec!["t_mid", "t_old"]);
    assert_eq!(
        store.task(WS, "t_new").unwrap().status,
        TaskStatus::Pending
    );
}

#[tokio::test]
async fn test_max_concurrency_overlaps_executions() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    for i in 0..4 {
        let task = TaskBuilder::new(WS, "slow").with_id(&format!("t_{i}")).build();
        store.create(&task).await.unwrap();
    }

    let handler = Arc::new(Completes::sleeping(StdDuration::from_millis(30)));
    let peak = Arc::clone(&handler.peak);
    let registry = registry_with("slow", handler).await;
    let config = DispatcherConfig {
        max_concurrency: 4,
        ..DispatcherConfig::default()
    };
    let dispatcher = dispatcher_with(&store, &clock, registry, config);

    let report = dispatcher.execute_pending(10).await.unwrap();
    assert_eq!(report.count("completed"), 4);
    assert!(peak.load(Ordering::SeqCst) > 1);
}

#[tokio::test]
async fn test_report_serializes_result_tags() {
    let clock = ManualClock::at_epoch();
    let store = MockTaskRepository::new();
    let task = TaskBuilder::new(WS, "work").with_id("t_1").build();
    store.create(&task).await.unwrap();

    let registry = registry_with("work", Arc::new(Completes::new())).await;
    let dispatcher = dispatcher_with(&store, &clock, registry, DispatcherConfig::default());
    let report = dispatcher.execute_pending(10).await.unwrap();

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["attempted"], 1);
    assert_eq!(json["records"][0]["task_id"], "t_1");
    assert_eq!(json["records"][0]["result"], "completed");
}
