//! End-to-end scenarios over the assembled core with an in-memory store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use aidos_core::common::SystemClock;
use aidos_core::kernel::{MockCommandRunner, MockNotifier};
use aidos_core::kv::{KvStore, MemoryKv};
use aidos_core::monitoring::{AlertCondition, AlertSeverity, ConditionOp};
use aidos_core::healing::{ActionSpec, HealingAction, HealingStrategy};
use aidos_core::scheduler::{NewTask, TaskEvent, TaskPriority, TaskStatus};
use aidos_core::{Core, CoreConfig, CoreContext, CoreError};

/// Core over a real clock with fast worker polling, so retry backoffs
/// elapse in wall time.
fn realtime_core() -> Core {
    let clock = Arc::new(SystemClock::new());
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new(clock.clone()));
    let context = CoreContext::new(
        clock,
        kv,
        Arc::new(MockNotifier::new()),
        Arc::new(MockCommandRunner::new()),
    );
    let mut config = CoreConfig::default();
    config.queue.min_poll_interval = Duration::from_millis(10);
    config.queue.max_poll_interval = Duration::from_millis(50);
    Core::new(config, context)
}

#[derive(Debug, Clone, PartialEq)]
enum Recorded {
    Started(uuid::Uuid),
    Completed(uuid::Uuid),
    Failed(uuid::Uuid, bool),
    Blocked(uuid::Uuid),
    RetryScheduled(uuid::Uuid, u64),
}

fn record_events(core: &Core) -> Arc<parking_lot::Mutex<Vec<Recorded>>> {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let sink = log.clone();
    core.scheduler.on_event(move |event| {
        let entry = match event {
            TaskEvent::Started { task_id, .. } => Recorded::Started(*task_id),
            TaskEvent::Completed { task_id, .. } => Recorded::Completed(*task_id),
            TaskEvent::Failed { task_id, retry, .. } => Recorded::Failed(*task_id, *retry),
            TaskEvent::Blocked { task_id } => Recorded::Blocked(*task_id),
            TaskEvent::RetryScheduled { task_id, delay_ms } => {
                Recorded::RetryScheduled(*task_id, *delay_ms)
            }
        };
        sink.lock().push(entry);
    });
    log
}

async fn wait_for_completion(core: &Core, timeout: Duration) {
    let deadline = std::time::Instant::now() + timeout;
    while !core.scheduler.is_complete().await {
        assert!(
            std::time::Instant::now() < deadline,
            "scheduler did not finish in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

fn position(log: &[Recorded], needle: &Recorded) -> usize {
    log.iter()
        .position(|e| e == needle)
        .unwrap_or_else(|| panic!("event {needle:?} not found in {log:?}"))
}

#[tokio::test]
async fn happy_path_with_dependencies_runs_in_order() {
    let core = realtime_core();
    let log = record_events(&core);

    core.scheduler
        .register_executor("dev", |_payload| async move { Ok(json!("ok")) });
    core.scheduler
        .register_executor("qa", |_payload| async move { Ok(json!("pass")) });

    let build = core
        .scheduler
        .add_task(NewTask {
            agent_id: Some("dev".to_string()),
            ..NewTask::named("build")
        })
        .await
        .unwrap();
    let test = core
        .scheduler
        .add_task(NewTask {
            agent_id: Some("qa".to_string()),
            dependencies: vec![build],
            ..NewTask::named("test")
        })
        .await
        .unwrap();

    core.start();
    core.scheduler.schedule_task(build, "dev").await.unwrap();
    core.scheduler.schedule_task(test, "qa").await.unwrap();

    wait_for_completion(&core, Duration::from_secs(10)).await;
    core.shutdown().await;

    let status = core.scheduler.get_status().await.unwrap();
    assert_eq!(status.completed, 2);
    assert_eq!(status.failed, 0);

    let build_task = core.scheduler.get_task(build).await.unwrap();
    assert_eq!(build_task.status, TaskStatus::Completed);
    assert_eq!(build_task.result, Some(json!("ok")));
    let test_task = core.scheduler.get_task(test).await.unwrap();
    assert_eq!(test_task.result, Some(json!("pass")));

    let log = log.lock().clone();
    let order = [
        position(&log, &Recorded::Started(build)),
        position(&log, &Recorded::Completed(build)),
        position(&log, &Recorded::Started(test)),
        position(&log, &Recorded::Completed(test)),
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]), "events out of order: {log:?}");
    assert!(!log.iter().any(|e| matches!(e, Recorded::Failed(_, _))));
}

#[tokio::test]
async fn transient_failures_retry_then_succeed() {
    let core = realtime_core();
    let log = record_events(&core);

    let calls = Arc::new(AtomicU32::new(0));
    let seen = calls.clone();
    core.scheduler.register_executor("dev", move |_payload| {
        let calls = seen.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(CoreError::execution("connect ECONNREFUSED 10.0.0.1:5432"))
            } else {
                Ok(json!({}))
            }
        }
    });

    let task = core
        .scheduler
        .add_task(NewTask {
            agent_id: Some("dev".to_string()),
            max_retries: 3,
            ..NewTask::named("flaky-build")
        })
        .await
        .unwrap();

    core.start();
    core.scheduler.schedule_task(task, "dev").await.unwrap();
    wait_for_completion(&core, Duration::from_secs(30)).await;
    core.shutdown().await;

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        core.scheduler.get_task(task).await.unwrap().status,
        TaskStatus::Completed
    );

    let log = log.lock().clone();
    let delays: Vec<u64> = log
        .iter()
        .filter_map(|e| match e {
            Recorded::RetryScheduled(_, delay) => Some(*delay),
            _ => None,
        })
        .collect();
    assert_eq!(delays.len(), 2, "expected two retry events: {log:?}");
    assert!(delays[0] >= 1_000);
    assert!(delays[1] > delays[0], "delays must increase: {delays:?}");
    assert!(!log.iter().any(|e| matches!(e, Recorded::Failed(_, _))));
    assert_eq!(core.dead_letter.count().await.unwrap(), 0);
}

#[tokio::test]
async fn exhausted_retries_land_in_dead_letter() {
    let core = realtime_core();
    let log = record_events(&core);

    core.scheduler.register_executor("dev", |_payload| async move {
        Err(CoreError::execution("ETIMEDOUT waiting for upstream"))
    });

    let task = core
        .scheduler
        .add_task(NewTask {
            agent_id: Some("dev".to_string()),
            max_retries: 2,
            ..NewTask::named("doomed")
        })
        .await
        .unwrap();

    core.start();
    core.scheduler.schedule_task(task, "dev").await.unwrap();
    wait_for_completion(&core, Duration::from_secs(30)).await;
    core.shutdown().await;

    assert_eq!(
        core.scheduler.get_task(task).await.unwrap().status,
        TaskStatus::Failed
    );
    let log = log.lock().clone();
    assert!(log.contains(&Recorded::Failed(task, false)), "{log:?}");

    let entries = core.dead_letter.list(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempts_made, 2);
    assert!(entries[0].failure_reason.contains("timeout"));
    assert_eq!(entries[0].task_id, Some(task));
}

#[tokio::test]
async fn concurrent_idempotent_execution_runs_once() {
    let core = realtime_core();
    let counter = Arc::new(AtomicU32::new(0));

    let payload_a = json!({"name": "a", "age": 30});
    let payload_b = json!({"age": 30, "name": "a"});

    let run = |payload: Value| {
        let idempotency = core.idempotency.clone();
        let counter = counter.clone();
        async move {
            idempotency
                .execute_idempotent("addUser", &payload, || async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(json!({"id": "u1"}))
                })
                .await
        }
    };

    let (first, second) = tokio::join!(run(payload_a), run(payload_b));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(counter.load(Ordering::SeqCst), 1);
    assert_eq!(first.result, json!({"id": "u1"}));
    assert_eq!(second.result, json!({"id": "u1"}));
    assert!(first.is_cached != second.is_cached);
}

#[tokio::test]
async fn alert_suppression_counts_duplicates() {
    let (context, deps) = CoreContext::for_tests();
    let core = Core::new(CoreConfig::default(), context);

    core.context.alerts.add_rule(aidos_core::monitoring::AlertRule {
        id: "cpu-high".to_string(),
        metric_name: "cpu".to_string(),
        condition: AlertCondition {
            op: ConditionOp::Gt,
            threshold: 80.0,
        },
        severity: AlertSeverity::Warning,
        enabled: true,
        cooldown_ms: 0,
    });

    // Identical WARNING events at 0, 10, 20, 30, 40 seconds.
    let mut emitted = 0;
    for i in 0..5 {
        if i > 0 {
            deps.clock.advance(Duration::from_secs(10));
        }
        emitted += core
            .context
            .alerts
            .evaluate_metric("cpu", 95.0, None)
            .await
            .len();
    }

    assert_eq!(emitted, 1);
    assert_eq!(core.context.alerts.get_suppression_stats().suppressed_count, 4);

    // Past the window the next event emits again.
    deps.clock.advance(Duration::from_secs(61));
    assert_eq!(
        core.context
            .alerts
            .evaluate_metric("cpu", 95.0, None)
            .await
            .len(),
        1
    );
}

#[tokio::test]
async fn healing_strategy_fires_once_per_cooldown() {
    let (context, deps) = CoreContext::for_tests();
    let core = Core::new(CoreConfig::default(), context);

    core.healing.register_strategy(HealingStrategy {
        id: "cpu-relief".to_string(),
        trigger_metric: "cpu".to_string(),
        trigger_severity: AlertSeverity::Warning,
        trigger_condition: AlertCondition {
            op: ConditionOp::Gt,
            threshold: 80.0,
        },
        actions: vec![ActionSpec {
            action: HealingAction::Command {
                command: "echo reduce-load".to_string(),
            },
            retryable: true,
        }],
        cooldown: Duration::from_secs(300),
        enabled: true,
    });

    let first = core
        .healing
        .check_and_heal("cpu", 90.0, AlertSeverity::Warning)
        .await
        .unwrap();
    assert!(first.triggered);

    deps.clock.advance(Duration::from_secs(1));
    let second = core
        .healing
        .check_and_heal("cpu", 90.0, AlertSeverity::Warning)
        .await
        .unwrap();
    assert!(!second.triggered);

    assert_eq!(deps.command_runner.executed().len(), 1);
}

#[tokio::test]
async fn critical_task_overtakes_earlier_lower_priority_task() {
    let core = realtime_core();

    // Enqueue a HIGH task (wire 8) first and a CRITICAL task (wire 7)
    // second; the critical one must be claimed first.
    let mut high = NewTask::named("high-priority");
    high.priority = TaskPriority::High;
    high.agent_id = Some("dev".to_string());
    let high = core.scheduler.add_task(high).await.unwrap();

    let mut critical = NewTask::named("critical-priority");
    critical.priority = TaskPriority::Critical;
    critical.agent_id = Some("dev".to_string());
    let critical = core.scheduler.add_task(critical).await.unwrap();

    core.scheduler.schedule_task(high, "dev").await.unwrap();
    core.scheduler.schedule_task(critical, "dev").await.unwrap();

    let first = core
        .queue
        .claim_next(aidos_core::queue::TASK_QUEUE, "probe")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.task_id, Some(critical));
    assert_eq!(first.priority, 7);

    let second = core
        .queue
        .claim_next(aidos_core::queue::TASK_QUEUE, "probe")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.task_id, Some(high));
}

#[tokio::test]
async fn dead_letter_requeue_preserves_payload_and_completes() {
    let core = realtime_core();

    // First attempt fails permanently; after requeue the processor works.
    let healthy = Arc::new(AtomicU32::new(0));
    let seen = healthy.clone();
    core.scheduler.register_executor("dev", move |payload| {
        let calls = seen.clone();
        async move {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(CoreError::execution("ETIMEDOUT"))
            } else {
                Ok(payload)
            }
        }
    });

    let task = core
        .scheduler
        .add_task(NewTask {
            agent_id: Some("dev".to_string()),
            payload: json!({"keep": "me"}),
            max_retries: 1,
            ..NewTask::named("replayable")
        })
        .await
        .unwrap();

    core.start();
    core.scheduler.schedule_task(task, "dev").await.unwrap();
    wait_for_completion(&core, Duration::from_secs(10)).await;

    let entries = core.dead_letter.list(None).await.unwrap();
    assert_eq!(entries.len(), 1);
    let entry = &entries[0];
    assert_eq!(entry.payload["payload"], json!({"keep": "me"}));

    let job_id = core
        .dead_letter
        .requeue(&entry.entry_id, &core.queue)
        .await
        .unwrap();

    // The requeued job carries the original payload byte-for-byte and
    // fresh attempts.
    let job = core
        .queue
        .get_job(aidos_core::queue::TASK_QUEUE, &job_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.data, entry.payload);
    assert_eq!(job.attempts, 0);

    core.shutdown().await;
}
