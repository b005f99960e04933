//! End-to-end load test runs against the in-process broker
//!
//! The full-length scenarios take 10+ seconds of wall-clock time and are marked
//! with #[ignore]. Run them explicitly with:
//! ```bash
//! cargo test --release --test integration_load_test -- --ignored
//! ```

use rmq_loadgen::broker::{InMemoryBroker, QueueDepthSource};
use rmq_loadgen::config::QueueType;
use rmq_loadgen::flow_control::FlowControlMonitor;
use rmq_loadgen::payload::PayloadBuilder;
use rmq_loadgen::pool::ConnectionPool;
use rmq_loadgen::{Classification, Config, LoadGenError, TestOrchestrator, TestReport, WorkerRole};
use std::sync::Arc;
use std::time::Duration;

const QUEUE: &str = "loadtest-queue";

fn base_config() -> Config {
    let mut config = Config::default();
    config.broker.hosts = vec!["rmq1".into(), "rmq2".into(), "rmq3".into()];
    config.queue.name = QUEUE.to_string();
    config.queue.queue_type = QueueType::Quorum;
    config.producer.workers = 2;
    config.producer.connections_per_worker = 2;
    config.producer.target_rate = 400;
    config.producer.message_size = 1024;
    config.consumer.workers = 2;
    config.consumer.connections_per_worker = 2;
    config.consumer.prefetch_count = 100;
    config.consumer.batch_ack_size = 50;
    config.consumer.batch_ack_timeout_ms = 200;
    config.test.duration_secs = 3;
    config.test.poll_interval_ms = 500;
    config.test.drain_grace_ms = 200;
    config.test.max_drain_ms = 10_000;
    config.retry.max_attempts = 1;
    config.retry.base_delay_ms = 10;
    config
}

fn simulated_broker() -> InMemoryBroker {
    let broker = InMemoryBroker::new();
    broker.declare_queue(QUEUE, QueueType::Quorum);
    broker
}

async fn run(config: Config, broker: &InMemoryBroker) -> rmq_loadgen::Result<TestReport> {
    TestOrchestrator::new(
        config,
        Arc::new(broker.clone()),
        Some(Arc::new(broker.clone()) as Arc<dyn QueueDepthSource>),
    )
    .run()
    .await
}

/// Raise a broker-wide alarm `at` after now, lasting `hold`
fn schedule_alarm(broker: &InMemoryBroker, at: Duration, hold: Duration) {
    let broker = broker.clone();
    tokio::spawn(async move {
        tokio::time::sleep(at).await;
        broker.block("memory alarm");
        tokio::time::sleep(hold).await;
        broker.unblock();
    });
}

fn assert_counters_consistent(report: &TestReport) {
    assert!(report.producers.confirmed <= report.producers.sent);
    assert!(report.consumers.acked <= report.consumers.received);
    for snapshot in &report.snapshots {
        assert!(snapshot.is_consistent(), "inconsistent snapshot: {:?}", snapshot);
    }
    for pair in report.snapshots.windows(2) {
        assert!(pair[1].producers.confirmed >= pair[0].producers.confirmed);
        assert!(pair[1].consumers.acked >= pair[0].consumers.acked);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_short_run_reaches_target() {
    let broker = simulated_broker();
    let report = run(base_config(), &broker).await.unwrap();

    // 400 msg/s for 3 s, within 5%
    let confirmed = report.producers.confirmed;
    assert!((1140..=1260).contains(&confirmed), "confirmed {}", confirmed);
    assert_eq!(report.classification, Classification::TargetAchieved);
    assert!(report.drained);
    assert_eq!(report.consumers.received, confirmed);
    assert_eq!(report.consumers.acked, confirmed);
    assert_eq!(report.final_queue_depth, Some(0));
    assert!(report.peak_queue_depth.is_some());
    assert_counters_consistent(&report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Only run with --ignored flag
async fn test_full_run_2000_msgs_per_sec() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.producer.workers = 4;
    config.producer.connections_per_worker = 5;
    config.producer.target_rate = 2000;
    config.consumer.workers = 4;
    config.consumer.connections_per_worker = 5;
    config.consumer.prefetch_count = 200;
    config.consumer.batch_ack_size = 100;
    config.test.duration_secs = 10;
    config.test.poll_interval_ms = 1_000;

    let report = run(config, &broker).await.unwrap();

    let confirmed = report.producers.confirmed;
    assert!((19_600..=20_400).contains(&confirmed), "confirmed {}", confirmed);
    assert_eq!(report.classification, Classification::TargetAchieved);
    assert_eq!(report.consumers.acked, confirmed);
    assert_counters_consistent(&report);
    println!("{}", report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_broker_alarm_is_reported_as_backpressure() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.test.duration_secs = 4;

    schedule_alarm(&broker, Duration::from_secs(1), Duration::from_secs(2));
    let report = run(config, &broker).await.unwrap();

    assert!(
        (1.5..=2.5).contains(&report.blocked_seconds),
        "blocked {:.2}s",
        report.blocked_seconds
    );
    assert_eq!(report.classification, Classification::BackpressureLimited);
    assert_eq!(report.producers.errors, 0);
    assert!(report.drained);
    assert_counters_consistent(&report);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Only run with --ignored flag
async fn test_three_second_alarm_in_ten_second_run() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.producer.target_rate = 1000;
    config.test.duration_secs = 10;

    schedule_alarm(&broker, Duration::from_secs(2), Duration::from_secs(3));
    let report = run(config, &broker).await.unwrap();

    assert!(
        (2.5..=3.5).contains(&report.blocked_seconds),
        "blocked {:.2}s",
        report.blocked_seconds
    );
    assert_eq!(report.classification, Classification::BackpressureLimited);
    // roughly 7 of 10 seconds worth of messages
    let expected = 7_000.0;
    let confirmed = report.producers.confirmed as f64;
    assert!((confirmed - expected).abs() / expected < 0.1, "confirmed {}", confirmed);
}

#[tokio::test]
async fn test_preloaded_queue_acked_in_full_batches() {
    let broker = simulated_broker();
    let builder = PayloadBuilder::new(0, 1024).unwrap();
    broker.preload(QUEUE, (0..100).map(|seq| builder.build(seq)));

    let mut config = base_config();
    config.producer.workers = 0;
    config.consumer.workers = 1;
    config.consumer.connections_per_worker = 1;
    config.consumer.prefetch_count = 100;
    config.consumer.batch_ack_size = 50;
    config.consumer.batch_ack_timeout_ms = 5_000;
    config.test.duration_secs = 1;

    let report = run(config, &broker).await.unwrap();

    assert_eq!(report.consumers.received, 100);
    assert_eq!(report.consumers.acked, 100);
    assert_eq!(report.consumers.integrity_failures, 0);
    assert_eq!(broker.ack_calls(), 2);
    assert_eq!(broker.depth(QUEUE), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stop_twice_closes_each_connection_once() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.test.duration_secs = 30;
    let orchestrator = Arc::new(TestOrchestrator::new(
        config,
        Arc::new(broker.clone()),
        Some(Arc::new(broker.clone()) as Arc<dyn QueueDepthSource>),
    ));

    let handle = {
        let orchestrator = orchestrator.clone();
        tokio::spawn(async move { orchestrator.run().await })
    };
    tokio::time::sleep(Duration::from_millis(800)).await;
    orchestrator.stop();
    orchestrator.stop();
    orchestrator.interrupt_token().cancel();

    let report = tokio::time::timeout(Duration::from_secs(15), handle)
        .await
        .unwrap()
        .unwrap()
        .unwrap();

    assert!(report.interrupted);
    // 2 producers and 2 consumers with 2 connections each
    assert_eq!(broker.close_calls(), 8);
    assert_eq!(broker.open_connections(), 0);
    assert_eq!(report.consumers.acked, report.consumers.received);
    assert_eq!(report.consumers.received, report.producers.confirmed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_payload_size_survives_round_trip() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.producer.message_size = 4096;
    config.test.duration_secs = 1;

    let report = run(config, &broker).await.unwrap();

    assert!(report.consumers.received > 0);
    assert_eq!(report.consumers.integrity_failures, 0);
    assert_eq!(report.producers.bytes_sent, report.producers.sent * 4096);
    assert_eq!(report.consumers.bytes_received, report.consumers.received * 4096);
}

#[tokio::test]
async fn test_zero_connection_pool_is_rejected() {
    let broker = simulated_broker();
    let result = ConnectionPool::connect(
        "producer-0",
        &["rmq1:5672".to_string()],
        0,
        Arc::new(broker.clone()),
        Default::default(),
        FlowControlMonitor::new(),
    )
    .await;
    assert!(matches!(result, Err(LoadGenError::InvalidConfig(_))));

    let mut config = base_config();
    config.producer.connections_per_worker = 0;
    let result = run(config, &broker).await;
    assert!(matches!(result, Err(LoadGenError::InvalidConfig(_))));
    assert_eq!(broker.connect_attempts(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_producer_failing_at_init_is_flagged() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.producer.connections_per_worker = 1;
    config.test.duration_secs = 1;
    broker.fail_next_connects(1);

    let report = run(config, &broker).await.unwrap();

    assert!(report.partial_worker_failure);
    assert_eq!(report.failed_workers.len(), 1);
    let failed = report
        .workers
        .iter()
        .find(|w| w.worker_id == report.failed_workers[0])
        .unwrap();
    assert_eq!(failed.role, WorkerRole::Producer);
    assert_eq!(failed.counters.sent, 0);
    // the surviving producer still published
    assert!(report.producers.confirmed > 0);
    assert!(report.to_string().contains("PARTIAL WORKER FAILURE"));
}

#[tokio::test]
async fn test_invalid_rate_fails_before_any_connection() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.producer.workers = 4;
    config.producer.target_rate = 3;

    let result = run(config, &broker).await;
    assert!(matches!(result, Err(LoadGenError::InvalidConfig(_))));
    assert_eq!(broker.connect_attempts(), 0);
    assert_eq!(broker.published(), 0);
}

#[tokio::test]
async fn test_report_serializes_for_tooling() {
    let broker = simulated_broker();
    let mut config = base_config();
    config.test.duration_secs = 1;
    let report = run(config, &broker).await.unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("report.json");
    tokio_test::assert_ok!(report.write_to_file(&path));

    let parsed: TestReport =
        serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(parsed.run_id, report.run_id);
    assert_eq!(parsed.classification, report.classification);
    assert_eq!(parsed.snapshots.len(), report.snapshots.len());
}
