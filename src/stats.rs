//! Periodic aggregation of worker counters.
//!
//! Every poll reads each worker's counters atomically, sums them, and derives
//! interval rates against the previous poll. Snapshots are kept in order for
//! the final report.

use crate::broker::QueueDepthSource;
use crate::config::{ThresholdConfig, WorkerRole};
use crate::counters::{CounterSnapshot, Counters};
use crate::flow_control::FlowControlMonitor;
use crate::orchestrator::TestState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub timestamp: DateTime<Utc>,
    pub state: TestState,
    pub elapsed_secs: f64,
    pub interval_secs: f64,
    pub producers: CounterSnapshot,
    pub consumers: CounterSnapshot,
    /// msg/s over the interval
    pub publish_rate: f64,
    pub confirm_rate: f64,
    pub consume_rate: f64,
    pub ack_rate: f64,
    /// bytes/s over the interval
    pub publish_bytes_rate: f64,
    pub consume_bytes_rate: f64,
    pub queue_depth: Option<u64>,
    pub blocked_seconds: f64,
    pub blocked_connections: usize,
    pub producer_below_target: bool,
    pub consumer_falling_behind: bool,
}

impl AggregateSnapshot {
    pub fn is_consistent(&self) -> bool {
        self.producers.is_consistent() && self.consumers.is_consistent()
    }
}

#[derive(Clone)]
pub struct WorkerCounters {
    pub worker_id: String,
    pub role: WorkerRole,
    pub counters: Arc<Counters>,
}

pub struct StatsAggregator {
    workers: Vec<WorkerCounters>,
    monitor: Arc<FlowControlMonitor>,
    depth_source: Option<Arc<dyn QueueDepthSource>>,
    queue: String,
    /// Total producer target in msg/s, 0 = unlimited
    target_rate: u64,
    thresholds: ThresholdConfig,
    started: Instant,
    previous_at: Instant,
    previous_producers: CounterSnapshot,
    previous_consumers: CounterSnapshot,
    depth_history: VecDeque<u64>,
    state: TestState,
    snapshots: Vec<AggregateSnapshot>,
}

impl StatsAggregator {
    pub fn new(
        queue: &str,
        target_rate: u64,
        thresholds: ThresholdConfig,
        monitor: Arc<FlowControlMonitor>,
        depth_source: Option<Arc<dyn QueueDepthSource>>,
    ) -> Self {
        let now = Instant::now();
        Self {
            workers: Vec::new(),
            monitor,
            depth_source,
            queue: queue.to_string(),
            target_rate,
            thresholds,
            started: now,
            previous_at: now,
            previous_producers: CounterSnapshot::default(),
            previous_consumers: CounterSnapshot::default(),
            depth_history: VecDeque::new(),
            state: TestState::Running,
            snapshots: Vec::new(),
        }
    }

    pub fn register(&mut self, worker_id: &str, role: WorkerRole, counters: Arc<Counters>) {
        self.workers.push(WorkerCounters {
            worker_id: worker_id.to_string(),
            role,
            counters,
        });
    }

    /// Restart the clock, e.g. once workers are spawned
    pub fn reset_clock(&mut self) {
        let now = Instant::now();
        self.started = now;
        self.previous_at = now;
    }

    /// Phase recorded in subsequent snapshots
    pub fn set_state(&mut self, state: TestState) {
        self.state = state;
    }

    pub fn workers(&self) -> &[WorkerCounters] {
        &self.workers
    }

    pub fn snapshots(&self) -> &[AggregateSnapshot] {
        &self.snapshots
    }

    pub fn into_snapshots(self) -> Vec<AggregateSnapshot> {
        self.snapshots
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.started.elapsed()
    }

    /// Sum of one role's counters, read without locking
    pub fn totals(&self, role: WorkerRole) -> CounterSnapshot {
        self.workers
            .iter()
            .filter(|w| w.role == role)
            .map(|w| w.counters.snapshot())
            .sum()
    }

    /// Queue depth from the broker, `None` when there is no source or it failed
    pub async fn queue_depth(&self) -> Option<u64> {
        let source = self.depth_source.as_ref()?;
        match source.queue_depth(&self.queue).await {
            Ok(depth) => Some(depth),
            Err(e) => {
                debug!("Queue depth query for {} failed: {}", self.queue, e);
                None
            }
        }
    }

    pub async fn poll(&mut self) -> AggregateSnapshot {
        let queue_depth = self.queue_depth().await;

        let now = Instant::now();
        let producers = self.totals(WorkerRole::Producer);
        let consumers = self.totals(WorkerRole::Consumer);
        let interval = now.duration_since(self.previous_at).as_secs_f64();

        let produced = producers.delta_since(&self.previous_producers);
        let consumed = consumers.delta_since(&self.previous_consumers);
        let rate = |count: u64| if interval > 0.0 { count as f64 / interval } else { 0.0 };

        let publish_rate = rate(produced.sent);
        let confirm_rate = rate(produced.confirmed);
        let consume_rate = rate(consumed.received);

        match queue_depth {
            Some(depth) => {
                self.depth_history.push_back(depth);
                while self.depth_history.len() > self.thresholds.queue_growth_polls {
                    self.depth_history.pop_front();
                }
            }
            // growth must be seen on consecutive polls
            None => self.depth_history.clear(),
        }

        let producer_below_target = self.state == TestState::Running
            && self.target_rate > 0
            && interval > 0.0
            && confirm_rate < self.thresholds.producer_target_ratio * self.target_rate as f64;

        let has_consumers = self.workers.iter().any(|w| w.role == WorkerRole::Consumer);
        let lagging = confirm_rate > 0.0
            && consume_rate < confirm_rate * (1.0 - self.thresholds.consumer_lag_margin);
        let consumer_falling_behind = has_consumers && (lagging || self.depth_growing());

        let snapshot = AggregateSnapshot {
            timestamp: Utc::now(),
            state: self.state,
            elapsed_secs: now.duration_since(self.started).as_secs_f64(),
            interval_secs: interval,
            producers,
            consumers,
            publish_rate,
            confirm_rate,
            consume_rate,
            ack_rate: rate(consumed.acked),
            publish_bytes_rate: rate(produced.bytes_sent),
            consume_bytes_rate: rate(consumed.bytes_received),
            queue_depth,
            blocked_seconds: self.monitor.blocked_seconds(),
            blocked_connections: self.monitor.blocked_connections(),
            producer_below_target,
            consumer_falling_behind,
        };

        self.previous_at = now;
        self.previous_producers = producers;
        self.previous_consumers = consumers;
        self.snapshots.push(snapshot.clone());
        snapshot
    }

    /// Depth rose at every one of the last `queue_growth_polls` polls
    fn depth_growing(&self) -> bool {
        self.depth_history.len() >= self.thresholds.queue_growth_polls
            && self
                .depth_history
                .iter()
                .zip(self.depth_history.iter().skip(1))
                .all(|(earlier, later)| later > earlier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::QueueInfo;
    use crate::error::Result;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::time::Duration;

    struct ScriptedDepth(Mutex<VecDeque<u64>>);

    #[async_trait]
    impl QueueDepthSource for ScriptedDepth {
        async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
            let messages = self.0.lock().pop_front().unwrap_or(0);
            Ok(QueueInfo {
                name: queue.to_string(),
                queue_type: "quorum".to_string(),
                messages,
                consumers: 1,
            })
        }
    }

    fn aggregator(target_rate: u64, depths: Option<Vec<u64>>) -> StatsAggregator {
        let source = depths.map(|d| {
            Arc::new(ScriptedDepth(Mutex::new(d.into_iter().collect()))) as Arc<dyn QueueDepthSource>
        });
        StatsAggregator::new(
            "q",
            target_rate,
            ThresholdConfig::default(),
            FlowControlMonitor::new(),
            source,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_rates() {
        let mut stats = aggregator(100, None);
        let producer = Arc::new(Counters::new());
        let consumer = Arc::new(Counters::new());
        stats.register("producer-0", WorkerRole::Producer, producer.clone());
        stats.register("consumer-0", WorkerRole::Consumer, consumer.clone());

        for _ in 0..200 {
            producer.record_sent(1024);
            producer.record_confirmed();
            consumer.record_received(1024);
        }
        consumer.record_acked(200);
        tokio::time::advance(Duration::from_secs(2)).await;

        let first = stats.poll().await;
        assert_eq!(first.interval_secs, 2.0);
        assert_eq!(first.confirm_rate, 100.0);
        assert_eq!(first.consume_rate, 100.0);
        assert_eq!(first.publish_bytes_rate, 102_400.0);
        assert!(!first.producer_below_target);
        assert!(!first.consumer_falling_behind);

        for _ in 0..50 {
            producer.record_sent(1024);
            producer.record_confirmed();
        }
        tokio::time::advance(Duration::from_secs(1)).await;
        let second = stats.poll().await;
        assert_eq!(second.confirm_rate, 50.0);
        assert_eq!(second.consume_rate, 0.0);
        assert_eq!(second.producers.confirmed, 250);
        assert!(second.producer_below_target);
        assert!(second.consumer_falling_behind);
        assert_eq!(stats.snapshots().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_target_never_below() {
        let mut stats = aggregator(0, None);
        stats.register("producer-0", WorkerRole::Producer, Arc::new(Counters::new()));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(!stats.poll().await.producer_below_target);
    }

    #[tokio::test(start_paused = true)]
    async fn test_below_target_only_while_running() {
        let mut stats = aggregator(100, None);
        stats.register("producer-0", WorkerRole::Producer, Arc::new(Counters::new()));
        stats.set_state(TestState::Draining);
        tokio::time::advance(Duration::from_secs(1)).await;
        let snapshot = stats.poll().await;
        assert!(!snapshot.producer_below_target);
        assert_eq!(snapshot.state, TestState::Draining);
    }

    #[tokio::test(start_paused = true)]
    async fn test_growing_depth_flags_consumers() {
        let mut stats = aggregator(0, Some(vec![10, 20, 30, 25, 40, 50, 60]));
        stats.register("consumer-0", WorkerRole::Consumer, Arc::new(Counters::new()));

        let mut flags = Vec::new();
        for _ in 0..7 {
            tokio::time::advance(Duration::from_secs(1)).await;
            flags.push(stats.poll().await.consumer_falling_behind);
        }
        assert_eq!(flags, vec![false, false, true, false, false, true, true]);
        assert_eq!(stats.snapshots()[3].queue_depth, Some(25));
    }

    struct FlakyDepth(Mutex<VecDeque<Option<u64>>>);

    #[async_trait]
    impl QueueDepthSource for FlakyDepth {
        async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
            match self.0.lock().pop_front().flatten() {
                Some(messages) => Ok(QueueInfo {
                    name: queue.to_string(),
                    queue_type: "quorum".to_string(),
                    messages,
                    consumers: 1,
                }),
                None => Err(crate::error::LoadGenError::ManagementApi(
                    "HTTP 503 Service Unavailable".to_string(),
                )),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_depth_query_breaks_growth_streak() {
        let depths = vec![Some(10), Some(20), None, Some(30), Some(40), Some(50)];
        let source = Arc::new(FlakyDepth(Mutex::new(depths.into_iter().collect())));
        let mut stats = StatsAggregator::new(
            "q",
            0,
            ThresholdConfig::default(),
            FlowControlMonitor::new(),
            Some(source as Arc<dyn QueueDepthSource>),
        );
        stats.register("consumer-0", WorkerRole::Consumer, Arc::new(Counters::new()));

        let mut flags = Vec::new();
        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(1)).await;
            flags.push(stats.poll().await.consumer_falling_behind);
        }
        // 10, 20, 30 straddle the failed poll and do not count as a streak
        assert_eq!(flags, vec![false, false, false, false, false, true]);
        assert_eq!(stats.snapshots()[2].queue_depth, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_consumers_never_behind() {
        let mut stats = aggregator(0, Some(vec![1, 2, 3, 4]));
        stats.register("producer-0", WorkerRole::Producer, Arc::new(Counters::new()));
        for _ in 0..4 {
            tokio::time::advance(Duration::from_secs(1)).await;
            assert!(!stats.poll().await.consumer_falling_behind);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_snapshots_consistent_under_concurrent_writers() {
        let mut stats = aggregator(0, None);
        let mut writers = Vec::new();
        for i in 0..4 {
            let counters = Arc::new(Counters::new());
            let role = if i % 2 == 0 {
                WorkerRole::Producer
            } else {
                WorkerRole::Consumer
            };
            stats.register(&format!("worker-{}", i), role, counters.clone());
            writers.push(tokio::spawn(async move {
                for n in 0..50_000u64 {
                    counters.record_sent(10);
                    counters.record_confirmed();
                    counters.record_received(10);
                    counters.record_acked(1);
                    if n % 1_000 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            }));
        }

        let mut previous: Option<AggregateSnapshot> = None;
        while writers.iter().any(|w| !w.is_finished()) {
            let snapshot = stats.poll().await;
            assert!(snapshot.is_consistent(), "{:?}", snapshot);
            if let Some(previous) = &previous {
                assert!(snapshot.producers.sent >= previous.producers.sent);
                assert!(snapshot.consumers.acked >= previous.consumers.acked);
            }
            previous = Some(snapshot);
            tokio::task::yield_now().await;
        }
        for writer in writers {
            writer.await.unwrap();
        }
        let last = stats.poll().await;
        assert_eq!(last.producers.confirmed, 100_000);
        assert_eq!(last.consumers.acked, 100_000);
    }
}
