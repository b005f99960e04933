//! Rate-limited, confirm-tracking producer worker.
//!
//! A worker runs one publish lane per pooled connection. Lanes share the
//! worker's rate limiter and counters, and each lane has at most one publish
//! in flight, waiting for the broker's confirm before taking the next permit.

use crate::config::{Config, WorkerConfig};
use crate::counters::Counters;
use crate::error::{LoadGenError, Result};
use crate::flow_control::FlowControlMonitor;
use crate::payload::PayloadBuilder;
use crate::pool::ConnectionPool;
use crate::rate_limiter::RateLimiter;
use crate::broker::Confirmation;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub persistent: bool,
    pub confirm_timeout: Duration,
    /// Grace given to an in-flight confirm once the stop signal fires
    pub shutdown_confirm_timeout: Duration,
    pub max_catch_up: Duration,
    /// Stop on its own after this long, even without a stop signal
    pub deadline: Option<Duration>,
}

impl ProducerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            persistent: config.producer.persistent,
            confirm_timeout: config.producer.confirm_timeout(),
            shutdown_confirm_timeout: config.test.shutdown_confirm_timeout(),
            max_catch_up: config.producer.max_catch_up(),
            deadline: None,
        }
    }
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

pub struct ProducerWorker {
    config: WorkerConfig,
    settings: ProducerSettings,
    pool: Arc<ConnectionPool>,
    monitor: Arc<FlowControlMonitor>,
    limiter: RateLimiter,
    counters: Arc<Counters>,
    payload: PayloadBuilder,
    sequence: AtomicU64,
}

impl ProducerWorker {
    pub fn new(
        config: WorkerConfig,
        settings: ProducerSettings,
        pool: Arc<ConnectionPool>,
        monitor: Arc<FlowControlMonitor>,
        counters: Arc<Counters>,
    ) -> Result<Self> {
        let payload = PayloadBuilder::new(config.index, config.message_size)?;
        let limiter = RateLimiter::new(config.target_rate, settings.max_catch_up);
        Ok(Self {
            config,
            settings,
            pool,
            monitor,
            limiter,
            counters,
            payload,
            sequence: AtomicU64::new(0),
        })
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Publish until `stop` fires (or the deadline passes), then close the pool.
    ///
    /// Only resource exhaustion ends the worker early; per-message failures are
    /// counted and the lane carries on.
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let stop = stop.child_token();
        if let Some(deadline) = self.settings.deadline {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = stop.cancelled() => {}
                    _ = tokio::time::sleep(deadline) => stop.cancel(),
                }
            });
        }

        let lanes = self.pool.live_channels().max(1);
        info!(
            "Producer {} starting: target {} msg/s, {} byte messages, {} lanes",
            self.config.worker_id,
            if self.limiter.is_unlimited() {
                "unlimited".to_string()
            } else {
                self.limiter.rate().to_string()
            },
            self.config.message_size,
            lanes
        );

        let tasks: Vec<_> = (0..lanes)
            .map(|lane| {
                let worker = self.clone();
                let stop = stop.clone();
                tokio::spawn(async move { worker.lane(lane, stop).await })
            })
            .collect();

        let mut failure = None;
        for task in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(LoadGenError::WorkerFailed {
                    worker_id: self.config.worker_id.clone(),
                    reason: format!("publish lane panicked: {}", e),
                }),
            };
            if let Err(e) = result {
                // one failing lane takes the others down with it
                stop.cancel();
                failure.get_or_insert(e);
            }
        }

        self.pool.close_all().await;

        let totals = self.counters.snapshot();
        match failure {
            Some(e) => {
                error!(
                    "Producer {} failed after {} confirmed: {}",
                    self.config.worker_id, totals.confirmed, e
                );
                Err(e)
            }
            None => {
                info!(
                    "Producer {} finished: sent={} confirmed={} rejected={} errors={}",
                    self.config.worker_id,
                    totals.sent,
                    totals.confirmed,
                    totals.rejected,
                    totals.errors
                );
                Ok(())
            }
        }
    }

    async fn lane(&self, lane: usize, stop: CancellationToken) -> Result<()> {
        debug!("Producer {} lane {} started", self.config.worker_id, lane);
        loop {
            if stop.is_cancelled() {
                break;
            }

            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = self.limiter.acquire() => {}
            }

            let acquired = tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                acquired = self.pool.acquire() => acquired,
            };
            let mut handle = match acquired {
                Ok(handle) => handle,
                Err(_) if self.pool.is_closed() => break,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.counters.record_error();
                    warn!("Producer {} could not get a connection: {}", self.config.worker_id, e);
                    continue;
                }
            };

            let connection_id = handle.id();
            if self.monitor.is_blocked(connection_id) {
                debug!(
                    "Producer {} lane {} waiting for connection {} to unblock",
                    self.config.worker_id, lane, connection_id
                );
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = self.monitor.wait_until_unblocked(connection_id) => {}
                }
                // time spent blocked is not made up afterwards
                self.limiter.resync();
            }
            let episodes = self.monitor.block_episodes(connection_id);

            let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
            let payload = self.payload.build(sequence);
            let size = payload.len();

            let publisher = match handle.publisher().await {
                Ok(publisher) => publisher,
                Err(e) => {
                    self.counters.record_error();
                    warn!(
                        "Producer {} failed to open a channel on connection {}: {}",
                        self.config.worker_id, connection_id, e
                    );
                    continue;
                }
            };

            self.counters.record_sent(size);
            let outcome = {
                let publish = timeout(
                    self.settings.confirm_timeout,
                    publisher.publish(&self.config.queue, payload, self.settings.persistent),
                );
                tokio::pin!(publish);

                tokio::select! {
                    outcome = &mut publish => Some(outcome),
                    _ = stop.cancelled() => {
                        timeout(self.settings.shutdown_confirm_timeout, &mut publish)
                            .await
                            .ok()
                    }
                }
            };

            if self.monitor.block_episodes(connection_id) != episodes {
                // the alarm fired while this publish was held by the broker
                self.limiter.resync();
            }

            match outcome {
                Some(Ok(Ok(Confirmation::Ack))) => self.counters.record_confirmed(),
                Some(Ok(Ok(Confirmation::Nack))) => {
                    self.counters.record_rejected();
                    debug!(
                        "Producer {} message {} nacked by broker",
                        self.config.worker_id, sequence
                    );
                }
                Some(Ok(Err(e))) => {
                    self.counters.record_error();
                    warn!(
                        "Producer {} publish of message {} failed: {}",
                        self.config.worker_id, sequence, e
                    );
                    handle.reset_publisher();
                }
                Some(Err(_elapsed)) => {
                    if self.monitor.is_blocked(connection_id) {
                        debug!(
                            "Producer {} confirm for message {} delayed by flow control",
                            self.config.worker_id, sequence
                        );
                    } else {
                        self.counters.record_error();
                        warn!(
                            "Producer {} confirm for message {} timed out after {:?}",
                            self.config.worker_id, sequence, self.settings.confirm_timeout
                        );
                    }
                    handle.reset_publisher();
                }
                None => {
                    self.counters.record_error();
                    warn!(
                        "Producer {} abandoned in-flight confirm for message {} at shutdown",
                        self.config.worker_id, sequence
                    );
                    break;
                }
            }
        }
        debug!("Producer {} lane {} stopped", self.config.worker_id, lane);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use crate::config::{RetryConfig, WorkerRole};
    use tokio::time::Instant;

    const QUEUE: &str = "producer_test_queue";

    fn worker_config(target_rate: u64, connections: usize) -> WorkerConfig {
        WorkerConfig {
            worker_id: "producer-0".to_string(),
            role: WorkerRole::Producer,
            index: 0,
            target_rate,
            message_size: 256,
            connections,
            channels_per_connection: 1,
            queue: QUEUE.to_string(),
            endpoints: vec!["node1:5672".to_string()],
        }
    }

    async fn producer(
        broker: &InMemoryBroker,
        target_rate: u64,
        connections: usize,
        settings: ProducerSettings,
    ) -> Arc<ProducerWorker> {
        producer_with_channels(broker, target_rate, connections, 1, settings).await
    }

    async fn producer_with_channels(
        broker: &InMemoryBroker,
        target_rate: u64,
        connections: usize,
        channels: usize,
        settings: ProducerSettings,
    ) -> Arc<ProducerWorker> {
        let mut config = worker_config(target_rate, connections);
        config.channels_per_connection = channels;
        let monitor = FlowControlMonitor::new();
        let pool = ConnectionPool::connect_with_channels(
            &config.worker_id,
            &config.endpoints,
            connections,
            channels,
            Arc::new(broker.clone()),
            RetryConfig {
                jitter: false,
                ..Default::default()
            },
            monitor.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        Arc::new(ProducerWorker::new(config, settings, pool, monitor, Arc::new(Counters::new())).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_publishes_at_target_rate() {
        let broker = InMemoryBroker::new();
        let settings = ProducerSettings {
            deadline: Some(Duration::from_secs(2)),
            ..Default::default()
        };
        let worker = producer(&broker, 500, 3, settings).await;

        worker.clone().run(CancellationToken::new()).await.unwrap();

        let totals = worker.counters().snapshot();
        assert!(
            (980..=1001).contains(&totals.confirmed),
            "confirmed {}",
            totals.confirmed
        );
        assert_eq!(totals.confirmed, totals.sent);
        assert_eq!(totals.rejected, 0);
        assert_eq!(broker.depth(QUEUE), totals.confirmed);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_each_channel_publishes_in_parallel() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_latency(Duration::from_millis(100));
        let settings = ProducerSettings {
            deadline: Some(Duration::from_secs(1)),
            ..Default::default()
        };

        let single = producer(&broker, 0, 1, settings.clone()).await;
        single.clone().run(CancellationToken::new()).await.unwrap();
        let single_confirmed = single.counters().snapshot().confirmed;
        assert!(single_confirmed <= 11, "confirmed {}", single_confirmed);

        let attempts = broker.connect_attempts();
        let multi = producer_with_channels(&broker, 0, 1, 4, settings).await;
        assert_eq!(broker.connect_attempts(), attempts + 1);
        multi.clone().run(CancellationToken::new()).await.unwrap();

        // four confirms in flight on one connection instead of one
        let totals = multi.counters().snapshot();
        assert!(totals.confirmed >= 36, "confirmed {}", totals.confirmed);
        assert_eq!(totals.errors, 0);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nacks_are_counted_not_fatal() {
        let broker = InMemoryBroker::new();
        broker.set_nack_every(4);
        let settings = ProducerSettings {
            deadline: Some(Duration::from_secs(1)),
            ..Default::default()
        };
        let worker = producer(&broker, 400, 1, settings).await;

        worker.clone().run(CancellationToken::new()).await.unwrap();

        let totals = worker.counters().snapshot();
        assert!(totals.rejected > 0);
        assert_eq!(totals.confirmed + totals.rejected, totals.sent);
        assert_eq!(totals.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_confirm_finishes_on_stop() {
        let broker = InMemoryBroker::new();
        broker.set_confirm_latency(Duration::from_millis(500));
        let worker = producer(&broker, 0, 2, ProducerSettings::default()).await;

        let stop = CancellationToken::new();
        let run = tokio::spawn(worker.clone().run(stop.clone()));
        tokio::time::sleep(Duration::from_millis(1_250)).await;
        stop.cancel();
        run.await.unwrap().unwrap();

        let totals = worker.counters().snapshot();
        assert!(totals.sent >= 4);
        assert_eq!(totals.confirmed, totals.sent);
        assert_eq!(totals.errors, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waits_while_connection_blocked() {
        let broker = InMemoryBroker::new();
        let settings = ProducerSettings {
            deadline: Some(Duration::from_secs(3)),
            ..Default::default()
        };
        let worker = producer(&broker, 100, 1, settings).await;

        let run = tokio::spawn(worker.clone().run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        broker.block("memory alarm");
        tokio::time::sleep(Duration::from_millis(10)).await;
        let at_block = worker.counters().snapshot().sent;

        tokio::time::sleep(Duration::from_millis(1_000)).await;
        // at most the publish already in flight when the alarm fired
        assert!(worker.counters().snapshot().sent <= at_block + 1);

        broker.unblock();
        run.await.unwrap().unwrap();

        let totals = worker.counters().snapshot();
        // roughly two of the three seconds were spent publishing
        assert!(
            (190..=215).contains(&totals.confirmed),
            "confirmed {}",
            totals.confirmed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_pool_ends_worker() {
        let broker = InMemoryBroker::new();
        let worker = producer(&broker, 50, 1, ProducerSettings::default()).await;

        let run = tokio::spawn(worker.clone().run(CancellationToken::new()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        broker.fail_endpoint("node1:5672");
        broker.kill_connections();

        let started = Instant::now();
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, LoadGenError::ConnectionExhausted { .. }));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert!(worker.counters().snapshot().confirmed > 0);
    }
}
