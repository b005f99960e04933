//! Test lifecycle: INIT → RUNNING → DRAINING → DONE.
//!
//! The orchestrator owns every worker. It connects all pools before anything
//! is spawned, polls the [`StatsAggregator`] while the test runs, stops the
//! producers first so consumers can drain the queue, and finally assembles a
//! [`TestReport`]. An interrupt at any point skips straight to DRAINING with a
//! shorter drain bound.

use crate::broker::{BrokerConnector, QueueDepthSource};
use crate::config::{Config, WorkerConfig, WorkerRole};
use crate::consumer::{ConsumerSettings, ConsumerWorker};
use crate::counters::Counters;
use crate::error::{LoadGenError, Result};
use crate::flow_control::FlowControlMonitor;
use crate::metrics::LoadGenMetrics;
use crate::pool::ConnectionPool;
use crate::producer::{ProducerSettings, ProducerWorker};
use crate::report::{RunSummary, TestReport, WorkerResult};
use crate::stats::{AggregateSnapshot, StatsAggregator};
use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock as AsyncRwLock;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TestState {
    Init,
    Running,
    Draining,
    Done,
}

/// A worker that made it past INIT, or the reason it did not
struct WorkerSlot {
    config: WorkerConfig,
    counters: Arc<Counters>,
    pool: Option<Arc<ConnectionPool>>,
    task: Option<JoinHandle<Result<()>>>,
    error: Option<String>,
}

impl WorkerSlot {
    async fn join(&mut self) {
        let Some(task) = self.task.take() else {
            return;
        };
        let outcome = match task.await {
            Ok(result) => result,
            Err(e) => Err(LoadGenError::WorkerFailed {
                worker_id: self.config.worker_id.clone(),
                reason: format!("task panicked: {}", e),
            }),
        };
        if let Err(e) = outcome {
            self.error.get_or_insert_with(|| e.to_string());
        }
    }

    fn live_connections(&self) -> usize {
        self.pool.as_ref().map_or(0, |p| p.live())
    }

    fn result(&self) -> WorkerResult {
        WorkerResult {
            worker_id: self.config.worker_id.clone(),
            role: self.config.role,
            counters: self.counters.snapshot(),
            error: self.error.clone(),
        }
    }
}

pub struct TestOrchestrator {
    config: Config,
    connector: Arc<dyn BrokerConnector>,
    depth_source: Option<Arc<dyn QueueDepthSource>>,
    monitor: Arc<FlowControlMonitor>,
    state: Arc<AsyncRwLock<TestState>>,
    interrupt: CancellationToken,
    metrics: Option<Arc<LoadGenMetrics>>,
}

impl TestOrchestrator {
    pub fn new(
        config: Config,
        connector: Arc<dyn BrokerConnector>,
        depth_source: Option<Arc<dyn QueueDepthSource>>,
    ) -> Self {
        Self {
            config,
            connector,
            depth_source,
            monitor: FlowControlMonitor::new(),
            state: Arc::new(AsyncRwLock::new(TestState::Init)),
            interrupt: CancellationToken::new(),
            metrics: None,
        }
    }

    /// Export snapshot values to this registry; one is created on demand when
    /// `metrics.listen` is configured
    pub fn with_metrics(mut self, metrics: Arc<LoadGenMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn monitor(&self) -> &Arc<FlowControlMonitor> {
        &self.monitor
    }

    pub async fn state(&self) -> TestState {
        *self.state.read().await
    }

    /// Token that interrupts the run when cancelled, e.g. from a signal handler
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Request a graceful stop; repeated calls have no further effect
    pub fn stop(&self) {
        if !self.interrupt.is_cancelled() {
            info!("Stop requested, draining");
        }
        self.interrupt.cancel();
    }

    /// Run the whole test once.
    ///
    /// Configuration problems, a failed queue check with
    /// `queue.require_existing`, and a role with no reachable workers are
    /// returned as errors before any worker starts.
    pub async fn run(&self) -> Result<TestReport> {
        {
            let state = self.state.read().await;
            if *state != TestState::Init {
                return Err(LoadGenError::InvalidOperation(format!(
                    "Cannot run test in state {:?}",
                    *state
                )));
            }
        }
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let config = &self.config;
        config.validate()?;
        self.verify_queue().await?;

        let metrics = match (&self.metrics, &config.metrics.listen) {
            (Some(metrics), _) => Some(metrics.clone()),
            (None, Some(_)) => Some(LoadGenMetrics::new()?),
            (None, None) => None,
        };
        let metrics_shutdown = CancellationToken::new();
        let metrics_server = match (&metrics, &config.metrics.listen) {
            (Some(metrics), Some(listen)) => {
                let addr: SocketAddr = listen.parse().map_err(|e| {
                    LoadGenError::InvalidConfig(format!("metrics.listen '{}': {}", listen, e))
                })?;
                Some(metrics.serve(addr, metrics_shutdown.clone())?.1)
            }
            _ => None,
        };

        let mut producers = self.connect_role(config.producer_worker_configs()).await;
        let mut consumers = self.connect_role(config.consumer_worker_configs()).await;

        if self.interrupt.is_cancelled() {
            warn!("Test interrupted during startup, closing opened pools");
            self.set_state(TestState::Draining).await;
            self.abort_init(&producers, &consumers, &metrics_shutdown).await;
            if let Some(server) = metrics_server {
                let _ = server.await;
            }
            let workers = producers
                .iter()
                .chain(consumers.iter())
                .map(WorkerSlot::result)
                .collect();
            return Ok(TestReport::build(
                RunSummary {
                    run_id,
                    queue: config.queue.name.clone(),
                    started_at,
                    finished_at: Utc::now(),
                    interrupted: true,
                    target_rate: config.producer.target_rate,
                    message_size: config.producer.message_size,
                    running_secs: 0.0,
                    consuming_secs: 0.0,
                    drained: false,
                    final_queue_depth: None,
                    blocked_seconds: 0.0,
                    workers,
                    snapshots: Vec::new(),
                },
                &config.thresholds,
            ));
        }

        for (role, slots) in [(WorkerRole::Producer, &producers), (WorkerRole::Consumer, &consumers)] {
            if !slots.is_empty() && slots.iter().all(|s| s.pool.is_none()) {
                let reasons: Vec<String> = slots.iter().filter_map(|s| s.error.clone()).collect();
                self.abort_init(&producers, &consumers, &metrics_shutdown).await;
                return Err(LoadGenError::EndpointsUnreachable(format!(
                    "no {} worker could connect: {}",
                    role,
                    reasons.join("; ")
                )));
            }
        }

        let mut aggregator = StatsAggregator::new(
            &config.queue.name,
            config.producer.target_rate,
            config.thresholds.clone(),
            self.monitor.clone(),
            self.depth_source.clone(),
        );
        for slot in producers.iter().chain(consumers.iter()) {
            aggregator.register(&slot.config.worker_id, slot.config.role, slot.counters.clone());
        }

        // Consumers subscribe first so the first published messages are not left waiting
        let consumer_stop = CancellationToken::new();
        let producer_stop = CancellationToken::new();
        for slot in consumers.iter_mut() {
            if let Some(pool) = &slot.pool {
                let worker = Arc::new(ConsumerWorker::new(
                    slot.config.clone(),
                    ConsumerSettings::from_config(config),
                    pool.clone(),
                    slot.counters.clone(),
                ));
                let stop = consumer_stop.clone();
                slot.task = Some(tokio::spawn(worker.run(stop)));
            }
        }
        for slot in producers.iter_mut() {
            if let Some(pool) = &slot.pool {
                let worker = match ProducerWorker::new(
                    slot.config.clone(),
                    ProducerSettings::from_config(config),
                    pool.clone(),
                    self.monitor.clone(),
                    slot.counters.clone(),
                ) {
                    Ok(worker) => Arc::new(worker),
                    Err(e) => {
                        consumer_stop.cancel();
                        producer_stop.cancel();
                        self.abort_init(&producers, &consumers, &metrics_shutdown).await;
                        return Err(e);
                    }
                };
                let stop = producer_stop.clone();
                slot.task = Some(tokio::spawn(worker.run(stop)));
            }
        }

        let consuming_started = Instant::now();
        aggregator.reset_clock();
        self.set_state(TestState::Running).await;
        aggregator.set_state(TestState::Running);
        info!(
            "Test {} running for {}s: {} producers, {} consumers, target {}",
            run_id,
            config.test.duration_secs,
            producers.len(),
            consumers.len(),
            if config.producer.target_rate == 0 {
                "unlimited".to_string()
            } else {
                format!("{} msg/s", config.producer.target_rate)
            }
        );

        let live = |p: &[WorkerSlot], c: &[WorkerSlot]| -> usize {
            p.iter().chain(c.iter()).map(WorkerSlot::live_connections).sum()
        };

        let poll_interval = config.test.poll_interval();
        let deadline = consuming_started + config.test.duration();
        let mut ticker = interval_at(consuming_started + poll_interval, poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let interrupted = loop {
            tokio::select! {
                _ = self.interrupt.cancelled() => break true,
                _ = tokio::time::sleep_until(deadline) => break false,
                _ = ticker.tick() => {
                    let snapshot = aggregator.poll().await;
                    log_progress(&snapshot);
                    if let Some(metrics) = &metrics {
                        metrics.observe(&snapshot, live(&producers, &consumers));
                    }
                }
            }
        };
        if interrupted {
            warn!(
                "Test interrupted after {:.1}s, draining",
                consuming_started.elapsed().as_secs_f64()
            );
        }

        // DRAINING
        self.set_state(TestState::Draining).await;
        aggregator.set_state(TestState::Draining);
        producer_stop.cancel();
        let running_secs = consuming_started.elapsed().as_secs_f64();
        let blocked_seconds = self.monitor.blocked_seconds();
        join_all(producers.iter_mut().map(|slot| slot.join())).await;

        let max_drain = if interrupted {
            config.test.interrupt_drain().min(config.test.max_drain())
        } else {
            config.test.max_drain()
        };
        let has_consumers = consumers.iter().any(|s| s.task.is_some());
        let drained = if has_consumers {
            self.drain(&mut aggregator, max_drain, metrics.as_deref(), || {
                live(&producers, &consumers)
            })
            .await
        } else {
            false
        };
        let interrupted = interrupted || self.interrupt.is_cancelled();

        consumer_stop.cancel();
        join_all(consumers.iter_mut().map(|slot| slot.join())).await;
        let consuming_secs = consuming_started.elapsed().as_secs_f64();

        // DONE
        aggregator.set_state(TestState::Done);
        let last = aggregator.poll().await;
        if let Some(metrics) = &metrics {
            metrics.observe(&last, 0);
        }
        self.monitor.shutdown();
        metrics_shutdown.cancel();
        if let Some(server) = metrics_server {
            let _ = server.await;
        }

        let workers: Vec<WorkerResult> = producers
            .iter()
            .chain(consumers.iter())
            .map(WorkerSlot::result)
            .collect();
        for failed in workers.iter().filter(|w| w.error.is_some()) {
            error!(
                "Worker {} failed: {}",
                failed.worker_id,
                failed.error.as_deref().unwrap_or_default()
            );
        }

        let report = TestReport::build(
            RunSummary {
                run_id,
                queue: config.queue.name.clone(),
                started_at,
                finished_at: Utc::now(),
                interrupted,
                target_rate: config.producer.target_rate,
                message_size: config.producer.message_size,
                running_secs,
                consuming_secs,
                drained: drained || (!has_consumers && last.queue_depth == Some(0)),
                final_queue_depth: last.queue_depth,
                blocked_seconds,
                workers,
                snapshots: aggregator.into_snapshots(),
            },
            &config.thresholds,
        );
        self.set_state(TestState::Done).await;
        info!(
            "Test finished: {} (producer {:.1} msg/s, consumer {:.1} msg/s)",
            report.classification, report.achieved_producer_rate, report.achieved_consumer_rate
        );
        Ok(report)
    }

    /// Keep consumers running for at least `drain_grace` and at most `max_drain`,
    /// returning whether the queue emptied
    async fn drain(
        &self,
        aggregator: &mut StatsAggregator,
        max_drain: Duration,
        metrics: Option<&LoadGenMetrics>,
        live: impl Fn() -> usize,
    ) -> bool {
        let started = Instant::now();
        let mut max_drain = max_drain;
        let mut grace = self.config.test.drain_grace().min(max_drain);
        let check_every = self.config.test.poll_interval().min(Duration::from_millis(250));
        info!(
            "Draining for at least {:.1}s, at most {:.1}s",
            grace.as_secs_f64(),
            max_drain.as_secs_f64()
        );
        let mut interrupted = self.interrupt.is_cancelled();

        loop {
            let snapshot = aggregator.poll().await;
            if let Some(metrics) = metrics {
                metrics.observe(&snapshot, live());
            }
            let complete = drain_complete(&snapshot);
            let elapsed = started.elapsed();
            if complete && elapsed >= grace {
                info!("Queue drained after {:.1}s", elapsed.as_secs_f64());
                return true;
            }
            if elapsed >= max_drain {
                if !complete {
                    warn!(
                        "Drain gave up after {:.1}s with {} messages left",
                        elapsed.as_secs_f64(),
                        snapshot
                            .queue_depth
                            .unwrap_or_else(|| snapshot.producers.confirmed.saturating_sub(snapshot.consumers.received))
                    );
                }
                return complete;
            }
            tokio::select! {
                _ = sleep(check_every.min(max_drain - elapsed)) => {}
                _ = self.interrupt.cancelled(), if !interrupted => {
                    interrupted = true;
                    let elapsed = started.elapsed();
                    max_drain = max_drain.min(elapsed + self.config.test.interrupt_drain());
                    grace = grace.min(max_drain);
                    warn!(
                        "Drain interrupted after {:.1}s, giving up by {:.1}s",
                        elapsed.as_secs_f64(),
                        max_drain.as_secs_f64()
                    );
                }
            }
        }
    }

    /// Best-effort by default; fatal only with `queue.require_existing`
    async fn verify_queue(&self) -> Result<()> {
        let queue = &self.config.queue;
        let Some(source) = &self.depth_source else {
            if queue.require_existing {
                return Err(LoadGenError::InvalidConfig(
                    "queue.require_existing needs a management API to check against".to_string(),
                ));
            }
            warn!("No management API configured, skipping queue verification");
            return Ok(());
        };

        let problem = match source.queue_info(&queue.name).await {
            Ok(info) if info.queue_type == queue.queue_type.to_string() => {
                info!(
                    "Queue {} verified: type={} messages={} consumers={}",
                    info.name, info.queue_type, info.messages, info.consumers
                );
                return Ok(());
            }
            Ok(info) => LoadGenError::QueueTypeMismatch {
                queue: queue.name.clone(),
                expected: queue.queue_type.to_string(),
                actual: info.queue_type,
            },
            Err(e) => e,
        };

        if queue.require_existing {
            error!("Queue verification failed: {}", problem);
            Err(problem)
        } else {
            warn!("Queue verification failed, continuing: {}", problem);
            Ok(())
        }
    }

    /// Open every worker's pool concurrently; failures are kept per worker.
    /// An interrupt abandons connects still in progress.
    async fn connect_role(&self, configs: Vec<WorkerConfig>) -> Vec<WorkerSlot> {
        let connects = configs.into_iter().map(|wc| async move {
            let pool = ConnectionPool::connect_with_channels(
                &wc.worker_id,
                &wc.endpoints,
                wc.connections,
                wc.channels_per_connection,
                self.connector.clone(),
                self.config.retry.clone(),
                self.monitor.clone(),
                &self.interrupt,
            )
            .await;
            let (pool, error) = match pool {
                Ok(pool) => (Some(pool), None),
                Err(e) => {
                    error!("Worker {} could not start: {}", wc.worker_id, e);
                    (None, Some(e.to_string()))
                }
            };
            WorkerSlot {
                config: wc,
                counters: Arc::new(Counters::new()),
                pool,
                task: None,
                error,
            }
        });
        join_all(connects).await
    }

    async fn abort_init(
        &self,
        producers: &[WorkerSlot],
        consumers: &[WorkerSlot],
        metrics_shutdown: &CancellationToken,
    ) {
        let pools = producers.iter().chain(consumers.iter()).filter_map(|s| s.pool.clone());
        join_all(pools.map(|pool| async move { pool.close_all().await })).await;
        self.monitor.shutdown();
        metrics_shutdown.cancel();
        self.set_state(TestState::Done).await;
    }

    async fn set_state(&self, next: TestState) {
        let mut state = self.state.write().await;
        if *state != next {
            info!("Test state {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

fn drain_complete(snapshot: &AggregateSnapshot) -> bool {
    match snapshot.queue_depth {
        Some(depth) => depth == 0,
        None => snapshot.consumers.received >= snapshot.producers.confirmed,
    }
}

fn log_progress(snapshot: &AggregateSnapshot) {
    let depth = snapshot
        .queue_depth
        .map_or_else(|| "n/a".to_string(), |d| d.to_string());
    info!(
        "[{:>7.1}s] publish {:>8.0}/s confirm {:>8.0}/s consume {:>8.0}/s depth {:>8} blocked {:.1}s{}{}",
        snapshot.elapsed_secs,
        snapshot.publish_rate,
        snapshot.confirm_rate,
        snapshot.consume_rate,
        depth,
        snapshot.blocked_seconds,
        if snapshot.producer_below_target { " [below target]" } else { "" },
        if snapshot.consumer_falling_behind { " [consumers behind]" } else { "" },
    );
}
