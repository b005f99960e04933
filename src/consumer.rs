//! Push-subscription consumer worker with batched cumulative acks.

use crate::broker::Subscription;
use crate::config::{Config, WorkerConfig};
use crate::counters::Counters;
use crate::error::{LoadGenError, Result};
use crate::payload;
use crate::pool::{ConnectionPool, PooledHandle};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub prefetch: u16,
    pub batch_ack_size: usize,
    /// Oldest a pending ack may get before the partial batch is flushed
    pub batch_ack_timeout: Duration,
    pub processing_delay: Option<Duration>,
    /// Decode each payload header and count size mismatches
    pub verify_payloads: bool,
}

impl ConsumerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            prefetch: config.consumer.prefetch_count,
            batch_ack_size: config.consumer.batch_ack_size,
            batch_ack_timeout: config.consumer.batch_ack_timeout(),
            processing_delay: config.consumer.processing_delay(),
            verify_payloads: true,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Delivery tags waiting for one cumulative ack
#[derive(Debug)]
pub struct AckBatch {
    max_size: usize,
    pending: usize,
    last_tag: Option<u64>,
    oldest: Option<Instant>,
}

impl AckBatch {
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size: max_size.max(1),
            pending: 0,
            last_tag: None,
            oldest: None,
        }
    }

    /// Add a tag; returns true once the batch is full
    pub fn push(&mut self, delivery_tag: u64) -> bool {
        if self.pending == 0 {
            self.oldest = Some(Instant::now());
        }
        self.pending += 1;
        self.last_tag = Some(self.last_tag.map_or(delivery_tag, |t| t.max(delivery_tag)));
        self.is_full()
    }

    pub fn len(&self) -> usize {
        self.pending
    }

    pub fn is_empty(&self) -> bool {
        self.pending == 0
    }

    pub fn is_full(&self) -> bool {
        self.pending >= self.max_size
    }

    /// When the oldest pending ack reaches `max_age`
    pub fn flush_deadline(&self, max_age: Duration) -> Option<Instant> {
        self.oldest.map(|oldest| oldest + max_age)
    }

    /// Highest tag and count to acknowledge, leaving the batch empty
    pub fn take(&mut self) -> Option<(u64, usize)> {
        let tag = self.last_tag.take()?;
        let count = std::mem::take(&mut self.pending);
        self.oldest = None;
        Some((tag, count))
    }

    /// Forget pending tags whose channel is gone; the broker redelivers them
    pub fn discard(&mut self) -> usize {
        self.take().map(|(_, count)| count).unwrap_or(0)
    }
}

pub struct ConsumerWorker {
    config: WorkerConfig,
    settings: ConsumerSettings,
    pool: Arc<ConnectionPool>,
    counters: Arc<Counters>,
}

enum LaneExit {
    Stopped,
    Resubscribe,
}

impl ConsumerWorker {
    pub fn new(
        config: WorkerConfig,
        settings: ConsumerSettings,
        pool: Arc<ConnectionPool>,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            config,
            settings,
            pool,
            counters,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn counters(&self) -> &Arc<Counters> {
        &self.counters
    }

    /// Consume until `stop` fires, flush pending acks, then close the pool
    pub async fn run(self: Arc<Self>, stop: CancellationToken) -> Result<()> {
        let lanes = self.pool.live_channels().max(1);
        info!(
            "Consumer {} starting: {} subscriptions, prefetch {}, ack batch {}",
            self.config.worker_id, lanes, self.settings.prefetch, self.settings.batch_ack_size
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
                    reason: format!("consume lane panicked: {}", e),
                }),
            };
            if let Err(e) = result {
                failure.get_or_insert(e);
            }
        }

        self.pool.close_all().await;

        let totals = self.counters.snapshot();
        match failure {
            Some(e) => {
                error!(
                    "Consumer {} failed after {} acked: {}",
                    self.config.worker_id, totals.acked, e
                );
                Err(e)
            }
            None => {
                info!(
                    "Consumer {} finished: received={} acked={} errors={} integrity_failures={}",
                    self.config.worker_id,
                    totals.received,
                    totals.acked,
                    totals.errors,
                    totals.integrity_failures
                );
                Ok(())
            }
        }
    }

    async fn lane(&self, lane: usize, stop: CancellationToken) -> Result<()> {
        loop {
            if stop.is_cancelled() {
                return Ok(());
            }

            let acquired = tokio::select! {
                biased;
                _ = stop.cancelled() => return Ok(()),
                acquired = self.pool.acquire() => acquired,
            };
            let handle = match acquired {
                Ok(handle) => handle,
                Err(_) if self.pool.is_closed() => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    self.counters.record_error();
                    warn!("Consumer {} could not get a connection: {}", self.config.worker_id, e);
                    continue;
                }
            };

            let subscription = match handle
                .connection()
                .subscribe(&self.config.queue, self.settings.prefetch)
                .await
            {
                Ok(subscription) => subscription,
                Err(e) => {
                    self.counters.record_error();
                    warn!(
                        "Consumer {} failed to subscribe to {} on connection {}: {}",
                        self.config.worker_id,
                        self.config.queue,
                        handle.id(),
                        e
                    );
                    // back off before the pool hands out the same connection again
                    tokio::select! {
                        _ = stop.cancelled() => return Ok(()),
                        _ = sleep(Duration::from_millis(100)) => {}
                    }
                    continue;
                }
            };
            debug!(
                "Consumer {} lane {} subscribed on connection {}",
                self.config.worker_id,
                lane,
                handle.id()
            );

            match self.consume(handle, subscription, &stop).await {
                LaneExit::Stopped => return Ok(()),
                LaneExit::Resubscribe => {
                    info!(
                        "Consumer {} lane {} reconnecting and resubscribing",
                        self.config.worker_id, lane
                    );
                }
            }
        }
    }

    async fn consume(
        &self,
        handle: PooledHandle,
        mut subscription: Box<dyn Subscription>,
        stop: &CancellationToken,
    ) -> LaneExit {
        let mut batch = AckBatch::new(self.settings.batch_ack_size);

        let exit = loop {
            let flush_at = batch.flush_deadline(self.settings.batch_ack_timeout);

            tokio::select! {
                biased;
                _ = stop.cancelled() => break LaneExit::Stopped,
                _ = sleep_until(flush_at.unwrap_or_else(Instant::now)), if flush_at.is_some() => {
                    if self.flush(subscription.as_mut(), &mut batch).await.is_err() {
                        break LaneExit::Resubscribe;
                    }
                }
                delivery = subscription.next_delivery() => match delivery {
                    Some(Ok(delivery)) => {
                        self.counters.record_received(delivery.payload.len());
                        if self.settings.verify_payloads {
                            if let Err(e) = payload::verify(&delivery.payload) {
                                self.counters.record_integrity_failure();
                                debug!("Consumer {} payload check failed: {}", self.config.worker_id, e);
                            }
                        }
                        if let Some(delay) = self.settings.processing_delay {
                            sleep(delay).await;
                        }
                        if batch.push(delivery.delivery_tag)
                            && self.flush(subscription.as_mut(), &mut batch).await.is_err()
                        {
                            break LaneExit::Resubscribe;
                        }
                    }
                    Some(Err(e)) => {
                        self.counters.record_error();
                        warn!(
                            "Consumer {} subscription on connection {} failed: {}",
                            self.config.worker_id,
                            handle.id(),
                            e
                        );
                        let dropped = batch.discard();
                        if dropped > 0 {
                            debug!("Consumer {} dropped {} unacked tags", self.config.worker_id, dropped);
                        }
                        break LaneExit::Resubscribe;
                    }
                    None => {
                        warn!(
                            "Consumer {} subscription on connection {} ended by broker",
                            self.config.worker_id,
                            handle.id()
                        );
                        break LaneExit::Resubscribe;
                    }
                }
            }
        };

        if matches!(exit, LaneExit::Stopped) {
            // ack what was received before unsubscribing
            let _ = self.flush(subscription.as_mut(), &mut batch).await;
            if let Err(e) = subscription.cancel().await {
                debug!("Consumer {} cancel failed: {}", self.config.worker_id, e);
            }
        }
        drop(subscription);
        drop(handle);
        exit
    }

    async fn flush(&self, subscription: &mut dyn Subscription, batch: &mut AckBatch) -> Result<()> {
        let Some((tag, count)) = batch.take() else {
            return Ok(());
        };
        match subscription.ack(tag, true).await {
            Ok(()) => {
                self.counters.record_acked(count as u64);
                Ok(())
            }
            Err(e) => {
                self.counters.record_error();
                warn!(
                    "Consumer {} failed to ack {} messages up to tag {}: {}",
                    self.config.worker_id, count, tag, e
                );
                Err(e)
            }
        }
    }
}
