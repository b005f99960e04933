//! In-process broker used by tests and `--simulate` runs.
//!
//! Behaves like a single-vhost RabbitMQ node as far as the load generator
//! can observe it: publisher confirms, push delivery bounded by prefetch,
//! cumulative acks, requeue of unacked messages when a channel goes away,
//! and connection-level blocking. Faults can be injected per endpoint.

use super::traits::{
    BrokerConnection, BrokerConnector, Confirmation, Delivery, FlowEvent, Publisher,
    QueueDepthSource, QueueInfo, Subscription,
};
use crate::config::QueueType;
use crate::error::{LoadGenError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Bytes,
    redelivered: bool,
}

struct MemQueue {
    name: String,
    queue_type: QueueType,
    ready: Mutex<VecDeque<StoredMessage>>,
    unacked: AtomicU64,
    consumers: AtomicU64,
    notify: Notify,
}

impl MemQueue {
    fn new(name: &str, queue_type: QueueType) -> Self {
        Self {
            name: name.to_string(),
            queue_type,
            ready: Mutex::new(VecDeque::new()),
            unacked: AtomicU64::new(0),
            consumers: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, message: StoredMessage) {
        self.ready.lock().push_back(message);
        self.notify.notify_waiters();
    }

    fn depth(&self) -> u64 {
        self.ready.lock().len() as u64 + self.unacked.load(Ordering::Acquire)
    }
}

struct BrokerInner {
    queues: DashMap<String, Arc<MemQueue>>,
    connections: DashMap<u64, Arc<ConnectionInner>>,
    next_connection_id: AtomicU64,
    failing_endpoints: DashSet<String>,
    pending_connect_failures: AtomicU64,
    blocked: watch::Sender<Option<String>>,
    confirm_latency: Mutex<Duration>,
    nack_every: AtomicU64,
    strict_routing: AtomicBool,
    published: AtomicU64,
    connect_attempts: AtomicU64,
    ack_calls: AtomicU64,
    close_calls: AtomicU64,
}

impl BrokerInner {
    fn queue(&self, name: &str) -> Arc<MemQueue> {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemQueue::new(name, QueueType::Classic)))
            .clone()
    }

    fn broadcast(&self, event: FlowEvent) {
        for connection in self.connections.iter() {
            let _ = connection.flow_tx.send(event.clone());
        }
    }
}

/// Simulated broker; clones share the same state
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<BrokerInner>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let (blocked, _) = watch::channel(None);
        Self {
            inner: Arc::new(BrokerInner {
                queues: DashMap::new(),
                connections: DashMap::new(),
                next_connection_id: AtomicU64::new(1),
                failing_endpoints: DashSet::new(),
                pending_connect_failures: AtomicU64::new(0),
                blocked,
                confirm_latency: Mutex::new(Duration::ZERO),
                nack_every: AtomicU64::new(0),
                strict_routing: AtomicBool::new(false),
                published: AtomicU64::new(0),
                connect_attempts: AtomicU64::new(0),
                ack_calls: AtomicU64::new(0),
                close_calls: AtomicU64::new(0),
            }),
        }
    }

    pub fn declare_queue(&self, name: &str, queue_type: QueueType) {
        self.inner
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemQueue::new(name, queue_type)));
    }

    /// Put messages straight onto a queue, bypassing publishers
    pub fn preload(&self, queue: &str, payloads: impl IntoIterator<Item = Bytes>) {
        let queue = self.inner.queue(queue);
        let mut ready = queue.ready.lock();
        for payload in payloads {
            ready.push_back(StoredMessage {
                payload,
                redelivered: false,
            });
        }
        drop(ready);
        queue.notify.notify_waiters();
    }

    /// Ready plus unacknowledged messages, like the management API's `messages`
    pub fn depth(&self, queue: &str) -> u64 {
        self.inner
            .queues
            .get(queue)
            .map(|q| q.depth())
            .unwrap_or(0)
    }

    pub fn set_confirm_latency(&self, latency: Duration) {
        *self.inner.confirm_latency.lock() = latency;
    }

    /// Nack every `n`th publish (0 disables)
    pub fn set_nack_every(&self, n: u64) {
        self.inner.nack_every.store(n, Ordering::Relaxed);
    }

    /// Return publishes to undeclared queues as unroutable instead of creating the queue
    pub fn set_strict_routing(&self, strict: bool) {
        self.inner.strict_routing.store(strict, Ordering::Relaxed);
    }

    pub fn fail_endpoint(&self, endpoint: &str) {
        self.inner.failing_endpoints.insert(endpoint.to_string());
    }

    pub fn restore_endpoint(&self, endpoint: &str) {
        self.inner.failing_endpoints.remove(endpoint);
    }

    /// Refuse the next `n` connection attempts on any endpoint
    pub fn fail_next_connects(&self, n: u64) {
        self.inner.pending_connect_failures.store(n, Ordering::Relaxed);
    }

    /// Raise a resource alarm: every connection gets a blocked notification and
    /// publishes stall until [`unblock`](Self::unblock)
    pub fn block(&self, reason: &str) {
        info!("Simulated broker blocking publishers: {}", reason);
        self.inner.blocked.send_replace(Some(reason.to_string()));
        self.inner.broadcast(FlowEvent::Blocked {
            reason: reason.to_string(),
        });
    }

    pub fn unblock(&self) {
        info!("Simulated broker unblocking publishers");
        self.inner.blocked.send_replace(None);
        self.inner.broadcast(FlowEvent::Unblocked);
    }

    pub fn is_blocked(&self) -> bool {
        self.inner.blocked.borrow().is_some()
    }

    /// Drop every open connection as if the network went away
    pub fn kill_connections(&self) {
        let ids: Vec<u64> = self.inner.connections.iter().map(|c| *c.key()).collect();
        for id in ids {
            if let Some((_, connection)) = self.inner.connections.remove(&id) {
                connection.open.store(false, Ordering::Release);
                connection.closed.cancel();
            }
        }
    }

    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Relaxed)
    }

    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::Relaxed)
    }

    pub fn ack_calls(&self) -> u64 {
        self.inner.ack_calls.load(Ordering::Relaxed)
    }

    /// Number of `close()` calls received, including repeated ones
    pub fn close_calls(&self) -> u64 {
        self.inner.close_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>> {
        self.inner.connect_attempts.fetch_add(1, Ordering::Relaxed);

        if self.inner.failing_endpoints.contains(endpoint) {
            return Err(LoadGenError::Connection(format!(
                "connection refused by {}",
                endpoint
            )));
        }
        let refused = self
            .inner
            .pending_connect_failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(LoadGenError::Connection(format!(
                "connection refused by {}",
                endpoint
            )));
        }

        let id = self.inner.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (flow_tx, flow_rx) = mpsc::unbounded_channel();
        if let Some(reason) = self.inner.blocked.borrow().clone() {
            let _ = flow_tx.send(FlowEvent::Blocked { reason });
        }

        let connection = Arc::new(ConnectionInner {
            id,
            endpoint: endpoint.to_string(),
            open: AtomicBool::new(true),
            closed: CancellationToken::new(),
            flow_tx,
            flow_rx: Mutex::new(Some(flow_rx)),
        });
        self.inner.connections.insert(id, connection.clone());
        debug!("Simulated connection {} opened to {}", id, endpoint);

        Ok(Arc::new(MemConnection {
            inner: connection,
            broker: self.inner.clone(),
        }))
    }
}

#[async_trait]
impl QueueDepthSource for InMemoryBroker {
    async fn queue_info(&self, queue: &str) -> Result<QueueInfo> {
        let q = self
            .inner
            .queues
            .get(queue)
            .map(|q| q.clone())
            .ok_or_else(|| LoadGenError::QueueNotFound(queue.to_string()))?;
        Ok(QueueInfo {
            name: q.name.clone(),
            queue_type: q.queue_type.to_string(),
            messages: q.depth(),
            consumers: q.consumers.load(Ordering::Relaxed),
        })
    }
}

struct ConnectionInner {
    id: u64,
    endpoint: String,
    open: AtomicBool,
    closed: CancellationToken,
    flow_tx: mpsc::UnboundedSender<FlowEvent>,
    flow_rx: Mutex<Option<mpsc::UnboundedReceiver<FlowEvent>>>,
}

impl ConnectionInner {
    fn ensure_open(&self) -> Result<()> {
        if self.open.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(LoadGenError::ConnectionClosed(format!(
                "connection {} to {} is closed",
                self.id, self.endpoint
            )))
        }
    }
}

struct MemConnection {
    inner: Arc<ConnectionInner>,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl BrokerConnection for MemConnection {
    fn id(&self) -> u64 {
        self.inner.id
    }

    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    async fn open_publisher(&self) -> Result<Box<dyn Publisher>> {
        self.inner.ensure_open()?;
        Ok(Box::new(MemPublisher {
            connection: self.inner.clone(),
            broker: self.broker.clone(),
        }))
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>> {
        self.inner.ensure_open()?;
        let queue = self.broker.queue(queue);
        queue.consumers.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemSubscription {
            connection: self.inner.clone(),
            broker: self.broker.clone(),
            queue,
            prefetch: prefetch.max(1) as usize,
            next_tag: 1,
            outstanding: VecDeque::new(),
            cancelled: false,
        }))
    }

    fn flow_events(&self) -> Option<mpsc::UnboundedReceiver<FlowEvent>> {
        self.inner.flow_rx.lock().take()
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_calls.fetch_add(1, Ordering::Relaxed);
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.broker.connections.remove(&self.inner.id);
            self.inner.closed.cancel();
            debug!("Simulated connection {} closed", self.inner.id);
        }
        Ok(())
    }
}

struct MemPublisher {
    connection: Arc<ConnectionInner>,
    broker: Arc<BrokerInner>,
}

#[async_trait]
impl Publisher for MemPublisher {
    async fn publish(
        &self,
        routing_key: &str,
        payload: Bytes,
        _persistent: bool,
    ) -> Result<Confirmation> {
        self.connection.ensure_open()?;

        // a blocked connection stops reading from the socket
        let mut blocked = self.broker.blocked.subscribe();
        let unblocked = async { blocked.wait_for(|reason| reason.is_none()).await.map(|_| ()) };
        tokio::select! {
            _ = unblocked => {}
            _ = self.connection.closed.cancelled() => {}
        }
        self.connection.ensure_open()?;

        let latency = *self.broker.confirm_latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let n = self.broker.published.fetch_add(1, Ordering::Relaxed) + 1;
        let nack_every = self.broker.nack_every.load(Ordering::Relaxed);
        if nack_every > 0 && n % nack_every == 0 {
            return Ok(Confirmation::Nack);
        }
        if self.broker.strict_routing.load(Ordering::Relaxed)
            && !self.broker.queues.contains_key(routing_key)
        {
            return Ok(Confirmation::Nack);
        }

        self.broker.queue(routing_key).push(StoredMessage {
            payload,
            redelivered: false,
        });
        Ok(Confirmation::Ack)
    }
}

struct MemSubscription {
    connection: Arc<ConnectionInner>,
    broker: Arc<BrokerInner>,
    queue: Arc<MemQueue>,
    prefetch: usize,
    next_tag: u64,
    outstanding: VecDeque<(u64, StoredMessage)>,
    cancelled: bool,
}

impl MemSubscription {
    fn try_take(&mut self) -> Option<Delivery> {
        if self.outstanding.len() >= self.prefetch {
            return None;
        }
        let message = self.queue.ready.lock().pop_front()?;
        self.queue.unacked.fetch_add(1, Ordering::AcqRel);

        let delivery_tag = self.next_tag;
        self.next_tag += 1;
        let delivery = Delivery {
            delivery_tag,
            payload: message.payload.clone(),
            redelivered: message.redelivered,
        };
        self.outstanding.push_back((delivery_tag, message));
        Some(delivery)
    }

    fn requeue_outstanding(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        let count = self.outstanding.len() as u64;
        {
            let mut ready = self.queue.ready.lock();
            while let Some((_, mut message)) = self.outstanding.pop_back() {
                message.redelivered = true;
                ready.push_front(message);
            }
        }
        self.queue.unacked.fetch_sub(count, Ordering::AcqRel);
        self.queue.notify.notify_waiters();
    }
}

#[async_trait]
impl Subscription for MemSubscription {
    async fn next_delivery(&mut self) -> Option<Result<Delivery>> {
        loop {
            if self.cancelled {
                return None;
            }
            if let Err(e) = self.connection.ensure_open() {
                return Some(Err(e));
            }

            let queue = self.queue.clone();
            let notified = queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(delivery) = self.try_take() {
                return Some(Ok(delivery));
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.connection.closed.cancelled() => {}
            }
        }
    }

    async fn ack(&mut self, delivery_tag: u64, multiple: bool) -> Result<()> {
        self.broker.ack_calls.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = self.connection.ensure_open() {
            return Err(LoadGenError::Ack(e.to_string()));
        }

        let before = self.outstanding.len();
        if multiple {
            self.outstanding.retain(|(tag, _)| *tag > delivery_tag);
        } else {
            self.outstanding.retain(|(tag, _)| *tag != delivery_tag);
        }
        let acked = (before - self.outstanding.len()) as u64;
        if acked == 0 {
            return Err(LoadGenError::Ack(format!(
                "unknown delivery tag {}",
                delivery_tag
            )));
        }

        self.queue.unacked.fetch_sub(acked, Ordering::AcqRel);
        // freed prefetch capacity
        self.queue.notify.notify_waiters();
        Ok(())
    }

    async fn cancel(&mut self) -> Result<()> {
        if !self.cancelled {
            self.cancelled = true;
            self.queue.consumers.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

impl Drop for MemSubscription {
    fn drop(&mut self) {
        if !self.cancelled {
            self.queue.consumers.fetch_sub(1, Ordering::Relaxed);
        }
        self.requeue_outstanding();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    const QUEUE: &str = "test_queue";

    async fn publish_n(broker: &InMemoryBroker, n: usize) {
        let connection = broker.connect("node1:5672").await.unwrap();
        let publisher = connection.open_publisher().await.unwrap();
        for i in 0..n {
            let confirm = publisher
                .publish(QUEUE, Bytes::from(format!("msg-{}", i)), true)
                .await
                .unwrap();
            assert_eq!(confirm, Confirmation::Ack);
        }
    }

    #[tokio::test]
    async fn test_publish_consume_and_cumulative_ack() {
        let broker = InMemoryBroker::new();
        publish_n(&broker, 10).await;
        assert_eq!(broker.depth(QUEUE), 10);

        let connection = broker.connect("node1:5672").await.unwrap();
        let mut subscription = connection.subscribe(QUEUE, 100).await.unwrap();
        let mut last_tag = 0;
        for _ in 0..10 {
            let delivery = subscription.next_delivery().await.unwrap().unwrap();
            last_tag = delivery.delivery_tag;
        }
        assert_eq!(broker.depth(QUEUE), 10);

        subscription.ack(last_tag, true).await.unwrap();
        assert_eq!(broker.depth(QUEUE), 0);
        assert_eq!(broker.ack_calls(), 1);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        publish_n(&broker, 5).await;

        let connection = broker.connect("node1:5672").await.unwrap();
        let mut subscription = connection.subscribe(QUEUE, 2).await.unwrap();
        subscription.next_delivery().await.unwrap().unwrap();
        let second = subscription.next_delivery().await.unwrap().unwrap();

        let third = timeout(Duration::from_millis(50), subscription.next_delivery()).await;
        assert!(third.is_err(), "prefetch window should be full");

        subscription.ack(second.delivery_tag, true).await.unwrap();
        let third = timeout(Duration::from_millis(50), subscription.next_delivery())
            .await
            .unwrap();
        assert!(third.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_dropped_subscription_requeues() {
        let broker = InMemoryBroker::new();
        publish_n(&broker, 3).await;

        let connection = broker.connect("node1:5672").await.unwrap();
        let mut subscription = connection.subscribe(QUEUE, 10).await.unwrap();
        subscription.next_delivery().await.unwrap().unwrap();
        drop(subscription);

        let mut again = connection.subscribe(QUEUE, 10).await.unwrap();
        let redelivered = again.next_delivery().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        assert_eq!(redelivered.payload, Bytes::from("msg-0"));
        assert_eq!(broker.depth(QUEUE), 3);
    }

    #[tokio::test]
    async fn test_nack_injection() {
        let broker = InMemoryBroker::new();
        broker.set_nack_every(2);
        let connection = broker.connect("node1:5672").await.unwrap();
        let publisher = connection.open_publisher().await.unwrap();

        let mut nacks = 0;
        for _ in 0..10 {
            if publisher.publish(QUEUE, Bytes::from_static(b"x"), false).await.unwrap()
                == Confirmation::Nack
            {
                nacks += 1;
            }
        }
        assert_eq!(nacks, 5);
        assert_eq!(broker.depth(QUEUE), 5);
    }

    #[tokio::test]
    async fn test_strict_routing_returns_unroutable_publishes() {
        let broker = InMemoryBroker::new();
        broker.set_strict_routing(true);
        broker.declare_queue(QUEUE, QueueType::Quorum);
        let connection = broker.connect("node1:5672").await.unwrap();
        let publisher = connection.open_publisher().await.unwrap();

        let missing = publisher
            .publish("no_such_queue", Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        assert_eq!(missing, Confirmation::Nack);
        assert_eq!(broker.depth("no_such_queue"), 0);

        let routed = publisher.publish(QUEUE, Bytes::from_static(b"x"), true).await.unwrap();
        assert_eq!(routed, Confirmation::Ack);
        assert_eq!(broker.depth(QUEUE), 1);
    }

    #[tokio::test]
    async fn test_block_emits_events_and_stalls_publishes() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("node1:5672").await.unwrap();
        let mut events = connection.flow_events().unwrap();
        assert!(connection.flow_events().is_none());

        broker.block("memory alarm");
        assert_eq!(
            events.recv().await.unwrap(),
            FlowEvent::Blocked {
                reason: "memory alarm".to_string()
            }
        );

        let publisher = connection.open_publisher().await.unwrap();
        let stalled = timeout(
            Duration::from_millis(50),
            publisher.publish(QUEUE, Bytes::from_static(b"x"), true),
        )
        .await;
        assert!(stalled.is_err());
        assert_eq!(broker.published(), 0);

        broker.unblock();
        assert_eq!(events.recv().await.unwrap(), FlowEvent::Unblocked);
        publisher
            .publish(QUEUE, Bytes::from_static(b"x"), true)
            .await
            .unwrap();
        assert_eq!(broker.published(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure_injection() {
        let broker = InMemoryBroker::new();
        broker.fail_endpoint("node2:5672");
        assert!(broker.connect("node2:5672").await.is_err());
        assert!(broker.connect("node1:5672").await.is_ok());

        broker.fail_next_connects(2);
        assert!(broker.connect("node1:5672").await.is_err());
        assert!(broker.connect("node1:5672").await.is_err());
        assert!(broker.connect("node1:5672").await.is_ok());
        assert_eq!(broker.connect_attempts(), 5);
    }

    #[tokio::test]
    async fn test_killed_connection_fails_operations() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("node1:5672").await.unwrap();
        let mut subscription = connection.subscribe(QUEUE, 10).await.unwrap();

        broker.kill_connections();
        assert!(!connection.is_open());
        assert!(matches!(
            subscription.next_delivery().await,
            Some(Err(LoadGenError::ConnectionClosed(_)))
        ));
        assert!(matches!(
            subscription.ack(1, true).await,
            Err(LoadGenError::Ack(_))
        ));
        assert!(connection.open_publisher().await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_counted_and_idempotent() {
        let broker = InMemoryBroker::new();
        let connection = broker.connect("node1:5672").await.unwrap();
        assert_eq!(broker.open_connections(), 1);

        connection.close().await.unwrap();
        connection.close().await.unwrap();
        assert_eq!(broker.close_calls(), 2);
        assert_eq!(broker.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_queue_info() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.queue_info(QUEUE).await,
            Err(LoadGenError::QueueNotFound(_))
        ));

        broker.declare_queue(QUEUE, QueueType::Quorum);
        publish_n(&broker, 4).await;
        let info = broker.queue_info(QUEUE).await.unwrap();
        assert_eq!(info.queue_type, "quorum");
        assert_eq!(info.messages, 4);
        assert_eq!(broker.queue_depth(QUEUE).await.unwrap(), 4);
    }
}
