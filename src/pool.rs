//! Per-worker broker connection pool.
//!
//! Connections are opened eagerly at construction, spread over the worker's
//! endpoint list. Each connection carries `channels_per_connection` channel
//! slots, and slots are handed out least-recently-used first, so consecutive
//! checkouts land on different connections. A slot whose connection has died
//! re-establishes it on its next checkout, failing over through the endpoint
//! list with bounded exponential backoff; sibling slots then pick up the
//! replacement instead of dialing again.

use crate::broker::{BrokerConnection, BrokerConnector, Publisher};
use crate::config::RetryConfig;
use crate::error::{LoadGenError, Result};
use crate::flow_control::FlowControlMonitor;
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// A broker connection shared by every channel slot opened on it
struct SharedConnection {
    current: Mutex<(usize, Arc<dyn BrokerConnection>)>,
    reconnecting: AsyncMutex<()>,
    lost: AtomicBool,
}

impl SharedConnection {
    fn new(endpoint_index: usize, connection: Arc<dyn BrokerConnection>) -> Arc<Self> {
        Arc::new(Self {
            current: Mutex::new((endpoint_index, connection)),
            reconnecting: AsyncMutex::new(()),
            lost: AtomicBool::new(false),
        })
    }

    fn current(&self) -> (usize, Arc<dyn BrokerConnection>) {
        let current = self.current.lock();
        (current.0, current.1.clone())
    }

    fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }
}

/// One channel slot on a pooled connection, with the publish channel opened on it
pub struct ConnectionHandle {
    shared: Arc<SharedConnection>,
    channel: usize,
    connection: Arc<dyn BrokerConnection>,
    publisher: Option<Box<dyn Publisher>>,
    last_used: Instant,
}

impl ConnectionHandle {
    fn new(shared: Arc<SharedConnection>, channel: usize) -> Self {
        let (_, connection) = shared.current();
        Self {
            shared,
            channel,
            connection,
            publisher: None,
            last_used: Instant::now(),
        }
    }

    /// Connection id; slots on the same connection share it
    pub fn id(&self) -> u64 {
        self.connection.id()
    }

    /// Slot number on its connection, starting at 0
    pub fn channel(&self) -> usize {
        self.channel
    }

    pub fn endpoint(&self) -> &str {
        self.connection.endpoint()
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    pub fn connection(&self) -> &Arc<dyn BrokerConnection> {
        &self.connection
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    /// Confirm-mode channel for this slot, opened on first use
    pub async fn publisher(&mut self) -> Result<&dyn Publisher> {
        if self.publisher.is_none() {
            let publisher = self.connection.open_publisher().await?;
            self.publisher = Some(publisher);
        }
        self.publisher
            .as_deref()
            .ok_or_else(|| LoadGenError::Channel("publisher channel unavailable".to_string()))
    }

    /// Drop the cached channel so the next publish opens a fresh one
    pub fn reset_publisher(&mut self) {
        self.publisher = None;
    }

    fn rebind(&mut self, connection: Arc<dyn BrokerConnection>) {
        self.connection = connection;
        self.publisher = None;
    }
}

#[derive(Default)]
struct PoolState {
    idle: VecDeque<ConnectionHandle>,
    live: usize,
    connections: HashMap<u64, Arc<dyn BrokerConnection>>,
}

pub struct ConnectionPool {
    worker_id: String,
    configured: usize,
    channels: usize,
    endpoints: Vec<String>,
    connector: Arc<dyn BrokerConnector>,
    retry: RetryConfig,
    monitor: Arc<FlowControlMonitor>,
    state: Mutex<PoolState>,
    available: Semaphore,
    closed: AtomicBool,
}

impl ConnectionPool {
    /// Open `connections` single-channel connections, cycling through `endpoints`
    pub async fn connect(
        worker_id: &str,
        endpoints: &[String],
        connections: usize,
        connector: Arc<dyn BrokerConnector>,
        retry: RetryConfig,
        monitor: Arc<FlowControlMonitor>,
    ) -> Result<Arc<Self>> {
        Self::connect_with_channels(
            worker_id,
            endpoints,
            connections,
            1,
            connector,
            retry,
            monitor,
            &CancellationToken::new(),
        )
        .await
    }

    /// Open `connections` connections with `channels` slots each.
    ///
    /// Endpoints that stay unreachable after every retry are skipped with a
    /// degraded-capacity warning; the pool only fails if nothing connected.
    /// Cancelling `cancel` abandons the remaining attempts and closes whatever
    /// was opened.
    #[allow(clippy::too_many_arguments)]
    #[instrument(skip(endpoints, connector, retry, monitor, cancel))]
    pub async fn connect_with_channels(
        worker_id: &str,
        endpoints: &[String],
        connections: usize,
        channels: usize,
        connector: Arc<dyn BrokerConnector>,
        retry: RetryConfig,
        monitor: Arc<FlowControlMonitor>,
        cancel: &CancellationToken,
    ) -> Result<Arc<Self>> {
        if connections == 0 || channels == 0 {
            return Err(LoadGenError::InvalidConfig(format!(
                "worker {} configured with {} connections of {} channels",
                worker_id, connections, channels
            )));
        }
        if endpoints.is_empty() {
            return Err(LoadGenError::InvalidConfig(format!(
                "worker {} has no broker endpoints",
                worker_id
            )));
        }

        let pool = Arc::new(Self {
            worker_id: worker_id.to_string(),
            configured: connections,
            channels,
            endpoints: endpoints.to_vec(),
            connector,
            retry,
            monitor,
            state: Mutex::new(PoolState::default()),
            available: Semaphore::new(0),
            closed: AtomicBool::new(false),
        });

        let attempts = (0..connections).map(|slot| {
            let pool = pool.clone();
            let endpoint_index = slot % pool.endpoints.len();
            async move {
                let endpoint = &pool.endpoints[endpoint_index];
                let connected = tokio::select! {
                    connected = pool.connect_with_retry(endpoint) => connected,
                    _ = cancel.cancelled() => Err(LoadGenError::Connection(
                        "interrupted while connecting".to_string(),
                    )),
                };
                connected
                    .map(|connection| SharedConnection::new(endpoint_index, connection))
                    .map_err(|e| (endpoint.clone(), e))
            }
        });

        let mut opened = Vec::new();
        let mut failures = Vec::new();
        for result in join_all(attempts).await {
            match result {
                Ok(shared) => opened.push(shared),
                Err((endpoint, e)) => {
                    warn!("Worker {} gave up on {}: {}", worker_id, endpoint, e);
                    failures.push(endpoint);
                }
            }
        }
        pool.add(&opened);

        if cancel.is_cancelled() {
            pool.close_all().await;
            return Err(LoadGenError::Connection(format!(
                "worker {} interrupted while connecting",
                worker_id
            )));
        }

        let live = pool.live();
        if live == 0 {
            return Err(LoadGenError::EndpointsUnreachable(format!(
                "worker {} could not open any of {} connections ({})",
                worker_id,
                connections,
                failures.join(", ")
            )));
        }
        if live < connections {
            warn!(
                "Worker {} running at degraded capacity: {} of {} connections live",
                worker_id, live, connections
            );
        } else {
            info!(
                "Worker {} opened {} connections with {} channels each",
                worker_id, live, channels
            );
        }
        Ok(pool)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn configured(&self) -> usize {
        self.configured
    }

    pub fn channels_per_connection(&self) -> usize {
        self.channels
    }

    /// Connections not yet given up on, whether idle or checked out
    pub fn live(&self) -> usize {
        self.state.lock().live
    }

    /// Channel slots on live connections
    pub fn live_channels(&self) -> usize {
        self.live() * self.channels
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Check out the least recently used channel slot, re-establishing its
    /// connection if it died.
    ///
    /// Fails with `ConnectionExhausted` once no live connection remains.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledHandle> {
        loop {
            self.ensure_usable()?;
            let permit = self
                .available
                .acquire()
                .await
                .map_err(|_| self.unusable_error())?;
            permit.forget();

            let handle = self.state.lock().idle.pop_front();
            let Some(mut handle) = handle else {
                continue;
            };
            if handle.shared.is_lost() {
                // slot retired with its connection
                continue;
            }

            if !handle.is_open() {
                match self.revive(&handle.shared).await {
                    Ok(connection) => handle.rebind(connection),
                    Err(e) => {
                        debug!(
                            "Worker {} dropped channel {}: {}",
                            self.worker_id, handle.channel, e
                        );
                        continue;
                    }
                }
            }

            handle.last_used = Instant::now();
            return Ok(PooledHandle {
                pool: self.clone(),
                handle: Some(handle),
            });
        }
    }

    /// Return a handle to the idle queue
    pub fn release(&self, mut handle: PooledHandle) {
        if let Some(inner) = handle.handle.take() {
            self.put_back(inner);
        }
    }

    /// Close every connection the pool opened. Later calls do nothing.
    pub async fn close_all(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("Worker {} pool already closed", self.worker_id);
            return;
        }
        self.available.close();

        let connections: Vec<Arc<dyn BrokerConnection>> = {
            let mut state = self.state.lock();
            state.idle.clear();
            state.live = 0;
            state.connections.drain().map(|(_, c)| c).collect()
        };

        let count = connections.len();
        for connection in connections {
            self.monitor.forget(connection.id());
            if let Err(e) = connection.close().await {
                debug!(
                    "Worker {} error closing connection {}: {}",
                    self.worker_id,
                    connection.id(),
                    e
                );
            }
        }
        info!("Worker {} closed {} connections", self.worker_id, count);
    }

    /// Reconnect a dead shared connection once, however many of its slots ask.
    ///
    /// On failure the connection is given up on and its slots are retired.
    async fn revive(&self, shared: &SharedConnection) -> Result<Arc<dyn BrokerConnection>> {
        let _reconnecting = shared.reconnecting.lock().await;
        if shared.is_lost() {
            return Err(LoadGenError::ConnectionClosed(
                "connection was given up on".to_string(),
            ));
        }
        let (endpoint_index, dead) = shared.current();
        if dead.is_open() {
            // a sibling slot already reconnected
            return Ok(dead);
        }

        warn!(
            "Worker {} connection {} to {} is down, reconnecting",
            self.worker_id,
            dead.id(),
            dead.endpoint()
        );
        self.discard(&dead);
        match self.reconnect(endpoint_index).await {
            Ok((endpoint_index, fresh)) => {
                if !self.track(&fresh) {
                    let _ = fresh.close().await;
                    return Err(self.unusable_error());
                }
                *shared.current.lock() = (endpoint_index, fresh.clone());
                Ok(fresh)
            }
            Err(e) => {
                shared.lost.store(true, Ordering::Release);
                let live = {
                    let mut state = self.state.lock();
                    state.live = state.live.saturating_sub(1);
                    state.live
                };
                warn!(
                    "Worker {} lost a connection for good ({} of {} live): {}",
                    self.worker_id, live, self.configured, e
                );
                if live == 0 {
                    self.available.close();
                }
                Err(e)
            }
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.is_closed() || self.state.lock().live == 0 {
            return Err(self.unusable_error());
        }
        Ok(())
    }

    fn unusable_error(&self) -> LoadGenError {
        if self.is_closed() {
            LoadGenError::InvalidOperation(format!("worker {} pool is closed", self.worker_id))
        } else {
            LoadGenError::ConnectionExhausted {
                worker_id: self.worker_id.clone(),
                live: 0,
                configured: self.configured,
            }
        }
    }

    /// Register opened connections and queue their slots, interleaved so
    /// consecutive checkouts rotate across connections
    fn add(&self, opened: &[Arc<SharedConnection>]) {
        for shared in opened {
            let (_, connection) = shared.current();
            self.track(&connection);
        }
        {
            let mut state = self.state.lock();
            state.live += opened.len();
            for channel in 0..self.channels {
                for shared in opened {
                    state.idle.push_back(ConnectionHandle::new(shared.clone(), channel));
                }
            }
        }
        self.available.add_permits(opened.len() * self.channels);
    }

    /// Start watching a connection; false once the pool is closed
    fn track(&self, connection: &Arc<dyn BrokerConnection>) -> bool {
        let mut state = self.state.lock();
        if self.is_closed() {
            return false;
        }
        state.connections.insert(connection.id(), connection.clone());
        self.monitor.watch(connection);
        true
    }

    fn discard(&self, connection: &Arc<dyn BrokerConnection>) {
        self.monitor.forget(connection.id());
        self.state.lock().connections.remove(&connection.id());
    }

    fn put_back(&self, handle: ConnectionHandle) {
        if self.is_closed() || handle.shared.is_lost() {
            return;
        }
        self.state.lock().idle.push_back(handle);
        self.available.add_permits(1);
    }

    /// Bounded retries against a single endpoint
    async fn connect_with_retry(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.connector.connect(endpoint).await {
                Ok(connection) => {
                    debug!(
                        "Worker {} connected to {} on attempt {}",
                        self.worker_id, endpoint, attempt
                    );
                    return Ok(connection);
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} to {} failed: {}",
                        attempt, endpoint, e
                    );
                    if attempt >= self.retry.max_attempts {
                        return Err(LoadGenError::Connection(format!(
                            "Failed to connect to {} after {} attempts: {}",
                            endpoint, attempt, e
                        )));
                    }
                }
            }
            sleep(self.backoff(attempt)).await;
        }
    }

    /// Like `connect_with_retry`, but each attempt moves on to the next endpoint
    async fn reconnect(&self, start_index: usize) -> Result<(usize, Arc<dyn BrokerConnection>)> {
        let mut attempt = 0;
        loop {
            if self.is_closed() {
                return Err(self.unusable_error());
            }
            let endpoint_index = (start_index + attempt as usize) % self.endpoints.len();
            let endpoint = &self.endpoints[endpoint_index];
            attempt += 1;

            match self.connector.connect(endpoint).await {
                Ok(connection) => {
                    info!(
                        "Worker {} reconnected to {} on attempt {}",
                        self.worker_id, endpoint, attempt
                    );
                    return Ok((endpoint_index, connection));
                }
                Err(e) => {
                    warn!("Reconnect attempt {} to {} failed: {}", attempt, endpoint, e);
                    if attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                }
            }
            sleep(self.backoff(attempt)).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let delay = self.retry.delay_for_attempt(attempt);
        if self.retry.jitter {
            let jitter = (delay.as_millis() as f64 * 0.1 * simple_rand()) as u64;
            delay + Duration::from_millis(jitter)
        } else {
            delay
        }
    }
}

/// Checked-out channel slot; goes back to the pool when dropped
pub struct PooledHandle {
    pool: Arc<ConnectionPool>,
    handle: Option<ConnectionHandle>,
}

impl Deref for PooledHandle {
    type Target = ConnectionHandle;

    fn deref(&self) -> &ConnectionHandle {
        // only None after release() consumed the guard
        self.handle.as_ref().unwrap_or_else(|| unreachable!())
    }
}

impl DerefMut for PooledHandle {
    fn deref_mut(&mut self) -> &mut ConnectionHandle {
        self.handle.as_mut().unwrap_or_else(|| unreachable!())
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.pool.put_back(handle);
        }
    }
}

/// Simple random number generator for jitter
fn simple_rand() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    (nanos % 1000) as f64 / 1000.0
}
