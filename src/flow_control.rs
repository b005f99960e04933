//! Broker flow control tracking.
//!
//! RabbitMQ blocks publishing connections when a memory or disk alarm fires.
//! The monitor keeps one [`BlockState`] per connection, lets producers park
//! until their connection is unblocked, and accumulates the wall-clock time
//! during which any connection was blocked so a throughput shortfall can be
//! attributed to broker backpressure.

use crate::broker::{BrokerConnection, FlowEvent};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockState {
    Unblocked,
    Blocked { reason: String, since: Instant },
}

impl BlockState {
    pub fn is_blocked(&self) -> bool {
        matches!(self, BlockState::Blocked { .. })
    }
}

#[derive(Debug, Default)]
struct BlockedTime {
    blocked_connections: usize,
    since: Option<Instant>,
    accumulated: Duration,
}

struct Tracked {
    state: watch::Sender<BlockState>,
    /// Transitions into BLOCKED seen on this connection
    episodes: AtomicU64,
}

pub struct FlowControlMonitor {
    states: DashMap<u64, Arc<Tracked>>,
    blocked_time: Mutex<BlockedTime>,
    shutdown: CancellationToken,
}

impl Default for FlowControlMonitor {
    fn default() -> Self {
        Self {
            states: DashMap::new(),
            blocked_time: Mutex::new(BlockedTime::default()),
            shutdown: CancellationToken::new(),
        }
    }
}

impl FlowControlMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Start tracking a connection and forward its flow events into its state
    pub fn watch(self: &Arc<Self>, connection: &Arc<dyn BrokerConnection>) {
        let id = connection.id();
        self.register(id);

        let Some(mut events) = connection.flow_events() else {
            debug!("Connection {} flow events already taken", id);
            return;
        };

        let monitor = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    event = events.recv() => event,
                };
                match event {
                    Some(FlowEvent::Blocked { reason }) => monitor.set_blocked(id, &reason),
                    Some(FlowEvent::Unblocked) => monitor.set_unblocked(id),
                    None => break,
                }
            }
        });
    }

    pub fn register(&self, connection_id: u64) {
        self.states
            .entry(connection_id)
            .or_insert_with(|| {
                Arc::new(Tracked {
                    state: watch::channel(BlockState::Unblocked).0,
                    episodes: AtomicU64::new(0),
                })
            });
    }

    /// Stop tracking a closed or replaced connection
    pub fn forget(&self, connection_id: u64) {
        let mut time = self.blocked_time.lock();
        let Some((_, tracked)) = self.states.remove(&connection_id) else {
            return;
        };
        // dropping the sender releases any waiter
        if tracked.state.borrow().is_blocked() {
            Self::close_interval(&mut time);
        }
    }

    /// Transitions and the blocked-time counter change under the same lock, so
    /// a concurrent `forget` can never see one without the other
    pub fn set_blocked(&self, connection_id: u64, reason: &str) {
        let mut time = self.blocked_time.lock();
        let Some(tracked) = self.tracked(connection_id) else {
            return;
        };
        let now = Instant::now();
        let changed = tracked.state.send_if_modified(|current| {
            if current.is_blocked() {
                return false;
            }
            *current = BlockState::Blocked {
                reason: reason.to_string(),
                since: now,
            };
            true
        });
        if changed {
            tracked.episodes.fetch_add(1, Ordering::AcqRel);
            if time.blocked_connections == 0 {
                time.since = Some(now);
            }
            time.blocked_connections += 1;
            warn!("Connection {} blocked by broker: {}", connection_id, reason);
        }
    }

    pub fn set_unblocked(&self, connection_id: u64) {
        let mut time = self.blocked_time.lock();
        let Some(tracked) = self.tracked(connection_id) else {
            return;
        };
        let mut blocked_for = Duration::ZERO;
        let changed = tracked.state.send_if_modified(|current| match current {
            BlockState::Blocked { since, .. } => {
                blocked_for = since.elapsed();
                *current = BlockState::Unblocked;
                true
            }
            BlockState::Unblocked => false,
        });
        if changed {
            Self::close_interval(&mut time);
            info!(
                "Connection {} unblocked after {:.2}s",
                connection_id,
                blocked_for.as_secs_f64()
            );
        }
    }

    fn close_interval(time: &mut BlockedTime) {
        time.blocked_connections = time.blocked_connections.saturating_sub(1);
        if time.blocked_connections == 0 {
            if let Some(since) = time.since.take() {
                time.accumulated += since.elapsed();
            }
        }
    }

    pub fn state(&self, connection_id: u64) -> BlockState {
        self.states
            .get(&connection_id)
            .map(|t| t.state.borrow().clone())
            .unwrap_or(BlockState::Unblocked)
    }

    pub fn is_blocked(&self, connection_id: u64) -> bool {
        self.states
            .get(&connection_id)
            .map(|t| t.state.borrow().is_blocked())
            .unwrap_or(false)
    }

    /// Number of times the connection has entered BLOCKED; a change between two
    /// reads means a block happened in between, even if it is already over
    pub fn block_episodes(&self, connection_id: u64) -> u64 {
        self.states
            .get(&connection_id)
            .map(|t| t.episodes.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Suspend the caller until the connection is unblocked or forgotten
    pub async fn wait_until_unblocked(&self, connection_id: u64) {
        let Some(tracked) = self.tracked(connection_id) else {
            return;
        };
        let mut rx = tracked.state.subscribe();
        drop(tracked);
        // Err means the connection was forgotten
        let _ = rx.wait_for(|s| !s.is_blocked()).await.map(|_| ());
    }

    /// Connections currently blocked
    pub fn blocked_connections(&self) -> usize {
        self.blocked_time.lock().blocked_connections
    }

    /// Time during which at least one tracked connection was blocked
    pub fn blocked_duration(&self) -> Duration {
        let time = self.blocked_time.lock();
        match time.since {
            Some(since) => time.accumulated + since.elapsed(),
            None => time.accumulated,
        }
    }

    pub fn blocked_seconds(&self) -> f64 {
        self.blocked_duration().as_secs_f64()
    }

    /// Stop all event watchers
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    fn tracked(&self, connection_id: u64) -> Option<Arc<Tracked>> {
        self.states.get(&connection_id).map(|t| Arc::clone(&t))
    }
}
