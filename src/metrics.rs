//! Prometheus view of a running test.
//!
//! Values are copied from each [`AggregateSnapshot`], so the exported counters
//! always equal the workers' own counters at the last poll.

use crate::error::{LoadGenError, Result};
use crate::stats::AggregateSnapshot;
use prometheus::{Encoder, Gauge, IntCounter, IntGauge, Registry, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use warp::http::StatusCode;
use warp::Filter;

pub struct LoadGenMetrics {
    pub messages_sent: IntCounter,
    pub messages_confirmed: IntCounter,
    pub messages_rejected: IntCounter,
    pub messages_received: IntCounter,
    pub messages_acked: IntCounter,
    pub errors: IntCounter,
    pub publish_rate: Gauge,
    pub confirm_rate: Gauge,
    pub consume_rate: Gauge,
    pub queue_depth: IntGauge,
    pub blocked_seconds: Gauge,
    pub blocked_connections: IntGauge,
    pub live_connections: IntGauge,
    pub registry: Registry,
}

impl LoadGenMetrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let counter = |name: &str, help: &str| -> Result<IntCounter> {
            let c = IntCounter::new(name, help)?;
            registry.register(Box::new(c.clone()))?;
            Ok(c)
        };
        let messages_sent = counter("rmq_loadgen_messages_sent_total", "Messages handed to the broker")?;
        let messages_confirmed = counter(
            "rmq_loadgen_messages_confirmed_total",
            "Publishes positively confirmed by the broker",
        )?;
        let messages_rejected = counter(
            "rmq_loadgen_messages_rejected_total",
            "Publishes negatively confirmed by the broker",
        )?;
        let messages_received = counter("rmq_loadgen_messages_received_total", "Messages delivered to consumers")?;
        let messages_acked = counter("rmq_loadgen_messages_acked_total", "Messages acknowledged by consumers")?;
        let errors = counter("rmq_loadgen_errors_total", "Publish, consume and ack errors")?;

        let gauge = |name: &str, help: &str| -> Result<Gauge> {
            let g = Gauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let publish_rate = gauge("rmq_loadgen_publish_rate", "Messages sent per second over the last poll")?;
        let confirm_rate = gauge("rmq_loadgen_confirm_rate", "Messages confirmed per second over the last poll")?;
        let consume_rate = gauge("rmq_loadgen_consume_rate", "Messages received per second over the last poll")?;
        let blocked_seconds = gauge(
            "rmq_loadgen_blocked_seconds",
            "Time during which at least one connection was blocked",
        )?;

        let int_gauge = |name: &str, help: &str| -> Result<IntGauge> {
            let g = IntGauge::new(name, help)?;
            registry.register(Box::new(g.clone()))?;
            Ok(g)
        };
        let queue_depth = int_gauge("rmq_loadgen_queue_depth", "Messages in the test queue")?;
        let blocked_connections = int_gauge(
            "rmq_loadgen_blocked_connections",
            "Connections currently blocked by the broker",
        )?;
        let live_connections = int_gauge("rmq_loadgen_live_connections", "Open broker connections")?;

        Ok(Arc::new(Self {
            messages_sent,
            messages_confirmed,
            messages_rejected,
            messages_received,
            messages_acked,
            errors,
            publish_rate,
            confirm_rate,
            consume_rate,
            queue_depth,
            blocked_seconds,
            blocked_connections,
            live_connections,
            registry,
        }))
    }

    pub fn observe(&self, snapshot: &AggregateSnapshot, live_connections: usize) {
        let p = &snapshot.producers;
        let c = &snapshot.consumers;
        advance(&self.messages_sent, p.sent);
        advance(&self.messages_confirmed, p.confirmed);
        advance(&self.messages_rejected, p.rejected);
        advance(&self.messages_received, c.received);
        advance(&self.messages_acked, c.acked);
        advance(&self.errors, p.errors + c.errors);

        self.publish_rate.set(snapshot.publish_rate);
        self.confirm_rate.set(snapshot.confirm_rate);
        self.consume_rate.set(snapshot.consume_rate);
        if let Some(depth) = snapshot.queue_depth {
            self.queue_depth.set(depth as i64);
        }
        self.blocked_seconds.set(snapshot.blocked_seconds);
        self.blocked_connections.set(snapshot.blocked_connections as i64);
        self.live_connections.set(live_connections as i64);
    }

    /// Text exposition format
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| LoadGenError::Metrics(e.to_string()))
    }

    /// Serve `GET /metrics` until `shutdown` fires
    pub fn serve(
        self: &Arc<Self>,
        addr: SocketAddr,
        shutdown: CancellationToken,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let metrics = Arc::clone(self);
        let route = warp::path!("metrics").and(warp::get()).map(move || {
            let (status, body) = match metrics.render() {
                Ok(body) => (StatusCode::OK, body),
                Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            };
            warp::reply::with_status(
                warp::reply::with_header(body, "content-type", prometheus::TEXT_FORMAT),
                status,
            )
        });

        let (bound, server) = warp::serve(route)
            .try_bind_with_graceful_shutdown(addr, async move { shutdown.cancelled().await })
            .map_err(|e| LoadGenError::Metrics(format!("failed to bind {}: {}", addr, e)))?;
        info!("Serving metrics on http://{}/metrics", bound);
        Ok((bound, tokio::spawn(server)))
    }
}

/// Move a monotonic counter up to `value`
fn advance(counter: &IntCounter, value: u64) {
    let current = counter.get();
    if value > current {
        counter.inc_by(value - current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::CounterSnapshot;
    use crate::orchestrator::TestState;
    use chrono::Utc;

    fn snapshot(sent: u64, received: u64) -> AggregateSnapshot {
        AggregateSnapshot {
            timestamp: Utc::now(),
            state: TestState::Running,
            elapsed_secs: 1.0,
            interval_secs: 1.0,
            producers: CounterSnapshot {
                sent,
                confirmed: sent,
                ..Default::default()
            },
            consumers: CounterSnapshot {
                received,
                acked: received,
                errors: 1,
                ..Default::default()
            },
            publish_rate: sent as f64,
            confirm_rate: sent as f64,
            consume_rate: received as f64,
            ack_rate: received as f64,
            publish_bytes_rate: 0.0,
            consume_bytes_rate: 0.0,
            queue_depth: Some(sent - received),
            blocked_seconds: 0.5,
            blocked_connections: 0,
            producer_below_target: false,
            consumer_falling_behind: false,
        }
    }

    #[test]
    fn test_observe_tracks_snapshot_totals() {
        let metrics = LoadGenMetrics::new().unwrap();
        metrics.observe(&snapshot(100, 40), 5);
        metrics.observe(&snapshot(250, 200), 4);

        assert_eq!(metrics.messages_sent.get(), 250);
        assert_eq!(metrics.messages_confirmed.get(), 250);
        assert_eq!(metrics.messages_received.get(), 200);
        assert_eq!(metrics.errors.get(), 1);
        assert_eq!(metrics.queue_depth.get(), 50);
        assert_eq!(metrics.live_connections.get(), 4);
        assert_eq!(metrics.blocked_seconds.get(), 0.5);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = LoadGenMetrics::new().unwrap();
        metrics.observe(&snapshot(10, 10), 1);
        let text = metrics.render().unwrap();
        assert!(text.contains("rmq_loadgen_messages_sent_total 10"));
        assert!(text.contains("# TYPE rmq_loadgen_queue_depth gauge"));
    }

    #[tokio::test]
    async fn test_serve_until_shutdown() {
        let metrics = LoadGenMetrics::new().unwrap();
        let shutdown = CancellationToken::new();
        let (addr, server) = metrics
            .serve("127.0.0.1:0".parse().unwrap(), shutdown.clone())
            .unwrap();
        assert_ne!(addr.port(), 0);

        shutdown.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
    }
}
