use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Broker answer to a confirmed publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack,
    Nack,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Bytes,
    pub redelivered: bool,
}

/// Connection-level flow control notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowEvent {
    Blocked { reason: String },
    Unblocked,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub name: String,
    pub queue_type: String,
    pub messages: u64,
    pub consumers: u64,
}

/// Opens connections to a single `host:port` endpoint
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    fn id(&self) -> u64;
    fn endpoint(&self) -> &str;
    fn is_open(&self) -> bool;

    /// Channel in confirm mode, publishing to `routing_key` on the default exchange
    async fn open_publisher(&self) -> Result<Box<dyn Publisher>>;

    /// Push subscription with manual acks and the given prefetch window
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<Box<dyn Subscription>>;

    /// Takes the flow event stream; only the first caller gets it
    fn flow_events(&self) -> Option<mpsc::UnboundedReceiver<FlowEvent>>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish and wait for the broker's confirm
    async fn publish(&self, routing_key: &str, payload: Bytes, persistent: bool)
        -> Result<Confirmation>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Next pushed delivery, `None` once the subscription is gone
    async fn next_delivery(&mut self) -> Option<Result<Delivery>>;

    async fn ack(&mut self, delivery_tag: u64, multiple: bool) -> Result<()>;

    async fn cancel(&mut self) -> Result<()>;
}

/// Broker-side reporting used for queue depth and startup checks
#[async_trait]
pub trait QueueDepthSource: Send + Sync {
    async fn queue_info(&self, queue: &str) -> Result<QueueInfo>;

    async fn queue_depth(&self, queue: &str) -> Result<u64> {
        Ok(self.queue_info(queue).await?.messages)
    }
}
