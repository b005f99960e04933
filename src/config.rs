use crate::error::{LoadGenError, Result};
use crate::payload::HEADER_LEN;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub broker: BrokerConfig,
    pub queue: QueueConfig,
    pub producer: ProducerConfig,
    pub consumer: ConsumerConfig,
    pub test: TestConfig,
    pub retry: RetryConfig,
    pub thresholds: ThresholdConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Cluster nodes, either `host` or `host:port`
    pub hosts: Vec<String>,
    /// Port used for hosts listed without one
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
    pub heartbeat_secs: u16,
    pub connect_timeout_ms: u64,
    /// Base URL of the management HTTP API, e.g. `http://rmq1:15672`
    pub management_url: Option<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            hosts: vec!["localhost".to_string()],
            port: 5672,
            username: "guest".to_string(),
            password: "guest".to_string(),
            vhost: "/".to_string(),
            heartbeat_secs: 30,
            connect_timeout_ms: 5_000,
            management_url: None,
        }
    }
}

impl BrokerConfig {
    /// Ordered, de-duplicated `host:port` list used for connection failover
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = Vec::with_capacity(self.hosts.len());
        for host in &self.hosts {
            let host = host.trim();
            if host.is_empty() {
                continue;
            }
            let endpoint = if host.contains(':') {
                host.to_string()
            } else {
                format!("{}:{}", host, self.port)
            };
            if !endpoints.contains(&endpoint) {
                endpoints.push(endpoint);
            }
        }
        endpoints
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueType {
    Classic,
    Quorum,
    Stream,
}

impl fmt::Display for QueueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueueType::Classic => write!(f, "classic"),
            QueueType::Quorum => write!(f, "quorum"),
            QueueType::Stream => write!(f, "stream"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub name: String,
    /// Expected queue type, checked against the management API when available
    pub queue_type: QueueType,
    /// Fail at startup instead of warning when the queue is missing or of another type
    pub require_existing: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "simple_load_test_queue".to_string(),
            queue_type: QueueType::Quorum,
            require_existing: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    pub workers: usize,
    pub connections_per_worker: usize,
    /// Publish lanes per connection, each on its own confirm channel
    pub channels_per_connection: usize,
    /// Total target across all producer workers in msg/s; 0 means unlimited
    pub target_rate: u64,
    pub message_size: usize,
    pub persistent: bool,
    pub confirm_timeout_ms: u64,
    /// Largest backlog of permits the rate limiter will release back-to-back
    pub max_catch_up_ms: u64,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            connections_per_worker: 5,
            channels_per_connection: 1,
            target_rate: 10_000,
            message_size: 10 * 1024,
            persistent: true,
            confirm_timeout_ms: 5_000,
            max_catch_up_ms: 1_000,
        }
    }
}

impl ProducerConfig {
    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn max_catch_up(&self) -> Duration {
        Duration::from_millis(self.max_catch_up_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    pub workers: usize,
    pub connections_per_worker: usize,
    /// Subscriptions per connection
    pub channels_per_connection: usize,
    pub prefetch_count: u16,
    pub batch_ack_size: usize,
    /// Oldest a pending ack may get before the partial batch is flushed
    pub batch_ack_timeout_ms: u64,
    /// Simulated per-message processing time
    pub processing_delay_ms: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            connections_per_worker: 5,
            channels_per_connection: 1,
            prefetch_count: 200,
            batch_ack_size: 100,
            batch_ack_timeout_ms: 1_000,
            processing_delay_ms: 0,
        }
    }
}

impl ConsumerConfig {
    pub fn batch_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_ack_timeout_ms)
    }

    pub fn processing_delay(&self) -> Option<Duration> {
        (self.processing_delay_ms > 0).then(|| Duration::from_millis(self.processing_delay_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    pub duration_secs: u64,
    pub poll_interval_ms: u64,
    /// Minimum time consumers keep running after producers stop
    pub drain_grace_ms: u64,
    /// Upper bound on the whole drain phase
    pub max_drain_ms: u64,
    /// Drain bound used when the run is interrupted
    pub interrupt_drain_ms: u64,
    /// How long a producer lane waits for an in-flight confirm once stopped
    pub shutdown_confirm_timeout_ms: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            duration_secs: 60,
            poll_interval_ms: 1_000,
            drain_grace_ms: 2_000,
            max_drain_ms: 30_000,
            interrupt_drain_ms: 3_000,
            shutdown_confirm_timeout_ms: 2_000,
        }
    }
}

impl TestConfig {
    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn max_drain(&self) -> Duration {
        Duration::from_millis(self.max_drain_ms)
    }

    pub fn interrupt_drain(&self) -> Duration {
        Duration::from_millis(self.interrupt_drain_ms)
    }

    pub fn shutdown_confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_confirm_timeout_ms)
    }
}

/// Bounded exponential backoff used when opening or re-opening connections
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    /// Delay to wait after failed attempt number `attempt` (1-based), before jitter
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    /// Fraction of the target rate the producers must reach
    pub producer_target_ratio: f64,
    /// Allowed shortfall of consume rate behind confirm rate
    pub consumer_lag_margin: f64,
    /// Consecutive polls of strictly growing queue depth that count as falling behind
    pub queue_growth_polls: usize,
    /// Slack when attributing a producer shortfall to blocked time
    pub backpressure_tolerance: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            producer_target_ratio: 0.95,
            consumer_lag_margin: 0.10,
            queue_growth_polls: 3,
            backpressure_tolerance: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Address for the Prometheus `/metrics` endpoint, disabled when unset
    pub listen: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerRole {
    Producer,
    Consumer,
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerRole::Producer => write!(f, "producer"),
            WorkerRole::Consumer => write!(f, "consumer"),
        }
    }
}

/// Immutable per-worker settings, derived once from a validated [`Config`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: String,
    pub role: WorkerRole,
    pub index: usize,
    /// msg/s for this worker; 0 means unlimited
    pub target_rate: u64,
    pub message_size: usize,
    pub connections: usize,
    pub channels_per_connection: usize,
    pub queue: String,
    /// Failover order for this worker, rotated so workers start on different nodes
    pub endpoints: Vec<String>,
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.producer.workers == 0 && self.consumer.workers == 0 {
            return Err(LoadGenError::InvalidConfig(
                "producer.workers and consumer.workers cannot both be 0".to_string(),
            ));
        }

        if self.broker.endpoints().is_empty() {
            return Err(LoadGenError::InvalidConfig(
                "broker.hosts must contain at least one endpoint".to_string(),
            ));
        }

        if self.queue.name.trim().is_empty() {
            return Err(LoadGenError::InvalidConfig(
                "queue.name cannot be empty".to_string(),
            ));
        }

        if self.producer.workers > 0 {
            if self.producer.connections_per_worker == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "producer.connections_per_worker must be greater than 0".to_string(),
                ));
            }

            if self.producer.channels_per_connection == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "producer.channels_per_connection must be greater than 0".to_string(),
                ));
            }

            if self.producer.target_rate > 0
                && self.producer.target_rate < self.producer.workers as u64
            {
                return Err(LoadGenError::InvalidConfig(format!(
                    "producer.target_rate ({}) must be at least producer.workers ({}) or 0 for unlimited",
                    self.producer.target_rate, self.producer.workers
                )));
            }

            if self.producer.message_size < HEADER_LEN {
                return Err(LoadGenError::InvalidConfig(format!(
                    "producer.message_size must be at least {} bytes",
                    HEADER_LEN
                )));
            }

            if self.producer.confirm_timeout_ms == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "producer.confirm_timeout_ms must be greater than 0".to_string(),
                ));
            }
        }

        if self.consumer.workers > 0 {
            if self.consumer.connections_per_worker == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "consumer.connections_per_worker must be greater than 0".to_string(),
                ));
            }

            if self.consumer.channels_per_connection == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "consumer.channels_per_connection must be greater than 0".to_string(),
                ));
            }

            if self.consumer.batch_ack_size == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "consumer.batch_ack_size must be greater than 0".to_string(),
                ));
            }

            if self.consumer.prefetch_count == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "consumer.prefetch_count must be greater than 0".to_string(),
                ));
            }

            // A batch larger than the prefetch window only ever flushes on the age timeout
            if self.consumer.batch_ack_size > self.consumer.prefetch_count as usize {
                return Err(LoadGenError::InvalidConfig(format!(
                    "consumer.batch_ack_size ({}) cannot exceed consumer.prefetch_count ({})",
                    self.consumer.batch_ack_size, self.consumer.prefetch_count
                )));
            }

            if self.consumer.batch_ack_timeout_ms == 0 {
                return Err(LoadGenError::InvalidConfig(
                    "consumer.batch_ack_timeout_ms must be greater than 0".to_string(),
                ));
            }
        }

        if self.test.duration_secs == 0 {
            return Err(LoadGenError::InvalidConfig(
                "test.duration_secs must be greater than 0".to_string(),
            ));
        }

        if self.test.poll_interval_ms == 0 {
            return Err(LoadGenError::InvalidConfig(
                "test.poll_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.test.max_drain_ms < self.test.drain_grace_ms {
            return Err(LoadGenError::InvalidConfig(
                "test.max_drain_ms must be >= test.drain_grace_ms".to_string(),
            ));
        }

        if self.retry.max_attempts == 0 {
            return Err(LoadGenError::InvalidConfig(
                "retry.max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.retry.multiplier < 1.0 {
            return Err(LoadGenError::InvalidConfig(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }

        let ratio = self.thresholds.producer_target_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(LoadGenError::InvalidConfig(
                "thresholds.producer_target_ratio must be in (0, 1]".to_string(),
            ));
        }

        let margin = self.thresholds.consumer_lag_margin;
        if !(0.0..1.0).contains(&margin) {
            return Err(LoadGenError::InvalidConfig(
                "thresholds.consumer_lag_margin must be in [0, 1)".to_string(),
            ));
        }

        if self.thresholds.queue_growth_polls < 2 {
            return Err(LoadGenError::InvalidConfig(
                "thresholds.queue_growth_polls must be at least 2".to_string(),
            ));
        }

        Ok(())
    }

    /// Split the total producer target evenly; the remainder goes to the first workers
    pub fn producer_worker_configs(&self) -> Vec<WorkerConfig> {
        let workers = self.producer.workers;
        let endpoints = self.broker.endpoints();
        (0..workers)
            .map(|index| {
                let target_rate = if self.producer.target_rate == 0 {
                    0
                } else {
                    let base = self.producer.target_rate / workers as u64;
                    let extra = (index as u64) < self.producer.target_rate % workers as u64;
                    base + extra as u64
                };
                WorkerConfig {
                    worker_id: format!("producer-{}", index),
                    role: WorkerRole::Producer,
                    index,
                    target_rate,
                    message_size: self.producer.message_size,
                    connections: self.producer.connections_per_worker,
                    channels_per_connection: self.producer.channels_per_connection,
                    queue: self.queue.name.clone(),
                    endpoints: rotate(&endpoints, index),
                }
            })
            .collect()
    }

    pub fn consumer_worker_configs(&self) -> Vec<WorkerConfig> {
        let endpoints = self.broker.endpoints();
        (0..self.consumer.workers)
            .map(|index| WorkerConfig {
                worker_id: format!("consumer-{}", index),
                role: WorkerRole::Consumer,
                index,
                target_rate: 0,
                message_size: self.producer.message_size,
                connections: self.consumer.connections_per_worker,
                channels_per_connection: self.consumer.channels_per_connection,
                queue: self.queue.name.clone(),
                endpoints: rotate(&endpoints, index),
            })
            .collect()
    }
}

fn rotate(endpoints: &[String], by: usize) -> Vec<String> {
    if endpoints.is_empty() {
        return Vec::new();
    }
    let mut rotated = endpoints.to_vec();
    rotated.rotate_left(by % endpoints.len());
    rotated
}
