use thiserror::Error;

pub type Result<T> = std::result::Result<T, LoadGenError>;

#[derive(Error, Debug, Clone)]
pub enum LoadGenError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    #[error("Channel error: {0}")]
    Channel(String),

    /// Every connection in a worker's pool is dead.
    #[error("Connection pool exhausted for worker {worker_id}: {live} of {configured} connections live")]
    ConnectionExhausted {
        worker_id: String,
        live: usize,
        configured: usize,
    },

    #[error("All broker endpoints unreachable: {0}")]
    EndpointsUnreachable(String),

    #[error("Publish rejected by broker: {0}")]
    PublishRejected(String),

    #[error("Operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Subscription error: {0}")]
    Subscription(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Queue type mismatch for {queue}: expected {expected}, found {actual}")]
    QueueTypeMismatch {
        queue: String,
        expected: String,
        actual: String,
    },

    #[error("Management API error: {0}")]
    ManagementApi(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Worker {worker_id} failed: {reason}")]
    WorkerFailed { worker_id: String, reason: String },
}

impl From<std::io::Error> for LoadGenError {
    fn from(err: std::io::Error) -> Self {
        LoadGenError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for LoadGenError {
    fn from(err: serde_json::Error) -> Self {
        LoadGenError::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for LoadGenError {
    fn from(err: toml::de::Error) -> Self {
        LoadGenError::Config(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for LoadGenError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        LoadGenError::Timeout { timeout_ms: 0 }
    }
}

impl From<prometheus::Error> for LoadGenError {
    fn from(err: prometheus::Error) -> Self {
        LoadGenError::Metrics(err.to_string())
    }
}

impl From<reqwest::Error> for LoadGenError {
    fn from(err: reqwest::Error) -> Self {
        LoadGenError::ManagementApi(err.to_string())
    }
}

impl LoadGenError {
    /// Error category used for log fields and metric labels
    pub fn category(&self) -> &'static str {
        match self {
            LoadGenError::Io(_) => "io",
            LoadGenError::Config(_) | LoadGenError::InvalidConfig(_) => "configuration",
            LoadGenError::Connection(_)
            | LoadGenError::ConnectionClosed(_)
            | LoadGenError::Channel(_)
            | LoadGenError::Timeout { .. } => "transient_io",
            LoadGenError::PublishRejected(_) => "broker_rejection",
            LoadGenError::ConnectionExhausted { .. } | LoadGenError::EndpointsUnreachable(_) => {
                "resource_exhaustion"
            }
            LoadGenError::Subscription(_) | LoadGenError::Ack(_) => "consumer",
            LoadGenError::QueueNotFound(_) | LoadGenError::QueueTypeMismatch { .. } => "queue",
            LoadGenError::ManagementApi(_) => "management_api",
            LoadGenError::InvalidPayload(_) | LoadGenError::Serialization(_) => "payload",
            LoadGenError::Metrics(_) => "metrics",
            LoadGenError::InvalidOperation(_) => "invalid_operation",
            LoadGenError::WorkerFailed { .. } => "worker",
        }
    }

    /// Whether a later attempt on a fresh or reconnected handle may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            LoadGenError::Io(_)
            | LoadGenError::Connection(_)
            | LoadGenError::ConnectionClosed(_)
            | LoadGenError::Channel(_)
            | LoadGenError::Timeout { .. }
            | LoadGenError::Subscription(_)
            | LoadGenError::Ack(_)
            | LoadGenError::ManagementApi(_) => true,

            LoadGenError::Config(_)
            | LoadGenError::InvalidConfig(_)
            | LoadGenError::ConnectionExhausted { .. }
            | LoadGenError::EndpointsUnreachable(_)
            | LoadGenError::PublishRejected(_)
            | LoadGenError::QueueNotFound(_)
            | LoadGenError::QueueTypeMismatch { .. }
            | LoadGenError::InvalidPayload(_)
            | LoadGenError::Serialization(_)
            | LoadGenError::Metrics(_)
            | LoadGenError::InvalidOperation(_)
            | LoadGenError::WorkerFailed { .. } => false,
        }
    }

    /// Errors that end a worker (or the whole run at INIT) instead of being counted
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LoadGenError::Config(_)
                | LoadGenError::InvalidConfig(_)
                | LoadGenError::ConnectionExhausted { .. }
                | LoadGenError::EndpointsUnreachable(_)
                | LoadGenError::QueueNotFound(_)
                | LoadGenError::QueueTypeMismatch { .. }
        )
    }
}
