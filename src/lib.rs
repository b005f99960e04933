pub mod broker;
pub mod config;
pub mod consumer;
pub mod counters;
pub mod error;
pub mod flow_control;
pub mod metrics;
pub mod orchestrator;
pub mod panic_handler;
pub mod payload;
pub mod pool;
pub mod producer;
pub mod rate_limiter;
pub mod report;
pub mod stats;

pub use config::{Config, WorkerConfig, WorkerRole};
pub use error::{LoadGenError, Result};
pub use orchestrator::{TestOrchestrator, TestState};
pub use report::{Classification, OutputFormat, TestReport};
