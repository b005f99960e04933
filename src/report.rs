//! Final test report and its classification.

use crate::config::{ThresholdConfig, WorkerRole};
use crate::counters::CounterSnapshot;
use crate::error::{LoadGenError, Result};
use crate::stats::AggregateSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Classification {
    TargetAchieved,
    /// Shortfall explained by time the broker kept connections blocked
    BackpressureLimited,
    /// Producers could not reach the target on their own
    ProducerCapacityLimited,
    ConsumerFallingBehind,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::TargetAchieved => write!(f, "TARGET_ACHIEVED"),
            Classification::BackpressureLimited => write!(f, "BACKPRESSURE_LIMITED"),
            Classification::ProducerCapacityLimited => write!(f, "PRODUCER_CAPACITY_LIMITED"),
            Classification::ConsumerFallingBehind => write!(f, "CONSUMER_FALLING_BEHIND"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Text,
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Invalid output format: {}. Valid formats: text, json", s)),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl OutputFormat {
    /// JSON for `.json` files, text otherwise
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => OutputFormat::Json,
            _ => OutputFormat::Text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: String,
    pub role: WorkerRole,
    pub counters: CounterSnapshot,
    /// Set when the worker exited early
    pub error: Option<String>,
}

/// Everything the orchestrator measured, before classification
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interrupted: bool,
    pub target_rate: u64,
    pub message_size: usize,
    /// Time producers were publishing
    pub running_secs: f64,
    /// Time consumers were consuming, including the drain
    pub consuming_secs: f64,
    pub drained: bool,
    pub final_queue_depth: Option<u64>,
    pub blocked_seconds: f64,
    pub workers: Vec<WorkerResult>,
    pub snapshots: Vec<AggregateSnapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestReport {
    pub run_id: Uuid,
    pub queue: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub interrupted: bool,
    pub classification: Classification,
    /// Configured total producer rate in msg/s, 0 = unlimited
    pub target_rate: u64,
    pub achieved_producer_rate: f64,
    pub achieved_consumer_rate: f64,
    pub message_size: usize,
    pub running_secs: f64,
    pub consuming_secs: f64,
    pub producers: CounterSnapshot,
    pub consumers: CounterSnapshot,
    pub rejection_ratio: f64,
    pub peak_queue_depth: Option<u64>,
    pub final_queue_depth: Option<u64>,
    pub blocked_seconds: f64,
    pub drained: bool,
    pub producer_below_target_polls: usize,
    pub consumer_behind_polls: usize,
    pub running_polls: usize,
    pub partial_worker_failure: bool,
    pub failed_workers: Vec<String>,
    pub workers: Vec<WorkerResult>,
    pub snapshots: Vec<AggregateSnapshot>,
}

impl TestReport {
    pub fn build(summary: RunSummary, thresholds: &ThresholdConfig) -> Self {
        let sum_role = |role: WorkerRole| -> CounterSnapshot {
            summary
                .workers
                .iter()
                .filter(|w| w.role == role)
                .map(|w| w.counters)
                .sum()
        };
        let producers = sum_role(WorkerRole::Producer);
        let consumers = sum_role(WorkerRole::Consumer);
        let has_producers = summary.workers.iter().any(|w| w.role == WorkerRole::Producer);
        let has_consumers = summary.workers.iter().any(|w| w.role == WorkerRole::Consumer);

        let per_sec = |count: u64, secs: f64| if secs > 0.0 { count as f64 / secs } else { 0.0 };
        let achieved_producer_rate = per_sec(producers.confirmed, summary.running_secs);
        let achieved_consumer_rate = per_sec(consumers.received, summary.consuming_secs);

        let published = producers.confirmed + producers.rejected;
        let rejection_ratio = if published > 0 {
            producers.rejected as f64 / published as f64
        } else {
            0.0
        };

        let running: Vec<&AggregateSnapshot> = summary
            .snapshots
            .iter()
            .filter(|s| s.state == crate::orchestrator::TestState::Running)
            .collect();
        let producer_below_target_polls = running.iter().filter(|s| s.producer_below_target).count();
        let consumer_behind_polls = running.iter().filter(|s| s.consumer_falling_behind).count();

        let peak_queue_depth = summary
            .snapshots
            .iter()
            .filter_map(|s| s.queue_depth)
            .chain(summary.final_queue_depth)
            .max();

        let failed_workers: Vec<String> = summary
            .workers
            .iter()
            .filter(|w| w.error.is_some())
            .map(|w| w.worker_id.clone())
            .collect();

        let consumers_behind = has_consumers
            && (!summary.drained || consumer_behind_polls * 2 > running.len());

        let classification = classify(
            if has_producers { summary.target_rate } else { 0 },
            achieved_producer_rate,
            summary.blocked_seconds,
            summary.running_secs,
            consumers_behind,
            thresholds,
        );

        TestReport {
            run_id: summary.run_id,
            queue: summary.queue,
            started_at: summary.started_at,
            finished_at: summary.finished_at,
            interrupted: summary.interrupted,
            classification,
            target_rate: summary.target_rate,
            achieved_producer_rate,
            achieved_consumer_rate,
            message_size: summary.message_size,
            running_secs: summary.running_secs,
            consuming_secs: summary.consuming_secs,
            producers,
            consumers,
            rejection_ratio,
            peak_queue_depth,
            final_queue_depth: summary.final_queue_depth,
            blocked_seconds: summary.blocked_seconds,
            drained: summary.drained,
            producer_below_target_polls,
            consumer_behind_polls,
            running_polls: running.len(),
            partial_worker_failure: !failed_workers.is_empty(),
            failed_workers,
            workers: summary.workers,
            snapshots: summary.snapshots,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn render(&self, format: OutputFormat) -> Result<String> {
        match format {
            OutputFormat::Json => self.to_json(),
            OutputFormat::Text => Ok(self.to_string()),
        }
    }

    /// Write the report, as JSON when the file name ends in `.json`
    pub fn write_to_file(&self, path: &Path) -> Result<()> {
        let rendered = self.render(OutputFormat::for_path(path))?;
        std::fs::write(path, rendered).map_err(|e| {
            LoadGenError::Io(format!("failed to write report to {}: {}", path.display(), e))
        })
    }
}

/// Attribute a missed target to the broker, the producers or the consumers
pub fn classify(
    target_rate: u64,
    achieved_producer_rate: f64,
    blocked_seconds: f64,
    running_secs: f64,
    consumers_behind: bool,
    thresholds: &ThresholdConfig,
) -> Classification {
    let target = target_rate as f64;
    let producer_ok =
        target_rate == 0 || achieved_producer_rate >= thresholds.producer_target_ratio * target;

    if !producer_ok {
        let shortfall = 1.0 - achieved_producer_rate / target;
        let blocked_fraction = if running_secs > 0.0 {
            (blocked_seconds / running_secs).min(1.0)
        } else {
            0.0
        };
        if blocked_fraction > 0.0 && shortfall <= blocked_fraction + thresholds.backpressure_tolerance {
            Classification::BackpressureLimited
        } else {
            Classification::ProducerCapacityLimited
        }
    } else if consumers_behind {
        Classification::ConsumerFallingBehind
    } else {
        Classification::TargetAchieved
    }
}

fn depth(depth: Option<u64>) -> String {
    depth.map_or_else(|| "n/a".to_string(), |d| d.to_string())
}

fn mib(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let target = if self.target_rate == 0 {
            "unlimited".to_string()
        } else {
            format!("{} msg/s", self.target_rate)
        };

        writeln!(f, "RabbitMQ Load Test Report")?;
        writeln!(f, "=========================")?;
        writeln!(f, "Run:                   {}", self.run_id)?;
        writeln!(f, "Queue:                 {}", self.queue)?;
        writeln!(f, "Started:               {}", self.started_at.to_rfc3339())?;
        writeln!(f, "Finished:              {}", self.finished_at.to_rfc3339())?;
        if self.interrupted {
            writeln!(f, "Interrupted:           yes")?;
        }
        writeln!(f, "Result:                {}", self.classification)?;
        writeln!(f)?;
        writeln!(f, "Throughput")?;
        writeln!(f, "  Target rate:         {}", target)?;
        writeln!(f, "  Producer rate:       {:.1} msg/s over {:.1}s", self.achieved_producer_rate, self.running_secs)?;
        writeln!(f, "  Consumer rate:       {:.1} msg/s over {:.1}s", self.achieved_consumer_rate, self.consuming_secs)?;
        writeln!(f, "  Message size:        {} bytes", self.message_size)?;
        writeln!(f)?;
        writeln!(f, "Producers")?;
        writeln!(f, "  Sent:                {}", self.producers.sent)?;
        writeln!(f, "  Confirmed:           {}", self.producers.confirmed)?;
        writeln!(f, "  Rejected:            {} ({:.2}%)", self.producers.rejected, self.rejection_ratio * 100.0)?;
        writeln!(f, "  Errors:              {}", self.producers.errors)?;
        writeln!(f, "  Data sent:           {:.2} MiB", mib(self.producers.bytes_sent))?;
        writeln!(f)?;
        writeln!(f, "Consumers")?;
        writeln!(f, "  Received:            {}", self.consumers.received)?;
        writeln!(f, "  Acked:               {}", self.consumers.acked)?;
        writeln!(f, "  Errors:              {}", self.consumers.errors)?;
        writeln!(f, "  Integrity failures:  {}", self.consumers.integrity_failures)?;
        writeln!(f, "  Data received:       {:.2} MiB", mib(self.consumers.bytes_received))?;
        writeln!(f)?;
        writeln!(f, "Broker")?;
        writeln!(f, "  Peak queue depth:    {}", depth(self.peak_queue_depth))?;
        writeln!(f, "  Final queue depth:   {}", depth(self.final_queue_depth))?;
        writeln!(f, "  Blocked time:        {:.2}s", self.blocked_seconds)?;
        writeln!(f, "  Drained:             {}", if self.drained { "yes" } else { "no" })?;
        writeln!(
            f,
            "  Polls below target:  {} of {}",
            self.producer_below_target_polls, self.running_polls
        )?;
        writeln!(
            f,
            "  Polls consumers lag: {} of {}",
            self.consumer_behind_polls, self.running_polls
        )?;

        if self.partial_worker_failure {
            writeln!(f)?;
            writeln!(f, "PARTIAL WORKER FAILURE: {}", self.failed_workers.join(", "))?;
        }

        writeln!(f)?;
        writeln!(f, "Workers")?;
        for worker in &self.workers {
            let c = &worker.counters;
            match worker.role {
                WorkerRole::Producer => write!(
                    f,
                    "  {:<12} sent={} confirmed={} rejected={} errors={}",
                    worker.worker_id, c.sent, c.confirmed, c.rejected, c.errors
                )?,
                WorkerRole::Consumer => write!(
                    f,
                    "  {:<12} received={} acked={} errors={}",
                    worker.worker_id, c.received, c.acked, c.errors
                )?,
            }
            match &worker.error {
                Some(error) => writeln!(f, " FAILED: {}", error)?,
                None => writeln!(f)?,
            }
        }
        Ok(())
    }
}
