//! rmq-loadgen - rate-controlled RabbitMQ load test driver
//!
//! Settings come from an optional TOML file, then environment variables and
//! command line flags on top.

use anyhow::Context;
use clap::{Parser, ValueEnum};
use rmq_loadgen::broker::{
    BrokerConnector, InMemoryBroker, ManagementClient, ManagementConfig, QueueDepthSource,
};
use rmq_loadgen::{panic_handler, Config, OutputFormat, TestOrchestrator};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
#[command(name = "rmq-loadgen")]
#[command(about = "Rate-controlled multi-worker RabbitMQ load generator")]
#[command(version)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma separated broker hosts, `host` or `host:port`
    #[arg(long, env = "RABBITMQ_HOSTS", value_delimiter = ',')]
    hosts: Option<Vec<String>>,

    #[arg(long, env = "RABBITMQ_PORT")]
    port: Option<u16>,

    #[arg(long, env = "RABBITMQ_ADMIN_USER")]
    username: Option<String>,

    #[arg(long, env = "RABBITMQ_ADMIN_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    #[arg(long, env = "RABBITMQ_VHOST")]
    vhost: Option<String>,

    /// Management API base URL used for queue depth, e.g. http://rmq1:15672
    #[arg(long, env = "RABBITMQ_MANAGEMENT_URL")]
    management_url: Option<String>,

    #[arg(long, env = "TEST_QUEUE_NAME")]
    queue: Option<String>,

    /// Total target publish rate, 0 for unlimited
    #[arg(long, env = "MESSAGES_PER_SECOND")]
    rate: Option<u64>,

    #[arg(long, env = "MESSAGE_SIZE_KB")]
    message_size_kb: Option<usize>,

    #[arg(long, env = "TEST_DURATION_SECONDS")]
    duration: Option<u64>,

    #[arg(long, env = "PRODUCER_WORKERS")]
    producer_workers: Option<usize>,

    #[arg(long, env = "PRODUCER_CONNECTIONS_PER_WORKER")]
    producer_connections: Option<usize>,

    #[arg(long, env = "CONSUMER_WORKERS")]
    consumer_workers: Option<usize>,

    #[arg(long, env = "CONSUMER_CONNECTIONS_PER_WORKER")]
    consumer_connections: Option<usize>,

    /// Channels opened on every connection, producers and consumers alike
    #[arg(long, env = "CHANNELS_PER_CONNECTION")]
    channels_per_connection: Option<usize>,

    #[arg(long, env = "CONSUMER_PREFETCH_COUNT")]
    prefetch: Option<u16>,

    #[arg(long, env = "BATCH_ACK_SIZE")]
    batch_ack_size: Option<usize>,

    #[arg(long, env = "PROCESSING_DELAY_MS")]
    processing_delay_ms: Option<u64>,

    /// Serve Prometheus metrics on this address, e.g. 0.0.0.0:9464
    #[arg(long)]
    metrics_listen: Option<String>,

    /// Fail instead of warning when the queue is missing or has the wrong type
    #[arg(long)]
    require_queue: bool,

    /// Run against an in-process broker instead of RabbitMQ
    #[arg(long)]
    simulate: bool,

    /// With --simulate, raise a broker alarm after this many seconds
    #[arg(long, requires = "simulate")]
    simulate_block_at: Option<u64>,

    /// With --simulate, how long the alarm lasts
    #[arg(long, requires = "simulate", default_value = "5")]
    simulate_block_secs: u64,

    /// Report format on stdout
    #[arg(short, long, default_value = "text")]
    output: OutputFormat,

    /// Also write the report to this file, JSON when it ends in .json
    #[arg(long)]
    report_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "text")]
    log_format: LogFormat,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => {
                let path = path.to_string_lossy();
                Config::from_file(&path)
                    .with_context(|| format!("Failed to load configuration from {}", path))?
            }
            None => Config::default(),
        };

        if let Some(hosts) = &self.hosts {
            config.broker.hosts = hosts.clone();
        }
        if let Some(port) = self.port {
            config.broker.port = port;
        }
        if let Some(username) = &self.username {
            config.broker.username = username.clone();
        }
        if let Some(password) = &self.password {
            config.broker.password = password.clone();
        }
        if let Some(vhost) = &self.vhost {
            config.broker.vhost = vhost.clone();
        }
        if let Some(url) = &self.management_url {
            config.broker.management_url = Some(url.clone());
        }
        if let Some(queue) = &self.queue {
            config.queue.name = queue.clone();
        }
        if self.require_queue {
            config.queue.require_existing = true;
        }
        if let Some(rate) = self.rate {
            config.producer.target_rate = rate;
        }
        if let Some(kb) = self.message_size_kb {
            config.producer.message_size = kb * 1024;
        }
        if let Some(duration) = self.duration {
            config.test.duration_secs = duration;
        }
        if let Some(workers) = self.producer_workers {
            config.producer.workers = workers;
        }
        if let Some(connections) = self.producer_connections {
            config.producer.connections_per_worker = connections;
        }
        if let Some(workers) = self.consumer_workers {
            config.consumer.workers = workers;
        }
        if let Some(connections) = self.consumer_connections {
            config.consumer.connections_per_worker = connections;
        }
        if let Some(channels) = self.channels_per_connection {
            config.producer.channels_per_connection = channels;
            config.consumer.channels_per_connection = channels;
        }
        if let Some(prefetch) = self.prefetch {
            config.consumer.prefetch_count = prefetch;
        }
        if let Some(batch) = self.batch_ack_size {
            config.consumer.batch_ack_size = batch;
        }
        if let Some(delay) = self.processing_delay_ms {
            config.consumer.processing_delay_ms = delay;
        }
        if let Some(listen) = &self.metrics_listen {
            config.metrics.listen = Some(listen.clone());
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

type Backends = (Arc<dyn BrokerConnector>, Option<Arc<dyn QueueDepthSource>>);

fn backends(cli: &Cli, config: &Config) -> anyhow::Result<Backends> {
    if cli.simulate {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&config.queue.name, config.queue.queue_type);
        if let Some(at) = cli.simulate_block_at {
            let broker = broker.clone();
            let hold = Duration::from_secs(cli.simulate_block_secs);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(at)).await;
                broker.block("simulated memory alarm");
                tokio::time::sleep(hold).await;
                broker.unblock();
            });
        }
        info!("Running against the in-process simulated broker");
        return Ok((Arc::new(broker.clone()), Some(Arc::new(broker))));
    }

    let depth_source = match ManagementConfig::from_broker(&config.broker) {
        Some(management) => {
            let client = ManagementClient::new(management)?;
            Some(Arc::new(client) as Arc<dyn QueueDepthSource>)
        }
        None => {
            warn!("No management URL configured; queue depth will not be reported");
            None
        }
    };
    Ok((amqp_connector(config)?, depth_source))
}

#[cfg(feature = "amqp")]
fn amqp_connector(config: &Config) -> anyhow::Result<Arc<dyn BrokerConnector>> {
    Ok(Arc::new(rmq_loadgen::broker::AmqpConnector::new(&config.broker)))
}

#[cfg(not(feature = "amqp"))]
fn amqp_connector(_config: &Config) -> anyhow::Result<Arc<dyn BrokerConnector>> {
    anyhow::bail!("built without AMQP support; rebuild with `--features amqp` or pass --simulate")
}

/// Cancel `interrupt` on Ctrl+C or SIGTERM
fn spawn_signal_handler(interrupt: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            let mut terminate = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(terminate) => terminate,
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    let _ = signal::ctrl_c().await;
                    interrupt.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = signal::ctrl_c() => info!("Received Ctrl+C, stopping test"),
                _ = terminate.recv() => info!("Received SIGTERM, stopping test"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = signal::ctrl_c().await;
            info!("Received Ctrl+C, stopping test");
        }
        interrupt.cancel();
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_format);
    panic_handler::install_panic_hook();

    let config = cli.load_config()?;
    info!(
        "Load test against {:?}, queue {} ({})",
        config.broker.endpoints(),
        config.queue.name,
        config.queue.queue_type
    );

    let (connector, depth_source) = backends(&cli, &config)?;
    let orchestrator = TestOrchestrator::new(config, connector, depth_source);
    spawn_signal_handler(orchestrator.interrupt_token());

    let report = orchestrator.run().await.context("Load test failed")?;

    println!("{}", report.render(cli.output)?);
    if let Some(path) = &cli.report_file {
        report.write_to_file(path)?;
        info!("Report written to {}", path.display());
    }
    Ok(())
}
