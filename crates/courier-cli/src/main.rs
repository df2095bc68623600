//! `courier`: administer the broker queues behind an agent pipeline.

mod config;

use clap::{Parser, Subcommand};
use config::CourierConfig;
use courier_broker::{AmqpTransport, BrokerConnection, Publisher, Queue, Transport};
use courier_core::{Envelope, QueueName};
use courier_orchestrator::{snapshot_queues, wait_for_drain};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "courier", about = "Courier: durable work queues for agent pipelines")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "courier.toml")]
    config: PathBuf,

    /// Broker host (overrides config and environment)
    #[arg(long, global = true)]
    host: Option<String>,

    /// Broker port (overrides config and environment)
    #[arg(long, global = true)]
    port: Option<u16>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print message counts for every pipeline stage queue as JSON
    Queues,
    /// Declare a queue
    Declare {
        queue: String,
        /// Declare a non-durable queue
        #[arg(long)]
        transient: bool,
    },
    /// Publish a text envelope to a queue
    Publish {
        queue: String,
        content: String,
        #[arg(long, default_value = "cli")]
        sender: String,
        #[arg(long)]
        correlation_id: Option<String>,
    },
    /// Wait until every pipeline stage queue is empty
    Drain {
        #[arg(long, default_value_t = 60)]
        max_wait_secs: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(log_filter(None))
        .json()
        .init();

    let cli = Cli::parse();
    let mut config = CourierConfig::load(&cli.config).await?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config.apply_flags(cli.host, cli.port);
    config.validate()?;

    let transport: Arc<dyn Transport> = Arc::new(AmqpTransport::new("courier-cli"));
    let connection = Arc::new(BrokerConnection::new(config.broker.clone(), transport));
    info!(endpoint = %config.broker.endpoint(), "Connecting");

    let result = connection
        .scoped(|conn| async move {
            match cli.command {
                Commands::Queues => {
                    let stages = config.pipeline.stage_queues()?;
                    let snapshot = snapshot_queues(&conn, &stages).await?;
                    println!("{}", serde_json::to_string_pretty(&snapshot)?);
                }
                Commands::Declare { queue, transient } => {
                    let name = QueueName::new(queue)?;
                    Queue::declare(&conn, &name, !transient).await?;
                    println!("Declared '{}' (durable: {})", name, !transient);
                }
                Commands::Publish {
                    queue,
                    content,
                    sender,
                    correlation_id,
                } => {
                    let name = QueueName::new(queue)?;
                    let mut envelope = Envelope::text(content, sender);
                    if let Some(id) = correlation_id {
                        envelope = envelope.with_correlation_id(id);
                    }
                    let publisher = Publisher::new(Arc::clone(&conn));
                    publisher.publish(&name, &envelope).await?;
                    publisher.close().await?;
                    println!("Published {} to '{}'", envelope.message_id(), name);
                }
                Commands::Drain { max_wait_secs } => {
                    let stages = config.pipeline.stage_queues()?;
                    let report = wait_for_drain(
                        &conn,
                        &stages,
                        config.pipeline.drain_poll_interval(),
                        Duration::from_secs(max_wait_secs),
                    )
                    .await?;
                    println!("{}", serde_json::to_string_pretty(&report)?);
                    if !report.drained {
                        return Err(courier_core::CourierError::Timeout(format!(
                            "{} message(s) still queued after {}s",
                            report.pending(),
                            max_wait_secs
                        )));
                    }
                }
            }
            Ok(())
        })
        .await;

    result.map_err(anyhow::Error::from)
}

/// Load `.env` (the given file, or the nearest one found upward) and build
/// the log filter from the resulting `RUST_LOG`. Defaults to `info`.
fn log_filter(env_file: Option<&Path>) -> EnvFilter {
    // A missing .env is fine.
    if let Some(path) = env_file {
        dotenvy::from_path(path).ok();
    } else {
        dotenvy::dotenv().ok();
    }
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}
