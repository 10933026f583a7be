//! event-redis binary entry point.
//!
//! Usage: some-producer | event-redis [--hostname <host>] [--queue <name>]
//!
//! Reads one JSON object per line from stdin and forwards each to the
//! configured Redis list. Flushes for at most the shutdown deadline on EOF
//! or Ctrl-C.

use anyhow::Context;
use clap::Parser;
use event_redis::logging::{self, LogConfig};
use event_redis::{BridgeConfig, Event, EventPublisher, ReconnectPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

/// event-redis: forward newline-delimited JSON events into a Redis list.
#[derive(Parser, Debug)]
#[command(name = "event-redis")]
#[command(about = "Forward newline-delimited JSON events into a Redis list")]
struct Args {
    /// Redis hostname.
    #[arg(long, env = "EVENT_REDIS_HOSTNAME")]
    hostname: Option<String>,

    /// Redis port.
    #[arg(long, env = "EVENT_REDIS_PORT")]
    port: Option<u16>,

    /// List the events are pushed onto.
    #[arg(long, env = "EVENT_REDIS_QUEUE")]
    queue: Option<String>,

    /// Connect timeout in milliseconds.
    #[arg(long, env = "EVENT_REDIS_CONNECT_TIMEOUT_MS")]
    connect_timeout_ms: Option<u64>,

    /// Reconnect with exponential backoff after the link drops.
    #[arg(long)]
    reconnect: bool,

    /// Also append JSON log lines to this file.
    #[arg(long, env = "EVENT_REDIS_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn build_config(args: &Args) -> BridgeConfig {
    let mut config = BridgeConfig::from_env();

    if let Some(hostname) = &args.hostname {
        config.endpoint.host = hostname.clone();
    }
    if let Some(port) = args.port {
        config.endpoint.port = port;
    }
    if let Some(queue) = &args.queue {
        config.endpoint.queue_name = queue.clone();
    }
    if let Some(ms) = args.connect_timeout_ms {
        config.endpoint.connect_timeout = Duration::from_millis(ms);
    }
    if args.reconnect {
        config.reconnect = ReconnectPolicy::backoff();
    }

    config
}

fn forward_line(publisher: &EventPublisher, line: &str) {
    let line = line.trim();
    if line.is_empty() {
        return;
    }

    match Event::from_json(line) {
        Ok(event) => {
            publisher.publish(&event);
        }
        Err(e) => warn!(error = %e, line = %line, "Skipping malformed event line"),
    }
}

/// Give the first connection attempt a chance before consuming input.
async fn wait_until_ready(publisher: &EventPublisher, limit: Duration) {
    let started = tokio::time::Instant::now();
    while !publisher.connection().is_ready() && started.elapsed() < limit {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    logging::init_with_config(LogConfig {
        default_level: args.log_level.clone(),
        log_path: args.log_file.clone(),
    })
    .context("failed to open log file")?;

    let config = build_config(&args);
    info!(
        host = %config.endpoint.host,
        port = config.endpoint.port,
        queue = %config.endpoint.queue_name,
        connect_timeout_ms = config.endpoint.connect_timeout.as_millis() as u64,
        "Configuration loaded"
    );

    let shutdown_deadline = config.shutdown_deadline;
    let connect_timeout = config.endpoint.connect_timeout;

    let publisher = EventPublisher::start(config, &tokio::runtime::Handle::current())
        .context("failed to start event publisher")?;

    wait_until_ready(&publisher, connect_timeout).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => forward_line(&publisher, &line),
                Ok(None) => {
                    info!("Input closed");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read input");
                    break;
                }
            },
            _ = &mut ctrl_c => {
                info!("Received shutdown signal, flushing...");
                break;
            }
        }
    }

    publisher.shutdown(shutdown_deadline).await;

    Ok(())
}
