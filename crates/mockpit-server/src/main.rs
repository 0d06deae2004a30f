//! Mockpit CLI: serve an environment file until interrupted.
//!
//! Usage:
//!   mockpit --data ./environment.json [--port 3000] [--hostname 127.0.0.1] [--metrics-port 9090]

use anyhow::Context;
use clap::{Parser, ValueEnum};
use mockpit_server::{Environment, MetricsServer, ServerEvent, ServerInstance, ServerOptions};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

/// Serve a mock API environment
#[derive(Parser, Debug)]
#[command(name = "mockpit")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Environment file (JSON or YAML)
    #[arg(short, long, env = "MOCKPIT_DATA")]
    data: PathBuf,

    /// Override the environment port
    #[arg(short, long, env = "MOCKPIT_PORT")]
    port: Option<u16>,

    /// Override the environment hostname
    #[arg(long)]
    hostname: Option<String>,

    /// Route ids or path fragments to exclude (repeatable)
    #[arg(long = "disable-routes", value_delimiter = ',')]
    disable_routes: Vec<String>,

    /// Upper bound for callback latency in milliseconds
    #[arg(long)]
    max_callback_latency: Option<u64>,

    /// Serve Prometheus metrics on this port
    #[arg(long, env = "MOCKPIT_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match format {
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_format);

    let environment = Environment::from_file(&args.data)
        .with_context(|| format!("Failed to load environment {}", args.data.display()))?;
    let options = ServerOptions {
        disabled_routes: args.disable_routes,
        hostname_override: args.hostname,
        port_override: args.port,
        max_callback_latency_ms: args.max_callback_latency,
        ..ServerOptions::for_environment_file(&args.data)
    };

    let instance = ServerInstance::start(environment, options)
        .await
        .context("Failed to start the environment")?;
    let mut events = instance.subscribe();

    let metrics = match args.metrics_port {
        Some(port) => {
            let server = MetricsServer::bind(SocketAddr::from(([0, 0, 0, 0], port)))
                .await
                .context("Failed to bind the metrics port")?;
            Some(tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    error!("Metrics server stopped: {}", e);
                }
            }))
        }
        None => None,
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            event = events.recv() => match event {
                Ok(ServerEvent::Error { code, message }) => warn!("[{}] {}", code, message),
                Ok(ServerEvent::CallbackInvoked(record)) => {
                    info!("Callback '{}' -> {:?}", record.name, record.status)
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Event log lagged, {} events skipped", skipped)
                }
                Err(e) => {
                    error!("Event stream closed: {}", e);
                    break;
                }
            }
        }
    }

    instance.stop();
    if let Some(task) = metrics {
        task.abort();
    }
    Ok(())
}
