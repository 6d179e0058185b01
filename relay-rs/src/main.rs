//! smtp-relay: SMTP relay service
//!
//! Listens for mail from allow-listed clients and forwards it to the
//! configured smart host. Stops on Ctrl-C.

use anyhow::Context;
use clap::Parser;
use relay_rs::relay::RelayTransaction;
use relay_rs::smtp::SmtpServer;
use relay_rs::sweeper::LogRetentionSweeper;
use relay_rs::trace::TraceLog;
use relay_rs::transport::SmtpTransportFactory;
use relay_rs::Settings;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "smtp-relay", version)]
#[command(about = "Relay mail from the local network to a smart host", long_about = None)]
struct Args {
    /// Settings file shared with relay-config
    #[arg(long, env = "SMTP_RELAY_CONFIG", default_value = "config.json")]
    config: PathBuf,

    /// Directory for protocol trace files
    #[arg(long, env = "SMTP_RELAY_LOG_DIR", default_value = "logs")]
    log_dir: PathBuf,

    /// Override the listenPort setting
    #[arg(long, env = "SMTP_RELAY_LISTEN_PORT")]
    listen_port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "smtp_relay=info,relay_rs=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting smtp-relay v{}", env!("CARGO_PKG_VERSION"));

    info!("Loading configuration from {}", args.config.display());
    let mut settings = Settings::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(port) = args.listen_port {
        settings.listen_port = port;
    }
    if let Err(e) = settings.validate() {
        warn!("Configuration problem: {} (affected relay attempts will fail)", e);
    }

    if !settings.smart_host_configured() {
        warn!("No smart host configured, every relay attempt will fail until one is set");
    }
    if settings.allow_all_ips {
        warn!("allowAllIPs is enabled, any client may relay");
    }
    info!("Settings: {:?}", settings);

    let settings = Arc::new(settings);
    let trace = Arc::new(TraceLog::new(&args.log_dir));
    let relay = Arc::new(RelayTransaction::new(
        Arc::clone(&settings),
        Arc::clone(&trace),
        Arc::new(SmtpTransportFactory::new()),
    ));

    let shutdown = CancellationToken::new();

    // Trace retention runs beside the listener
    let sweeper = LogRetentionSweeper::new(&args.log_dir, &settings);
    let sweeper_task = tokio::spawn(sweeper.run(shutdown.child_token()));

    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Shutdown requested");
                ctrl_c.cancel();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    let server = SmtpServer::new(settings, relay, trace);
    let result = server.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = sweeper_task.await {
        error!("Trace retention task failed: {}", e);
    }

    result.context("SMTP listener failed")?;
    info!("smtp-relay stopped");
    Ok(())
}
