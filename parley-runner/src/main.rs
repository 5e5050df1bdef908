//! Parley Runner - local bot runner over the console
//!
//! This binary provides a ready-to-use runner that:
//! - Loads runner configuration from a YAML file
//! - Registers the bundled commands and tasks for a console bot
//! - Reloads command configuration under `watcher.base_dir` while running
//! - Stops gracefully on Ctrl+C or SIGTERM

mod commands;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::Parser;
use parley::adapter::ConsoleBot;
use parley::observability::{InMemoryMetrics, spawn_metrics_log_reporter};
use parley::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{Level, error, info};

const BOT_TYPE: &str = "console";

#[derive(Debug, Parser)]
#[command(name = "parley", about = "Run the bundled commands over a console bot")]
struct Args {
    #[arg(long, default_value = "config/parley.yaml")]
    config: PathBuf,
    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,
    /// Seconds between metric log lines; 0 disables them.
    #[arg(long, default_value_t = 60)]
    metrics_interval_secs: u64,
}

/// Writes critical bot failures to the log.
struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, _ctx: Context, bot_type: &BotType, err: &BotError) -> Result<()> {
        error!(bot_type = %bot_type, "ALERT: bot stopped: {}", err);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    info!("Starting Parley...");

    let config = if args.config.exists() {
        RunnerConfig::from_file(&args.config)
            .with_context(|| format!("invalid configuration {}", args.config.display()))?
    } else {
        info!(
            "{} not found, using default configuration",
            args.config.display()
        );
        RunnerConfig::default()
    };

    let mut registry = Registry::new();
    commands::register(&mut registry, BOT_TYPE)?;

    let token = CancellationToken::new();

    let metrics = Arc::new(InMemoryMetrics::new());
    let reporter = (args.metrics_interval_secs > 0).then(|| {
        spawn_metrics_log_reporter(
            metrics.clone(),
            Duration::from_secs(args.metrics_interval_secs),
            token.clone(),
        )
    });

    let runner = Runner::builder(config)
        .bot(ConsoleBot::new(BOT_TYPE))
        .alerter(LogAlerter)
        .registry(registry)
        .metrics(metrics)
        .build()?;

    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            info!("Shutdown signal received");
            token.cancel();
        }
    });

    let result = runner.run(token.clone()).await;
    token.cancel();
    if let Some(reporter) = reporter {
        let _ = reporter.await;
    }
    result?;

    info!("Parley stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
