use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use fxbot::config::GatewayKind;
use fxbot::gateway::{BridgeClient, Gateway, PaperGateway};
use fxbot::logging::{self, setup_logging};
use fxbot::{BotConfig, Orchestrator};

/// Multi-timeframe trading orchestrator
#[derive(Debug, Parser)]
#[command(name = "fxbot", version, about)]
struct Cli {
    /// TOML settings file
    #[arg(short, long, env = "FXBOT_CONFIG")]
    config: Option<PathBuf>,

    /// Use the in-memory paper gateway regardless of the configured one.
    /// It starts with no bars and no instruments, so streams log as empty
    /// and no orders are placed; useful to check settings and startup.
    #[arg(long)]
    paper: bool,

    /// Log filter used when RUST_LOG is unset, e.g. "fxbot=debug"
    #[arg(long)]
    log_filter: Option<String>,

    /// Emit JSON log lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    setup_logging(cli.log_filter.as_deref(), cli.json);

    let config = BotConfig::load(cli.config.as_deref()).context("loading settings")?;
    let gateway = build_gateway(&config, cli.paper)?;

    let handle = Orchestrator::start(config, gateway)
        .await
        .context("starting bot")?;

    tracing::info!(target: logging::MAIN, "Press Ctrl+C to stop...");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl+C")?;

    let report = handle.stop().await;
    tracing::info!(
        target: logging::MAIN,
        "orders: {} placed, {} exhausted retries, {} fatal, {} dropped while paused, {} refused at limit; {} pending discarded",
        report.executor.succeeded,
        report.executor.retries_exhausted,
        report.executor.fatal,
        report.executor.dropped_while_paused,
        report.executor.dropped_at_limit,
        report.discarded_signals
    );
    if let Some(closed) = report.closed {
        for (id, reason) in &closed.failed {
            tracing::warn!(target: logging::ERROR, position_id = id, "left open: {}", reason);
        }
    }

    Ok(())
}

fn build_gateway(config: &BotConfig, force_paper: bool) -> anyhow::Result<Arc<dyn Gateway>> {
    let settings = &config.gateway;
    if force_paper || settings.kind == GatewayKind::Paper {
        tracing::info!(target: logging::MAIN, "using paper gateway");
        tracing::warn!(
            target: logging::MAIN,
            "paper gateway has no market data feed; streams will report empty data"
        );
        return Ok(Arc::new(PaperGateway::new(settings.paper_balance)));
    }

    let client = BridgeClient::new(
        settings.base_url.clone(),
        settings.api_key.clone(),
        settings.timeout(),
        settings.requests_per_second,
    )
    .context("building bridge client")?;
    tracing::info!(target: logging::MAIN, "using bridge gateway at {}", settings.base_url);
    Ok(Arc::new(client))
}
