use std::sync::Arc;
use anyhow::{Context, Result};
use clap::Parser;
use invitrack_core::InviteTracker;
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod gateway;
mod http_platform;
mod welcome;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Args::parse();
    let config = config::Config::load(&args.config)?;
    init_tracing(args.json_logs || config.logging.format == config::LogFormat::Json);
    tracing::info!("Loaded configuration from '{}'", args.config);
    config.validate()?;

    let platform = http_platform::HttpPlatform::new(
        &config.platform.api_base,
        &config.platform.token,
        config.request_timeout(),
    )
    .context("could not build platform HTTP client")?;

    let tracker = Arc::new(InviteTracker::new(Arc::new(platform), config.tracker()));

    let shutdown_notify = Arc::new(tokio::sync::Notify::new());
    let welcome = welcome::spawn_welcome_logger(tracker.subscribe(), shutdown_notify.clone());

    let consumer = gateway::GatewayConsumer::new(
        &config.platform.gateway_url,
        &config.platform.token,
        config.platform.intents,
        tracker.clone(),
    );
    let gateway = tokio::spawn(consumer.run());

    print_startup_banner(&config);

    tokio::signal::ctrl_c().await?;
    println!();
    tracing::info!("Shutting down (ctrl-c)...");

    gateway.abort();
    tracker.shutdown();
    shutdown_notify.notify_waiters();
    let _ = welcome.await;

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("invitrack=info"));
    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn print_startup_banner(config: &config::Config) {
    println!();
    println!("  Invitrack {}", env!("CARGO_PKG_VERSION"));
    println!();
    println!("  API:         {}", config.platform.api_base);
    println!("  Gateway:     {}", config.platform.gateway_url);
    println!(
        "  Recompute:   every {}s",
        config.scheduler.recompute_interval_secs
    );
    println!("  Grace:       {}s", config.grace.period_secs);
    println!();
}
