//! Kite Sidekick - standalone relay process.

use anyhow::Result;
use clap::Parser;
use kite_core::RelayConfig;
use kite_sidekick::{start_sidekick, SidekickSettings};
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(name = "kite-sidekick")]
#[command(about = "Realtime relay for Kite procedure servers")]
struct Args {
    /// Port to listen on (0 = auto-assign)
    #[arg(short, long, default_value_t = RelayConfig::DEFAULT_PORT)]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Base URL of the procedure server receiving forwarded channel messages
    #[arg(long)]
    server_url: Option<String>,

    /// Shared secret for the control plane
    #[arg(long, env = "KITE_SIDEKICK_SECRET", hide_env_values = true)]
    secret: String,

    /// Frames buffered per client before the oldest is dropped
    #[arg(long, default_value_t = RelayConfig::OUTBOUND_QUEUE_CAPACITY)]
    queue_capacity: usize,

    /// Seconds an unredeemed connection token stays valid (0 = forever)
    #[arg(long, default_value_t = RelayConfig::PENDING_TOKEN_TTL.as_secs())]
    pending_ttl_secs: u64,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging
    let log_level = if args.debug { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    info!("Starting Kite Sidekick");

    let mut settings = SidekickSettings::new(args.secret);
    settings.server_url = args.server_url;
    settings.queue_capacity = args.queue_capacity;
    settings.pending_ttl = match args.pending_ttl_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };

    match &settings.server_url {
        Some(url) => info!("Forwarding channel messages to {}", url),
        None => info!("No procedure server configured"),
    }

    let addr = start_sidekick(settings, &args.host, args.port).await?;

    // Print port for process supervisors to read (intentional stdout)
    println!("SIDEKICK_PORT={}", addr.port());

    info!("Sidekick running on {}", addr);

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, exiting");

    Ok(())
}
