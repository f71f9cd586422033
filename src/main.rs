//! Room relay - Entry Point
//!
//! Parses the command line, starts the server and runs it until Ctrl-C.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use room_relay::config::{
    Config, DEFAULT_ADDR, DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_PONG_WAIT, DEFAULT_ROOM_LIFETIME,
};
use room_relay::Server;

/// WebSocket relay for short-lived broadcast rooms
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Socket address to listen on
    #[arg(long, default_value = DEFAULT_ADDR)]
    addr: String,

    /// Lifetime of each room in seconds
    #[arg(long, default_value_t = DEFAULT_ROOM_LIFETIME.as_secs())]
    room_lifetime_secs: u64,

    /// Idle timeout for client connections in seconds
    #[arg(long, default_value_t = DEFAULT_PONG_WAIT.as_secs())]
    pong_wait_secs: u64,

    /// Maximum inbound message size in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_MESSAGE_SIZE)]
    max_message_size: usize,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            addr: self.addr,
            room_lifetime: Duration::from_secs(self.room_lifetime_secs),
            max_message_size: self.max_message_size,
            ..Config::default()
        }
        .with_pong_wait(Duration::from_secs(self.pong_wait_secs))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging with environment filter
    // Use RUST_LOG env var to control log level
    // e.g., RUST_LOG=debug or RUST_LOG=room_relay=trace
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("room_relay=info")),
        )
        .init();

    let config = Cli::parse().into_config();
    let lifetime = config.room_lifetime;

    let server = Server::bind(config).await?;
    info!(
        "Room relay listening on {} (room lifetime {:?})",
        server.local_addr()?,
        lifetime
    );

    server.run_until_ctrl_c().await;
    Ok(())
}
