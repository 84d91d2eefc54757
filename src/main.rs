//! Dual-transport chat relay server
//!
//! Listens for text-protocol clients over TCP and binary-protocol clients
//! over UDP on the same port, relaying channel traffic between them.
//!
//! Usage:
//!   parley                          # defaults: 127.0.0.1:4567
//!   parley -l 0.0.0.0 -p 5000      # custom bind address
//!   RUST_LOG=parley=debug parley    # per-datagram traffic logging

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use parley::server::{RelayServer, ServerConfig};

#[derive(Parser, Debug)]
#[command(version, about = "Dual-transport chat relay server")]
struct Args {
    /// Address to listen on
    #[arg(short = 'l', long, default_value = "127.0.0.1")]
    listen: String,

    /// Port for both the TCP listener and the UDP socket
    #[arg(short = 'p', long, default_value_t = 4567)]
    port: u16,

    /// UDP confirmation timeout in milliseconds
    #[arg(short = 'd', long = "confirm-timeout", default_value_t = 250)]
    confirm_timeout_ms: u64,

    /// UDP retransmissions after the initial send
    #[arg(short = 'r', long, default_value_t = 3)]
    max_retransmissions: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("parley=info".parse()?))
        .init();

    let args = Args::parse();
    let config = ServerConfig {
        listen: args.listen,
        port: args.port,
        confirm_timeout: Duration::from_millis(args.confirm_timeout_ms),
        max_retransmissions: args.max_retransmissions,
    };

    let server = RelayServer::bind(config).await?;
    server.run().await?;
    Ok(())
}
