//! Server assembly: both listeners, the shared state, and shutdown
//!
//! One TCP listener and one UDP socket bind the same address and port. The
//! transport receive loop, the datagram dispatch loop, and the stream accept
//! loop run as long-lived tasks joined on shutdown; a watch channel carries
//! the stop signal to every task down to individual connections.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::info;

use crate::error::{ChatError, Result};
use crate::server::broadcast;
use crate::server::session::SessionStore;
use crate::server::{tcp, udp};
use crate::transport::ReliableUdp;

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address both listeners bind to
    pub listen: String,
    /// Port shared by the TCP listener and the UDP socket
    pub port: u16,
    /// How long a reliable datagram send waits for its CONFIRM
    pub confirm_timeout: Duration,
    /// Retransmissions after the initial send before giving up
    pub max_retransmissions: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1".to_string(),
            port: 4567,
            confirm_timeout: Duration::from_millis(250),
            max_retransmissions: 3,
        }
    }
}

/// State both transport handlers operate on
pub struct Shared {
    /// The session table
    pub store: SessionStore,
    /// Confirmed-delivery sender for datagram members
    pub udp: Arc<ReliableUdp>,
}

impl Shared {
    /// Remove a session and announce its departure to its channel
    pub async fn depart(&self, key: SocketAddr) {
        if let Some(session) = self.store.remove(key).await {
            if let (Some(display_name), Some(channel)) = (session.display_name, session.channel_id)
            {
                broadcast::server_notice(
                    self,
                    &channel,
                    None,
                    &broadcast::departed_notice(&display_name, &channel),
                )
                .await;
            }
        }
    }
}

/// The assembled dual-transport relay server
pub struct RelayServer {
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Bind both listening sockets
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = format!("{}:{}", config.listen, config.port);
        let listener = TcpListener::bind(&addr).await.map_err(|source| ChatError::Startup {
            addr: addr.clone(),
            source,
        })?;
        let socket = UdpSocket::bind(&addr).await.map_err(|source| ChatError::Startup {
            addr: addr.clone(),
            source,
        })?;
        let udp = Arc::new(ReliableUdp::new(
            socket,
            config.confirm_timeout,
            config.max_retransmissions,
        ));
        info!(
            "Listening on tcp {} / udp {}",
            listener.local_addr()?,
            udp.local_addr()?
        );

        Ok(Self {
            listener,
            shared: Arc::new(Shared {
                store: SessionStore::new(),
                udp,
            }),
        })
    }

    /// Addresses actually bound, useful when the configured port was 0
    pub fn local_addrs(&self) -> Result<(SocketAddr, SocketAddr)> {
        Ok((self.listener.local_addr()?, self.shared.udp.local_addr()?))
    }

    /// Serve until interrupted
    pub async fn run(self) -> Result<()> {
        self.run_until(signal::ctrl_c()).await
    }

    /// Serve until the given future completes, then drain every task
    pub async fn run_until(self, shutdown: impl Future) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let mut tasks = JoinSet::new();
        tasks.spawn(Arc::clone(&self.shared.udp).recv_loop(inbound_tx, shutdown_rx.clone()));
        tasks.spawn(udp::dispatch_loop(
            Arc::clone(&self.shared),
            inbound_rx,
            shutdown_rx.clone(),
        ));
        tasks.spawn(tcp::accept_loop(
            self.listener,
            Arc::clone(&self.shared),
            shutdown_rx,
        ));

        shutdown.await;
        info!("Shutdown requested, draining");
        let _ = shutdown_tx.send(true);
        while tasks.join_next().await.is_some() {}
        info!("Server stopped");
        Ok(())
    }
}
