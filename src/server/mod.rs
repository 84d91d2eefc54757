//! The relay server: shared session state, one handler per transport,
//! cross-transport fan-out
//!
//! ## Layout
//!
//! - **session**: the session table both transports mutate
//! - **tcp**: accept loop and per-connection command handling
//! - **udp**: datagram dispatch over the reliable transport
//! - **broadcast**: channel fan-out choosing line or frame per member
//! - **relay**: configuration, socket binding, task lifecycle

pub mod broadcast;
pub mod relay;
pub mod session;
pub mod tcp;
pub mod udp;

pub use relay::{RelayServer, ServerConfig, Shared};
pub use session::{SendHandle, Session, SessionStore, TransportKind, DEFAULT_CHANNEL};
