//! Dual-transport chat relay
//!
//! A chat server reachable over two transports at once: a CRLF-delimited
//! text protocol over TCP and a confirmed binary protocol over UDP. Clients
//! authenticate, join named channels, and exchange messages; the server
//! relays each message to every other channel member in whichever wire
//! format that member's transport speaks.
//!
//! The UDP side compensates for datagram loss with stop-and-wait
//! acknowledgment: every protocol frame the server sends is retransmitted
//! until the peer confirms it or the retry budget runs out.

pub mod error;
pub mod protocol;
pub mod server;
pub mod transport;

pub use error::{ChatError, Result};
pub use server::{RelayServer, ServerConfig};
