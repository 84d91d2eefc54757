//! Transport layer: confirmed delivery over the shared UDP socket
//!
//! TCP needs no help from this layer; its ordering and delivery come from
//! the stream itself. The datagram side gets a stop-and-wait confirmation
//! scheme with bounded retransmission.

pub mod reliable;

pub use reliable::{InboundDatagram, ReliableUdp, SendOutcome};
