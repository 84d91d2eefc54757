//! Channel fan-out across both transports
//!
//! A broadcast renders once per transport: a CRLF line for the TCP members
//! and a MSG frame template for the datagram members. Every datagram member
//! gets its own copy under a fresh message id, first transmission in member
//! order, confirmation handled in the background so one silent member never
//! delays the rest.

use std::net::SocketAddr;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::protocol::frame::Frame;
use crate::protocol::text;
use crate::protocol::SERVER_DISPLAY_NAME;
use crate::server::relay::Shared;
use crate::server::session::SendHandle;

/// Notice shown when a client enters a channel
pub fn joined_notice(display_name: &str, channel_id: &str) -> String {
    format!("{} has joined {}", display_name, channel_id)
}

/// Notice shown when a client switches away from a channel
pub fn left_notice(display_name: &str, channel_id: &str) -> String {
    format!("{} has left {}", display_name, channel_id)
}

/// Notice shown when a client leaves the server entirely
pub fn departed_notice(display_name: &str, channel_id: &str) -> String {
    format!("{} has left the {}", display_name, channel_id)
}

/// Relay a chat message to everyone in a channel
///
/// The message text crosses transports verbatim; only the framing differs.
pub async fn to_channel(
    shared: &Shared,
    channel_id: &str,
    exclude: Option<SocketAddr>,
    from_display_name: &str,
    content: &str,
) {
    let members = shared.store.members_of(channel_id, exclude).await;
    if members.is_empty() {
        return;
    }
    debug!(
        "relaying message from {} to {} member(s) of {}",
        from_display_name,
        members.len(),
        channel_id
    );

    let line = text::chat_message(from_display_name, content);
    let template = Frame::msg(from_display_name, content).to_bytes();
    for member in members {
        match member.handle {
            SendHandle::Tcp(tx) => {
                if tx.send(line.clone()).is_err() {
                    warn!("tcp session {} is gone, dropping its copy", member.key);
                }
            }
            SendHandle::Udp(addr) => {
                let send = Arc::clone(&shared.udp).send_background(template.clone(), addr);
                if let Err(e) = send.await {
                    warn!("datagram send to {} failed: {}", addr, e);
                }
            }
        }
    }
}

/// Relay a join/leave announcement, spoken by the server itself
pub async fn server_notice(
    shared: &Shared,
    channel_id: &str,
    exclude: Option<SocketAddr>,
    content: &str,
) {
    to_channel(shared, channel_id, exclude, SERVER_DISPLAY_NAME, content).await;
}
