//! Datagram-side session handling
//!
//! The transport's receive loop feeds frames here; each one is handled by a
//! short-lived task. A well-formed frame is confirmed before anything else,
//! duplicates included, then checked against the session's seen-id window so
//! a retransmitted command is never applied twice. Undecodable datagrams
//! draw an ERR frame and touch no session state.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{ChatError, Result};
use crate::protocol::frame::{Frame, FrameBody};
use crate::server::broadcast;
use crate::server::relay::Shared;
use crate::server::session::{SendHandle, TransportKind, DEFAULT_CHANNEL};
use crate::transport::InboundDatagram;

/// Drain the transport's inbound queue until shutdown
pub async fn dispatch_loop(
    shared: Arc<Shared>,
    mut inbound: mpsc::UnboundedReceiver<InboundDatagram>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handlers = JoinSet::new();
    loop {
        tokio::select! {
            datagram = inbound.recv() => match datagram {
                Some(datagram) => {
                    handlers.spawn(handle_datagram(Arc::clone(&shared), datagram));
                }
                None => break,
            },
            Some(_) = handlers.join_next(), if !handlers.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    while handlers.join_next().await.is_some() {}
    debug!("datagram dispatch loop stopped");
}

async fn handle_datagram(shared: Arc<Shared>, datagram: InboundDatagram) {
    let from = datagram.from;
    let frame = match datagram.frame {
        Ok(frame) => frame,
        Err(e) => {
            warn!("malformed datagram from {}: {}", from, e);
            let text = e.client_text().unwrap_or("Malformed message");
            if let Err(send_err) = shared.udp.send_error(text, from).await {
                warn!("error frame to {} failed: {}", from, send_err);
            }
            return;
        }
    };

    debug!("RECV {} | {} (id {})", from, frame.frame_type().name(), frame.id);

    // Receipt is acknowledged before anything else, duplicates included
    if let Err(e) = shared.udp.send_confirm(frame.id, from).await {
        warn!("confirm to {} failed: {}", from, e);
    }

    shared
        .store
        .get_or_create(from, TransportKind::Udp, SendHandle::Udp(from))
        .await;

    if !shared.store.note_message_id(from, frame.id).await {
        debug!("duplicate id {} from {}, dropped", frame.id, from);
        return;
    }

    if let Err(e) = apply_frame(&shared, from, frame).await {
        match e.client_text() {
            // State violation: tell the client, session survives
            Some(text) => {
                if let Err(send_err) = shared.udp.send_error(text, from).await {
                    warn!("error frame to {} failed: {}", from, send_err);
                }
            }
            None => warn!("datagram from {} not handled: {}", from, e),
        }
    }
}

async fn apply_frame(shared: &Arc<Shared>, from: SocketAddr, frame: Frame) -> Result<()> {
    let ref_id = frame.id;
    match frame.body {
        FrameBody::Auth {
            username,
            display_name,
            secret,
        } => auth(shared, from, ref_id, username, display_name, secret).await,
        FrameBody::Join {
            channel_id,
            display_name,
        } => join(shared, from, ref_id, channel_id, display_name).await,
        FrameBody::Msg {
            display_name,
            content,
        } => msg(shared, from, display_name, content).await,
        FrameBody::Bye => {
            shared.depart(from).await;
            Ok(())
        }
        FrameBody::Err { content } => client_error(shared, from, content).await,
        FrameBody::Reply { .. } => Err(ChatError::violation("Unexpected message")),
        // CONFIRMs are consumed by the transport's receive loop
        FrameBody::Confirm => Ok(()),
    }
}

async fn auth(
    shared: &Arc<Shared>,
    from: SocketAddr,
    ref_id: u16,
    username: String,
    display_name: String,
    secret: String,
) -> Result<()> {
    // Check and claim in one critical section; datagram handlers run
    // concurrently, so a split check could let two AUTHs both pass
    let claimed = shared
        .store
        .update(from, {
            let username = username.clone();
            let display_name = display_name.clone();
            move |s| {
                if s.username.is_some() {
                    return false;
                }
                s.username = Some(username);
                s.display_name = Some(display_name);
                s.secret = Some(secret);
                s.channel_id = Some(DEFAULT_CHANNEL.to_string());
                true
            }
        })
        .await
        .unwrap_or(false);
    if !claimed {
        return Err(ChatError::violation("Already authenticated"));
    }
    info!("User {} ({}) authenticated from {}", username, display_name, from);

    // The direct reply settles before the channel hears about the arrival
    let _ = shared
        .udp
        .send_reply(true, ref_id, "Auth success", from)
        .await?;
    broadcast::server_notice(
        shared,
        DEFAULT_CHANNEL,
        None,
        &broadcast::joined_notice(&display_name, DEFAULT_CHANNEL),
    )
    .await;
    Ok(())
}

async fn join(
    shared: &Arc<Shared>,
    from: SocketAddr,
    ref_id: u16,
    channel_id: String,
    display_name: String,
) -> Result<()> {
    let old_channel = shared
        .store
        .update(from, {
            let display_name = display_name.clone();
            move |s| {
                s.display_name = Some(display_name);
                s.channel_id.clone()
            }
        })
        .await
        .flatten();

    if let Some(old) = old_channel {
        broadcast::server_notice(
            shared,
            &old,
            Some(from),
            &broadcast::left_notice(&display_name, &old),
        )
        .await;
    }

    shared
        .store
        .update(from, {
            let channel_id = channel_id.clone();
            move |s| s.channel_id = Some(channel_id)
        })
        .await;
    info!("User {} joined {}", display_name, channel_id);

    let _ = shared
        .udp
        .send_reply(true, ref_id, "Join success", from)
        .await?;
    broadcast::server_notice(
        shared,
        &channel_id,
        None,
        &broadcast::joined_notice(&display_name, &channel_id),
    )
    .await;
    Ok(())
}

async fn msg(
    shared: &Arc<Shared>,
    from: SocketAddr,
    display_name: String,
    content: String,
) -> Result<()> {
    let channel = shared.store.get(from).await.and_then(|s| s.channel_id);
    match channel {
        Some(channel) => {
            broadcast::to_channel(shared, &channel, Some(from), &display_name, &content).await;
            Ok(())
        }
        None => Err(ChatError::violation("Not authenticated")),
    }
}

async fn client_error(shared: &Arc<Shared>, from: SocketAddr, content: String) -> Result<()> {
    warn!("{} reported an error: {}", from, content);
    // Answer BYE; its confirm-wait must not delay the leave notice, and a
    // failed send must not keep the session alive
    let bye = Frame::new(0, FrameBody::Bye).to_bytes();
    if let Err(e) = Arc::clone(&shared.udp).send_background(bye, from).await {
        warn!("farewell to {} failed: {}", from, e);
    }
    shared.depart(from).await;
    Ok(())
}
