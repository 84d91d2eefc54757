//! Stream-side session handling
//!
//! Every accepted connection runs as its own task: a read loop parses
//! length-bounded CRLF-delimited commands, and a paired writer task owns the
//! write half so replies and broadcast copies never interleave mid-line. All
//! channel state lives in the shared session store, which is how stream
//! members and datagram members see each other.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::protocol::text::{self, TextCommand, TextParseError};
use crate::server::broadcast;
use crate::server::relay::Shared;
use crate::server::session::{SendHandle, TransportKind, DEFAULT_CHANNEL};

/// Accept connections until shutdown; each one runs as an independent task
pub async fn accept_loop(
    listener: TcpListener,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    info!("New connection from {}", peer);
                    connections.spawn(handle_connection(
                        stream,
                        peer,
                        Arc::clone(&shared),
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!("accept failed: {}", e),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    // Connection tasks watch the same shutdown signal; let them finish
    while connections.join_next().await.is_some() {}
    debug!("stream accept loop stopped");
}

/// How a connection's read loop ended
enum StreamEnd {
    /// A BYE or ERR command ended the session; the handler already cleaned up
    Command,
    /// EOF or read error without a BYE
    Lost,
    /// Server shutdown
    Shutdown,
}

/// One read from the bounded line reader
#[derive(Debug)]
enum InboundLine {
    Line(String),
    /// The line exceeded `MAX_LINE_LENGTH`; its remainder is discarded
    Oversized,
    /// EOF
    Closed,
}

/// CRLF line reader that never buffers more than one bounded line
///
/// A peer may stream bytes without ever sending a delimiter; the buffered
/// prefix is capped at `MAX_LINE_LENGTH` and an oversized line is reported
/// once, then skipped through its terminator.
struct LineReader<R> {
    reader: R,
    buf: BytesMut,
    discarding: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: BytesMut::with_capacity(4096),
            discarding: false,
        }
    }

    async fn next_line(&mut self) -> io::Result<InboundLine> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                if self.discarding {
                    self.discarding = false;
                    continue;
                }
                line.truncate(line.len() - 1);
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                if line.len() > text::MAX_LINE_LENGTH {
                    return Ok(InboundLine::Oversized);
                }
                let text = String::from_utf8(line.to_vec())
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                return Ok(InboundLine::Line(text));
            }
            if self.discarding {
                self.buf.clear();
            } else if self.buf.len() > text::MAX_LINE_LENGTH {
                self.discarding = true;
                self.buf.clear();
                return Ok(InboundLine::Oversized);
            }
            if self.reader.read_buf(&mut self.buf).await? == 0 {
                return Ok(InboundLine::Closed);
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    shared: Arc<Shared>,
    mut shutdown: watch::Receiver<bool>,
) {
    let (reader, writer) = stream.into_split();
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let writer_task = tokio::spawn(write_lines(writer, peer, line_rx));

    shared
        .store
        .get_or_create(peer, TransportKind::Tcp, SendHandle::Tcp(line_tx.clone()))
        .await;

    let mut lines = LineReader::new(reader);
    let end = loop {
        tokio::select! {
            next = lines.next_line() => match next {
                Ok(InboundLine::Line(line)) => {
                    debug!("RECV {} | {}", peer, line);
                    if !handle_line(&shared, peer, &line_tx, &line).await {
                        break StreamEnd::Command;
                    }
                }
                Ok(InboundLine::Oversized) => {
                    warn!("{} sent an oversized line, discarded", peer);
                    let _ = line_tx.send(TextParseError::Unknown.reply_line().to_string());
                }
                Ok(InboundLine::Closed) => {
                    debug!("{} closed the stream", peer);
                    break StreamEnd::Lost;
                }
                Err(e) => {
                    warn!("read error from {}: {}", peer, e);
                    break StreamEnd::Lost;
                }
            },
            _ = shutdown.changed() => break StreamEnd::Shutdown,
        }
    };

    match end {
        StreamEnd::Command => {}
        // The peer vanished without BYE; announce its departure
        StreamEnd::Lost => shared.depart(peer).await,
        StreamEnd::Shutdown => {
            shared.store.remove(peer).await;
        }
    }

    drop(line_tx);
    let _ = writer_task.await;
    info!("Connection from {} closed", peer);
}

/// The connection's writer task: owns the write half, appends CRLF
async fn write_lines(
    mut writer: OwnedWriteHalf,
    peer: SocketAddr,
    mut lines: mpsc::UnboundedReceiver<String>,
) {
    while let Some(line) = lines.recv().await {
        debug!("SENT {} | {}", peer, line);
        if let Err(e) = writer.write_all(format!("{}\r\n", line).as_bytes()).await {
            warn!("write to {} failed: {}", peer, e);
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Process one inbound line; false means the session is over
async fn handle_line(
    shared: &Shared,
    peer: SocketAddr,
    replies: &mpsc::UnboundedSender<String>,
    line: &str,
) -> bool {
    match TextCommand::parse(line) {
        Ok(TextCommand::Auth {
            username,
            display_name,
            secret,
        }) => {
            handle_auth(shared, peer, replies, username, display_name, secret).await;
            true
        }
        Ok(TextCommand::Join {
            channel_id,
            display_name,
        }) => {
            handle_join(shared, peer, replies, channel_id, display_name).await;
            true
        }
        Ok(TextCommand::Msg {
            display_name,
            content,
        }) => {
            handle_msg(shared, peer, replies, display_name, content).await;
            true
        }
        Ok(TextCommand::Err) => {
            warn!("{} reported an error: {}", peer, line);
            let _ = replies.send("BYE".to_string());
            shared.depart(peer).await;
            false
        }
        Ok(TextCommand::Bye) => {
            shared.depart(peer).await;
            false
        }
        Err(bad) => {
            let _ = replies.send(bad.reply_line().to_string());
            true
        }
    }
}

async fn handle_auth(
    shared: &Shared,
    peer: SocketAddr,
    replies: &mpsc::UnboundedSender<String>,
    username: String,
    display_name: String,
    secret: String,
) {
    // Check and claim in one critical section, as the datagram side does
    let claimed = shared
        .store
        .update(peer, {
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
        let _ = replies.send(text::server_error("Already authenticated"));
        return;
    }
    info!("User {} ({}) authenticated from {}", username, display_name, peer);

    let _ = replies.send(text::reply_ok("Auth success"));
    broadcast::server_notice(
        shared,
        DEFAULT_CHANNEL,
        None,
        &broadcast::joined_notice(&display_name, DEFAULT_CHANNEL),
    )
    .await;
}

async fn handle_join(
    shared: &Shared,
    peer: SocketAddr,
    replies: &mpsc::UnboundedSender<String>,
    channel_id: String,
    display_name: String,
) {
    let old_channel = shared
        .store
        .update(peer, {
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
            Some(peer),
            &broadcast::left_notice(&display_name, &old),
        )
        .await;
    }

    shared
        .store
        .update(peer, {
            let channel_id = channel_id.clone();
            move |s| s.channel_id = Some(channel_id)
        })
        .await;
    info!("User {} joined {}", display_name, channel_id);

    let _ = replies.send(text::reply_ok("Join success"));
    broadcast::server_notice(
        shared,
        &channel_id,
        None,
        &broadcast::joined_notice(&display_name, &channel_id),
    )
    .await;
}

async fn handle_msg(
    shared: &Shared,
    peer: SocketAddr,
    replies: &mpsc::UnboundedSender<String>,
    display_name: String,
    content: String,
) {
    let channel = shared.store.get(peer).await.and_then(|s| s.channel_id);
    match channel {
        Some(channel) => {
            broadcast::to_channel(shared, &channel, Some(peer), &display_name, &content).await;
        }
        None => {
            let _ = replies.send(text::server_error("Not authenticated"));
        }
    }
}
