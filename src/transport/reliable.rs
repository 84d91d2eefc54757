//! Reliable delivery over the shared datagram socket
//!
//! The datagram transport is unreliable, so every protocol frame the server
//! sends is confirmed by the peer: send, wait up to the confirmation timeout
//! for a CONFIRM carrying the frame's id, retransmit on silence, give up
//! after a bounded number of retransmissions.
//!
//! One socket serves all peers for both directions. A single receive loop
//! classifies every inbound datagram: CONFIRMs resolve entries in the
//! pending-acknowledgment table (keyed by remote address + expected id),
//! everything else is handed to the session handler. Waiters never touch the
//! socket for receiving, so concurrent sends cannot steal each other's
//! traffic.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::protocol::frame::{rewrite_message_id, Frame, FrameBody, FrameType, MAX_DATAGRAM_SIZE};

/// Outcome of one reliable send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The peer confirmed the frame
    Acknowledged,
    /// Retransmissions are exhausted and no confirmation arrived
    Abandoned,
}

/// One datagram handed from the receive loop to the session handler
///
/// Undecodable input travels as the error so the handler decides the
/// session's fate; the transport itself never mutates session state.
#[derive(Debug)]
pub struct InboundDatagram {
    pub from: SocketAddr,
    pub frame: Result<Frame>,
}

/// Confirmed-delivery wrapper around the shared UDP socket
pub struct ReliableUdp {
    /// The one socket shared by the receive loop and all sends
    socket: UdpSocket,

    /// Outstanding reliable sends awaiting a CONFIRM
    pending: Mutex<HashMap<(SocketAddr, u16), oneshot::Sender<()>>>,

    /// Monotonic message id generator, unique per sender for the process
    next_id: AtomicU16,

    /// How long to wait for a CONFIRM before retransmitting
    confirm_timeout: Duration,

    /// How many retransmissions to attempt after the initial send
    max_retransmissions: u32,
}

impl ReliableUdp {
    /// Wrap a bound socket with the given retry configuration
    pub fn new(socket: UdpSocket, confirm_timeout: Duration, max_retransmissions: u32) -> Self {
        Self {
            socket,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(1),
            confirm_timeout,
            max_retransmissions,
        }
    }

    /// Local address of the shared socket
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    fn next_message_id(&self) -> u16 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Stamp a fresh id onto the encoded frame and register its waiter
    async fn register(&self, to: SocketAddr, datagram: &mut BytesMut) -> (u16, oneshot::Receiver<()>) {
        let id = self.next_message_id();
        rewrite_message_id(datagram, id);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert((to, id), tx);
        (id, rx)
    }

    async fn forget(&self, to: SocketAddr, id: u16) {
        self.pending.lock().await.remove(&(to, id));
    }

    /// Send an encoded frame and wait for its CONFIRM, retransmitting the
    /// same id on timeout
    ///
    /// The frame's id bytes are overwritten with a fresh id before the first
    /// transmission, so callers may pass a shared encoded template.
    pub async fn send_reliable(&self, mut datagram: BytesMut, to: SocketAddr) -> Result<SendOutcome> {
        let (id, rx) = self.register(to, &mut datagram).await;
        if let Err(e) = self.socket.send_to(&datagram, to).await {
            self.forget(to, id).await;
            return Err(e.into());
        }
        debug!("SENT {} | {} (id {})", to, frame_name(&datagram), id);
        self.await_confirm(datagram, to, id, rx).await
    }

    /// Like `send_reliable`, but return after the first transmission and
    /// finish the confirm-wait in a background task
    ///
    /// Used for broadcasts: first transmissions happen in dispatch order
    /// while one silent member's retries never delay the others. An
    /// abandonment is logged by the background task.
    pub async fn send_background(self: Arc<Self>, mut datagram: BytesMut, to: SocketAddr) -> Result<()> {
        let (id, rx) = self.register(to, &mut datagram).await;
        if let Err(e) = self.socket.send_to(&datagram, to).await {
            self.forget(to, id).await;
            return Err(e.into());
        }
        debug!("SENT {} | {} (id {})", to, frame_name(&datagram), id);
        tokio::spawn(async move {
            if let Err(e) = self.await_confirm(datagram, to, id, rx).await {
                warn!("retransmission to {} failed: {}", to, e);
            }
        });
        Ok(())
    }

    async fn await_confirm(
        &self,
        datagram: BytesMut,
        to: SocketAddr,
        id: u16,
        mut rx: oneshot::Receiver<()>,
    ) -> Result<SendOutcome> {
        let mut retries = 0u32;
        loop {
            match timeout(self.confirm_timeout, &mut rx).await {
                Ok(Ok(())) => {
                    trace!("RECV {} | CONFIRM (id {})", to, id);
                    return Ok(SendOutcome::Acknowledged);
                }
                // Waiter displaced from the table; nothing left to wait on
                Ok(Err(_)) => return Ok(SendOutcome::Abandoned),
                Err(_) => {
                    if retries >= self.max_retransmissions {
                        break;
                    }
                    retries += 1;
                    debug!(
                        "RETRY {} | {} (id {}, retry {}/{})",
                        to,
                        frame_name(&datagram),
                        id,
                        retries,
                        self.max_retransmissions
                    );
                    if let Err(e) = self.socket.send_to(&datagram, to).await {
                        self.forget(to, id).await;
                        return Err(e.into());
                    }
                }
            }
        }
        self.forget(to, id).await;
        warn!(
            "no CONFIRM from {} for id {} after {} transmissions, giving up",
            to,
            id,
            self.max_retransmissions + 1
        );
        Ok(SendOutcome::Abandoned)
    }

    /// Acknowledge an inbound frame; fire-and-forget, never itself confirmed
    pub async fn send_confirm(&self, ref_id: u16, to: SocketAddr) -> Result<()> {
        let datagram = Frame::new(ref_id, FrameBody::Confirm).to_bytes();
        self.socket.send_to(&datagram, to).await?;
        debug!("SENT {} | CONFIRM (id {})", to, ref_id);
        Ok(())
    }

    /// Send a REPLY answering the command with id `ref_id`
    pub async fn send_reply(
        &self,
        success: bool,
        ref_id: u16,
        content: &str,
        to: SocketAddr,
    ) -> Result<SendOutcome> {
        let frame = Frame::new(
            0,
            FrameBody::Reply {
                success,
                ref_id,
                content: content.to_string(),
            },
        );
        self.send_reliable(frame.to_bytes(), to).await
    }

    /// Send an ERR frame
    pub async fn send_error(&self, content: &str, to: SocketAddr) -> Result<SendOutcome> {
        let frame = Frame::new(
            0,
            FrameBody::Err {
                content: content.to_string(),
            },
        );
        self.send_reliable(frame.to_bytes(), to).await
    }

    /// Send a BYE frame
    pub async fn send_bye(&self, to: SocketAddr) -> Result<SendOutcome> {
        let frame = Frame::new(0, FrameBody::Bye);
        self.send_reliable(frame.to_bytes(), to).await
    }

    /// The receive loop for the shared socket
    ///
    /// Runs until shutdown is signalled or the handler side hangs up.
    /// CONFIRMs resolve their pending entry here; every other datagram,
    /// decoded or not, goes to `inbound`.
    pub async fn recv_loop(
        self: Arc<Self>,
        inbound: mpsc::UnboundedSender<InboundDatagram>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                received = self.socket.recv_from(&mut buf) => {
                    let (len, from) = match received {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("datagram receive error: {}", e);
                            continue;
                        }
                    };
                    match Frame::decode(&buf[..len]) {
                        Ok(frame) if frame.frame_type() == FrameType::Confirm => {
                            let waiter = self.pending.lock().await.remove(&(from, frame.id));
                            match waiter {
                                Some(tx) => {
                                    let _ = tx.send(());
                                }
                                None => trace!("stale CONFIRM (id {}) from {}", frame.id, from),
                            }
                        }
                        result => {
                            if inbound.send(InboundDatagram { from, frame: result }).is_err() {
                                break;
                            }
                        }
                    }
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("datagram receive loop stopped");
    }
}

fn frame_name(datagram: &[u8]) -> &'static str {
    datagram
        .first()
        .and_then(|&b| FrameType::from_u8(b))
        .map(|t| t.name())
        .unwrap_or("?")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn transport(confirm_timeout_ms: u64, max_retransmissions: u32) -> Arc<ReliableUdp> {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        Arc::new(ReliableUdp::new(
            socket,
            Duration::from_millis(confirm_timeout_ms),
            max_retransmissions,
        ))
    }

    fn spawn_recv_loop(
        udp: &Arc<ReliableUdp>,
    ) -> (
        mpsc::UnboundedReceiver<InboundDatagram>,
        watch::Sender<bool>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(Arc::clone(udp).recv_loop(inbound_tx, shutdown_rx));
        (inbound_rx, shutdown_tx)
    }

    #[tokio::test]
    async fn test_send_acknowledged_on_confirm() {
        let udp = transport(500, 3).await;
        let (_inbound_rx, _shutdown_tx) = spawn_recv_loop(&udp);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        let frame = Frame::new(0, FrameBody::Err { content: "x".into() });
        let sender = tokio::spawn({
            let udp = Arc::clone(&udp);
            let datagram = frame.to_bytes();
            async move { udp.send_reliable(datagram, to).await }
        });

        let mut buf = [0u8; 1024];
        let (len, from) = peer.recv_from(&mut buf).await.unwrap();
        let received = Frame::decode(&buf[..len]).unwrap();
        assert_eq!(received.frame_type(), FrameType::Err);

        let confirm = Frame::new(received.id, FrameBody::Confirm).to_bytes();
        peer.send_to(&confirm, from).await.unwrap();

        let outcome = sender.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Acknowledged);
    }

    #[tokio::test]
    async fn test_abandoned_after_retransmissions_with_one_id() {
        let udp = transport(40, 2).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        let sender = tokio::spawn({
            let udp = Arc::clone(&udp);
            let datagram = Frame::new(0, FrameBody::Bye).to_bytes();
            async move { udp.send_reliable(datagram, to).await }
        });

        // 1 initial transmission + 2 retransmissions, all carrying one id
        let mut buf = [0u8; 64];
        let mut ids = Vec::new();
        for _ in 0..3 {
            let (len, _) = peer.recv_from(&mut buf).await.unwrap();
            ids.push(Frame::decode(&buf[..len]).unwrap().id);
        }
        assert!(ids.iter().all(|&id| id == ids[0]));

        let outcome = sender.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Abandoned);

        // No further retransmission after giving up
        let quiet = timeout(Duration::from_millis(150), peer.recv_from(&mut buf)).await;
        assert!(quiet.is_err());
    }

    #[tokio::test]
    async fn test_confirm_from_wrong_address_is_ignored() {
        let udp = transport(150, 0).await;
        let (_inbound_rx, _shutdown_tx) = spawn_recv_loop(&udp);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let impostor = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        let sender = tokio::spawn({
            let udp = Arc::clone(&udp);
            let datagram = Frame::new(0, FrameBody::Bye).to_bytes();
            async move { udp.send_reliable(datagram, to).await }
        });

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let id = Frame::decode(&buf[..len]).unwrap().id;

        // Right id, wrong source address: must not resolve the waiter
        let server_addr = udp.local_addr().unwrap();
        impostor
            .send_to(&Frame::new(id, FrameBody::Confirm).to_bytes(), server_addr)
            .await
            .unwrap();

        let outcome = sender.await.unwrap().unwrap();
        assert_eq!(outcome, SendOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_recv_loop_hands_over_protocol_frames_and_errors() {
        let udp = transport(100, 0).await;
        let (mut inbound_rx, _shutdown_tx) = spawn_recv_loop(&udp);

        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = udp.local_addr().unwrap();

        let auth = Frame::new(
            9,
            FrameBody::Auth {
                username: "alice".into(),
                display_name: "Alice".into(),
                secret: "pw".into(),
            },
        );
        peer.send_to(&auth.to_bytes(), server_addr).await.unwrap();

        let datagram = inbound_rx.recv().await.unwrap();
        assert_eq!(datagram.from, peer.local_addr().unwrap());
        assert_eq!(datagram.frame.unwrap(), auth);

        // Undecodable input reaches the handler as an error
        peer.send_to(&[0x42, 0x00, 0x00], server_addr).await.unwrap();
        let datagram = inbound_rx.recv().await.unwrap();
        assert!(datagram.frame.is_err());
    }

    #[tokio::test]
    async fn test_send_confirm_is_fire_and_forget() {
        let udp = transport(100, 0).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        udp.send_confirm(0x0102, peer.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..len], &[0x00, 0x02, 0x01]);
    }

    #[tokio::test]
    async fn test_message_ids_are_monotonic() {
        let udp = transport(20, 0).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        let first = Frame::new(0, FrameBody::Bye).to_bytes();
        let second = Frame::new(0, FrameBody::Bye).to_bytes();
        let _ = udp.send_reliable(first, to).await.unwrap();
        let _ = udp.send_reliable(second, to).await.unwrap();

        let mut buf = [0u8; 64];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let id_a = Frame::decode(&buf[..len]).unwrap().id;
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let id_b = Frame::decode(&buf[..len]).unwrap().id;
        assert_eq!(id_b, id_a.wrapping_add(1));
    }

    #[tokio::test]
    async fn test_send_background_returns_after_first_transmission() {
        let udp = transport(400, 1).await;
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let to = peer.local_addr().unwrap();

        // Returns well before the confirm timeout even though nobody confirms
        let started = tokio::time::Instant::now();
        Arc::clone(&udp)
            .send_background(Frame::msg("Server", "one").to_bytes(), to)
            .await
            .unwrap();
        Arc::clone(&udp)
            .send_background(Frame::msg("Server", "two").to_bytes(), to)
            .await
            .unwrap();
        assert!(started.elapsed() < Duration::from_millis(200));

        // First transmissions arrive in dispatch order
        let mut buf = [0u8; 256];
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let first = Frame::decode(&buf[..len]).unwrap();
        let (len, _) = peer.recv_from(&mut buf).await.unwrap();
        let second = Frame::decode(&buf[..len]).unwrap();
        match (first.body, second.body) {
            (FrameBody::Msg { content: a, .. }, FrameBody::Msg { content: b, .. }) => {
                assert_eq!(a, "one");
                assert_eq!(b, "two");
            }
            other => panic!("unexpected frames: {:?}", other),
        }
    }
}
