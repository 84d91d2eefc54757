//! Session tracking for both transports
//!
//! A session is one connected client, keyed by its remote socket address.
//! TCP and UDP clients live in the same table so channel broadcasts can
//! cross transports; only the delivery handle differs.

use std::collections::VecDeque;
use std::net::SocketAddr;

use tokio::sync::{mpsc, RwLock};

/// Channel every freshly authenticated client lands in
pub const DEFAULT_CHANNEL: &str = "default";

/// How many recently seen datagram message ids a session remembers
const SEEN_ID_WINDOW: usize = 32;

/// Which transport a session arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Udp,
}

/// How server-originated traffic reaches a session
#[derive(Debug, Clone)]
pub enum SendHandle {
    /// Complete reply lines; the connection's writer task appends CRLF
    Tcp(mpsc::UnboundedSender<String>),
    /// Confirmed datagrams to this address
    Udp(SocketAddr),
}

/// One connected client, on either transport
#[derive(Debug, Clone)]
pub struct Session {
    /// Remote address, the session key
    pub key: SocketAddr,
    /// Transport the client connected over
    pub transport: TransportKind,
    /// Login name from AUTH
    pub username: Option<String>,
    /// Name shown to other clients, set by AUTH and JOIN
    pub display_name: Option<String>,
    /// Credential presented at AUTH; stored, never checked against anything
    pub secret: Option<String>,
    /// Channel the client currently chats in; None until authenticated
    pub channel_id: Option<String>,
    /// Delivery handle for broadcasts
    pub handle: SendHandle,
    /// Recently processed inbound message ids, for duplicate suppression
    seen_ids: VecDeque<u16>,
}

impl Session {
    fn new(key: SocketAddr, transport: TransportKind, handle: SendHandle) -> Self {
        Self {
            key,
            transport,
            username: None,
            display_name: None,
            secret: None,
            channel_id: None,
            handle,
            seen_ids: VecDeque::new(),
        }
    }

    /// Record an inbound message id; false means it was already seen
    fn note_message_id(&mut self, id: u16) -> bool {
        if self.seen_ids.contains(&id) {
            return false;
        }
        self.seen_ids.push_back(id);
        if self.seen_ids.len() > SEEN_ID_WINDOW {
            self.seen_ids.pop_front();
        }
        true
    }
}

/// The shared session table
pub struct SessionStore {
    sessions: RwLock<Vec<Session>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
        }
    }

    /// Look up a session, creating it with the given handle on first contact
    pub async fn get_or_create(
        &self,
        key: SocketAddr,
        transport: TransportKind,
        handle: SendHandle,
    ) -> Session {
        let mut sessions = self.sessions.write().await;
        if let Some(existing) = sessions.iter().find(|s| s.key == key) {
            return existing.clone();
        }
        let session = Session::new(key, transport, handle);
        sessions.push(session.clone());
        session
    }

    /// Get a snapshot of a session
    pub async fn get(&self, key: SocketAddr) -> Option<Session> {
        let sessions = self.sessions.read().await;
        sessions.iter().find(|s| s.key == key).cloned()
    }

    /// Whether a session exists for this address
    pub async fn contains(&self, key: SocketAddr) -> bool {
        let sessions = self.sessions.read().await;
        sessions.iter().any(|s| s.key == key)
    }

    /// Drop a session, returning its final state
    pub async fn remove(&self, key: SocketAddr) -> Option<Session> {
        let mut sessions = self.sessions.write().await;
        let index = sessions.iter().position(|s| s.key == key)?;
        Some(sessions.remove(index))
    }

    /// Mutate a session in place under the table lock
    pub async fn update<R>(
        &self,
        key: SocketAddr,
        mutate: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.write().await;
        sessions.iter_mut().find(|s| s.key == key).map(mutate)
    }

    /// Snapshot of everyone in a channel, in join order, optionally
    /// excluding one address
    pub async fn members_of(&self, channel_id: &str, exclude: Option<SocketAddr>) -> Vec<Session> {
        let sessions = self.sessions.read().await;
        sessions
            .iter()
            .filter(|s| s.channel_id.as_deref() == Some(channel_id))
            .filter(|s| Some(s.key) != exclude)
            .cloned()
            .collect()
    }

    /// Record an inbound datagram id for a session; false means duplicate
    pub async fn note_message_id(&self, key: SocketAddr, id: u16) -> bool {
        let mut sessions = self.sessions.write().await;
        match sessions.iter_mut().find(|s| s.key == key) {
            Some(session) => session.note_message_id(id),
            None => true,
        }
    }

    /// Number of live sessions
    pub async fn session_count(&self) -> usize {
        let sessions = self.sessions.read().await;
        sessions.len()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
