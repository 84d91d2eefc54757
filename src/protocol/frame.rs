//! Binary frame protocol for the datagram transport
//!
//! Frame format:
//! ```text
//! +----------+---------------+------------------+
//! | type     | message id    | payload          |
//! | (1 byte) | (2 bytes, LE) | (per type)       |
//! +----------+---------------+------------------+
//! ```
//!
//! String fields are UTF-8 bytes terminated by a single zero byte. The
//! message id correlates acknowledgments: a CONFIRM carries the id of the
//! frame it acknowledges, a REPLY additionally references the id of the
//! command it answers.

use bytes::{BufMut, BytesMut};

use crate::error::{ChatError, Result};

/// Frame header size: 1 byte type + 2 bytes message id
pub const FRAME_HEADER_SIZE: usize = 3;

/// Maximum datagram the receive loop accepts (theoretical UDP payload limit)
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Frame types of the datagram protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Acknowledges receipt of the frame whose id it carries
    Confirm = 0x00,
    /// Server answer to AUTH/JOIN, references the answered id
    Reply = 0x01,
    /// Client authentication request
    Auth = 0x02,
    /// Channel switch request
    Join = 0x03,
    /// Chat message
    Msg = 0x04,
    /// Error notification
    Err = 0xFE,
    /// End of session
    Bye = 0xFF,
}

impl FrameType {
    /// Convert from u8, returns None for unknown types
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x00 => Some(FrameType::Confirm),
            0x01 => Some(FrameType::Reply),
            0x02 => Some(FrameType::Auth),
            0x03 => Some(FrameType::Join),
            0x04 => Some(FrameType::Msg),
            0xFE => Some(FrameType::Err),
            0xFF => Some(FrameType::Bye),
            _ => None,
        }
    }

    /// Short uppercase name used in traffic logs
    pub fn name(&self) -> &'static str {
        match self {
            FrameType::Confirm => "CONFIRM",
            FrameType::Reply => "REPLY",
            FrameType::Auth => "AUTH",
            FrameType::Join => "JOIN",
            FrameType::Msg => "MSG",
            FrameType::Err => "ERR",
            FrameType::Bye => "BYE",
        }
    }
}

/// Typed payload of a frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameBody {
    /// No payload; the header id is the acknowledged id
    Confirm,
    /// Result of the command identified by `ref_id`
    Reply {
        success: bool,
        ref_id: u16,
        content: String,
    },
    /// Authentication request
    Auth {
        username: String,
        display_name: String,
        secret: String,
    },
    /// Channel switch request
    Join {
        channel_id: String,
        display_name: String,
    },
    /// Chat message
    Msg {
        display_name: String,
        content: String,
    },
    /// Error notification
    Err { content: String },
    /// End of session, no payload
    Bye,
}

/// A single datagram-protocol frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u16,
    pub body: FrameBody,
}

impl Frame {
    /// Create a frame with the given id and body
    pub fn new(id: u16, body: FrameBody) -> Self {
        Self { id, body }
    }

    /// The wire type of this frame
    pub fn frame_type(&self) -> FrameType {
        match self.body {
            FrameBody::Confirm => FrameType::Confirm,
            FrameBody::Reply { .. } => FrameType::Reply,
            FrameBody::Auth { .. } => FrameType::Auth,
            FrameBody::Join { .. } => FrameType::Join,
            FrameBody::Msg { .. } => FrameType::Msg,
            FrameBody::Err { .. } => FrameType::Err,
            FrameBody::Bye => FrameType::Bye,
        }
    }

    /// Encode this frame into a buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.frame_type() as u8);
        buf.put_u16_le(self.id);
        match &self.body {
            FrameBody::Confirm | FrameBody::Bye => {}
            FrameBody::Reply {
                success,
                ref_id,
                content,
            } => {
                buf.put_u8(u8::from(*success));
                buf.put_u16_le(*ref_id);
                put_string(buf, content);
            }
            FrameBody::Auth {
                username,
                display_name,
                secret,
            } => {
                put_string(buf, username);
                put_string(buf, display_name);
                put_string(buf, secret);
            }
            FrameBody::Join {
                channel_id,
                display_name,
            } => {
                put_string(buf, channel_id);
                put_string(buf, display_name);
            }
            FrameBody::Msg {
                display_name,
                content,
            } => {
                put_string(buf, display_name);
                put_string(buf, content);
            }
            FrameBody::Err { content } => put_string(buf, content),
        }
    }

    /// Encode this frame into a fresh buffer
    pub fn to_bytes(&self) -> BytesMut {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + 64);
        self.encode(&mut buf);
        buf
    }

    /// Decode a frame from one complete datagram
    ///
    /// Bytes past the frame's defined payload are ignored.
    pub fn decode(datagram: &[u8]) -> Result<Frame> {
        if datagram.len() < FRAME_HEADER_SIZE {
            return Err(ChatError::malformed(format!(
                "datagram of {} bytes is shorter than the frame header",
                datagram.len()
            )));
        }

        let frame_type = FrameType::from_u8(datagram[0]).ok_or_else(|| {
            ChatError::malformed(format!("unknown frame type 0x{:02X}", datagram[0]))
        })?;
        let id = u16::from_le_bytes([datagram[1], datagram[2]]);
        let mut rest = &datagram[FRAME_HEADER_SIZE..];

        let body = match frame_type {
            FrameType::Confirm => FrameBody::Confirm,
            FrameType::Bye => FrameBody::Bye,
            FrameType::Reply => {
                if rest.len() < 3 {
                    return Err(ChatError::malformed("REPLY payload truncated"));
                }
                let success = rest[0] != 0;
                let ref_id = u16::from_le_bytes([rest[1], rest[2]]);
                rest = &rest[3..];
                let content = take_string(&mut rest)?;
                FrameBody::Reply {
                    success,
                    ref_id,
                    content,
                }
            }
            FrameType::Auth => {
                let username = take_string(&mut rest)?;
                let display_name = take_string(&mut rest)?;
                let secret = take_string(&mut rest)?;
                FrameBody::Auth {
                    username,
                    display_name,
                    secret,
                }
            }
            FrameType::Join => {
                let channel_id = take_string(&mut rest)?;
                let display_name = take_string(&mut rest)?;
                FrameBody::Join {
                    channel_id,
                    display_name,
                }
            }
            FrameType::Msg => {
                let display_name = take_string(&mut rest)?;
                let content = take_string(&mut rest)?;
                FrameBody::Msg {
                    display_name,
                    content,
                }
            }
            FrameType::Err => {
                let content = take_string(&mut rest)?;
                FrameBody::Err { content }
            }
        };

        Ok(Frame::new(id, body))
    }

    /// Shorthand for a server chat message frame (id stamped at send time)
    pub fn msg(display_name: &str, content: &str) -> Self {
        Frame::new(
            0,
            FrameBody::Msg {
                display_name: display_name.to_string(),
                content: content.to_string(),
            },
        )
    }
}

/// Overwrite the message id of an already-encoded frame in place
///
/// Avoids re-encoding the payload when the same frame is sent more than once
/// with distinct ids, e.g. one clone per broadcast recipient.
pub fn rewrite_message_id(datagram: &mut [u8], id: u16) {
    debug_assert!(datagram.len() >= FRAME_HEADER_SIZE);
    if datagram.len() >= FRAME_HEADER_SIZE {
        datagram[1..FRAME_HEADER_SIZE].copy_from_slice(&id.to_le_bytes());
    }
}

fn put_string(buf: &mut BytesMut, value: &str) {
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Consume one NUL-terminated UTF-8 string from the front of `rest`
fn take_string(rest: &mut &[u8]) -> Result<String> {
    let nul = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ChatError::malformed("string field without zero terminator"))?;
    let value = std::str::from_utf8(&rest[..nul])
        .map_err(|_| ChatError::malformed("string field is not valid UTF-8"))?
        .to_string();
    *rest = &rest[nul + 1..];
    Ok(value)
}
