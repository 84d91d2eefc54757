//! Protocol layer for the chat relay
//!
//! This module provides:
//! - Binary frame encoding/decoding for the datagram transport
//! - Text command parsing/rendering for the stream transport

pub mod frame;
pub mod text;

// Re-export commonly used types
pub use frame::{
    rewrite_message_id, Frame, FrameBody, FrameType, FRAME_HEADER_SIZE, MAX_DATAGRAM_SIZE,
};
pub use text::{TextCommand, TextParseError, MAX_LINE_LENGTH, SERVER_DISPLAY_NAME};
