//! Incremental Frame Parser
//!
//! Parses request frames (server side) and replies (client side) out of a
//! growing receive buffer.
//!
//! The parser reads from a buffer and returns either:
//! - `Ok(Some((value, consumed)))` - a complete message, `consumed` bytes were used
//! - `Ok(None)` - the message is incomplete, wait for more data
//! - `Err(ParseError)` - invalid protocol data, the connection should be closed
//!
//! Length prefixes are checked against [`MAX_VALUE_SIZE`] before any payload
//! is buffered, so a hostile length cannot make the server allocate.

use crate::protocol::types::{
    Command, Frame, Reply, Status, FRAME_HEADER_LEN, MAX_VALUE_SIZE, REPLY_HEADER_LEN,
};
use bytes::Bytes;
use thiserror::Error;

/// Errors that can occur while parsing frames or replies.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ParseError {
    /// Unknown command byte
    #[error("unknown command: {0:#04x}")]
    UnknownCommand(u8),

    /// Unknown reply status byte
    #[error("unknown status: {0:#04x}")]
    UnknownStatus(u8),

    /// Key is not valid UTF-8
    #[error("invalid UTF-8 in key: {0}")]
    InvalidUtf8(String),

    /// A length prefix exceeds the maximum allowed size
    #[error("message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Result type for parsing operations.
pub type ParseResult<T> = Result<T, ParseError>;

/// Parser for request frames.
///
/// # Example
///
/// ```
/// use matchdb::protocol::{Command, FrameParser};
///
/// let parser = FrameParser::new();
/// let (frame, consumed) = parser.parse(b"G\x00\x03abc").unwrap().unwrap();
/// assert_eq!(frame.command, Command::Get);
/// assert_eq!(consumed, 6);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct FrameParser {
    max_value: usize,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameParser {
    pub fn new() -> Self {
        Self {
            max_value: MAX_VALUE_SIZE,
        }
    }

    /// Parser with a custom value size ceiling.
    pub fn with_max_value(max_value: usize) -> Self {
        Self { max_value }
    }

    /// Attempts to parse one frame from the front of `buf`.
    pub fn parse(&self, buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
        if buf.is_empty() {
            return Ok(None);
        }

        let command = Command::from_byte(buf[0]).ok_or(ParseError::UnknownCommand(buf[0]))?;
        if buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let key_len = u16::from_be_bytes([buf[1], buf[2]]) as usize;
        let key_end = FRAME_HEADER_LEN + key_len;
        if buf.len() < key_end {
            return Ok(None);
        }
        let key = &buf[FRAME_HEADER_LEN..key_end];
        std::str::from_utf8(key).map_err(|e| ParseError::InvalidUtf8(e.to_string()))?;

        if !command.has_value() {
            let frame = Frame {
                command,
                key: Bytes::copy_from_slice(key),
                value: None,
            };
            return Ok(Some((frame, key_end)));
        }

        let Some(len_bytes) = buf.get(key_end..key_end + 4) else {
            return Ok(None);
        };
        let value_len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if value_len > self.max_value {
            return Err(ParseError::MessageTooLarge {
                size: value_len,
                max: self.max_value,
            });
        }

        let value_start = key_end + 4;
        let value_end = value_start + value_len;
        if buf.len() < value_end {
            return Ok(None);
        }

        let frame = Frame {
            command,
            key: Bytes::copy_from_slice(key),
            value: Some(Bytes::copy_from_slice(&buf[value_start..value_end])),
        };
        Ok(Some((frame, value_end)))
    }
}

/// Convenience function to parse a single frame.
pub fn parse_frame(buf: &[u8]) -> ParseResult<Option<(Frame, usize)>> {
    FrameParser::new().parse(buf)
}

/// Parses one reply from the front of `buf`.
pub fn parse_reply(buf: &[u8]) -> ParseResult<Option<(Reply, usize)>> {
    if buf.is_empty() {
        return Ok(None);
    }

    let status = Status::from_byte(buf[0]).ok_or(ParseError::UnknownStatus(buf[0]))?;
    if buf.len() < REPLY_HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]) as usize;
    if len > MAX_VALUE_SIZE {
        return Err(ParseError::MessageTooLarge {
            size: len,
            max: MAX_VALUE_SIZE,
        });
    }

    let end = REPLY_HEADER_LEN + len;
    if buf.len() < end {
        return Ok(None);
    }

    let reply = Reply::new(status, Bytes::copy_from_slice(&buf[REPLY_HEADER_LEN..end]));
    Ok(Some((reply, end)))
}
