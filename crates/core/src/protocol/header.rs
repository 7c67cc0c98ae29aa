use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ParseErrorKind, Result};

/// Encoded size of [`MessageHeader`] in bytes.
pub const HEADER_LEN: usize = 4 + 1 + 4 + 8;

/// Registration message discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Register = 1,
    Unregister = 2,
}

impl TryFrom<u8> for MessageType {
    type Error = ParseErrorKind;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(MessageType::Register),
            2 => Ok(MessageType::Unregister),
            other => Err(ParseErrorKind::UnknownMessageType(other)),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Register => write!(f, "REGISTER"),
            Self::Unregister => write!(f, "UNREGISTER"),
        }
    }
}

/// Fixed header shared by requests and responses.
///
/// ```text
/// magic_cookie u32 | message_type u8 | sequence u32 | timestamp u64
/// ```
///
/// A response copies the request's header verbatim, which echoes the
/// message type, sequence number and timestamp back to the unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic_cookie: u32,
    pub message_type: MessageType,
    pub sequence: u32,
    pub timestamp: u64,
}

impl MessageHeader {
    pub(crate) fn decode(buf: &mut &[u8], expected_cookie: u32) -> Result<Self> {
        if buf.is_empty() {
            return Err(ParseErrorKind::EmptyDatagram.into());
        }
        ensure(*buf, HEADER_LEN)?;

        let magic_cookie = buf.get_u32();
        if magic_cookie != expected_cookie {
            return Err(ParseErrorKind::BadMagicCookie(magic_cookie).into());
        }
        let message_type = MessageType::try_from(buf.get_u8())?;

        Ok(MessageHeader {
            magic_cookie,
            message_type,
            sequence: buf.get_u32(),
            timestamp: buf.get_u64(),
        })
    }

    pub(crate) fn encode(&self, out: &mut BytesMut) {
        out.put_u32(self.magic_cookie);
        out.put_u8(self.message_type as u8);
        out.put_u32(self.sequence);
        out.put_u64(self.timestamp);
    }
}

pub(crate) fn ensure(buf: &[u8], len: usize) -> Result<()> {
    if buf.len() < len {
        return Err(ParseErrorKind::Truncated.into());
    }
    Ok(())
}

/// Read a `u16`-length-prefixed UTF-8 string.
pub(crate) fn get_str(buf: &mut &[u8]) -> Result<String> {
    ensure(*buf, 2)?;
    let len = buf.get_u16() as usize;
    ensure(*buf, len)?;
    let value = std::str::from_utf8(&buf[..len])
        .map_err(|_| ParseErrorKind::InvalidUtf8)?
        .to_string();
    buf.advance(len);
    Ok(value)
}

/// Write a `u16`-length-prefixed string. Values longer than `u16::MAX`
/// bytes are cut at the last char boundary that fits.
pub(crate) fn put_str(out: &mut BytesMut, value: &str) {
    let mut len = value.len().min(u16::MAX as usize);
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    out.put_u16(len as u16);
    out.put_slice(&value.as_bytes()[..len]);
}

pub(crate) fn ensure_consumed(buf: &[u8]) -> Result<()> {
    if !buf.is_empty() {
        return Err(ParseErrorKind::TrailingBytes(buf.len()).into());
    }
    Ok(())
}
