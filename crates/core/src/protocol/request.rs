use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ParseErrorKind, Result};
use crate::protocol::header::{self, MessageHeader, MessageType};

/// A decoded registration request.
///
/// ```text
/// header | unit_id str | nonce str | listen_port u16
/// ```
///
/// `nonce` is empty on first contact. `listen_port` is where the unit
/// expects the response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterRequest {
    pub header: MessageHeader,
    pub unit_id: String,
    pub nonce: String,
    pub listen_port: u16,
}

impl RegisterRequest {
    /// Build a REGISTER request with an empty nonce.
    pub fn register(magic_cookie: u32, unit_id: &str, listen_port: u16) -> Self {
        RegisterRequest {
            header: MessageHeader {
                magic_cookie,
                message_type: MessageType::Register,
                sequence: 0,
                timestamp: 0,
            },
            unit_id: unit_id.to_string(),
            nonce: String::new(),
            listen_port,
        }
    }

    /// Build an UNREGISTER request.
    pub fn unregister(magic_cookie: u32, unit_id: &str, listen_port: u16) -> Self {
        let mut request = Self::register(magic_cookie, unit_id, listen_port);
        request.header.message_type = MessageType::Unregister;
        request
    }

    pub fn with_nonce(mut self, nonce: &str) -> Self {
        self.nonce = nonce.to_string();
        self
    }

    pub fn with_sequence(mut self, sequence: u32) -> Self {
        self.header.sequence = sequence;
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.header.timestamp = timestamp;
        self
    }

    /// Decode a request datagram, checking it against `magic_cookie`.
    ///
    /// Returns [`RelayError::Parse`](crate::RelayError::Parse) on empty,
    /// truncated or otherwise malformed input, including trailing bytes.
    pub fn parse(datagram: &[u8], magic_cookie: u32) -> Result<Self> {
        let mut buf = datagram;
        let header = MessageHeader::decode(&mut buf, magic_cookie)?;

        let unit_id = header::get_str(&mut buf)?;
        if unit_id.is_empty() {
            return Err(ParseErrorKind::EmptyUnitId.into());
        }
        let nonce = header::get_str(&mut buf)?;
        header::ensure(buf, 2)?;
        let listen_port = buf.get_u16();
        header::ensure_consumed(buf)?;

        Ok(RegisterRequest {
            header,
            unit_id,
            nonce,
            listen_port,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = BytesMut::with_capacity(
            header::HEADER_LEN + 6 + self.unit_id.len() + self.nonce.len(),
        );
        self.header.encode(&mut out);
        header::put_str(&mut out, &self.unit_id);
        header::put_str(&mut out, &self.nonce);
        out.put_u16(self.listen_port);
        out.to_vec()
    }
}
