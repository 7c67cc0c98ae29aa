use std::fmt;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{ParseErrorKind, Result};
use crate::protocol::header::{self, MessageHeader};

/// Outcome of a registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Success = 0,
    NotAccepted = 1,
}

impl TryFrom<u8> for Status {
    type Error = ParseErrorKind;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            0 => Ok(Status::Success),
            1 => Ok(Status::NotAccepted),
            other => Err(ParseErrorKind::UnknownStatus(other)),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success => write!(f, "SUCCESS"),
            Self::NotAccepted => write!(f, "NOT_ACCEPTED"),
        }
    }
}

/// Why a registration was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Unknown unit: first leg of the challenge. Retry with the nonce.
    NotAuthorized,
    /// The presented nonce did not match; the session was destroyed.
    WrongNonce,
    /// No port could be leased for a new session.
    ResourceExhausted,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotAuthorized => "NOT_AUTHORIZED",
            Self::WrongNonce => "WRONG_NONCE",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
        }
    }

    pub fn from_wire(reason: &str) -> Option<Self> {
        match reason {
            "NOT_AUTHORIZED" => Some(Self::NotAuthorized),
            "WRONG_NONCE" => Some(Self::WrongNonce),
            "RESOURCE_EXHAUSTED" => Some(Self::ResourceExhausted),
            _ => None,
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registration response.
///
/// ```text
/// header | realm str | status u8 | [reason str]   (reason only when NOT_ACCEPTED)
/// ```
///
/// Built from the request's header so message type, sequence number and
/// timestamp are echoed unchanged.
#[must_use]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterResponse {
    pub header: MessageHeader,
    pub realm: String,
    pub status: Status,
    pub reason: Option<String>,
}

impl RegisterResponse {
    pub fn success(header: MessageHeader, realm: &str) -> Self {
        RegisterResponse {
            header,
            realm: realm.to_string(),
            status: Status::Success,
            reason: None,
        }
    }

    pub fn not_accepted(header: MessageHeader, realm: &str, reason: RejectReason) -> Self {
        RegisterResponse {
            header,
            realm: realm.to_string(),
            status: Status::NotAccepted,
            reason: Some(reason.as_str().to_string()),
        }
    }

    /// The reason as a known variant, if it is one.
    pub fn reject_reason(&self) -> Option<RejectReason> {
        self.reason.as_deref().and_then(RejectReason::from_wire)
    }

    pub fn is_success(&self) -> bool {
        self.status == Status::Success
    }

    pub fn serialize(&self) -> Vec<u8> {
        let reason = self.reason.as_deref().unwrap_or("");
        let mut out =
            BytesMut::with_capacity(header::HEADER_LEN + 5 + self.realm.len() + reason.len());
        self.header.encode(&mut out);
        header::put_str(&mut out, &self.realm);
        out.put_u8(self.status as u8);
        if self.status == Status::NotAccepted {
            header::put_str(&mut out, reason);
        }
        out.to_vec()
    }

    /// Decode a response datagram (unit side).
    pub fn parse(datagram: &[u8], magic_cookie: u32) -> Result<Self> {
        let mut buf = datagram;
        let header = MessageHeader::decode(&mut buf, magic_cookie)?;
        let realm = header::get_str(&mut buf)?;
        header::ensure(buf, 1)?;
        let status = Status::try_from(buf.get_u8())?;

        let reason = match status {
            Status::Success => None,
            Status::NotAccepted => {
                let reason = header::get_str(&mut buf)?;
                (!reason.is_empty()).then_some(reason)
            }
        };
        header::ensure_consumed(buf)?;

        Ok(RegisterResponse {
            header,
            realm,
            status,
            reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::header::MessageType;

    const COOKIE: u32 = 0x5254_5352;

    fn header() -> MessageHeader {
        MessageHeader {
            magic_cookie: COOKIE,
            message_type: MessageType::Register,
            sequence: 3,
            timestamp: 99,
        }
    }

    #[test]
    fn success_has_no_reason_field() {
        let bytes = RegisterResponse::success(header(), "streaming").serialize();
        // header + (2 + 9) realm + 1 status
        assert_eq!(bytes.len(), header::HEADER_LEN + 11 + 1);
        let resp = RegisterResponse::parse(&bytes, COOKIE).unwrap();
        assert!(resp.is_success());
        assert_eq!(resp.realm, "streaming");
        assert_eq!(resp.reason, None);
    }

    #[test]
    fn not_accepted_carries_reason() {
        let bytes =
            RegisterResponse::not_accepted(header(), "streaming", RejectReason::WrongNonce)
                .serialize();
        let resp = RegisterResponse::parse(&bytes, COOKIE).unwrap();
        assert_eq!(resp.status, Status::NotAccepted);
        assert_eq!(resp.reason.as_deref(), Some("WRONG_NONCE"));
        assert_eq!(resp.reject_reason(), Some(RejectReason::WrongNonce));
        assert_eq!(resp.header, header());
    }

    #[test]
    fn unknown_status_is_rejected() {
        let mut bytes = RegisterResponse::success(header(), "r").serialize();
        let last = bytes.len() - 1;
        bytes[last] = 7;
        assert!(matches!(
            RegisterResponse::parse(&bytes, COOKIE),
            Err(crate::RelayError::Parse {
                kind: ParseErrorKind::UnknownStatus(7)
            })
        ));
    }

    #[test]
    fn reason_strings_match_wire_names() {
        for reason in [
            RejectReason::NotAuthorized,
            RejectReason::WrongNonce,
            RejectReason::ResourceExhausted,
        ] {
            assert_eq!(RejectReason::from_wire(reason.as_str()), Some(reason));
        }
        assert_eq!(RejectReason::from_wire("bogus"), None);
    }
}
