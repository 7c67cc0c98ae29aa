//! Unit registration protocol.
//!
//! Units announce themselves to the relay with small binary datagrams over
//! UDP. Every message starts with a fixed [`header::MessageHeader`]:
//!
//! ```text
//! 0       4    5          9                17
//! +-------+----+----------+----------------+
//! | magic |type| sequence |   timestamp    |
//! +-------+----+----------+----------------+
//! ```
//!
//! followed by a type-specific body of `u16`-length-prefixed UTF-8 strings
//! and fixed-width integers, all big-endian.
//!
//! ## Handshake
//!
//! ```text
//! unit                                relay
//!  | REGISTER id, nonce=""              |
//!  |----------------------------------->|  provision session (Unregistered)
//!  |      NOT_ACCEPTED / NOT_AUTHORIZED |
//!  |<-----------------------------------|
//!  | REGISTER id, nonce=N               |
//!  |----------------------------------->|  N == b64(md5(md5(realm ‖ key)))?
//!  |                            SUCCESS |  -> Registered
//!  |<-----------------------------------|     (else WRONG_NONCE, session closed)
//! ```
//!
//! | Message | Type | Purpose |
//! |---------|------|---------|
//! | REGISTER | 1 | Handshake and keep-alive |
//! | UNREGISTER | 2 | Release a registered unit |

pub mod handler;
pub mod header;
pub mod nonce;
pub mod request;
pub mod response;

pub use handler::RegistrationHandler;
pub use header::{MessageHeader, MessageType};
pub use nonce::{NonceVerifier, expected_nonce};
pub use request::RegisterRequest;
pub use response::{RegisterResponse, RejectReason, Status};
