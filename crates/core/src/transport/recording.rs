//! In-memory channel provider for unit tests.

use std::collections::HashMap;
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::transport::{ChannelProvider, ChannelRole, Endpoint};

/// Records every open, close and send without touching the network.
#[derive(Default)]
pub(crate) struct RecordingChannels {
    open: Mutex<HashMap<(String, ChannelRole), Endpoint>>,
    pub(crate) closed: Mutex<Vec<(String, ChannelRole)>>,
    pub(crate) sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
    /// When set, opening this role fails with an I/O error.
    pub(crate) fail_role: Mutex<Option<ChannelRole>>,
    /// When set, every send fails.
    pub(crate) fail_send: Mutex<bool>,
}

impl RecordingChannels {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_open(&self, owner: &str, role: ChannelRole) -> bool {
        self.open.lock().contains_key(&(owner.to_string(), role))
    }

    pub(crate) fn open_count(&self) -> usize {
        self.open.lock().len()
    }

    pub(crate) fn close_count(&self, owner: &str) -> usize {
        self.closed.lock().iter().filter(|(o, _)| o == owner).count()
    }
}

impl ChannelProvider for RecordingChannels {
    fn open(&self, owner: &str, addr: SocketAddr, role: ChannelRole) -> Result<Endpoint> {
        if *self.fail_role.lock() == Some(role) {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                "address in use",
            )));
        }
        let endpoint = Endpoint {
            owner: owner.to_string(),
            role,
            local_addr: addr,
        };
        self.open
            .lock()
            .insert((owner.to_string(), role), endpoint.clone());
        Ok(endpoint)
    }

    fn close(&self, owner: &str, role: ChannelRole) -> bool {
        let removed = self.open.lock().remove(&(owner.to_string(), role)).is_some();
        if removed {
            self.closed.lock().push((owner.to_string(), role));
        }
        removed
    }

    fn send(&self, _endpoint: &Endpoint, dest: SocketAddr, payload: &[u8]) -> Result<usize> {
        if *self.fail_send.lock() {
            return Err(RelayError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                "send failed",
            )));
        }
        self.sent.lock().push((dest, payload.to_vec()));
        Ok(payload.len())
    }
}
