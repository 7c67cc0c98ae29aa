use std::collections::HashMap;
use std::net::{SocketAddr, UdpSocket};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{RelayError, Result};
use crate::transport::{ChannelProvider, ChannelRole, Endpoint};

/// Largest registration datagram we accept.
const MAX_DATAGRAM: usize = 2048;

/// Poll interval for the receive loop so `stop()` is noticed promptly.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// [`ChannelProvider`] backed by std UDP sockets.
///
/// Owners that open the same non-ephemeral local address share one bound
/// socket (e.g. every session's control endpoint on the deployment-wide
/// control port). The socket is dropped when its last owner closes.
#[derive(Default)]
pub struct UdpChannelProvider {
    inner: Mutex<Channels>,
}

#[derive(Default)]
struct Channels {
    sockets: HashMap<SocketAddr, Bound>,
    endpoints: HashMap<(String, ChannelRole), SocketAddr>,
}

struct Bound {
    socket: Arc<UdpSocket>,
    owners: usize,
}

impl UdpChannelProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the socket behind `endpoint`, for receive loops.
    pub fn socket(&self, endpoint: &Endpoint) -> Option<Arc<UdpSocket>> {
        self.inner
            .lock()
            .sockets
            .get(&endpoint.local_addr)
            .map(|b| b.socket.clone())
    }

    /// Number of distinct sockets currently bound.
    pub fn bound_count(&self) -> usize {
        self.inner.lock().sockets.len()
    }
}

impl ChannelProvider for UdpChannelProvider {
    fn open(&self, owner: &str, addr: SocketAddr, role: ChannelRole) -> Result<Endpoint> {
        let mut channels = self.inner.lock();
        let key = (owner.to_string(), role);

        if let Some(local_addr) = channels.endpoints.get(&key) {
            return Ok(Endpoint {
                owner: owner.to_string(),
                role,
                local_addr: *local_addr,
            });
        }

        let shared = if addr.port() != 0 {
            channels.sockets.get_mut(&addr)
        } else {
            None
        };

        let local_addr = match shared {
            Some(bound) => {
                bound.owners += 1;
                addr
            }
            None => {
                let socket = UdpSocket::bind(addr)?;
                let local_addr = socket.local_addr()?;
                channels.sockets.insert(
                    local_addr,
                    Bound {
                        socket: Arc::new(socket),
                        owners: 1,
                    },
                );
                tracing::debug!(owner, %role, %local_addr, "UDP socket bound");
                local_addr
            }
        };

        channels.endpoints.insert(key, local_addr);
        Ok(Endpoint {
            owner: owner.to_string(),
            role,
            local_addr,
        })
    }

    fn close(&self, owner: &str, role: ChannelRole) -> bool {
        let mut channels = self.inner.lock();
        let Some(local_addr) = channels.endpoints.remove(&(owner.to_string(), role)) else {
            return false;
        };

        if let Some(bound) = channels.sockets.get_mut(&local_addr) {
            bound.owners = bound.owners.saturating_sub(1);
            if bound.owners == 0 {
                channels.sockets.remove(&local_addr);
                tracing::debug!(owner, %role, %local_addr, "UDP socket released");
            }
        }
        true
    }

    fn send(&self, endpoint: &Endpoint, dest: SocketAddr, payload: &[u8]) -> Result<usize> {
        let socket = self
            .socket(endpoint)
            .ok_or_else(|| RelayError::ChannelNotOpen {
                owner: endpoint.owner.clone(),
                role: endpoint.role,
            })?;
        Ok(socket.send_to(payload, dest)?)
    }
}

/// Datagrams waiting for a worker before new ones are dropped.
const QUEUE_DEPTH: usize = 1024;

type Job = (Vec<u8>, SocketAddr);

/// Blocking datagram receive loop for the registration endpoint.
///
/// Datagrams are queued to a fixed pool of `workers` threads, so handler
/// invocations (including retransmissions for the same unit) run
/// concurrently while the thread count stays bounded. When the queue is
/// full the datagram is dropped; units retransmit.
///
/// Checks the `running` flag between reads. Once it clears, queued
/// datagrams are discarded and the loop returns only after every worker has
/// finished, so no handler call outlives it.
pub fn receive_loop<F>(
    socket: Arc<UdpSocket>,
    handler: Arc<F>,
    running: Arc<AtomicBool>,
    workers: usize,
) where
    F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
{
    if let Err(e) = socket.set_read_timeout(Some(POLL_INTERVAL)) {
        tracing::error!(error = %e, "failed to set read timeout on registration socket");
        return;
    }

    let (tx, rx) = mpsc::sync_channel::<Job>(QUEUE_DEPTH);
    let rx = Arc::new(Mutex::new(rx));
    let mut pool = Vec::with_capacity(workers.max(1));
    for n in 0..workers.max(1) {
        let rx = rx.clone();
        let handler = handler.clone();
        let running = running.clone();
        match thread::Builder::new()
            .name(format!("relay-worker-{n}"))
            .spawn(move || worker(rx, handler, running))
        {
            Ok(handle) => pool.push(handle),
            Err(e) => tracing::warn!(worker = n, error = %e, "failed to spawn registration worker"),
        }
    }
    if pool.is_empty() {
        tracing::error!("no registration workers available");
        return;
    }

    let mut buf = [0u8; MAX_DATAGRAM];
    while running.load(Ordering::SeqCst) {
        match socket.recv_from(&mut buf) {
            Ok((len, peer)) => match tx.try_send((buf[..len].to_vec(), peer)) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(%peer, "registration queue full, dropping datagram");
                }
                Err(TrySendError::Disconnected(_)) => {
                    tracing::error!("registration workers exited");
                    break;
                }
            },
            Err(ref e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) => {
                if running.load(Ordering::SeqCst) {
                    tracing::warn!(error = %e, "UDP receive error");
                }
            }
        }
    }

    drop(tx);
    for handle in pool {
        if handle.join().is_err() {
            tracing::warn!("registration worker panicked");
        }
    }
    tracing::debug!("registration receive loop exited");
}

fn worker<F>(rx: Arc<Mutex<mpsc::Receiver<Job>>>, handler: Arc<F>, running: Arc<AtomicBool>)
where
    F: Fn(&[u8], SocketAddr) + Send + Sync + 'static,
{
    loop {
        let job = rx.lock().recv();
        let Ok((datagram, peer)) = job else {
            break;
        };
        if !running.load(Ordering::SeqCst) {
            continue;
        }
        // A panic handling one datagram must not take the worker down.
        if panic::catch_unwind(AssertUnwindSafe(|| handler(&datagram, peer))).is_err() {
            tracing::error!(%peer, "registration handler panicked");
        }
    }
}
