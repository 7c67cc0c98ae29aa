use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::error::{RelayError, Result};
use crate::protocol::RegistrationHandler;
use crate::resource::PortPool;
use crate::session::SessionRegistry;
use crate::transport::udp::{self, UdpChannelProvider};
use crate::transport::{ChannelProvider, ChannelRole, Endpoint};

/// Default magic cookie (`"RTSR"`).
pub const DEFAULT_MAGIC_COOKIE: u32 = 0x5254_5352;

/// Owner name of the relay-wide registration endpoint.
const RELAY_OWNER: &str = "relay";

/// Read-only relay configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Marker every registration datagram must start with.
    pub magic_cookie: u32,
    /// Realm echoed in responses and mixed into the nonce.
    pub realm: String,
    /// Shared secret mixed into the nonce.
    pub hash_key: String,
    /// Local IP every endpoint binds to.
    pub listen_ip: IpAddr,
    /// Local control-channel port shared by all sessions.
    /// 0 binds one ephemeral port per session.
    pub control_port: u16,
    /// Local registration listen port (0 = ephemeral).
    pub register_port: u16,
    /// Fixed RTCP port for the whole deployment. When `None`, each session
    /// leases its own RTCP port from `port_range`.
    pub rtcp_port: Option<u16>,
    /// Ports managed by the [`PortPool`].
    pub port_range: RangeInclusive<u16>,
    /// Close sessions idle for this long. `None` keeps sessions until they
    /// are unregistered or the server stops.
    pub session_timeout: Option<Duration>,
    /// Worker threads handling registration datagrams.
    pub workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            magic_cookie: DEFAULT_MAGIC_COOKIE,
            realm: "rtsp-relay".to_string(),
            hash_key: String::new(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            control_port: 8554,
            register_port: 5070,
            rtcp_port: None,
            port_range: 20000..=20999,
            session_timeout: None,
            workers: 8,
        }
    }
}

impl ServerConfig {
    /// Address of the shared control endpoint.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.control_port)
    }

    pub fn register_addr(&self) -> SocketAddr {
        SocketAddr::new(self.listen_ip, self.register_port)
    }
}

/// Relay control-plane orchestrator.
///
/// Owns the port pool, the session registry and the UDP channel provider.
/// [`start`](Self::start) opens the registration endpoint and runs the
/// receive loop on a background thread.
pub struct Server {
    config: Arc<ServerConfig>,
    registry: SessionRegistry,
    channels: Arc<UdpChannelProvider>,
    running: Arc<AtomicBool>,
    endpoint: Option<Endpoint>,
    receiver: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let channels = Arc::new(UdpChannelProvider::new());
        let ports = Arc::new(PortPool::new(config.port_range.clone()));
        let registry = SessionRegistry::new(ports, channels.clone(), config.rtcp_port);

        Self {
            config: Arc::new(config),
            registry,
            channels,
            running: Arc::new(AtomicBool::new(false)),
            endpoint: None,
            receiver: None,
            expiry: None,
        }
    }

    pub fn start(&mut self) -> Result<()> {
        if self.running.load(Ordering::SeqCst) {
            return Err(RelayError::AlreadyRunning);
        }

        let endpoint =
            self.channels
                .open(RELAY_OWNER, self.config.register_addr(), ChannelRole::Register)?;
        let socket = self
            .channels
            .socket(&endpoint)
            .ok_or_else(|| RelayError::ChannelNotOpen {
                owner: RELAY_OWNER.to_string(),
                role: ChannelRole::Register,
            })?;

        let handler = Arc::new(RegistrationHandler::new(
            self.config.clone(),
            self.registry.clone(),
            self.channels.clone(),
            endpoint.clone(),
        ));

        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let workers = self.config.workers;
        let spawned = thread::Builder::new()
            .name("relay-receive".to_string())
            .spawn(move || {
                udp::receive_loop(
                    socket,
                    Arc::new(move |datagram: &[u8], peer: SocketAddr| {
                        handler.handle(datagram, peer);
                    }),
                    running,
                    workers,
                );
            });
        let receiver = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                self.channels.close(&endpoint.owner, endpoint.role);
                return Err(e.into());
            }
        };

        tracing::info!(
            addr = %endpoint.local_addr,
            realm = %self.config.realm,
            ports = ?self.config.port_range,
            workers,
            "relay registration server listening"
        );

        if let Some(timeout) = self.config.session_timeout {
            let registry = self.registry.clone();
            let running = self.running.clone();
            match thread::Builder::new()
                .name("relay-expiry".to_string())
                .spawn(move || expiry_loop(registry, timeout, running))
            {
                Ok(handle) => self.expiry = Some(handle),
                Err(e) => tracing::warn!(error = %e, "failed to start session expiry"),
            }
        }

        self.receiver = Some(receiver);
        self.endpoint = Some(endpoint);
        Ok(())
    }

    /// Stop receiving and close every session.
    ///
    /// Waits for the receive loop and its workers to finish before tearing
    /// sessions down, so no registration can create a session afterwards.
    pub fn stop(&mut self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        tracing::info!("server stopping");

        for handle in [self.receiver.take(), self.expiry.take()].into_iter().flatten() {
            if handle.join().is_err() {
                tracing::warn!("server thread panicked");
            }
        }

        let closed = self.registry.destroy_all();
        if let Some(endpoint) = self.endpoint.take() {
            self.channels.close(&endpoint.owner, endpoint.role);
        }
        tracing::info!(closed, "server stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Actual bound registration address (resolves an ephemeral port).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint
            .as_ref()
            .map(|e| e.local_addr)
            .ok_or(RelayError::NotStarted)
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn config(&self) -> Arc<ServerConfig> {
        self.config.clone()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Periodically close sessions idle for longer than `timeout`.
fn expiry_loop(registry: SessionRegistry, timeout: Duration, running: Arc<AtomicBool>) {
    let sweep_every = (timeout / 2).max(Duration::from_millis(50));
    let mut last_sweep = Instant::now();
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(50));
        if last_sweep.elapsed() >= sweep_every {
            registry.expire_idle(timeout);
            last_sweep = Instant::now();
        }
    }
    tracing::debug!("session expiry loop exited");
}
