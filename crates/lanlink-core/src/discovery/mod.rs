//! Peer discovery via UDP broadcast.
//!
//! Every instance broadcasts a `Discovery` envelope on an interval and
//! answers each one it hears with a unicast `DiscoveryResponse`, so a new
//! instance learns about existing ones after its first broadcast.
//!
//! ## Protocol
//!
//! - Port: 8888 (UDP), distinct from the transport port
//! - One serialized envelope per datagram, the text field carrying the
//!   sender's transport port
//! - Broadcast interval: 5 seconds
//! - Peer timeout: 15 seconds of silence
//!
//! A `UserLeft` envelope removes its sender immediately. A departing
//! instance broadcasts one on [`DiscoveryService::stop`].

mod peer;

pub use peer::{Observation, Peer, PeerTable};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{DiscoveryConfig, LocalIdentity};
use crate::error::{Error, Result};
use crate::protocol::{self, Envelope, MessageKind};

/// Largest UDP payload we try to receive.
const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 256;

/// Pause after a failed receive before trying again.
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Notifications published by the discovery service.
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    /// A previously unknown peer announced itself
    PeerDiscovered(Peer),
    /// A peer left or timed out
    PeerLeft(Peer),
    /// A non-fatal socket error
    Error(String),
}

#[derive(Debug)]
struct Shared {
    identity: LocalIdentity,
    transport_port: u16,
    config: DiscoveryConfig,
    socket: UdpSocket,
    peers: Mutex<PeerTable>,
    events: broadcast::Sender<DiscoveryEvent>,
    running: AtomicBool,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn emit(&self, event: DiscoveryEvent) {
        let _ = self.events.send(event);
    }

    fn report(&self, message: String) {
        if self.is_running() {
            tracing::warn!("{message}");
            self.emit(DiscoveryEvent::Error(message));
        }
    }

    async fn send_envelope(&self, envelope: &Envelope, target: SocketAddr) -> Result<()> {
        let bytes = protocol::serialize(envelope)?;
        self.socket
            .send_to(&bytes, target)
            .await
            .map_err(|e| Error::BroadcastFailed(format!("{target}: {e}")))?;
        Ok(())
    }

    async fn announce(&self) -> Result<()> {
        let envelope = Envelope::discovery(&self.identity, self.transport_port);
        self.send_envelope(&envelope, self.config.broadcast_target())
            .await
    }

    async fn handle_datagram(&self, bytes: &[u8], source: SocketAddr) {
        match protocol::deserialize(bytes) {
            Ok(envelope) => self.handle_envelope(&envelope, source).await,
            Err(e) => tracing::debug!(%source, "Skipping malformed discovery datagram: {e}"),
        }
    }

    async fn handle_envelope(&self, envelope: &Envelope, source: SocketAddr) {
        if envelope.sender_id() == self.identity.id {
            return;
        }

        match envelope.kind() {
            MessageKind::Discovery => {
                if self.record_presence(envelope, source).await {
                    let reply = Envelope::discovery_response(&self.identity, self.transport_port);
                    if let Err(e) = self.send_envelope(&reply, source).await {
                        self.report(format!("Failed to answer discovery from {source}: {e}"));
                    }
                }
            }
            MessageKind::DiscoveryResponse | MessageKind::UserJoined => {
                self.record_presence(envelope, source).await;
            }
            MessageKind::UserLeft => {
                let removed = self.peers.lock().await.remove(envelope.sender_id());
                if let Some(peer) = removed {
                    tracing::info!(peer_id = %peer.id, name = %peer.name, "Peer left");
                    self.emit(DiscoveryEvent::PeerLeft(peer));
                }
            }
            MessageKind::TextMessage
            | MessageKind::ImageMessage
            | MessageKind::FileTransferRequest
            | MessageKind::FileTransferAccept
            | MessageKind::FileTransferReject
            | MessageKind::FileTransferData
            | MessageKind::FileTransferComplete
            | MessageKind::TypingNotification
            | MessageKind::Heartbeat => {
                self.peers
                    .lock()
                    .await
                    .touch(envelope.sender_id(), Instant::now());
            }
        }
    }

    /// Returns `false` if the envelope does not announce a usable port.
    async fn record_presence(&self, envelope: &Envelope, source: SocketAddr) -> bool {
        let Some(port) = envelope.announced_port() else {
            tracing::debug!(
                %source,
                sender = envelope.sender_id(),
                "Skipping presence message without a transport port"
            );
            return false;
        };

        let observation = self.peers.lock().await.observe(
            envelope.sender_id(),
            envelope.sender_name(),
            source.ip(),
            port,
            Instant::now(),
        );

        if let Observation::Discovered(peer) = observation {
            tracing::info!(
                peer_id = %peer.id,
                name = %peer.name,
                addr = %peer.transport_addr(),
                "Discovered peer"
            );
            self.emit(DiscoveryEvent::PeerDiscovered(peer));
        }
        true
    }

    async fn sweep(&self) {
        let evicted = self
            .peers
            .lock()
            .await
            .sweep(Instant::now(), self.config.peer_timeout);

        for peer in evicted {
            tracing::info!(peer_id = %peer.id, name = %peer.name, "Peer timed out");
            self.emit(DiscoveryEvent::PeerLeft(peer));
        }
    }
}

/// Broadcast-based presence service.
///
/// The socket is bound by [`DiscoveryService::new`]; the receive and
/// broadcast loops run between [`start`](Self::start) and
/// [`stop`](Self::stop).
#[derive(Debug)]
pub struct DiscoveryService {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl DiscoveryService {
    /// Bind the discovery socket.
    ///
    /// # Arguments
    ///
    /// * `config` - Discovery settings
    /// * `identity` - The local peer
    /// * `transport_port` - Port announced to other peers for TCP traffic
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be bound or the interval is zero.
    pub async fn new(
        config: DiscoveryConfig,
        identity: LocalIdentity,
        transport_port: u16,
    ) -> Result<Self> {
        if config.broadcast_interval.is_zero() {
            return Err(Error::InvalidConfig {
                key: "discovery.broadcast_interval".to_string(),
                reason: "must be positive".to_string(),
            });
        }

        let socket = bind_broadcast_socket(config.bind_addr())?;
        let local_addr = socket.local_addr()?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::debug!(%local_addr, "Discovery socket bound");

        Ok(Self {
            shared: Arc::new(Shared {
                identity,
                transport_port,
                config,
                socket,
                peers: Mutex::new(PeerTable::new()),
                events,
                running: AtomicBool::new(false),
            }),
            local_addr,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the receive and broadcast loops. Does nothing if already running.
    pub async fn start(&self) {
        if self.shared.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(receive_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));
        tasks.push(tokio::spawn(broadcast_loop(
            Arc::clone(&self.shared),
            self.shutdown_tx.subscribe(),
        )));

        tracing::info!(
            addr = %self.local_addr,
            peer_id = %self.shared.identity.id,
            "Discovery started"
        );
    }

    /// Announce departure and stop both loops.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let farewell = Envelope::user_left(&self.shared.identity);
        if let Err(e) = self
            .shared
            .send_envelope(&farewell, self.shared.config.broadcast_target())
            .await
        {
            tracing::debug!("Failed to broadcast departure: {e}");
        }

        let _ = self.shutdown_tx.send(());
        let handles: Vec<_> = self.tasks.lock().await.drain(..).collect();
        crate::task::join_all(handles).await;

        tracing::info!("Discovery stopped");
    }

    /// Whether the loops are running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Address the socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The local peer.
    pub fn identity(&self) -> &LocalIdentity {
        &self.shared.identity
    }

    /// Subscribe to discovery events.
    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.shared.events.subscribe()
    }

    /// Broadcast a `Discovery` envelope now, outside the regular interval.
    ///
    /// # Errors
    ///
    /// Returns an error if the datagram cannot be sent.
    pub async fn announce(&self) -> Result<()> {
        self.shared.announce().await
    }

    /// Snapshot of the peers currently online.
    pub async fn online_peers(&self) -> Vec<Peer> {
        self.shared.peers.lock().await.online()
    }

    /// Snapshot of one peer.
    pub async fn peer(&self, id: &str) -> Option<Peer> {
        self.shared.peers.lock().await.get(id)
    }

    /// Refresh a known peer's last-seen time. Returns `false` if unknown.
    pub async fn touch(&self, id: &str) -> bool {
        self.shared.peers.lock().await.touch(id, Instant::now())
    }
}

impl Drop for DiscoveryService {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        for handle in self.tasks.get_mut().drain(..) {
            handle.abort();
        }
    }
}

fn bind_broadcast_socket(addr: SocketAddr) -> Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;

    socket.set_broadcast(true)?;
    socket.set_reuse_address(true)?;

    #[cfg(target_os = "macos")]
    socket.set_reuse_port(true)?;

    socket.bind(&addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn receive_loop(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            result = shared.socket.recv_from(&mut buf) => match result {
                Ok((len, source)) => shared.handle_datagram(&buf[..len], source).await,
                Err(e) => {
                    if !shared.is_running() {
                        break;
                    }
                    shared.report(format!("Discovery receive failed: {e}"));
                    tokio::time::sleep(RECEIVE_RETRY_DELAY).await;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("Discovery receive loop received shutdown signal");
                break;
            }
        }
    }
}

async fn broadcast_loop(shared: Arc<Shared>, mut shutdown_rx: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval(shared.config.broadcast_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = shared.announce().await {
                    shared.report(format!("Discovery broadcast failed: {e}"));
                }
                shared.sweep().await;
            }
            _ = shutdown_rx.recv() => {
                tracing::debug!("Discovery broadcast loop received shutdown signal");
                break;
            }
        }
    }
}
