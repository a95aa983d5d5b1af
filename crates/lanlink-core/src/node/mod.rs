//! A running Lanlink peer.
//!
//! [`Node`] binds the transport and discovery sockets, starts every loop,
//! and merges the services' notifications into one stream of
//! [`NodeEvent`]s. Commands resolve peers through a snapshot of the peer
//! table before touching the transport, so no two service locks are ever
//! held together.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::{Config, LocalIdentity};
use crate::discovery::{DiscoveryEvent, DiscoveryService, Peer};
use crate::error::{Error, Result};
use crate::message::{ChatMessage, MessageStore};
use crate::protocol::{Envelope, MessageKind};
use crate::transfer::{Transfer, TransferEvent, TransferManager};
use crate::transport::{TransportEvent, TransportService};

/// Capacity of the node event channel.
const EVENT_CAPACITY: usize = 1024;

/// Everything the presentation layer is told about.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// A peer appeared on the network
    PeerDiscovered(Peer),
    /// A peer left or timed out
    PeerLeft(Peer),
    /// A chat message arrived
    MessageReceived(ChatMessage),
    /// A peer is typing
    Typing {
        /// Who is typing
        peer_id: String,
    },
    /// A peer offered us a file
    TransferRequested(Transfer),
    /// A peer accepted our offer
    TransferAccepted(Transfer),
    /// A peer declined our offer
    TransferRejected(Transfer),
    /// A transfer moved forward
    TransferProgress {
        /// Transfer id
        file_id: String,
        /// Bytes done
        bytes_transferred: u64,
        /// Total bytes
        file_size: u64,
        /// Percentage done
        percent: u8,
    },
    /// A transfer finished
    TransferCompleted(Transfer),
    /// A transfer was cancelled or failed
    TransferFailed {
        /// Final record
        transfer: Transfer,
        /// What went wrong
        reason: String,
    },
    /// A non-fatal error worth showing as status text
    Error(String),
}

impl From<TransferEvent> for NodeEvent {
    fn from(event: TransferEvent) -> Self {
        match event {
            TransferEvent::Requested(t) => Self::TransferRequested(t),
            TransferEvent::Accepted(t) => Self::TransferAccepted(t),
            TransferEvent::Rejected(t) => Self::TransferRejected(t),
            TransferEvent::Progress {
                file_id,
                bytes_transferred,
                file_size,
                percent,
            } => Self::TransferProgress {
                file_id,
                bytes_transferred,
                file_size,
                percent,
            },
            TransferEvent::Completed(t) => Self::TransferCompleted(t),
            TransferEvent::Failed { transfer, reason } => Self::TransferFailed { transfer, reason },
        }
    }
}

struct Inner {
    identity: LocalIdentity,
    discovery: DiscoveryService,
    transport: Arc<TransportService>,
    transfers: TransferManager,
    store: Option<Arc<dyn MessageStore>>,
    events: broadcast::Sender<NodeEvent>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("identity", &self.identity)
            .field("discovery", &self.discovery.local_addr())
            .field("transport", &self.transport.local_addr())
            .field("store", &self.store.is_some())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn record(&self, message: &ChatMessage) {
        if let Some(store) = &self.store {
            store.append(message);
        }
    }

    async fn on_envelope(&self, envelope: Envelope) {
        if envelope
            .receiver_id()
            .is_some_and(|receiver| receiver != self.identity.id)
        {
            tracing::debug!(
                sender = envelope.sender_id(),
                receiver = ?envelope.receiver_id(),
                "Ignoring envelope addressed to another peer"
            );
            return;
        }

        self.discovery.touch(envelope.sender_id()).await;

        match envelope.kind() {
            MessageKind::TextMessage | MessageKind::ImageMessage => {
                if let Some(message) = ChatMessage::from_envelope(&envelope, &self.identity.id) {
                    self.record(&message);
                    self.emit(NodeEvent::MessageReceived(message));
                }
            }
            MessageKind::TypingNotification => {
                self.emit(NodeEvent::Typing {
                    peer_id: envelope.sender_id().to_string(),
                });
            }
            MessageKind::FileTransferRequest => {
                if let Some(message) = ChatMessage::from_envelope(&envelope, &self.identity.id) {
                    self.record(&message);
                }
                self.transfers.handle_envelope(&envelope).await;
            }
            MessageKind::FileTransferAccept
            | MessageKind::FileTransferReject
            | MessageKind::FileTransferData
            | MessageKind::FileTransferComplete => {
                self.transfers.handle_envelope(&envelope).await;
            }
            MessageKind::Heartbeat
            | MessageKind::Discovery
            | MessageKind::DiscoveryResponse
            | MessageKind::UserJoined
            | MessageKind::UserLeft => {}
        }
    }

    /// Drop the transfers a departed peer can no longer finish.
    async fn abandon_peer(&self, peer_id: &str, reason: &str) {
        let dropped = self.transfers.abandon_peer(peer_id, reason).await;
        if dropped > 0 {
            tracing::info!(peer_id, dropped, "Dropped transfers with unreachable peer: {reason}");
        }
    }

    async fn resolve(&self, peer_id: &str) -> Result<Peer> {
        self.discovery
            .peer(peer_id)
            .await
            .ok_or_else(|| Error::PeerNotFound(peer_id.to_string()))
    }
}

/// A started peer: discovery, transport and transfers behind one handle.
#[derive(Debug)]
pub struct Node {
    inner: Arc<Inner>,
    shutdown_tx: broadcast::Sender<()>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Node {
    /// Start a node without a message store.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a socket cannot
    /// be bound.
    pub async fn start(config: &Config) -> Result<Self> {
        Self::start_with_store(config, None).await
    }

    /// Start a node that appends every chat message to `store`.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or a socket cannot
    /// be bound.
    pub async fn start_with_store(
        config: &Config,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Result<Self> {
        config.validate()?;
        let identity = config.local_identity()?;

        let transport = Arc::new(TransportService::new(config.transport.clone()).await?);
        let transport_port = transport.local_addr().port();
        let discovery =
            DiscoveryService::new(config.discovery.clone(), identity.clone(), transport_port)
                .await?;
        let transfers = TransferManager::new(
            config.transfer.clone(),
            identity.clone(),
            Arc::clone(&transport),
        );

        let transport_rx = transport
            .take_events()
            .await
            .ok_or_else(|| Error::Protocol("transport events already taken".to_string()))?;
        let discovery_rx = discovery.subscribe();
        let transfer_rx = transfers.subscribe();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        let inner = Arc::new(Inner {
            identity,
            discovery,
            transport,
            transfers,
            store,
            events,
        });

        inner.transport.start().await?;
        inner.discovery.start().await;

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&inner),
            transport_rx,
            discovery_rx,
            transfer_rx,
            shutdown_tx.subscribe(),
        ));

        tracing::info!(
            peer_id = %inner.identity.id,
            name = %inner.identity.name,
            transport = %inner.transport.local_addr(),
            discovery = %inner.discovery.local_addr(),
            "Node started"
        );

        Ok(Self {
            inner,
            shutdown_tx,
            dispatch: Mutex::new(Some(dispatch)),
            running: AtomicBool::new(true),
        })
    }

    /// Stop every service, announcing departure to the network.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        self.inner.transfers.shutdown().await;
        self.inner.discovery.stop().await;
        self.inner.transport.stop().await;

        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.dispatch.lock().await.take() {
            crate::task::join_bounded(handle, crate::task::STOP_TIMEOUT).await;
        }

        tracing::info!("Node stopped");
    }

    /// Whether the node is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Subscribe to node events.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    /// The local peer.
    pub fn local_identity(&self) -> &LocalIdentity {
        &self.inner.identity
    }

    /// Address of the discovery socket.
    pub fn discovery_addr(&self) -> std::net::SocketAddr {
        self.inner.discovery.local_addr()
    }

    /// Address of the transport listener.
    pub fn transport_addr(&self) -> std::net::SocketAddr {
        self.inner.transport.local_addr()
    }

    /// Peers currently online.
    pub async fn peers(&self) -> Vec<Peer> {
        self.inner.discovery.online_peers().await
    }

    /// One peer, if online.
    pub async fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.inner.discovery.peer(peer_id).await
    }

    /// Send a text message.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown, the text is empty, or the
    /// send fails.
    pub async fn send_text(&self, peer_id: &str, text: &str) -> Result<ChatMessage> {
        let peer = self.inner.resolve(peer_id).await?;
        let envelope = Envelope::text_message(&self.inner.identity, &peer.id, text);
        self.send_chat(&envelope, &peer).await
    }

    /// Send an image.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown, the image is empty or too
    /// large, or the send fails.
    pub async fn send_image(&self, peer_id: &str, image: Vec<u8>) -> Result<ChatMessage> {
        let peer = self.inner.resolve(peer_id).await?;
        let envelope = Envelope::image_message(&self.inner.identity, &peer.id, image);
        self.send_chat(&envelope, &peer).await
    }

    async fn send_chat(&self, envelope: &Envelope, peer: &Peer) -> Result<ChatMessage> {
        self.inner.transport.send(envelope, peer).await?;
        let message = ChatMessage::from_envelope(envelope, &self.inner.identity.id)
            .ok_or_else(|| Error::Protocol(format!("{:?} is not a chat kind", envelope.kind())))?;
        self.inner.record(&message);
        Ok(message)
    }

    /// Tell a peer we are typing.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown or the send fails.
    pub async fn send_typing(&self, peer_id: &str) -> Result<()> {
        let peer = self.inner.resolve(peer_id).await?;
        let envelope =
            Envelope::from_identity(MessageKind::TypingNotification, &self.inner.identity)
                .with_receiver(peer.id.as_str());
        self.inner.transport.send(&envelope, &peer).await
    }

    /// Offer a file to a peer. Chunks flow only after the peer accepts and
    /// [`start_sending`](Self::start_sending) is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the peer is unknown, the file is missing or
    /// empty, or the request cannot be sent.
    pub async fn send_file(&self, peer_id: &str, path: &Path) -> Result<Transfer> {
        let peer = self.inner.resolve(peer_id).await?;
        let transfer = self.inner.transfers.request(&peer, path).await?;
        self.inner
            .record(&ChatMessage::from_transfer(&transfer, &self.inner.identity.id));
        Ok(transfer)
    }

    /// Stream an accepted outgoing transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not yet accepted.
    pub async fn start_sending(&self, file_id: &str) -> Result<Transfer> {
        self.inner.transfers.start_sending(file_id).await
    }

    /// Accept an incoming transfer, saving it to `save_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer or its sender is unknown, the file
    /// cannot be created, or the answer cannot be sent.
    pub async fn accept_transfer(&self, file_id: &str, save_path: &Path) -> Result<Transfer> {
        let sender = self.transfer_sender(file_id).await?;
        self.inner.transfers.accept(file_id, save_path, &sender).await
    }

    /// Decline an incoming transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer or its sender is unknown, or the
    /// answer cannot be sent.
    pub async fn reject_transfer(&self, file_id: &str) -> Result<Transfer> {
        let sender = self.transfer_sender(file_id).await?;
        self.inner.transfers.reject(file_id, &sender).await
    }

    /// Cancel a transfer in either direction.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown.
    pub async fn cancel_transfer(&self, file_id: &str) -> Result<Transfer> {
        self.inner.transfers.cancel(file_id).await
    }

    /// Transfers in progress.
    pub async fn active_transfers(&self) -> Vec<Transfer> {
        self.inner.transfers.active_transfers().await
    }

    async fn transfer_sender(&self, file_id: &str) -> Result<Peer> {
        let transfer = self
            .inner
            .transfers
            .transfer(file_id)
            .await
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
        self.inner.resolve(&transfer.sender_id).await
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // streaming senders hold the transport; stop them so it can close
        self.inner.transfers.halt();
        let _ = self.shutdown_tx.send(());
        if let Some(handle) = self.dispatch.get_mut().take() {
            handle.abort();
        }
    }
}

async fn dispatch_loop(
    inner: Arc<Inner>,
    mut transport_rx: mpsc::Receiver<TransportEvent>,
    mut discovery_rx: broadcast::Receiver<DiscoveryEvent>,
    mut transfer_rx: broadcast::Receiver<TransferEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        // relay queued notifications before taking more envelopes
        tokio::select! {
            biased;

            _ = shutdown_rx.recv() => {
                tracing::debug!("Dispatch loop received shutdown signal");
                break;
            }
            event = transfer_rx.recv() => match event {
                Ok(event) => inner.emit(event.into()),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Dispatch fell behind, {n} transfer events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            event = discovery_rx.recv() => match event {
                Ok(DiscoveryEvent::PeerDiscovered(peer)) => {
                    inner.emit(NodeEvent::PeerDiscovered(peer));
                }
                Ok(DiscoveryEvent::PeerLeft(peer)) => {
                    inner.abandon_peer(&peer.id, "peer left").await;
                    inner.emit(NodeEvent::PeerLeft(peer));
                }
                Ok(DiscoveryEvent::Error(message)) => inner.emit(NodeEvent::Error(message)),
                Err(RecvError::Lagged(n)) => {
                    tracing::warn!("Dispatch fell behind, {n} discovery events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            event = transport_rx.recv() => match event {
                Some(TransportEvent::MessageReceived { envelope, .. }) => {
                    inner.on_envelope(envelope).await;
                }
                Some(TransportEvent::ConnectionClosed { peer_id, remote_addr }) => {
                    tracing::debug!(?peer_id, %remote_addr, "Connection closed");
                    if let Some(peer_id) = peer_id {
                        if !inner.transport.is_connected(&peer_id).await {
                            inner.abandon_peer(&peer_id, "connection to peer closed").await;
                        }
                    }
                }
                Some(TransportEvent::Error(message)) => inner.emit(NodeEvent::Error(message)),
                None => break,
            },
        }
    }
}
