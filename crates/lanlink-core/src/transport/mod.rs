//! Pooled, length-prefixed TCP message transport.
//!
//! One connection per remote peer is kept in a pool keyed by peer id and is
//! used in both directions. Outbound connections are opened lazily by
//! [`TransportService::send`]; inbound connections join the pool under the
//! sender id of their first message. Every connection gets its own read
//! loop, and all received envelopes come out of one event queue no matter
//! which side opened the connection.
//!
//! The queue is bounded and has a single consumer, taken with
//! [`TransportService::take_events`]. A read loop waits for room in the
//! queue before reading its next frame, so a slow consumer slows the
//! sockets down instead of losing messages. A connection's close notice
//! is queued behind every envelope it delivered.
//!
//! The pool lock only guards map changes and is never held across socket
//! I/O. Writes to one connection are serialized by a per-connection lock.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::config::TransportConfig;
use crate::discovery::Peer;
use crate::error::{Error, Result};
use crate::protocol::{self, Envelope};

/// Capacity of the event queue.
const EVENT_CAPACITY: usize = 256;

/// Pause after a failed accept before trying again.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Notifications published by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A decoded, validated envelope arrived
    MessageReceived {
        /// The envelope
        envelope: Envelope,
        /// Remote end of the connection it arrived on
        remote_addr: SocketAddr,
    },
    /// A connection's read loop ended
    ConnectionClosed {
        /// Peer the connection was registered for, if it got that far
        peer_id: Option<String>,
        /// Remote end of the connection
        remote_addr: SocketAddr,
    },
    /// A non-fatal listener error
    Error(String),
}

#[derive(Debug, Clone)]
struct Connection {
    id: u64,
    remote_addr: SocketAddr,
    writer: Arc<Mutex<OwnedWriteHalf>>,
}

#[derive(Debug)]
struct Shared {
    config: TransportConfig,
    pool: Mutex<HashMap<String, Connection>>,
    readers: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_id: AtomicU64,
    events: mpsc::Sender<TransportEvent>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Queue an event without waiting. Dropped if the queue is full.
    fn try_emit(&self, event: TransportEvent) {
        if let Err(e) = self.events.try_send(event) {
            tracing::debug!("Transport event not queued: {e}");
        }
    }

    /// Split a stream, spawn its read loop and return its write side.
    async fn attach(self: &Arc<Self>, stream: TcpStream, peer_id: Option<String>) -> Connection {
        configure_stream(&stream);

        let remote_addr = stream
            .peer_addr()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 0)));
        let (reader, writer) = stream.into_split();
        let connection = Connection {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            remote_addr,
            writer: Arc::new(Mutex::new(writer)),
        };

        // the read loop removes its own handle on exit, so it must not run
        // before the handle is in the map
        let mut readers = self.readers.lock().await;
        let handle = tokio::spawn(read_loop(
            Arc::clone(self),
            reader,
            connection.clone(),
            peer_id,
            self.shutdown_tx.subscribe(),
        ));
        readers.insert(connection.id, handle);
        drop(readers);

        connection
    }

    /// Add a connection to the pool unless the peer already has one.
    /// Returns the connection that ends up pooled.
    async fn register(&self, peer_id: &str, connection: Connection) -> Connection {
        self.pool
            .lock()
            .await
            .entry(peer_id.to_string())
            .or_insert(connection)
            .clone()
    }

    async fn pooled(&self, peer_id: &str) -> Option<Connection> {
        self.pool.lock().await.get(peer_id).cloned()
    }

    /// Remove the pool entry for `peer_id` if it still is `connection_id`.
    async fn evict(&self, peer_id: &str, connection_id: u64) -> bool {
        let mut pool = self.pool.lock().await;
        if pool.get(peer_id).is_some_and(|c| c.id == connection_id) {
            pool.remove(peer_id);
            return true;
        }
        false
    }

    async fn close(&self, connection_id: u64) {
        let handle = self.readers.lock().await.remove(&connection_id);
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

/// TCP message transport with a per-peer connection pool.
#[derive(Debug)]
pub struct TransportService {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    events_rx: Mutex<Option<mpsc::Receiver<TransportEvent>>>,
}

impl TransportService {
    /// Bind the listener.
    ///
    /// # Errors
    ///
    /// Returns an error if the listening port cannot be acquired.
    pub async fn new(config: TransportConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let (events, events_rx) = mpsc::channel(EVENT_CAPACITY);
        let (shutdown_tx, _) = broadcast::channel(1);

        tracing::debug!(%local_addr, "Transport listener bound");

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                pool: Mutex::new(HashMap::new()),
                readers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                events,
                running: AtomicBool::new(false),
                shutdown_tx,
            }),
            local_addr,
            listener: Mutex::new(Some(listener)),
            accept_task: Mutex::new(None),
            events_rx: Mutex::new(Some(events_rx)),
        })
    }

    /// Start accepting connections. Does nothing if already running.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ServiceNotRunning`] if the service was stopped; its
    /// listener is closed and cannot be reopened.
    pub async fn start(&self) -> Result<()> {
        if self.shared.is_running() {
            return Ok(());
        }
        let listener = self
            .listener
            .lock()
            .await
            .take()
            .ok_or(Error::ServiceNotRunning)?;

        self.shared.running.store(true, Ordering::SeqCst);
        let handle = tokio::spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            self.shared.shutdown_tx.subscribe(),
        ));
        *self.accept_task.lock().await = Some(handle);

        tracing::info!(addr = %self.local_addr, "Transport started");
        Ok(())
    }

    /// Close the listener and every pooled connection.
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shared.shutdown_tx.send(());

        let mut handles: Vec<JoinHandle<()>> = Vec::new();
        handles.extend(self.accept_task.lock().await.take());
        handles.extend(self.shared.readers.lock().await.drain().map(|(_, h)| h));
        crate::task::join_all(handles).await;

        self.shared.pool.lock().await.clear();
        tracing::info!("Transport stopped");
    }

    /// Whether the listener is running.
    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Largest frame payload this transport sends or accepts.
    pub fn max_message_size(&self) -> usize {
        self.shared.config.max_message_size
    }

    /// Take the event queue. Only the first call gets it.
    ///
    /// Read loops stall once the queue is full, so whoever takes it must
    /// keep draining it.
    pub async fn take_events(&self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.events_rx.lock().await.take()
    }

    /// Send one envelope to a peer, reusing its pooled connection or
    /// opening a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if the envelope is invalid or too large, the peer
    /// cannot be reached, or the write fails. A connection that fails a
    /// write is evicted so the next send reconnects.
    pub async fn send(&self, envelope: &Envelope, peer: &Peer) -> Result<()> {
        if !self.shared.is_running() {
            return Err(Error::ServiceNotRunning);
        }

        let max = self.shared.config.max_message_size;
        let payload = protocol::serialize(envelope)?;
        protocol::check_frame_len(payload.len(), max)?;

        let connection = match self.shared.pooled(&peer.id).await {
            Some(connection) => connection,
            None => self.connect(peer).await?,
        };

        let result = {
            let mut writer = connection.writer.lock().await;
            protocol::write_frame(&mut *writer, &payload, max).await
        };

        match &result {
            Ok(()) => tracing::debug!(
                peer_id = %peer.id,
                kind = ?envelope.kind(),
                bytes = payload.len(),
                "Sent envelope"
            ),
            Err(e) => {
                tracing::warn!(peer_id = %peer.id, "Send failed, dropping connection: {e}");
                self.shared.evict(&peer.id, connection.id).await;
                self.shared.close(connection.id).await;
            }
        }
        result
    }

    async fn connect(&self, peer: &Peer) -> Result<Connection> {
        let addr = peer.transport_addr();
        let connecting = TcpStream::connect(addr);
        let stream = tokio::time::timeout(self.shared.config.connect_timeout, connecting)
            .await
            .map_err(|_| Error::ConnectTimeout(addr))??;

        tracing::debug!(peer_id = %peer.id, %addr, "Opened connection");

        let connection = self.shared.attach(stream, Some(peer.id.clone())).await;
        let pooled = self.shared.register(&peer.id, connection.clone()).await;
        if pooled.id != connection.id {
            // lost a race with another connect or an inbound connection
            self.shared.close(connection.id).await;
        }
        Ok(pooled)
    }

    /// Whether a pooled connection to `peer_id` exists.
    pub async fn is_connected(&self, peer_id: &str) -> bool {
        self.shared.pool.lock().await.contains_key(peer_id)
    }

    /// Number of pooled connections.
    pub async fn connection_count(&self) -> usize {
        self.shared.pool.lock().await.len()
    }

    /// Close the pooled connection to `peer_id`. Returns `false` if none existed.
    pub async fn disconnect(&self, peer_id: &str) -> bool {
        let removed = self.shared.pool.lock().await.remove(peer_id);
        match removed {
            Some(connection) => {
                self.shared.close(connection.id).await;
                true
            }
            None => false,
        }
    }
}

impl Drop for TransportService {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let _ = self.shared.shutdown_tx.send(());
        if let Some(handle) = self.accept_task.get_mut().take() {
            handle.abort();
        }
    }
}

/// Disable Nagle and enable OS keep-alive probes.
fn configure_stream(stream: &TcpStream) {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY: {e}");
    }

    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(10))
        .with_interval(Duration::from_secs(5));
    if let Err(e) = SockRef::from(stream).set_tcp_keepalive(&keepalive) {
        tracing::debug!("Failed to enable TCP keep-alive: {e}");
    }
}

async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => match result {
                Ok((stream, remote_addr)) => {
                    tracing::debug!(%remote_addr, "Accepted connection");
                    shared.attach(stream, None).await;
                }
                Err(e) => {
                    if !shared.is_running() {
                        break;
                    }
                    let message = format!("Failed to accept connection: {e}");
                    tracing::warn!("{message}");
                    shared.try_emit(TransportEvent::Error(message));
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("Accept loop received shutdown signal");
                break;
            }
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut reader: OwnedReadHalf,
    connection: Connection,
    mut peer_id: Option<String>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let max = shared.config.max_message_size;
    let remote_addr = connection.remote_addr;

    loop {
        let result = tokio::select! {
            result = protocol::read_envelope(&mut reader, max) => result,
            _ = shutdown_rx.recv() => break,
        };

        match result {
            Ok(envelope) => {
                if peer_id.is_none() {
                    let sender = envelope.sender_id().to_string();
                    shared.register(&sender, connection.clone()).await;
                    tracing::debug!(
                        peer_id = %sender,
                        %remote_addr,
                        "Identified inbound connection"
                    );
                    peer_id = Some(sender);
                }
                tracing::debug!(kind = ?envelope.kind(), %remote_addr, "Received envelope");
                let event = TransportEvent::MessageReceived {
                    envelope,
                    remote_addr,
                };
                let queued = tokio::select! {
                    sent = shared.events.send(event) => sent.is_ok(),
                    _ = shutdown_rx.recv() => false,
                };
                if !queued {
                    break;
                }
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                tracing::debug!(%remote_addr, "Connection closed by peer");
                break;
            }
            Err(e) if e.is_protocol_violation() => {
                tracing::warn!(%remote_addr, "Closing connection: {e}");
                break;
            }
            Err(e @ (Error::Serialization(_) | Error::Validation(_) | Error::EmptyData)) => {
                tracing::warn!(%remote_addr, "Dropping undecodable message: {e}");
            }
            Err(e) => {
                tracing::debug!(%remote_addr, "Read failed: {e}");
                break;
            }
        }
    }

    if let Some(id) = &peer_id {
        shared.evict(id, connection.id).await;
    }
    shared.readers.lock().await.remove(&connection.id);

    let closed = TransportEvent::ConnectionClosed {
        peer_id,
        remote_addr,
    };
    if shared.is_running() {
        tokio::select! {
            _ = shared.events.send(closed) => {}
            _ = shutdown_rx.recv() => {}
        }
    } else {
        shared.try_emit(closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalIdentity;
    use crate::protocol::MessageKind;
    use std::net::{IpAddr, Ipv4Addr};
    use std::time::Instant;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn test_config() -> TransportConfig {
        TransportConfig {
            port: 0,
            bind_address: LOCALHOST,
            max_message_size: 1024 * 1024,
            connect_timeout: Duration::from_secs(2),
        }
    }

    async fn started() -> TransportService {
        let service = TransportService::new(test_config()).await.unwrap();
        service.start().await.unwrap();
        service
    }

    fn peer_for(id: &str, service: &TransportService) -> Peer {
        Peer::new(id, id, LOCALHOST, service.local_addr().port(), Instant::now())
    }

    async fn next_message(rx: &mut mpsc::Receiver<TransportEvent>) -> Envelope {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .expect("timed out waiting for message")
                .expect("event queue closed");
            if let TransportEvent::MessageReceived { envelope, .. } = event {
                return envelope;
            }
        }
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let alice = LocalIdentity::new("a1", "Alice");
        let a = started().await;
        let b = started().await;
        let mut b_events = b.take_events().await.unwrap();

        let to_b = peer_for("b1", &b);
        for i in 0..20 {
            let envelope = Envelope::text_message(&alice, "b1", format!("msg-{i}"));
            a.send(&envelope, &to_b).await.unwrap();
        }

        for i in 0..20 {
            let envelope = next_message(&mut b_events).await;
            assert_eq!(envelope.sender_id(), "a1");
            assert_eq!(envelope.text(), Some(format!("msg-{i}").as_str()));
        }
        assert_eq!(a.connection_count().await, 1);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_reply_reuses_inbound_connection() {
        let alice = LocalIdentity::new("a1", "Alice");
        let bob = LocalIdentity::new("b1", "Bob");
        let a = started().await;
        let b = started().await;
        let mut a_events = a.take_events().await.unwrap();
        let mut b_events = b.take_events().await.unwrap();

        a.send(&Envelope::text_message(&alice, "b1", "hi"), &peer_for("b1", &b))
            .await
            .unwrap();
        next_message(&mut b_events).await;
        assert!(b.is_connected("a1").await);

        // wrong port: the reply can only arrive over the pooled connection
        let unreachable_a = Peer::new("a1", "Alice", LOCALHOST, 1, Instant::now());
        b.send(&Envelope::text_message(&bob, "a1", "bye"), &unreachable_a)
            .await
            .unwrap();

        let reply = next_message(&mut a_events).await;
        assert_eq!(reply.sender_id(), "b1");
        assert_eq!(reply.text(), Some("bye"));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_bad_frame_lengths_close_only_that_connection() {
        let alice = LocalIdentity::new("a1", "Alice");
        let b = started().await;
        let mut b_events = b.take_events().await.unwrap();

        for bad_len in [0u32, 1024 * 1024 + 1] {
            let mut raw = TcpStream::connect(b.local_addr()).await.unwrap();
            raw.write_all(&bad_len.to_le_bytes()).await.unwrap();

            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(2), raw.read(&mut buf))
                .await
                .expect("connection was not closed");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        let a = started().await;
        a.send(&Envelope::text_message(&alice, "b1", "still up"), &peer_for("b1", &b))
            .await
            .unwrap();
        assert_eq!(next_message(&mut b_events).await.text(), Some("still up"));

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_dropped() {
        let alice = LocalIdentity::new("a1", "Alice");
        let b = started().await;
        let mut b_events = b.take_events().await.unwrap();

        let mut raw = TcpStream::connect(b.local_addr()).await.unwrap();
        protocol::write_frame(&mut raw, b"\xff\xfe\xfd garbage", 1024)
            .await
            .unwrap();
        let valid = Envelope::text_message(&alice, "b1", "after garbage");
        protocol::write_envelope(&mut raw, &valid, 1024).await.unwrap();

        assert_eq!(next_message(&mut b_events).await.text(), Some("after garbage"));
        b.stop().await;
    }

    #[tokio::test]
    async fn test_oversized_envelope_rejected_before_send() {
        let alice = LocalIdentity::new("a1", "Alice");
        let mut config = test_config();
        config.max_message_size = 1024;
        let a = TransportService::new(config).await.unwrap();
        a.start().await.unwrap();
        let b = started().await;

        let image = Envelope::image_message(&alice, "b1", vec![7u8; 4096]);
        let result = a.send(&image, &peer_for("b1", &b)).await;
        assert!(matches!(result, Err(Error::MessageTooLarge { .. })));
        assert_eq!(a.connection_count().await, 0);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_fails() {
        let alice = LocalIdentity::new("a1", "Alice");
        let a = started().await;

        let closed = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let ghost = Peer::new("g1", "Ghost", LOCALHOST, port, Instant::now());
        let result = a.send(&Envelope::text_message(&alice, "g1", "anyone?"), &ghost).await;
        assert!(result.is_err());
        assert!(!a.is_connected("g1").await);

        a.stop().await;
    }

    #[tokio::test]
    async fn test_send_requires_running() {
        let alice = LocalIdentity::new("a1", "Alice");
        let a = TransportService::new(test_config()).await.unwrap();
        let peer = Peer::new("b1", "Bob", LOCALHOST, 1, Instant::now());
        let result = a.send(&Envelope::text_message(&alice, "b1", "hi"), &peer).await;
        assert!(matches!(result, Err(Error::ServiceNotRunning)));

        a.start().await.unwrap();
        a.stop().await;
        assert!(matches!(a.start().await, Err(Error::ServiceNotRunning)));
    }

    #[tokio::test]
    async fn test_closed_connection_leaves_pool() {
        let alice = LocalIdentity::new("a1", "Alice");
        let a = started().await;
        let b = started().await;
        let mut a_events = a.take_events().await.unwrap();
        let mut b_events = b.take_events().await.unwrap();

        a.send(&Envelope::text_message(&alice, "b1", "hi"), &peer_for("b1", &b))
            .await
            .unwrap();
        next_message(&mut b_events).await;
        assert!(b.disconnect("a1").await);

        let closed = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let event = a_events.recv().await;
                if let Some(TransportEvent::ConnectionClosed { peer_id, .. }) = event {
                    return peer_id;
                }
            }
        })
        .await
        .expect("connection close not observed");
        assert_eq!(closed.as_deref(), Some("b1"));
        assert!(!a.is_connected("b1").await);

        // the next send reconnects
        a.send(&Envelope::new(MessageKind::Heartbeat, "a1", "Alice"), &peer_for("b1", &b))
            .await
            .unwrap();
        assert_eq!(next_message(&mut b_events).await.kind(), MessageKind::Heartbeat);

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_slow_consumer_loses_nothing() {
        let alice = LocalIdentity::new("a1", "Alice");
        let a = Arc::new(started().await);
        let b = started().await;
        let mut b_events = b.take_events().await.unwrap();
        let to_b = peer_for("b1", &b);

        let count = EVENT_CAPACITY * 4;
        let sender = {
            let a = Arc::clone(&a);
            tokio::spawn(async move {
                for i in 0..count {
                    let envelope = Envelope::text_message(&alice, "b1", format!("msg-{i}"));
                    a.send(&envelope, &to_b).await.unwrap();
                }
            })
        };

        // let the queue fill up before draining it
        tokio::time::sleep(Duration::from_millis(200)).await;
        for i in 0..count {
            let envelope = next_message(&mut b_events).await;
            assert_eq!(envelope.text(), Some(format!("msg-{i}").as_str()));
        }
        sender.await.unwrap();

        a.stop().await;
        b.stop().await;
    }

    #[tokio::test]
    async fn test_quick_disconnects_leave_no_reader_handles() {
        let b = started().await;
        let mut b_events = b.take_events().await.unwrap();

        for _ in 0..20 {
            drop(TcpStream::connect(b.local_addr()).await.unwrap());
        }
        for _ in 0..20 {
            let event = tokio::time::timeout(Duration::from_secs(2), b_events.recv())
                .await
                .expect("timed out waiting for close")
                .expect("event queue closed");
            assert!(matches!(
                event,
                TransportEvent::ConnectionClosed { peer_id: None, .. }
            ));
        }
        assert!(b.shared.readers.lock().await.is_empty());

        b.stop().await;
    }
}
