//! File transfer protocol built on the transport.
//!
//! ## Flow
//!
//! ```text
//! Sender                               Receiver
//!   |-- FileTransferRequest ----------->|  Requested
//!   |<--------- FileTransferAccept -----|  Accepted (output file opened)
//!   |   (caller calls start_sending)    |
//!   |-- FileTransferData #0 ----------->|  Receiving
//!   |-- ...                             |
//!   |-- FileTransferData #n-1 --------->|
//!   |-- FileTransferComplete ---------->|  Completed
//! ```
//!
//! A `FileTransferReject` ends the transfer on both sides. Either side
//! sends one for a transfer it drops after the offer was answered, so a
//! cancel or a receiver-side failure stops the other end too. Chunks and
//! completions for unknown file ids are ignored, since they race with
//! cancellation. Partial output files are left on disk.

mod chunk;

pub use chunk::{chunk_count, Chunk, ChunkReader};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::{LocalIdentity, TransferConfig};
use crate::discovery::Peer;
use crate::error::{Error, Result};
use crate::protocol::{Envelope, MessageKind};
use crate::transport::TransportService;

/// Capacity of the event channel.
const EVENT_CAPACITY: usize = 1024;

/// Transfer state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferState {
    /// Offered, waiting for the receiver's answer
    Requested,
    /// Receiver accepted
    Accepted,
    /// Sender is streaming chunks
    Sending,
    /// Receiver is writing chunks
    Receiving,
    /// All bytes delivered
    Completed,
    /// Receiver declined
    Rejected,
    /// Stopped by a user on either side
    Cancelled,
    /// Stopped by an I/O or transport failure
    Failed,
}

impl TransferState {
    /// Whether the transfer has ended.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Rejected | Self::Cancelled | Self::Failed
        )
    }
}

impl std::fmt::Display for TransferState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Requested => "requested",
            Self::Accepted => "accepted",
            Self::Sending => "sending",
            Self::Receiving => "receiving",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which side of the transfer we are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferDirection {
    /// We send the file
    Outgoing,
    /// We receive the file
    Incoming,
}

/// One file transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    /// Unique id chosen by the sender
    pub file_id: String,
    /// File name without directories
    pub file_name: String,
    /// File size in bytes
    pub file_size: u64,
    /// Sending peer id
    pub sender_id: String,
    /// Sending peer name
    pub sender_name: String,
    /// Receiving peer id
    pub receiver_id: String,
    /// Our side of the transfer
    pub direction: TransferDirection,
    /// Current state
    pub state: TransferState,
    /// When the transfer was created
    pub started_at: DateTime<Utc>,
    /// Bytes sent or written so far
    pub bytes_transferred: u64,
    /// Output path, receiver side only
    pub save_path: Option<PathBuf>,
}

impl Transfer {
    /// Percentage done, `floor(bytes_transferred * 100 / file_size)`.
    ///
    /// Zero for an empty file.
    pub fn progress(&self) -> u8 {
        percent(self.bytes_transferred, self.file_size)
    }

    /// Whether every byte was delivered.
    pub fn is_completed(&self) -> bool {
        self.state == TransferState::Completed
    }

    /// Whether the local user cancelled the transfer.
    pub fn is_cancelled(&self) -> bool {
        self.state == TransferState::Cancelled
    }

    /// Id of the peer on the other end.
    pub fn remote_id(&self) -> &str {
        match self.direction {
            TransferDirection::Outgoing => &self.receiver_id,
            TransferDirection::Incoming => &self.sender_id,
        }
    }
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    let value = u128::from(done.min(total)) * 100 / u128::from(total);
    u8::try_from(value).unwrap_or(100)
}

/// Notifications published by the transfer manager.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// A peer offered us a file
    Requested(Transfer),
    /// The receiver accepted our offer
    Accepted(Transfer),
    /// The receiver declined our offer
    Rejected(Transfer),
    /// Bytes moved
    Progress {
        /// Transfer id
        file_id: String,
        /// Bytes done
        bytes_transferred: u64,
        /// Total bytes
        file_size: u64,
        /// Percentage done
        percent: u8,
    },
    /// Transfer finished successfully
    Completed(Transfer),
    /// Transfer was cancelled or failed
    Failed {
        /// Final record
        transfer: Transfer,
        /// What went wrong
        reason: String,
    },
}

#[derive(Debug)]
struct Entry {
    transfer: Transfer,
    cancelled: Arc<AtomicBool>,
    /// Set when the receiver told a streaming sender to stop
    stopped_by_peer: bool,
    /// Remote peer, once known
    peer: Option<Peer>,
    /// Local file, sender side only
    source: Option<PathBuf>,
    /// Open output file, receiver side only
    output: Option<Arc<Mutex<File>>>,
    next_chunk: i32,
    task: Option<JoinHandle<()>>,
}

impl Entry {
    fn new(transfer: Transfer) -> Self {
        Self {
            transfer,
            cancelled: Arc::new(AtomicBool::new(false)),
            stopped_by_peer: false,
            peer: None,
            source: None,
            output: None,
            next_chunk: 0,
            task: None,
        }
    }
}

#[derive(Debug)]
struct Shared {
    identity: LocalIdentity,
    config: TransferConfig,
    transport: Arc<TransportService>,
    active: Mutex<HashMap<String, Entry>>,
    events: broadcast::Sender<TransferEvent>,
    halted: AtomicBool,
}

impl Shared {
    fn emit(&self, event: TransferEvent) {
        let _ = self.events.send(event);
    }

    fn emit_progress(&self, transfer: &Transfer) {
        self.emit(TransferEvent::Progress {
            file_id: transfer.file_id.clone(),
            bytes_transferred: transfer.bytes_transferred,
            file_size: transfer.file_size,
            percent: transfer.progress(),
        });
    }

    /// Remove a transfer and report its final state.
    async fn finish(
        &self,
        file_id: &str,
        state: TransferState,
        reason: Option<String>,
    ) -> Option<Transfer> {
        let mut entry = self.active.lock().await.remove(file_id)?;
        entry.transfer.state = state;
        let transfer = entry.transfer;

        match reason {
            None => {
                tracing::info!(
                    file_id,
                    file = %transfer.file_name,
                    bytes = transfer.bytes_transferred,
                    "Transfer completed"
                );
                self.emit(TransferEvent::Completed(transfer.clone()));
            }
            Some(reason) => {
                tracing::error!(file_id, file = %transfer.file_name, "Transfer {state}: {reason}");
                self.emit(TransferEvent::Failed {
                    transfer: transfer.clone(),
                    reason,
                });
            }
        }
        Some(transfer)
    }

    /// Add `len` bytes to a transfer. Returns the updated record, or `None`
    /// if the transfer is gone.
    async fn advance(&self, file_id: &str, len: usize) -> Option<Transfer> {
        let mut active = self.active.lock().await;
        let entry = active.get_mut(file_id)?;
        entry.transfer.bytes_transferred = entry
            .transfer
            .bytes_transferred
            .saturating_add(len as u64)
            .min(entry.transfer.file_size);
        Some(entry.transfer.clone())
    }

    async fn send_file(
        self: Arc<Self>,
        file_id: String,
        peer: Peer,
        source: PathBuf,
        cancelled: Arc<AtomicBool>,
    ) {
        let outcome = self.stream_chunks(&file_id, &peer, &source, &cancelled).await;

        let outcome = match outcome {
            Ok(()) => {
                let complete =
                    Envelope::from_identity(MessageKind::FileTransferComplete, &self.identity)
                        .with_receiver(peer.id.as_str())
                        .with_file_id(file_id.as_str());
                self.transport.send(&complete, &peer).await
            }
            Err(e) => Err(e),
        };

        let (state, reason) = match outcome {
            Ok(()) => (TransferState::Completed, None),
            Err(Error::TransferCancelled) => {
                let by_peer = self
                    .active
                    .lock()
                    .await
                    .get(&file_id)
                    .is_some_and(|entry| entry.stopped_by_peer);
                if by_peer {
                    (TransferState::Cancelled, Some("cancelled by receiver".to_string()))
                } else {
                    if !self.halted.load(Ordering::SeqCst) {
                        self.send_cancel_notice(&file_id, &peer).await;
                    }
                    (TransferState::Cancelled, Some("cancelled".to_string()))
                }
            }
            Err(e) => (TransferState::Failed, Some(e.to_string())),
        };
        self.finish(&file_id, state, reason).await;
    }

    /// Tell the other side a transfer was dropped. Best effort.
    async fn send_cancel_notice(&self, file_id: &str, peer: &Peer) {
        let notice = Envelope::from_identity(MessageKind::FileTransferReject, &self.identity)
            .with_receiver(peer.id.as_str())
            .with_file_id(file_id);
        if let Err(e) = self.transport.send(&notice, peer).await {
            tracing::debug!(file_id, peer_id = %peer.id, "Cancel notice not delivered: {e}");
        }
    }

    fn stopping(&self, cancelled: &AtomicBool) -> bool {
        cancelled.load(Ordering::SeqCst) || self.halted.load(Ordering::SeqCst)
    }

    async fn stream_chunks(
        &self,
        file_id: &str,
        peer: &Peer,
        source: &Path,
        cancelled: &AtomicBool,
    ) -> Result<()> {
        let file_size = self
            .active
            .lock()
            .await
            .get(file_id)
            .map(|entry| entry.transfer.file_size)
            .ok_or(Error::TransferCancelled)?;

        let total = i32::try_from(chunk_count(file_size, self.config.chunk_size))
            .map_err(|_| Error::TransferFailed("file has too many chunks".to_string()))?;

        let file = File::open(source).await?;
        let mut reader = ChunkReader::new(file.take(file_size), self.config.chunk_size);
        let mut sent: u64 = 0;

        tracing::info!(file_id, chunks = total, to = %peer.id, "Sending file");

        while let Some(chunk) = reader.next_chunk().await? {
            if self.stopping(cancelled) {
                return Err(Error::TransferCancelled);
            }

            let index = i32::try_from(chunk.index)
                .map_err(|_| Error::TransferFailed("chunk index out of range".to_string()))?;
            let len = chunk.data.len();
            let envelope = Envelope::from_identity(MessageKind::FileTransferData, &self.identity)
                .with_receiver(peer.id.as_str())
                .with_file_id(file_id)
                .with_chunk(index, total)
                .with_data(chunk.data);
            self.transport.send(&envelope, peer).await?;

            sent += len as u64;
            let transfer = self
                .advance(file_id, len)
                .await
                .ok_or(Error::TransferCancelled)?;
            self.emit_progress(&transfer);

            if !self.config.chunk_delay.is_zero() {
                tokio::time::sleep(self.config.chunk_delay).await;
            }
        }

        if self.stopping(cancelled) {
            return Err(Error::TransferCancelled);
        }
        if sent != file_size {
            return Err(Error::TransferFailed(format!(
                "file shrank while sending: {sent} of {file_size} bytes read"
            )));
        }
        Ok(())
    }

    async fn on_request(&self, envelope: &Envelope) {
        let Some(file_id) = envelope.file_id() else {
            return;
        };
        let transfer = Transfer {
            file_id: file_id.to_string(),
            file_name: envelope.file_name().unwrap_or_default().to_string(),
            file_size: u64::try_from(envelope.file_size()).unwrap_or(0),
            sender_id: envelope.sender_id().to_string(),
            sender_name: envelope.sender_name().to_string(),
            receiver_id: self.identity.id.clone(),
            direction: TransferDirection::Incoming,
            state: TransferState::Requested,
            started_at: Utc::now(),
            bytes_transferred: 0,
            save_path: None,
        };

        {
            let mut active = self.active.lock().await;
            if active.contains_key(file_id) {
                tracing::debug!(file_id, "Ignoring duplicate transfer request");
                return;
            }
            active.insert(file_id.to_string(), Entry::new(transfer.clone()));
        }

        tracing::info!(
            file_id,
            file = %transfer.file_name,
            size = transfer.file_size,
            from = %transfer.sender_id,
            "Transfer requested"
        );
        self.emit(TransferEvent::Requested(transfer));
    }

    async fn on_answer(&self, envelope: &Envelope, accepted: bool) {
        let Some(file_id) = envelope.file_id() else {
            return;
        };

        let mut active = self.active.lock().await;
        let Some(entry) = active.get_mut(file_id) else {
            tracing::debug!(file_id, "Ignoring answer for unknown transfer");
            return;
        };
        if entry.transfer.remote_id() != envelope.sender_id() {
            tracing::debug!(file_id, "Ignoring transfer answer from unexpected peer");
            return;
        }

        let direction = entry.transfer.direction;
        match (direction, entry.transfer.state, accepted) {
            (TransferDirection::Outgoing, TransferState::Requested, true) => {
                entry.transfer.state = TransferState::Accepted;
                let snapshot = entry.transfer.clone();
                drop(active);
                tracing::info!(file_id, "Transfer accepted");
                self.emit(TransferEvent::Accepted(snapshot));
            }
            (TransferDirection::Outgoing, TransferState::Requested, false) => {
                if let Some(entry) = active.remove(file_id) {
                    drop(active);
                    let mut transfer = entry.transfer;
                    transfer.state = TransferState::Rejected;
                    tracing::info!(file_id, "Transfer rejected");
                    self.emit(TransferEvent::Rejected(transfer));
                }
            }
            (TransferDirection::Outgoing, TransferState::Sending, false) => {
                // the streaming task reports the outcome
                entry.stopped_by_peer = true;
                entry.cancelled.store(true, Ordering::SeqCst);
                tracing::info!(file_id, "Receiver stopped the transfer");
            }
            (_, _, false) => {
                drop(active);
                let reason = match direction {
                    TransferDirection::Outgoing => "cancelled by receiver",
                    TransferDirection::Incoming => "cancelled by sender",
                };
                self.finish(file_id, TransferState::Cancelled, Some(reason.to_string()))
                    .await;
            }
            (_, state, true) => {
                tracing::debug!(file_id, %state, "Ignoring unexpected transfer answer");
            }
        }
    }

    /// End an incoming transfer from inside the receive path and tell the
    /// sender, without waiting on the transport.
    async fn abort_incoming(
        &self,
        file_id: &str,
        state: TransferState,
        reason: String,
        sender: Option<Peer>,
    ) {
        self.finish(file_id, state, Some(reason)).await;

        if let Some(peer) = sender {
            let notice = Envelope::from_identity(MessageKind::FileTransferReject, &self.identity)
                .with_receiver(peer.id.as_str())
                .with_file_id(file_id);
            let transport = Arc::clone(&self.transport);
            tokio::spawn(async move {
                if let Err(e) = transport.send(&notice, &peer).await {
                    tracing::debug!(peer_id = %peer.id, "Cancel notice not delivered: {e}");
                }
            });
        }
    }

    async fn on_chunk(&self, envelope: &Envelope) {
        let Some(file_id) = envelope.file_id() else {
            return;
        };

        let (output, sender) = {
            let mut active = self.active.lock().await;
            let Some(entry) = active.get_mut(file_id) else {
                tracing::debug!(file_id, "Ignoring chunk for unknown transfer");
                return;
            };
            let receiving = matches!(
                entry.transfer.state,
                TransferState::Accepted | TransferState::Receiving
            );
            let Some(output) = entry.output.clone().filter(|_| receiving) else {
                tracing::debug!(file_id, "Ignoring chunk for transfer without open output");
                return;
            };
            if entry.transfer.sender_id != envelope.sender_id() {
                tracing::debug!(file_id, "Ignoring chunk from unexpected sender");
                return;
            }
            let sender = entry.peer.clone();
            if envelope.chunk_index() != entry.next_chunk {
                let reason = format!(
                    "expected chunk {}, got {}",
                    entry.next_chunk,
                    envelope.chunk_index()
                );
                drop(active);
                self.abort_incoming(file_id, TransferState::Failed, reason, sender)
                    .await;
                return;
            }
            let len = envelope.data().len() as u64;
            if entry.transfer.bytes_transferred.saturating_add(len) > entry.transfer.file_size {
                let reason = format!(
                    "chunk {} overruns the declared size of {} bytes",
                    envelope.chunk_index(),
                    entry.transfer.file_size
                );
                drop(active);
                self.abort_incoming(file_id, TransferState::Failed, reason, sender)
                    .await;
                return;
            }
            entry.next_chunk += 1;
            entry.transfer.state = TransferState::Receiving;
            (output, sender)
        };

        let written = {
            let mut file = output.lock().await;
            match file.write_all(envelope.data()).await {
                Ok(()) => file.flush().await,
                Err(e) => Err(e),
            }
        };

        if let Err(e) = written {
            drop(output);
            self.abort_incoming(
                file_id,
                TransferState::Cancelled,
                format!("failed to write chunk: {e}"),
                sender,
            )
            .await;
            return;
        }

        if let Some(transfer) = self.advance(file_id, envelope.data().len()).await {
            self.emit_progress(&transfer);
        }
    }

    async fn on_complete(&self, envelope: &Envelope) {
        let Some(file_id) = envelope.file_id() else {
            return;
        };

        let output = {
            let active = self.active.lock().await;
            match active.get(file_id) {
                Some(entry)
                    if entry.transfer.direction == TransferDirection::Incoming
                        && entry.transfer.sender_id == envelope.sender_id() =>
                {
                    entry.output.clone()
                }
                _ => {
                    tracing::debug!(file_id, "Ignoring completion for unknown transfer");
                    return;
                }
            }
        };

        let Some(output) = output else {
            return;
        };
        if let Err(e) = output.lock().await.sync_all().await {
            tracing::warn!(file_id, "Failed to sync output file: {e}");
        }

        let delivered = self
            .active
            .lock()
            .await
            .get(file_id)
            .map(|entry| entry.transfer.bytes_transferred == entry.transfer.file_size);

        let (state, reason) = match delivered {
            Some(true) => (TransferState::Completed, None),
            Some(false) => (
                TransferState::Failed,
                Some("sender finished before all bytes arrived".to_string()),
            ),
            None => return,
        };
        self.finish(file_id, state, reason).await;
    }
}

/// Tracks active transfers and drives both sides of the protocol.
#[derive(Debug, Clone)]
pub struct TransferManager {
    shared: Arc<Shared>,
}

impl TransferManager {
    /// Create a manager sending through `transport`.
    pub fn new(
        config: TransferConfig,
        identity: LocalIdentity,
        transport: Arc<TransportService>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                identity,
                config,
                transport,
                active: Mutex::new(HashMap::new()),
                events,
                halted: AtomicBool::new(false),
            }),
        }
    }

    /// Subscribe to transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.shared.events.subscribe()
    }

    /// Offer a file to a peer.
    ///
    /// Returns once the request has been written to the transport. Chunks
    /// are only sent after the peer accepts and [`start_sending`](Self::start_sending)
    /// is called.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing or empty, or the request
    /// cannot be sent.
    pub async fn request(&self, peer: &Peer, path: &Path) -> Result<Transfer> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|_| Error::FileNotFound(path.display().to_string()))?;
        if !metadata.is_file() {
            return Err(Error::FileNotFound(path.display().to_string()));
        }

        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .ok_or_else(|| Error::FileNotFound(path.display().to_string()))?;
        let file_size = metadata.len();
        let wire_size = i64::try_from(file_size)
            .map_err(|_| Error::TransferFailed("file is too large".to_string()))?;
        let file_id = Uuid::new_v4().to_string();

        let envelope =
            Envelope::from_identity(MessageKind::FileTransferRequest, &self.shared.identity)
                .with_receiver(peer.id.as_str())
                .with_file(file_name.as_str(), wire_size)
                .with_file_id(file_id.as_str());
        envelope.validate()?;

        let transfer = Transfer {
            file_id: file_id.clone(),
            file_name,
            file_size,
            sender_id: self.shared.identity.id.clone(),
            sender_name: self.shared.identity.name.clone(),
            receiver_id: peer.id.clone(),
            direction: TransferDirection::Outgoing,
            state: TransferState::Requested,
            started_at: Utc::now(),
            bytes_transferred: 0,
            save_path: None,
        };

        let mut entry = Entry::new(transfer.clone());
        entry.peer = Some(peer.clone());
        entry.source = Some(path.to_path_buf());
        self.shared.active.lock().await.insert(file_id.clone(), entry);

        if let Err(e) = self.shared.transport.send(&envelope, peer).await {
            self.shared.active.lock().await.remove(&file_id);
            return Err(e);
        }

        tracing::info!(
            file_id = %transfer.file_id,
            file = %transfer.file_name,
            size = transfer.file_size,
            to = %peer.id,
            "Transfer requested"
        );
        Ok(transfer)
    }

    /// Start streaming an accepted outgoing transfer on its own task.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or not accepted.
    pub async fn start_sending(&self, file_id: &str) -> Result<Transfer> {
        let mut active = self.shared.active.lock().await;
        let entry = active
            .get_mut(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;

        let ready = entry.transfer.direction == TransferDirection::Outgoing
            && entry.transfer.state == TransferState::Accepted;
        let (Some(peer), Some(source), true) = (entry.peer.clone(), entry.source.clone(), ready)
        else {
            return Err(Error::InvalidTransferState {
                file_id: file_id.to_string(),
                state: entry.transfer.state.to_string(),
                action: "start sending",
            });
        };

        entry.transfer.state = TransferState::Sending;
        let task = tokio::spawn(Arc::clone(&self.shared).send_file(
            file_id.to_string(),
            peer,
            source,
            Arc::clone(&entry.cancelled),
        ));
        entry.task = Some(task);
        Ok(entry.transfer.clone())
    }

    /// Accept an incoming transfer, writing it to `save_path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or already answered, the
    /// output file cannot be created, or the answer cannot be sent.
    pub async fn accept(&self, file_id: &str, save_path: &Path, peer: &Peer) -> Result<Transfer> {
        self.expect_pending(file_id, "accept").await?;

        if let Some(parent) = save_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = File::create(save_path).await?;

        let transfer = {
            let mut active = self.shared.active.lock().await;
            let entry = active
                .get_mut(file_id)
                .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
            entry.output = Some(Arc::new(Mutex::new(file)));
            entry.peer = Some(peer.clone());
            entry.transfer.state = TransferState::Accepted;
            entry.transfer.save_path = Some(save_path.to_path_buf());
            entry.transfer.clone()
        };

        let answer = Envelope::from_identity(MessageKind::FileTransferAccept, &self.shared.identity)
            .with_receiver(peer.id.as_str())
            .with_file_id(file_id);
        if let Err(e) = self.shared.transport.send(&answer, peer).await {
            self.shared.active.lock().await.remove(file_id);
            return Err(e);
        }

        tracing::info!(file_id, path = %save_path.display(), "Transfer accepted");
        Ok(transfer)
    }

    /// Decline an incoming transfer.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown or already answered. The
    /// local record is dropped even if the answer cannot be sent.
    pub async fn reject(&self, file_id: &str, peer: &Peer) -> Result<Transfer> {
        self.expect_pending(file_id, "reject").await?;

        let removed = self.shared.active.lock().await.remove(file_id);
        let mut transfer = removed
            .map(|entry| entry.transfer)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
        transfer.state = TransferState::Rejected;

        let answer = Envelope::from_identity(MessageKind::FileTransferReject, &self.shared.identity)
            .with_receiver(peer.id.as_str())
            .with_file_id(file_id);
        self.shared.transport.send(&answer, peer).await?;

        tracing::info!(file_id, "Transfer rejected");
        Ok(transfer)
    }

    /// Cancel a transfer on either side.
    ///
    /// A streaming sender stops before its next chunk and reports the
    /// failure itself; anything else is removed immediately and its output
    /// file closed. Once the offer was answered the other side is told.
    ///
    /// # Errors
    ///
    /// Returns an error if the transfer is unknown.
    pub async fn cancel(&self, file_id: &str) -> Result<Transfer> {
        let active = self.shared.active.lock().await;
        let entry = active
            .get(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
        entry.cancelled.store(true, Ordering::SeqCst);

        if entry.transfer.state == TransferState::Sending {
            let mut snapshot = entry.transfer.clone();
            snapshot.state = TransferState::Cancelled;
            return Ok(snapshot);
        }

        let peer = entry.peer.clone();
        drop(active);
        let transfer = self
            .shared
            .finish(file_id, TransferState::Cancelled, Some("cancelled".to_string()))
            .await
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;

        if let Some(peer) = peer {
            self.shared.send_cancel_notice(file_id, &peer).await;
        }
        Ok(transfer)
    }

    /// Fail every transfer still waiting on `peer_id`. Returns how many
    /// were dropped.
    ///
    /// Streaming senders are skipped; a send to a departed peer fails on
    /// its own.
    pub async fn abandon_peer(&self, peer_id: &str, reason: &str) -> usize {
        let ids: Vec<String> = self
            .shared
            .active
            .lock()
            .await
            .values()
            .filter(|entry| {
                entry.transfer.remote_id() == peer_id
                    && entry.transfer.state != TransferState::Sending
            })
            .map(|entry| entry.transfer.file_id.clone())
            .collect();

        for id in &ids {
            self.shared
                .finish(id, TransferState::Failed, Some(reason.to_string()))
                .await;
        }
        ids.len()
    }

    /// Make every streaming sender stop before its next chunk. Does not
    /// wait; see [`shutdown`](Self::shutdown).
    pub fn halt(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
    }

    /// Route a transfer envelope received from the transport.
    pub async fn handle_envelope(&self, envelope: &Envelope) {
        match envelope.kind() {
            MessageKind::FileTransferRequest => self.shared.on_request(envelope).await,
            MessageKind::FileTransferAccept => self.shared.on_answer(envelope, true).await,
            MessageKind::FileTransferReject => self.shared.on_answer(envelope, false).await,
            MessageKind::FileTransferData => self.shared.on_chunk(envelope).await,
            MessageKind::FileTransferComplete => self.shared.on_complete(envelope).await,
            MessageKind::Discovery
            | MessageKind::DiscoveryResponse
            | MessageKind::UserJoined
            | MessageKind::UserLeft
            | MessageKind::TextMessage
            | MessageKind::ImageMessage
            | MessageKind::TypingNotification
            | MessageKind::Heartbeat => {}
        }
    }

    /// Snapshot of one active transfer.
    pub async fn transfer(&self, file_id: &str) -> Option<Transfer> {
        self.shared
            .active
            .lock()
            .await
            .get(file_id)
            .map(|entry| entry.transfer.clone())
    }

    /// Percentage done for one active transfer.
    pub async fn progress(&self, file_id: &str) -> Option<u8> {
        self.transfer(file_id).await.map(|t| t.progress())
    }

    /// Snapshot of every active transfer, oldest first.
    pub async fn active_transfers(&self) -> Vec<Transfer> {
        let mut transfers: Vec<Transfer> = self
            .shared
            .active
            .lock()
            .await
            .values()
            .map(|entry| entry.transfer.clone())
            .collect();
        transfers.sort_by_key(|t| t.started_at);
        transfers
    }

    /// Cancel all transfers and wait for sending tasks to end.
    pub async fn shutdown(&self) {
        self.halt();
        let (ids, handles): (Vec<String>, Vec<JoinHandle<()>>) = {
            let mut active = self.shared.active.lock().await;
            let mut handles = Vec::new();
            for entry in active.values_mut() {
                entry.cancelled.store(true, Ordering::SeqCst);
                handles.extend(entry.task.take());
            }
            (active.keys().cloned().collect(), handles)
        };

        crate::task::join_all(handles).await;

        for id in ids {
            self.shared
                .finish(&id, TransferState::Cancelled, Some("shutting down".to_string()))
                .await;
        }
    }

    async fn expect_pending(&self, file_id: &str, action: &'static str) -> Result<()> {
        let active = self.shared.active.lock().await;
        let entry = active
            .get(file_id)
            .ok_or_else(|| Error::TransferNotFound(file_id.to_string()))?;
        if entry.transfer.direction != TransferDirection::Incoming
            || entry.transfer.state != TransferState::Requested
        {
            return Err(Error::InvalidTransferState {
                file_id: file_id.to_string(),
                state: entry.transfer.state.to_string(),
                action,
            });
        }
        Ok(())
    }
}
