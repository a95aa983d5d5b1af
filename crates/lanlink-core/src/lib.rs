//! # Lanlink Core Library
//!
//! `lanlink-core` provides the peer-to-peer engine behind Lanlink: processes
//! on the same local network find each other without a server and exchange
//! text, images and files directly.
//!
//! ## Features
//!
//! - **Serverless discovery**: UDP broadcast presence with timeout-based eviction
//! - **Connection reuse**: one pooled TCP connection per peer, used in both directions
//! - **Compact wire format**: a single binary envelope shared by every channel
//! - **Chunked transfers**: request/accept handshake followed by streamed chunks
//!
//! ## Modules
//!
//! - [`config`] - Configuration management
//! - [`discovery`] - Peer discovery via UDP broadcast
//! - [`message`] - Chat records handed to the history collaborator
//! - [`node`] - Facade wiring discovery, transport and transfers together
//! - [`protocol`] - Wire envelope and stream framing
//! - [`transfer`] - File transfer protocol
//! - [`transport`] - Pooled, length-prefixed TCP message transport
//!
//! ## Example
//!
//! ```rust,ignore
//! use lanlink_core::{config::Config, node::Node};
//!
//! let mut config = Config::load()?;
//! config.ensure_identity();
//! let node = Node::start(&config).await?;
//! let mut events = node.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod discovery;
pub mod error;
pub mod message;
pub mod node;
pub mod protocol;
mod task;
pub mod transfer;
pub mod transport;

pub use error::{Error, Result, ValidationError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default discovery port (UDP)
pub const DEFAULT_DISCOVERY_PORT: u16 = 8888;

/// Default transport port (TCP)
pub const DEFAULT_TRANSPORT_PORT: u16 = 9999;

/// Default interval between discovery broadcasts, in milliseconds
pub const DEFAULT_BROADCAST_INTERVAL_MS: u64 = 5000;

/// Default time without traffic after which a peer is evicted, in milliseconds
pub const DEFAULT_PEER_TIMEOUT_MS: u64 = 15000;

/// Default maximum size of one framed transport message (20 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 20 * 1024 * 1024;

/// Default chunk size for file transfers (64 KiB)
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default pause between two file chunks, in milliseconds
pub const DEFAULT_CHUNK_DELAY_MS: u64 = 10;
