//! Lanlink wire protocol implementation.
//!
//! Every channel carries the same binary [`Envelope`]. UDP discovery sends
//! one serialized envelope per datagram; the TCP transport wraps each
//! envelope in a length-prefixed frame.
//!
//! ## Frame Format
//!
//! ```text
//! ┌────────────────────┬──────────────────────────────────────┐
//! │       Length       │         Serialized Envelope          │
//! │  4 bytes (LE u32)  │           (Length bytes)             │
//! └────────────────────┴──────────────────────────────────────┘
//! ```
//!
//! A length of zero or above the configured maximum is a protocol violation
//! and the connection carrying it is closed.

mod envelope;

pub use envelope::{deserialize, serialize, Envelope, MessageKind};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Size of the frame length prefix in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Check a frame length against the protocol bounds `(0, max]`.
///
/// # Errors
///
/// Returns [`Error::Protocol`] for an empty frame and
/// [`Error::MessageTooLarge`] above `max`.
pub fn check_frame_len(len: usize, max: usize) -> Result<()> {
    if len == 0 {
        return Err(Error::Protocol("zero-length frame".to_string()));
    }
    if len > max {
        return Err(Error::MessageTooLarge { size: len, max });
    }
    Ok(())
}

/// Read one frame payload from a stream.
///
/// # Errors
///
/// Returns an error if reading fails or the length prefix is out of bounds.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LENGTH_PREFIX_SIZE];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;

    check_frame_len(len, max_len)?;

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame to a stream and flush it.
///
/// # Errors
///
/// Returns an error if the payload is out of bounds or writing fails.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8], max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    check_frame_len(payload.len(), max_len)?;
    let len = u32::try_from(payload.len()).map_err(|_| Error::MessageTooLarge {
        size: payload.len(),
        max: max_len,
    })?;

    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

/// Read and decode one envelope.
///
/// # Errors
///
/// Returns an error if the frame is invalid or the envelope does not decode.
pub async fn read_envelope<R>(reader: &mut R, max_len: usize) -> Result<Envelope>
where
    R: AsyncRead + Unpin,
{
    let payload = read_frame(reader, max_len).await?;
    deserialize(&payload)
}

/// Encode and write one envelope.
///
/// # Errors
///
/// Returns an error if the envelope is invalid, too large, or writing fails.
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope, max_len: usize) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let payload = serialize(envelope)?;
    write_frame(writer, &payload, max_len).await
}
