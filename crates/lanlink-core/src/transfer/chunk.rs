//! Fixed-size chunking of file content.

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::Result;

/// Number of chunks needed for `file_size` bytes, `ceil(file_size / chunk_size)`.
///
/// A zero chunk size is treated as one byte per chunk.
pub fn chunk_count(file_size: u64, chunk_size: usize) -> u64 {
    let chunk_size = (chunk_size as u64).max(1);
    file_size.div_ceil(chunk_size)
}

/// One slice of file content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position in the file
    pub index: u64,
    /// Chunk bytes; every chunk but the last is exactly `chunk_size` long
    pub data: Vec<u8>,
}

/// Reads a stream as consecutive chunks of `chunk_size` bytes.
#[derive(Debug)]
pub struct ChunkReader<R> {
    reader: R,
    chunk_size: usize,
    next_index: u64,
    done: bool,
}

impl<R> ChunkReader<R>
where
    R: AsyncRead + Unpin,
{
    /// Wrap a reader.
    pub fn new(reader: R, chunk_size: usize) -> Self {
        Self {
            reader,
            chunk_size: chunk_size.max(1),
            next_index: 0,
            done: false,
        }
    }

    /// Index of the next chunk to be read.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Read the next chunk, or `None` at end of stream.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails.
    pub async fn next_chunk(&mut self) -> Result<Option<Chunk>> {
        if self.done {
            return Ok(None);
        }

        let mut data = vec![0u8; self.chunk_size];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.reader.read(&mut data[filled..]).await?;
            if n == 0 {
                self.done = true;
                break;
            }
            filled += n;
        }

        if filled == 0 {
            return Ok(None);
        }
        data.truncate(filled);

        let chunk = Chunk {
            index: self.next_index,
            data,
        };
        self.next_index += 1;
        Ok(Some(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    async fn collect(bytes: &[u8], chunk_size: usize) -> Vec<Chunk> {
        let mut reader = ChunkReader::new(bytes, chunk_size);
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            chunks.push(chunk);
        }
        chunks
    }

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, 64), 0);
        assert_eq!(chunk_count(1, 64), 1);
        assert_eq!(chunk_count(64, 64), 1);
        assert_eq!(chunk_count(65, 64), 2);
        assert_eq!(chunk_count(200_000, 65_536), 4);
        assert_eq!(chunk_count(10, 0), 10);
    }

    #[tokio::test]
    async fn test_chunks_reconstruct_input() {
        for size in [1usize, 100, 4096, 4097, 10_000] {
            let mut bytes = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut bytes);

            let chunks = collect(&bytes, 1000).await;
            assert_eq!(chunks.len() as u64, chunk_count(size as u64, 1000));

            let mut rebuilt = Vec::new();
            for (i, chunk) in chunks.iter().enumerate() {
                assert_eq!(chunk.index, i as u64);
                if i + 1 < chunks.len() {
                    assert_eq!(chunk.data.len(), 1000);
                }
                rebuilt.extend_from_slice(&chunk.data);
            }
            assert_eq!(rebuilt, bytes);
        }
    }

    #[tokio::test]
    async fn test_empty_input_has_no_chunks() {
        assert!(collect(&[], 16).await.is_empty());
    }

    #[tokio::test]
    async fn test_short_reads_still_fill_chunks() {
        let (mut tx, rx) = tokio::io::duplex(7);
        let writer = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            tx.write_all(&[9u8; 50]).await.unwrap();
        });

        let mut reader = ChunkReader::new(rx, 20);
        let mut sizes = Vec::new();
        while let Some(chunk) = reader.next_chunk().await.unwrap() {
            sizes.push(chunk.data.len());
        }
        writer.await.unwrap();

        assert_eq!(sizes, vec![20, 20, 10]);
        assert_eq!(reader.next_index(), 3);
    }
}
