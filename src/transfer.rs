//! File byte streaming in both directions
//!
//! Outgoing: u64 length, then the file's bytes in `CHUNK_SIZE` pieces with no
//! further framing. Incoming: exactly the declared number of bytes, buffered
//! in memory. A stream that ends before the declared length is an error, not
//! a short success.

use crate::codec::{FrameReader, FrameWriter};
use crate::error::TransferError;
use crate::protocol::CHUNK_SIZE;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::debug;

/// State of one in-flight upload
#[derive(Debug)]
pub struct TransferSession {
    declared: u64,
    remaining: u64,
    buf: Vec<u8>,
}

impl TransferSession {
    pub fn new(declared: u64, limit: u64) -> Result<Self, TransferError> {
        if declared > limit {
            return Err(TransferError::TooLarge { declared, limit });
        }
        // Grow as bytes arrive rather than trusting the declared size up front
        let initial = declared.min(CHUNK_SIZE as u64 * 16) as usize;
        Ok(Self {
            declared,
            remaining: declared,
            buf: Vec::with_capacity(initial),
        })
    }

    pub fn declared(&self) -> u64 {
        self.declared
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn received(&self) -> u64 {
        self.declared - self.remaining
    }

    fn next_read_len(&self) -> usize {
        self.remaining.min(CHUNK_SIZE as u64) as usize
    }

    fn accept(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
        self.remaining -= chunk.len() as u64;
    }

    fn finish(self) -> Result<Vec<u8>, TransferError> {
        if self.remaining != 0 {
            return Err(TransferError::ShortRead {
                expected: self.declared,
                received: self.received(),
            });
        }
        Ok(self.buf)
    }
}

/// Receive exactly `declared` bytes from the connection
pub async fn receive<R>(
    reader: &mut FrameReader<R>,
    declared: u64,
    limit: u64,
) -> Result<Vec<u8>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut session = TransferSession::new(declared, limit)?;
    let mut chunk = vec![0u8; CHUNK_SIZE];
    while session.remaining() > 0 {
        let want = session.next_read_len();
        let n = reader.read_some(&mut chunk[..want]).await?;
        if n == 0 {
            break;
        }
        session.accept(&chunk[..n]);
    }
    debug!(declared, received = session.received(), "receive finished");
    session.finish()
}

/// Send the file at `path`: u64 length, then raw bytes. Returns bytes sent.
pub async fn send<W>(writer: &mut FrameWriter<W>, path: &Path) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|source| TransferError::File {
            path: PathBuf::from(path),
            source,
        })?;
    send_file(writer, file, path).await
}

/// Same as [`send`] for a file the caller already opened
pub async fn send_file<W>(
    writer: &mut FrameWriter<W>,
    mut file: tokio::fs::File,
    path: &Path,
) -> Result<u64, TransferError>
where
    W: AsyncWrite + Unpin,
{
    let file_err = |source| TransferError::File {
        path: PathBuf::from(path),
        source,
    };
    let announced = file.metadata().await.map_err(file_err)?.len();
    writer.write_u64(announced).await?;

    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut sent: u64 = 0;
    while sent < announced {
        let want = (announced - sent).min(CHUNK_SIZE as u64) as usize;
        let n = file.read(&mut chunk[..want]).await.map_err(file_err)?;
        if n == 0 {
            break;
        }
        writer.write_bytes(&chunk[..n]).await?;
        sent += n as u64;
    }
    writer.flush().await?;

    // The length is already on the wire; a file that shrank cannot be patched up
    if sent != announced {
        return Err(TransferError::LengthMismatch { announced, sent });
    }
    debug!(path = %path.display(), bytes = sent, "send finished");
    Ok(sent)
}
