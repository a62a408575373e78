//! Framing codec for the Stash wire protocol
//!
//! Three frame shapes exist: a string (u16 BE length + UTF-8 bytes, used for
//! tags and text fields), fixed-width integers (u64/i32 BE), and raw payload
//! bytes whose length was announced by a preceding u64.
//!
//! The reader is unbuffered: it never pulls bytes off the socket beyond the
//! frame it is assembling. Every socket operation can be bounded by an idle
//! timeout so a stalled peer only ever holds its own connection.

use crate::error::ProtocolError;
use crate::protocol::MAX_STRING_LEN;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::{timeout, Duration};

type Result<T> = std::result::Result<T, ProtocolError>;

#[inline]
fn timeout_ms(d: Duration) -> u64 {
    d.as_millis() as u64
}

/// Reading half of a framed connection
pub struct FrameReader<R> {
    inner: R,
    idle: Option<Duration>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, idle: None }
    }

    /// Bound every individual read by `idle`
    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle = idle;
        self
    }

    async fn read_exact_timed(&mut self, buf: &mut [u8]) -> Result<()> {
        let idle = self.idle;
        let fut = self.inner.read_exact(buf);
        let res = match idle {
            Some(d) => match timeout(d, fut).await {
                Ok(r) => r,
                Err(_) => return Err(ProtocolError::TimedOut(timeout_ms(d))),
            },
            None => fut.await,
        };
        res.map(|_| ()).map_err(ProtocolError::from_read)
    }

    /// Read whatever is available, up to `buf.len()`. Zero means EOF.
    pub async fn read_some(&mut self, buf: &mut [u8]) -> Result<usize> {
        let idle = self.idle;
        let fut = self.inner.read(buf);
        match idle {
            Some(d) => match timeout(d, fut).await {
                Ok(r) => Ok(r?),
                Err(_) => Err(ProtocolError::TimedOut(timeout_ms(d))),
            },
            None => Ok(fut.await?),
        }
    }

    /// Read the next request tag.
    ///
    /// Returns `Ok(None)` when the peer closed the stream cleanly between
    /// requests, and `Truncated` when it closed after the tag had started.
    pub async fn read_tag(&mut self) -> Result<Option<String>> {
        let mut first = [0u8; 1];
        if self.read_some(&mut first).await? == 0 {
            return Ok(None);
        }
        let mut second = [0u8; 1];
        self.read_exact_timed(&mut second).await?;
        let len = u16::from_be_bytes([first[0], second[0]]) as usize;
        self.read_utf8(len).await.map(Some)
    }

    pub async fn read_string(&mut self) -> Result<String> {
        let mut hdr = [0u8; 2];
        self.read_exact_timed(&mut hdr).await?;
        let len = u16::from_be_bytes(hdr) as usize;
        self.read_utf8(len).await
    }

    async fn read_utf8(&mut self, len: usize) -> Result<String> {
        let mut body = vec![0u8; len];
        if len > 0 {
            self.read_exact_timed(&mut body).await?;
        }
        String::from_utf8(body)
            .map_err(|e| ProtocolError::Malformed(format!("string is not UTF-8: {}", e)))
    }

    pub async fn read_u64(&mut self) -> Result<u64> {
        let mut b = [0u8; 8];
        self.read_exact_timed(&mut b).await?;
        Ok(u64::from_be_bytes(b))
    }

    pub async fn read_i32(&mut self) -> Result<i32> {
        let mut b = [0u8; 4];
        self.read_exact_timed(&mut b).await?;
        Ok(i32::from_be_bytes(b))
    }

    /// Read exactly `buf.len()` raw bytes
    pub async fn read_bytes(&mut self, buf: &mut [u8]) -> Result<()> {
        self.read_exact_timed(buf).await
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

/// Writing half of a framed connection. Frames are buffered until `flush`.
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
    idle: Option<Duration>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::new(inner),
            idle: None,
        }
    }

    pub fn with_idle_timeout(mut self, idle: Option<Duration>) -> Self {
        self.idle = idle;
        self
    }

    async fn write_all_timed(&mut self, buf: &[u8]) -> Result<()> {
        let idle = self.idle;
        let fut = self.inner.write_all(buf);
        match idle {
            Some(d) => match timeout(d, fut).await {
                Ok(r) => Ok(r?),
                Err(_) => Err(ProtocolError::TimedOut(timeout_ms(d))),
            },
            None => Ok(fut.await?),
        }
    }

    pub async fn write_string(&mut self, s: &str) -> Result<()> {
        if s.len() > MAX_STRING_LEN {
            return Err(ProtocolError::Malformed(format!(
                "string too long: {} bytes (max: {})",
                s.len(),
                MAX_STRING_LEN
            )));
        }
        let mut frame = Vec::with_capacity(2 + s.len());
        frame.extend_from_slice(&(s.len() as u16).to_be_bytes());
        frame.extend_from_slice(s.as_bytes());
        self.write_all_timed(&frame).await
    }

    /// Tags share the string encoding
    pub async fn write_tag(&mut self, tag: &str) -> Result<()> {
        self.write_string(tag).await
    }

    pub async fn write_u64(&mut self, v: u64) -> Result<()> {
        self.write_all_timed(&v.to_be_bytes()).await
    }

    pub async fn write_i32(&mut self, v: i32) -> Result<()> {
        self.write_all_timed(&v.to_be_bytes()).await
    }

    /// Raw payload bytes, no framing
    pub async fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all_timed(bytes).await
    }

    pub async fn flush(&mut self) -> Result<()> {
        let idle = self.idle;
        let fut = self.inner.flush();
        match idle {
            Some(d) => match timeout(d, fut).await {
                Ok(r) => Ok(r?),
                Err(_) => Err(ProtocolError::TimedOut(timeout_ms(d))),
            },
            None => Ok(fut.await?),
        }
    }

    /// Flush and close the write side
    pub async fn shutdown(&mut self) -> Result<()> {
        self.flush().await?;
        Ok(self.inner.shutdown().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_string_and_integers_over_duplex() {
        let (a, b) = duplex(1024);
        let mut w = FrameWriter::new(a);
        let mut r = FrameReader::new(b);

        w.write_tag("ADD_USER").await.unwrap();
        w.write_string("alice").await.unwrap();
        w.write_string("").await.unwrap();
        w.write_u64(u64::MAX - 7).await.unwrap();
        w.write_i32(-3).await.unwrap();
        w.flush().await.unwrap();

        assert_eq!(r.read_tag().await.unwrap().as_deref(), Some("ADD_USER"));
        assert_eq!(r.read_string().await.unwrap(), "alice");
        assert_eq!(r.read_string().await.unwrap(), "");
        assert_eq!(r.read_u64().await.unwrap(), u64::MAX - 7);
        assert_eq!(r.read_i32().await.unwrap(), -3);
    }

    #[tokio::test]
    async fn test_wire_layout_is_big_endian() {
        let (a, mut b) = duplex(64);
        let mut w = FrameWriter::new(a);
        w.write_string("OK").await.unwrap();
        w.write_u64(1).await.unwrap();
        w.flush().await.unwrap();
        drop(w);

        let mut raw = Vec::new();
        b.read_to_end(&mut raw).await.unwrap();
        assert_eq!(raw, vec![0, 2, b'O', b'K', 0, 0, 0, 0, 0, 0, 0, 1]);
    }

    #[tokio::test]
    async fn test_clean_eof_before_tag() {
        let (a, b) = duplex(64);
        drop(a);
        let mut r = FrameReader::new(b);
        assert!(r.read_tag().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_tag() {
        let (mut a, b) = duplex(64);
        // Declares 10 bytes, sends 3
        a.write_all(&[0, 10, b'A', b'D', b'D']).await.unwrap();
        drop(a);
        let mut r = FrameReader::new(b);
        assert!(matches!(r.read_tag().await, Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let (mut a, b) = duplex(64);
        a.write_all(&[0]).await.unwrap();
        drop(a);
        let mut r = FrameReader::new(b);
        assert!(matches!(r.read_tag().await, Err(ProtocolError::Truncated)));
    }

    #[tokio::test]
    async fn test_invalid_utf8_is_malformed() {
        let (mut a, b) = duplex(64);
        a.write_all(&[0, 2, 0xff, 0xfe]).await.unwrap();
        drop(a);
        let mut r = FrameReader::new(b);
        assert!(matches!(r.read_string().await, Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_oversized_string_rejected_before_write() {
        let (a, _b) = duplex(64);
        let mut w = FrameWriter::new(a);
        let big = "x".repeat(MAX_STRING_LEN + 1);
        assert!(matches!(w.write_string(&big).await, Err(ProtocolError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (_a, b) = duplex(64);
        let mut r = FrameReader::new(b).with_idle_timeout(Some(Duration::from_millis(20)));
        assert!(matches!(r.read_tag().await, Err(ProtocolError::TimedOut(20))));
    }
}
