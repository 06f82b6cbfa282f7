//! Stream abstraction
//!
//! All layers operate on one boxed duplex type, whether the underlying
//! connection is plain TCP or TLS. Wrappers add byte accounting and
//! peeked-prefix replay without changing the surface.

use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::resource::Traffic;

/// The core stream type used throughout the tunnel runtime.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}

/// Trait for types that can be converted into a Stream
pub trait IntoStream {
    fn into_stream(self) -> Stream;
}

impl<T> IntoStream for T
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn into_stream(self) -> Stream {
        Box::new(self)
    }
}

/// Counts bytes through the endpoint traffic counters: reads add to rx,
/// writes add to tx, on the TCP or UDP pair depending on the flow.
pub struct StatStream {
    inner: Stream,
    traffic: Arc<Traffic>,
    udp: bool,
}

impl StatStream {
    pub fn new(inner: Stream, traffic: Arc<Traffic>, udp: bool) -> Self {
        Self {
            inner,
            traffic,
            udp,
        }
    }
}

impl AsyncRead for StatStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let result = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = result {
            let n = (buf.filled().len() - before) as u64;
            let counter = if self.udp {
                &self.traffic.udp_rx
            } else {
                &self.traffic.tcp_rx
            };
            counter.fetch_add(n, Ordering::Relaxed);
        }
        result
    }
}

impl AsyncWrite for StatStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        let result = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = result {
            let counter = if self.udp {
                &self.traffic.udp_tx
            } else {
                &self.traffic.tcp_tx
            };
            counter.fetch_add(n as u64, Ordering::Relaxed);
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Replays previously peeked bytes before reading from the inner stream.
/// Used by protocol detection so the inspected prefix still reaches the
/// destination.
pub struct PrefixedStream {
    prefix: Vec<u8>,
    pos: usize,
    inner: Stream,
}

impl PrefixedStream {
    pub fn new(prefix: Vec<u8>, inner: Stream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for PrefixedStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = self.prefix.len() - self.pos;
            let n = remaining.min(buf.remaining());
            let start = self.pos;
            buf.put_slice(&self.prefix[start..start + n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_stat_stream_counts() {
        let (client, mut server) = tokio::io::duplex(1024);
        let traffic = Arc::new(Traffic::new());
        let mut counted = StatStream::new(client.into_stream(), Arc::clone(&traffic), false);

        counted.write_all(b"hello").await.unwrap();
        counted.flush().await.unwrap();
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        server.write_all(b"ok").await.unwrap();
        let mut buf = [0u8; 2];
        counted.read_exact(&mut buf).await.unwrap();

        assert_eq!(traffic.tcp_tx.load(Ordering::Relaxed), 5);
        assert_eq!(traffic.tcp_rx.load(Ordering::Relaxed), 2);
        assert_eq!(traffic.udp_rx.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_prefixed_stream_replays() {
        let (client, mut server) = tokio::io::duplex(1024);
        server.write_all(b" world").await.unwrap();

        let mut stream = PrefixedStream::new(b"hello".to_vec(), client.into_stream());
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello world");
    }
}
