//! Byte shuttling between paired connections
//!
//! `data_exchange` splices a flow's two streams in both directions with
//! pooled buffers, honoring the per-direction idle timeout and the shared
//! rate limiter. The UDP frame codec carries datagrams over the tunnel as
//! 2-byte big-endian length-prefixed records.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::resource::{BufferPool, RateLimiter};

use super::stream::Stream;

/// Largest payload a tunnel UDP frame can carry.
pub const MAX_UDP_FRAME: usize = 65535;

/// Bidirectional splice between two streams. Each direction copies through
/// one pooled buffer until EOF, error, or idle timeout (0 disables), then
/// shuts down its write side. Returns (a→b, b→a) byte totals.
pub async fn data_exchange(
    a: Stream,
    b: Stream,
    read_timeout: Duration,
    buffers: &BufferPool,
    limiter: Option<Arc<RateLimiter>>,
) -> (u64, u64) {
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);

    let forward = copy_half(
        &mut a_read,
        &mut b_write,
        read_timeout,
        buffers,
        limiter.clone(),
    );
    let backward = copy_half(&mut b_read, &mut a_write, read_timeout, buffers, limiter);

    tokio::join!(forward, backward)
}

async fn copy_half(
    reader: &mut ReadHalf<Stream>,
    writer: &mut WriteHalf<Stream>,
    read_timeout: Duration,
    buffers: &BufferPool,
    limiter: Option<Arc<RateLimiter>>,
) -> u64 {
    let mut buf = buffers.get();
    let mut total: u64 = 0;

    loop {
        let n = if read_timeout.is_zero() {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => n,
            }
        } else {
            match tokio::time::timeout(read_timeout, reader.read(&mut buf)).await {
                Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
                Ok(Ok(n)) => n,
            }
        };

        if let Some(limiter) = &limiter {
            limiter.throttle(n).await;
        }

        if writer.write_all(&buf[..n]).await.is_err() {
            break;
        }
        if writer.flush().await.is_err() {
            break;
        }
        total += n as u64;
    }

    let _ = writer.shutdown().await;
    buffers.put(buf);
    total
}

/// Write one datagram as a length-prefixed tunnel frame. Empty datagrams
/// are legal and travel as a bare zero header.
pub async fn write_udp_frame<W>(writer: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() > MAX_UDP_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("datagram too large: {}", payload.len()),
        ));
    }
    let header = (payload.len() as u16).to_be_bytes();
    writer.write_all(&header).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Read one tunnel frame into `buf`, returning the payload length. A
/// timeout > 0 bounds the wait for the next frame header.
pub async fn read_udp_frame<R>(
    reader: &mut R,
    buf: &mut [u8],
    timeout: Duration,
) -> io::Result<usize>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; 2];
    if timeout.is_zero() {
        reader.read_exact(&mut header).await?;
    } else {
        match tokio::time::timeout(timeout, reader.read_exact(&mut header)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "frame read timeout"));
            }
        }
    }

    let length = u16::from_be_bytes(header) as usize;
    if length == 0 {
        return Ok(0);
    }
    if length > buf.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("datagram too large: {} > buffer {}", length, buf.len()),
        ));
    }
    reader.read_exact(&mut buf[..length]).await?;
    Ok(length)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::stream::IntoStream;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_udp_frame_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(MAX_UDP_FRAME + 2);
        let mut buf = vec![0u8; MAX_UDP_FRAME];

        for payload in [&b""[..], b"ping", &vec![0xabu8; MAX_UDP_FRAME]] {
            write_udp_frame(&mut a, payload).await.unwrap();
            let n = read_udp_frame(&mut b, &mut buf, Duration::ZERO).await.unwrap();
            assert_eq!(&buf[..n], payload);
        }
    }

    #[tokio::test]
    async fn test_udp_frame_rejects_oversize() {
        let (mut a, _b) = tokio::io::duplex(64);
        let payload = vec![0u8; MAX_UDP_FRAME + 1];
        assert!(write_udp_frame(&mut a, &payload).await.is_err());
    }

    #[tokio::test]
    async fn test_udp_frame_read_timeout() {
        let (_a, mut b) = tokio::io::duplex(64);
        let mut buf = [0u8; 64];
        let err = read_udp_frame(&mut b, &mut buf, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_data_exchange_splices_both_ways() {
        let (a_local, mut a_remote) = tokio::io::duplex(1024);
        let (b_local, mut b_remote) = tokio::io::duplex(1024);

        let exchange = tokio::spawn(async move {
            data_exchange(
                a_local.into_stream(),
                b_local.into_stream(),
                Duration::ZERO,
                &BufferPool::new(1024),
                None,
            )
            .await
        });

        a_remote.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        b_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        b_remote.write_all(b"response").await.unwrap();
        let mut buf = [0u8; 8];
        a_remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(a_remote);
        drop(b_remote);
        let (forward, backward) = exchange.await.unwrap();
        assert_eq!(forward, 7);
        assert_eq!(backward, 8);
    }
}
