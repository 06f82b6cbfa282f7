//! Inbound protocol screening and PROXY v1
//!
//! Screening peeks at the first bytes of a freshly accepted TCP stream and
//! classifies SOCKS, HTTP, or TLS so configured protocols can be refused
//! before any byte reaches the tunnel. The peeked prefix is replayed for
//! flows that pass.

use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::common::stream::{PrefixedStream, Stream};
use crate::error::{Error, Result};

/// How many leading bytes the classifier may inspect.
const DETECT_PEEK_LEN: usize = 8;

/// Which protocols an endpoint refuses.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockList {
    pub socks: bool,
    pub http: bool,
    pub tls: bool,
}

impl BlockList {
    pub fn any(&self) -> bool {
        self.socks || self.http || self.tls
    }
}

/// Classify a peeked prefix. Returns the matched protocol tag only when
/// that protocol is on the block list.
pub fn detect_protocol(prefix: &[u8], block: BlockList) -> Option<&'static str> {
    if prefix.is_empty() {
        return None;
    }

    if block.socks && prefix.len() >= 2 {
        if prefix[0] == 0x04 && (prefix[1] == 0x01 || prefix[1] == 0x02) {
            return Some("SOCKS4");
        }
        if prefix[0] == 0x05 && (0x01..=0x03).contains(&prefix[1]) {
            return Some("SOCKS5");
        }
    }

    if block.http && prefix.len() >= 4 && prefix[0].is_ascii_uppercase() {
        for (i, &b) in prefix[1..].iter().enumerate() {
            if b == b' ' {
                return Some("HTTP");
            }
            if !b.is_ascii_uppercase() || i >= DETECT_PEEK_LEN - 1 {
                break;
            }
        }
    }

    if block.tls && prefix[0] == 0x16 {
        return Some("TLS");
    }

    None
}

/// Peek the stream head and run the classifier. The full window is
/// buffered before classifying, so a fragmented greeting cannot slip a
/// blocked protocol past the short-prefix guards; EOF or error classifies
/// whatever arrived. The returned stream replays everything consumed, so
/// callers can forward it untouched when no block matches.
pub async fn detect_block(stream: Stream, block: BlockList) -> (Option<&'static str>, Stream) {
    if !block.any() {
        return (None, stream);
    }

    let mut stream = stream;
    let mut prefix = Vec::with_capacity(DETECT_PEEK_LEN);
    let mut chunk = [0u8; DETECT_PEEK_LEN];
    while prefix.len() < DETECT_PEEK_LEN {
        let want = DETECT_PEEK_LEN - prefix.len();
        match stream.read(&mut chunk[..want]).await {
            Ok(0) | Err(_) => break,
            Ok(n) => prefix.extend_from_slice(&chunk[..n]),
        }
    }

    let detected = detect_protocol(&prefix, block);
    (detected, Box::new(PrefixedStream::new(prefix, stream)))
}

/// Format the PROXY protocol v1 line for a flow: the original client source
/// and the ingress address it connected to.
pub fn proxy_v1_header(client: SocketAddr, proxy: SocketAddr) -> Result<String> {
    let protocol = match (client, proxy) {
        (SocketAddr::V4(_), SocketAddr::V4(_)) => "TCP4",
        (SocketAddr::V6(_), SocketAddr::V6(_)) => "TCP6",
        _ => {
            return Err(Error::Protocol(
                "unsupported IP protocol for PROXY v1".into(),
            ))
        }
    };
    Ok(format!(
        "PROXY {} {} {} {} {}\r\n",
        protocol,
        client.ip(),
        proxy.ip(),
        client.port(),
        proxy.port()
    ))
}

/// Write the PROXY v1 preamble for the flow when injection is enabled.
/// `client` is the address string carried by the accept path or signal.
pub async fn send_proxy_v1<W>(
    writer: &mut W,
    enabled: bool,
    client: &str,
    proxy: SocketAddr,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if !enabled {
        return Ok(());
    }
    let client: SocketAddr = client
        .parse()
        .map_err(|_| Error::Protocol(format!("invalid client address: {}", client)))?;
    let header = proxy_v1_header(client, proxy)?;
    writer.write_all(header.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::stream::IntoStream;
    use tokio::io::AsyncWriteExt;

    const BLOCK_ALL: BlockList = BlockList {
        socks: true,
        http: true,
        tls: true,
    };

    #[test]
    fn test_detect_socks() {
        assert_eq!(detect_protocol(&[0x04, 0x01, 0, 0], BLOCK_ALL), Some("SOCKS4"));
        assert_eq!(detect_protocol(&[0x05, 0x03, 0, 0], BLOCK_ALL), Some("SOCKS5"));
        assert_eq!(detect_protocol(&[0x05, 0x04, 0, 0], BLOCK_ALL), None);
        // Not blocked, not reported.
        let no_socks = BlockList {
            socks: false,
            ..BLOCK_ALL
        };
        assert_eq!(detect_protocol(&[0x04, 0x01, 0, 0], no_socks), None);
    }

    #[test]
    fn test_detect_http() {
        assert_eq!(detect_protocol(b"GET / HT", BLOCK_ALL), Some("HTTP"));
        assert_eq!(detect_protocol(b"POST /ab", BLOCK_ALL), Some("HTTP"));
        assert_eq!(detect_protocol(b"OPTIONS ", BLOCK_ALL), Some("HTTP"));
        // No space within the peek window, or lower-case noise.
        assert_eq!(detect_protocol(b"AAAAAAAA", BLOCK_ALL), None);
        assert_eq!(detect_protocol(b"Get / HT", BLOCK_ALL), None);
    }

    #[test]
    fn test_detect_tls() {
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x00], BLOCK_ALL), Some("TLS"));
        let no_tls = BlockList {
            tls: false,
            ..BLOCK_ALL
        };
        assert_eq!(detect_protocol(&[0x16, 0x03, 0x01, 0x00], no_tls), None);
    }

    #[tokio::test]
    async fn test_detect_block_replays_prefix() {
        let (client, mut remote) = tokio::io::duplex(64);
        remote.write_all(b"GET / HTTP/1.1\r\n").await.unwrap();

        let block = BlockList {
            tls: true,
            ..Default::default()
        };
        let (detected, mut stream) = detect_block(client.into_stream(), block).await;
        assert_eq!(detected, None);

        // The inspected bytes must still come out of the wrapped stream.
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"GET / HTTP/1.1\r\n");
    }

    #[tokio::test]
    async fn test_detect_block_waits_for_fragmented_greeting() {
        let (client, mut remote) = tokio::io::duplex(64);
        // One byte now, the rest of the ClientHello after a pause; the
        // screen must still see the whole window.
        remote.write_all(&[0x16]).await.unwrap();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
            remote
                .write_all(&[0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01])
                .await
                .unwrap();
            remote
        });

        let block = BlockList {
            tls: true,
            ..Default::default()
        };
        let (detected, _stream) = detect_block(client.into_stream(), block).await;
        assert_eq!(detected, Some("TLS"));
    }

    #[tokio::test]
    async fn test_detect_block_classifies_short_stream_on_eof() {
        let (client, mut remote) = tokio::io::duplex(64);
        remote.write_all(&[0x04, 0x01]).await.unwrap();
        drop(remote);

        let block = BlockList {
            socks: true,
            ..Default::default()
        };
        let (detected, _stream) = detect_block(client.into_stream(), block).await;
        assert_eq!(detected, Some("SOCKS4"));
    }

    #[tokio::test]
    async fn test_detect_block_flags_tls_hello() {
        let (client, mut remote) = tokio::io::duplex(64);
        remote.write_all(&[0x16, 0x03, 0x01, 0x02, 0x00, 0x01, 0x00, 0x01]).await.unwrap();

        let block = BlockList {
            tls: true,
            ..Default::default()
        };
        let (detected, _stream) = detect_block(client.into_stream(), block).await;
        assert_eq!(detected, Some("TLS"));
    }

    #[test]
    fn test_proxy_v1_header_exact() {
        let header = proxy_v1_header(
            "10.1.1.1:54321".parse().unwrap(),
            "203.0.113.5:5000".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(header, "PROXY TCP4 10.1.1.1 203.0.113.5 54321 5000\r\n");

        let header = proxy_v1_header(
            "[2001:db8::1]:1000".parse().unwrap(),
            "[2001:db8::2]:2000".parse().unwrap(),
        )
        .unwrap();
        assert_eq!(header, "PROXY TCP6 2001:db8::1 2001:db8::2 1000 2000\r\n");

        assert!(proxy_v1_header(
            "10.1.1.1:1".parse().unwrap(),
            "[::1]:2".parse().unwrap()
        )
        .is_err());
    }
}
