//! Tunnel handshake
//!
//! The server side runs a one-shot HTTPS exchange on the tunnel port: a
//! `GET /` carrying the bearer token is answered with the tunnel parameters
//! (flow direction, pool bound, TLS code, pool type). Everything else is
//! refused; in particular `CONNECT` gets 405 so the endpoint can never act
//! as an open proxy. The client side issues the `GET /` over TLS without
//! certificate verification, because trust is pinned by fingerprint later.

use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info, warn};

use crate::config::HANDSHAKE_TIMEOUT;
use crate::crypto::{
    insecure_client_config, new_ram_identity, sni_server_name, verify_auth_token,
    generate_auth_token,
};
use crate::error::{Error, Result};

use super::endpoint::Endpoint;

/// Serve the handshake on the tunnel listener until one authorized `GET /`
/// lands. Returns the client IP; the listener is dropped so the port can be
/// rebound for the pool.
pub async fn server_handshake(endpoint: &Arc<Endpoint>, listener: TcpListener) -> Result<String> {
    // The handshake itself always rides on TLS; TLS code 0 only downgrades
    // the pool connections that follow.
    let identity = match endpoint.state.read().tls.clone() {
        Some(identity) => identity,
        None => new_ram_identity()?,
    };
    info!(
        "TLS cert fingerprint for authorization: {}",
        identity.fingerprint()
    );
    let acceptor = TlsAcceptor::from(identity.config.clone());
    let cancel = endpoint.cancel_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                let served = tokio::time::timeout(
                    *HANDSHAKE_TIMEOUT,
                    serve_handshake_conn(endpoint, &acceptor, stream),
                )
                .await;
                match served {
                    Ok(Ok(true)) => {
                        let client_ip = peer.ip().to_string();
                        let mut state = endpoint.state.write();
                        state.client_ip = client_ip.clone();
                        // Fresh RAM cert for the pool so the verify signal
                        // proves more than the throwaway handshake cert.
                        if state.tls_code == 1 {
                            match new_ram_identity() {
                                Ok(identity) => {
                                    state.tls = Some(identity);
                                    info!("TLS code-1: RAM cert regenerated with TLS 1.3");
                                }
                                Err(e) => warn!("Failed to regenerate RAM cert: {}", e),
                            }
                        }
                        return Ok(client_ip);
                    }
                    Ok(Ok(false)) => continue,
                    Ok(Err(e)) => {
                        debug!("Handshake request from {} failed: {}", peer, e);
                        continue;
                    }
                    Err(_) => {
                        debug!("Handshake request from {} timed out", peer);
                        continue;
                    }
                }
            }
        }
    }
}

/// Handle one handshake connection. `Ok(true)` means the tunnel config was
/// delivered to an authorized peer.
async fn serve_handshake_conn(
    endpoint: &Arc<Endpoint>,
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<bool> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| Error::Handshake(format!("TLS accept failed: {}", e)))?;
    let mut reader = BufReader::new(tls_stream);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().unwrap_or("").to_string();
    let path = parts.next().unwrap_or("").to_string();

    let mut authorization = String::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        if n == 0 || line == "\r\n" || line == "\n" {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.eq_ignore_ascii_case("authorization") {
                authorization = value.trim().to_string();
            }
        }
    }

    let stream = reader.get_mut();
    match method.as_str() {
        "GET" => {
            if path != "/" {
                respond(stream, "404 Not Found", "").await?;
                return Ok(false);
            }
            let token = authorization.strip_prefix("Bearer ").unwrap_or("");
            if !verify_auth_token(token, &endpoint.config.tunnel_key) {
                respond(stream, "401 Unauthorized", "").await?;
                return Ok(false);
            }

            let (flow, max, tls_code, pool_type) = {
                let state = endpoint.state.read();
                (
                    state.data_flow,
                    state.max_pool_capacity,
                    state.tls_code,
                    state.pool_type,
                )
            };
            let body = serde_json::json!({
                "flow": flow.to_string(),
                "max": max,
                "tls": tls_code.to_string(),
                "type": pool_type.to_string(),
            })
            .to_string();
            respond(stream, "200 OK", &body).await?;
            info!(
                "Sending tunnel config: FLOW={}|MAX={}|TLS={}|TYPE={}",
                flow, max, tls_code, pool_type
            );
            Ok(true)
        }
        "CONNECT" => {
            // The original carried a latent pre-auth CONNECT proxy here;
            // refusing it keeps the handshake port from doubling as an open
            // proxy.
            debug!("CONNECT refused on handshake port: {}", path);
            respond(stream, "405 Method Not Allowed", "").await?;
            Ok(false)
        }
        _ => {
            respond(stream, "405 Method Not Allowed", "").await?;
            Ok(false)
        }
    }
}

async fn respond<W>(writer: &mut W, status: &str, body: &str) -> Result<()>
where
    W: AsyncWriteExt + Unpin,
{
    let content_type = if body.is_empty() {
        String::new()
    } else {
        "Content-Type: application/json\r\n".to_string()
    };
    let response = format!(
        "HTTP/1.1 {}\r\n{}Connection: close\r\nContent-Length: {}\r\n\r\n{}",
        status,
        content_type,
        body.len(),
        body
    );
    writer.write_all(response.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug, Deserialize)]
struct HandshakeReply {
    flow: String,
    max: usize,
    tls: String,
    #[serde(rename = "type")]
    pool_type: String,
}

/// Issue the handshake `GET /` and adopt the server's tunnel parameters
/// into the run state.
pub async fn client_handshake(endpoint: &Arc<Endpoint>) -> Result<()> {
    let addr = endpoint
        .cache
        .resolve_addr(&endpoint.config.tunnel_addr)
        .await?;

    let reply = tokio::time::timeout(*HANDSHAKE_TIMEOUT, async {
        let stream = endpoint.dialer.dial_tcp(addr, *HANDSHAKE_TIMEOUT).await?;
        let connector = TlsConnector::from(insecure_client_config());
        let host = endpoint.config.tunnel_addr.clone();
        let sni = sni_server_name(&endpoint.config.server_name, &host);
        let tls_stream = connector
            .connect(sni, stream)
            .await
            .map_err(|e| Error::Handshake(format!("TLS connect failed: {}", e)))?;

        let mut reader = BufReader::new(tls_stream);
        let request = format!(
            "GET / HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\nConnection: close\r\n\r\n",
            endpoint.config.server_name,
            generate_auth_token(&endpoint.config.tunnel_key)
        );
        reader.get_mut().write_all(request.as_bytes()).await?;
        reader.get_mut().flush().await?;

        let mut status_line = String::new();
        reader.read_line(&mut status_line).await?;
        let status = status_line.split_whitespace().nth(1).unwrap_or("");
        if status != "200" {
            return Err(Error::Handshake(format!("status {}", status)));
        }
        loop {
            let mut line = String::new();
            let n = reader.read_line(&mut line).await?;
            if n == 0 || line == "\r\n" || line == "\n" {
                break;
            }
        }

        let mut body = Vec::new();
        reader.read_to_end(&mut body).await?;
        serde_json::from_slice::<HandshakeReply>(&body)
            .map_err(|e| Error::Handshake(format!("config decode failed: {}", e)))
    })
    .await
    .map_err(|_| Error::Handshake("handshake timeout".into()))??;

    let mut state = endpoint.state.write();
    state.data_flow = if reply.flow == "+" { '+' } else { '-' };
    state.max_pool_capacity = reply.max;
    state.tls_code = reply.tls.parse().unwrap_or(0);
    state.pool_type = reply.pool_type.parse().unwrap_or(0);
    info!(
        "Loading tunnel config: FLOW={}|MAX={}|TLS={}|TYPE={}",
        state.data_flow, state.max_pool_capacity, state.tls_code, state.pool_type
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{normalize_url, TunnelConfig};
    use crate::dns::DnsCache;
    use url::Url;

    async fn test_endpoint(raw_url: &str, tls_code: u8) -> Arc<Endpoint> {
        let url = Url::parse(&normalize_url(raw_url)).unwrap();
        let mut config = TunnelConfig::parse(&url).unwrap();
        let cache = Arc::new(DnsCache::new(config.dns_ttl));
        config.resolve_addresses(&cache).await.unwrap();
        let identity = new_ram_identity().unwrap();
        Endpoint::new(config, cache, tls_code, Some(identity))
    }

    #[tokio::test]
    async fn test_handshake_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = test_endpoint(
            &format!("server://secret@127.0.0.1:{}/127.0.0.1:19001", port),
            1,
        )
        .await;
        {
            let mut state = server.state.write();
            state.data_flow = '-';
            state.run_mode = 1;
        }
        server.init_run();
        let server_clone = Arc::clone(&server);
        let serving =
            tokio::spawn(async move { server_handshake(&server_clone, listener).await });

        let client = test_endpoint(
            &format!("client://secret@127.0.0.1:{}/127.0.0.1:19001", port),
            0,
        )
        .await;
        client.init_run();
        client_handshake(&client).await.unwrap();

        let client_ip = serving.await.unwrap().unwrap();
        assert_eq!(client_ip, "127.0.0.1");

        let state = client.state.read();
        assert_eq!(state.data_flow, '-');
        assert_eq!(state.tls_code, 1);
        assert_eq!(state.pool_type, 0);
        assert_eq!(state.max_pool_capacity, 1024);
        assert_eq!(server.state.read().client_ip, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_handshake_rejects_bad_key() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = test_endpoint(
            &format!("server://secret@127.0.0.1:{}/127.0.0.1:19001", port),
            1,
        )
        .await;
        server.init_run();
        let server_clone = Arc::clone(&server);
        tokio::spawn(async move { server_handshake(&server_clone, listener).await });

        let client = test_endpoint(
            &format!("client://wrong@127.0.0.1:{}/127.0.0.1:19001", port),
            0,
        )
        .await;
        client.init_run();
        let err = client_handshake(&client).await.unwrap_err();
        assert!(matches!(err, Error::Handshake(_)));
    }
}
