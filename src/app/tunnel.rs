//! Common-mode dispatch
//!
//! The ingress side accepts flows on the target listener, pairs each with a
//! pool connection, and announces the pairing over the control channel. The
//! peer side reacts to those announcements by resolving the paired
//! connection and dialing the real target. UDP flows keep per-source
//! session state; datagrams cross the tunnel as length-prefixed frames.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::ReadHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tracing::{debug, error, info, warn};

use crate::common::relay::{data_exchange, read_udp_frame, write_udp_frame};
use crate::common::stream::{IntoStream, StatStream, Stream};
use crate::config::{
    CONTEXT_CHECK_INTERVAL, POOL_GET_TIMEOUT, TCP_DIAL_TIMEOUT, UDP_READ_TIMEOUT,
};
use crate::pool::TransportPool;
use crate::protocol::{detect_block, send_proxy_v1};
use crate::signal::{Signal, ACTION_TCP, ACTION_UDP};

use super::endpoint::{Endpoint, UdpSessionConn};

/// Ingress entry point: wait for the pool (and the fingerprint verification
/// under TLS code 1), then run the accept loops.
pub async fn tunnel_loop(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    tcp_listener: Option<TcpListener>,
    udp_socket: Option<Arc<UdpSocket>>,
) {
    let cancel = endpoint.cancel_token();
    while !pool.ready() {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(CONTEXT_CHECK_INTERVAL).await;
    }

    if endpoint.state.read().tls_code == 1 {
        let notify = endpoint.verify_notify();
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = notify.notified() => {}
        }
    }

    if let Some(listener) = tcp_listener {
        let endpoint = Arc::clone(&endpoint);
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { tunnel_tcp_loop(endpoint, pool, listener).await });
    }
    if let Some(socket) = udp_socket {
        tokio::spawn(async move { tunnel_udp_loop(endpoint, pool, socket).await });
    }
}

/// Accept TCP flows on the target listener and hand each to a flow task.
pub async fn tunnel_tcp_loop(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    listener: TcpListener,
) {
    let cancel = endpoint.cancel_token();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                let _ = conn.set_nodelay(true);
                debug!("Target connection: {:?} <-> {}", conn.local_addr(), peer);
                let endpoint = Arc::clone(&endpoint);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move { ingress_tcp_flow(endpoint, pool, conn, peer).await });
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return;
                }
                error!("Target accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
                }
            }
        }
    }
}

async fn ingress_tcp_flow(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    conn: TcpStream,
    peer: SocketAddr,
) {
    let local_addr = match conn.local_addr() {
        Ok(addr) => addr,
        Err(_) => return,
    };

    let Some(_slot) = endpoint.slots.try_acquire_guard(false) else {
        error!(
            "TCP slot limit reached: {}/{}",
            endpoint.slots.tcp(),
            endpoint.slots.limit()
        );
        return;
    };

    let stream: Stream =
        StatStream::new(conn.into_stream(), Arc::clone(&endpoint.traffic), false).into_stream();
    let (blocked, stream) = detect_block(stream, endpoint.block).await;
    if let Some(protocol) = blocked {
        warn!("Blocked {} protocol from {}", protocol, peer);
        return;
    }

    let pool_conn = match pool.incoming_get(*POOL_GET_TIMEOUT).await {
        Ok(pool_conn) => pool_conn,
        Err(e) => {
            warn!("Pool reserve timeout: {}", e);
            return;
        }
    };
    let id = pool_conn.id.clone();
    debug!("Tunnel connection: get {} <- pool active {}", id, pool.active());

    endpoint.emit_signal(&Signal::launch(ACTION_TCP, &id, &peer.to_string()));
    debug!("TCP launch signal: cid {} -> control", id);

    let mut pool_stream = pool_conn.stream;
    if let Err(e) = send_proxy_v1(
        &mut pool_stream,
        endpoint.config.proxy_protocol,
        &peer.to_string(),
        local_addr,
    )
    .await
    {
        error!("PROXY v1 send failed: {}", e);
        return;
    }

    info!("Starting exchange: {} <-> {}", peer, id);
    let (sent, received) = data_exchange(
        stream,
        pool_stream,
        endpoint.config.read_timeout,
        &endpoint.tcp_buffers,
        endpoint.limiter.clone(),
    )
    .await;
    info!("Exchange complete: {} bytes sent, {} bytes received", sent, received);
    debug!("Tunnel connection: closed {}", id);
}

/// Demultiplex datagrams on the target UDP socket into per-source sessions,
/// each paired with one pool connection.
pub async fn tunnel_udp_loop(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    socket: Arc<UdpSocket>,
) {
    let cancel = endpoint.cancel_token();
    loop {
        let mut buf = endpoint.udp_buffers.get();
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                endpoint.udp_buffers.put(buf);
                return;
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, client_addr) = match received {
            Ok(received) => received,
            Err(e) => {
                endpoint.udp_buffers.put(buf);
                if cancel.is_cancelled() {
                    return;
                }
                error!("Target datagram receive failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
                }
                continue;
            }
        };
        endpoint.traffic.udp_rx.fetch_add(n as u64, Ordering::Relaxed);
        if let Some(limiter) = &endpoint.limiter {
            limiter.throttle(n).await;
        }

        let session_key = client_addr.to_string();
        let writer = match endpoint.get_udp_session(&session_key) {
            Some(UdpSessionConn::Tunnel(writer)) => {
                debug!("Using UDP session: {}", session_key);
                writer
            }
            _ => {
                if !endpoint.slots.try_acquire(true) {
                    error!(
                        "UDP slot limit reached: {}/{}",
                        endpoint.slots.udp(),
                        endpoint.slots.limit()
                    );
                    endpoint.udp_buffers.put(buf);
                    continue;
                }
                let pool_conn = match pool.incoming_get(*POOL_GET_TIMEOUT).await {
                    Ok(pool_conn) => pool_conn,
                    Err(e) => {
                        warn!("Pool reserve timeout: {}", e);
                        endpoint.slots.release(true);
                        endpoint.udp_buffers.put(buf);
                        continue;
                    }
                };
                let id = pool_conn.id.clone();
                debug!("Tunnel connection: get {} <- pool active {}", id, pool.active());

                let (read_half, write_half) = tokio::io::split(pool_conn.stream);
                let writer = Arc::new(tokio::sync::Mutex::new(write_half));
                endpoint.insert_udp_session(session_key.clone(), UdpSessionConn::Tunnel(Arc::clone(&writer)));

                {
                    let endpoint = Arc::clone(&endpoint);
                    let socket = Arc::clone(&socket);
                    let session_key = session_key.clone();
                    tokio::spawn(async move {
                        udp_session_return_pump(endpoint, socket, read_half, client_addr, session_key, id)
                            .await;
                    });
                }

                endpoint.emit_signal(&Signal::launch(ACTION_UDP, &pool_conn.id, &session_key));
                debug!("UDP launch signal: cid {} -> control", pool_conn.id);
                writer
            }
        };

        let mut write_half = writer.lock().await;
        if let Err(e) = write_udp_frame(&mut *write_half, &buf[..n]).await {
            error!("Datagram write to tunnel failed: {}", e);
            drop(write_half);
            endpoint.remove_udp_session(&session_key);
        }
        endpoint.udp_buffers.put(buf);
    }
}

/// Per-session reader: length-prefixed frames from the tunnel become
/// datagrams back to the flow source. Ends on idle timeout or error, which
/// reaps the session.
async fn udp_session_return_pump(
    endpoint: Arc<Endpoint>,
    socket: Arc<UdpSocket>,
    mut read_half: ReadHalf<Stream>,
    client_addr: SocketAddr,
    session_key: String,
    id: String,
) {
    let cancel = endpoint.cancel_token();
    let mut buf = endpoint.udp_buffers.get();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match read_udp_frame(&mut read_half, &mut buf, *UDP_READ_TIMEOUT).await {
            Ok(n) => {
                if let Some(limiter) = &endpoint.limiter {
                    limiter.throttle(n).await;
                }
                match socket.send_to(&buf[..n], client_addr).await {
                    Ok(sent) => {
                        endpoint
                            .traffic
                            .udp_tx
                            .fetch_add(sent as u64, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!("Datagram send to {} failed: {}", client_addr, e);
                        break;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                debug!("UDP session abort: {}", e);
                break;
            }
            Err(e) => {
                if e.kind() != std::io::ErrorKind::UnexpectedEof {
                    error!("Frame read from tunnel failed: {}", e);
                }
                break;
            }
        }
    }

    endpoint.remove_udp_session(&session_key);
    endpoint.slots.release(true);
    endpoint.udp_buffers.put(buf);
    debug!("Tunnel connection: closed {}", id);
}

/// Peer-side reaction to a `tcp` signal: resolve the paired pool
/// connection, dial the target with rotation, splice.
pub async fn tunnel_tcp_once(endpoint: Arc<Endpoint>, pool: Arc<dyn TransportPool>, received: Signal) {
    let id = received.id;
    debug!("TCP launch signal: cid {} <- control", id);

    let pool_conn = match pool.outgoing_get(&id, *POOL_GET_TIMEOUT).await {
        Ok(pool_conn) => pool_conn,
        Err(e) => {
            error!("Pool resolve timeout: {}", e);
            pool.add_error();
            return;
        }
    };
    debug!("Tunnel connection: get {} <- pool active {}", id, pool.active());

    let Some(_slot) = endpoint.slots.try_acquire_guard(false) else {
        error!(
            "TCP slot limit reached: {}/{}",
            endpoint.slots.tcp(),
            endpoint.slots.limit()
        );
        return;
    };

    let target = match endpoint.targets.dial_tcp(*TCP_DIAL_TIMEOUT).await {
        Ok(target) => target,
        Err(e) => {
            error!("Target dial failed: {}", e);
            return;
        }
    };
    debug!("Target connection: {:?} <-> {:?}", target.local_addr(), target.peer_addr());
    let target: Stream =
        StatStream::new(target.into_stream(), Arc::clone(&endpoint.traffic), false).into_stream();

    info!("Starting exchange: {} <-> target", id);
    let (sent, received_bytes) = data_exchange(
        pool_conn.stream,
        target,
        endpoint.config.read_timeout,
        &endpoint.tcp_buffers,
        endpoint.limiter.clone(),
    )
    .await;
    info!(
        "Exchange complete: {} bytes sent, {} bytes received",
        sent, received_bytes
    );
    debug!("Tunnel connection: closed {}", id);
}

/// Peer-side reaction to a `udp` signal: resolve the paired pool
/// connection, dial or reuse the per-source target socket, and pump frames
/// both ways until idle.
pub async fn tunnel_udp_once(endpoint: Arc<Endpoint>, pool: Arc<dyn TransportPool>, received: Signal) {
    let id = received.id;
    debug!("UDP launch signal: cid {} <- control", id);

    let pool_conn = match pool.outgoing_get(&id, *POOL_GET_TIMEOUT).await {
        Ok(pool_conn) => pool_conn,
        Err(e) => {
            error!("Pool resolve timeout: {}", e);
            pool.add_error();
            return;
        }
    };
    debug!("Tunnel connection: get {} <- pool active {}", id, pool.active());

    let session_key = received.remote;
    let (socket, is_new_session) = match endpoint.get_udp_session(&session_key) {
        Some(UdpSessionConn::Socket(socket)) => {
            debug!("Using UDP session: {}", session_key);
            (socket, false)
        }
        _ => {
            if !endpoint.slots.try_acquire(true) {
                error!(
                    "UDP slot limit reached: {}/{}",
                    endpoint.slots.udp(),
                    endpoint.slots.limit()
                );
                return;
            }
            let socket = match endpoint.targets.dial_udp().await {
                Ok(socket) => Arc::new(socket),
                Err(e) => {
                    error!("Target dial failed: {}", e);
                    endpoint.slots.release(true);
                    return;
                }
            };
            debug!("Target connection: {:?} <-> {:?}", socket.local_addr(), socket.peer_addr());
            endpoint.insert_udp_session(session_key.clone(), UdpSessionConn::Socket(Arc::clone(&socket)));
            (socket, true)
        }
    };

    let (mut tunnel_read, mut tunnel_write) = tokio::io::split(pool_conn.stream);
    let cancel = endpoint.cancel_token();

    let to_target = {
        let endpoint = Arc::clone(&endpoint);
        let socket = Arc::clone(&socket);
        async move {
            let mut buf = endpoint.udp_buffers.get();
            loop {
                match read_udp_frame(&mut tunnel_read, &mut buf, *UDP_READ_TIMEOUT).await {
                    Ok(n) => {
                        if let Some(limiter) = &endpoint.limiter {
                            limiter.throttle(n).await;
                        }
                        match socket.send(&buf[..n]).await {
                            Ok(sent) => {
                                endpoint
                                    .traffic
                                    .udp_tx
                                    .fetch_add(sent as u64, Ordering::Relaxed);
                            }
                            Err(e) => {
                                error!("Datagram send to target failed: {}", e);
                                break;
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                        debug!("UDP session abort: {}", e);
                        break;
                    }
                    Err(e) => {
                        if e.kind() != std::io::ErrorKind::UnexpectedEof {
                            error!("Frame read from tunnel failed: {}", e);
                        }
                        break;
                    }
                }
            }
            endpoint.udp_buffers.put(buf);
        }
    };

    let to_tunnel = {
        let endpoint = Arc::clone(&endpoint);
        let socket = Arc::clone(&socket);
        async move {
            let mut buf = endpoint.udp_buffers.get();
            loop {
                let received = tokio::time::timeout(*UDP_READ_TIMEOUT, socket.recv(&mut buf)).await;
                match received {
                    Ok(Ok(n)) => {
                        endpoint.traffic.udp_rx.fetch_add(n as u64, Ordering::Relaxed);
                        if let Some(limiter) = &endpoint.limiter {
                            limiter.throttle(n).await;
                        }
                        if let Err(e) = write_udp_frame(&mut tunnel_write, &buf[..n]).await {
                            error!("Frame write to tunnel failed: {}", e);
                            break;
                        }
                    }
                    Ok(Err(e)) => {
                        error!("Datagram receive from target failed: {}", e);
                        break;
                    }
                    Err(_) => {
                        debug!("UDP session abort: idle timeout");
                        break;
                    }
                }
            }
            endpoint.udp_buffers.put(buf);
        }
    };

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = to_target => {}
        _ = to_tunnel => {}
    }

    if is_new_session {
        endpoint.remove_udp_session(&session_key);
        endpoint.slots.release(true);
    }
    debug!("Tunnel connection: closed {}", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::config::{normalize_url, TunnelConfig};
    use crate::dns::DnsCache;
    use crate::error::{Error, Result};
    use crate::pool::PoolConn;
    use url::Url;

    /// In-memory rendezvous standing in for a transport pool.
    struct StubPool {
        conns: Mutex<HashMap<String, PoolConn>>,
        errors: AtomicUsize,
    }

    impl StubPool {
        fn with_conn(id: &str, stream: Stream) -> Arc<Self> {
            let mut conns = HashMap::new();
            conns.insert(
                id.to_string(),
                PoolConn {
                    id: id.to_string(),
                    stream,
                    peer_fingerprint: None,
                },
            );
            Arc::new(Self {
                conns: Mutex::new(conns),
                errors: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TransportPool for StubPool {
        async fn incoming_get(&self, _timeout: Duration) -> Result<PoolConn> {
            let mut conns = self.conns.lock();
            let id = conns.keys().next().cloned().ok_or(Error::PoolClosed)?;
            Ok(conns.remove(&id).unwrap())
        }

        async fn outgoing_get(&self, id: &str, _timeout: Duration) -> Result<PoolConn> {
            self.conns
                .lock()
                .remove(id)
                .ok_or_else(|| Error::PoolTimeout(id.to_string()))
        }

        fn ready(&self) -> bool {
            true
        }

        fn active(&self) -> usize {
            self.conns.lock().len()
        }

        fn capacity(&self) -> usize {
            8
        }

        fn interval(&self) -> Duration {
            Duration::from_millis(100)
        }

        async fn flush(&self) {
            self.conns.lock().clear();
        }

        fn add_error(&self) {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        fn error_count(&self) -> usize {
            self.errors.load(Ordering::Relaxed)
        }

        fn reset_error(&self) {
            self.errors.store(0, Ordering::Relaxed);
        }

        fn close(&self) {}
    }

    async fn test_endpoint(raw_url: &str) -> Arc<Endpoint> {
        let url = Url::parse(&normalize_url(raw_url)).unwrap();
        let mut config = TunnelConfig::parse(&url).unwrap();
        let cache = Arc::new(DnsCache::new(config.dns_ttl));
        config.resolve_addresses(&cache).await.unwrap();
        let endpoint = Endpoint::new(config, cache, 0, None);
        endpoint.init_run();
        endpoint
    }

    #[tokio::test]
    async fn test_tcp_signal_launches_flow_to_target() {
        // Echo target the peer side must dial.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            loop {
                match conn.read(&mut buf).await {
                    Ok(0) | Err(_) => return,
                    Ok(n) => {
                        if conn.write_all(&buf[..n]).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let endpoint = test_endpoint(&format!(
            "client://k@127.0.0.1:14500/{}?mode=2",
            target_addr
        ))
        .await;

        // The tunnel side of the paired pool connection stays with the test.
        let (mut tunnel_side, pool_side) = tokio::io::duplex(4096);
        let pool = StubPool::with_conn("ab12cd34", pool_side.into_stream());
        let pool_dyn: Arc<dyn TransportPool> = Arc::clone(&pool) as Arc<dyn TransportPool>;

        let received = Signal::launch(ACTION_TCP, "ab12cd34", "10.0.0.1:1234");
        tokio::spawn(tunnel_tcp_once(Arc::clone(&endpoint), pool_dyn, received));

        tunnel_side.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), tunnel_side.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"hello");
        // The flow's bytes went through the TCP traffic counters.
        assert!(endpoint.traffic.tcp_rx.load(Ordering::Relaxed) >= 5);
        assert!(endpoint.traffic.tcp_tx.load(Ordering::Relaxed) >= 5);
    }

    #[tokio::test]
    async fn test_tcp_signal_with_unknown_id_counts_error() {
        let endpoint = test_endpoint("client://k@127.0.0.1:14501/127.0.0.1:1?mode=2").await;
        let (_tunnel_side, pool_side) = tokio::io::duplex(64);
        let pool = StubPool::with_conn("ab12cd34", pool_side.into_stream());
        let pool_dyn: Arc<dyn TransportPool> = Arc::clone(&pool) as Arc<dyn TransportPool>;

        let received = Signal::launch(ACTION_TCP, "ffffffff", "10.0.0.1:1234");
        tunnel_tcp_once(Arc::clone(&endpoint), pool_dyn, received).await;
        assert_eq!(pool.error_count(), 1);
    }
}
