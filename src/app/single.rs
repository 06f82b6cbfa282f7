//! Single mode
//!
//! Degenerate topology: this endpoint both listens and dials, with no pool
//! and no signals. The accept/rotate/splice pipeline and the slot and
//! blocking discipline are the same as common mode; telemetry rides the
//! report ticker instead of the pong handler.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::common::relay::data_exchange;
use crate::common::stream::{IntoStream, StatStream, Stream};
use crate::config::{CONTEXT_CHECK_INTERVAL, REPORT_INTERVAL, TCP_DIAL_TIMEOUT, UDP_READ_TIMEOUT};
use crate::error::{Error, Result};
use crate::protocol::{detect_block, send_proxy_v1};

use super::endpoint::{Endpoint, UdpSessionConn};

/// Run the single-mode loops; the first to fail ends the run.
pub async fn single_control(
    endpoint: Arc<Endpoint>,
    tcp_listener: Option<TcpListener>,
    udp_socket: Option<Arc<UdpSocket>>,
) -> Result<()> {
    let cancel = endpoint.cancel_token();
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(3);

    if !endpoint.targets.is_empty() {
        let endpoint = Arc::clone(&endpoint);
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = single_event_loop(endpoint).await {
                let _ = err_tx.send(e).await;
            }
        });
    }
    if let Some(listener) = tcp_listener {
        let endpoint = Arc::clone(&endpoint);
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = single_tcp_loop(endpoint, listener).await {
                let _ = err_tx.send(e).await;
            }
        });
    }
    if let Some(socket) = udp_socket {
        let endpoint = Arc::clone(&endpoint);
        tokio::spawn(async move {
            if let Err(e) = single_udp_loop(endpoint, socket).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        err = err_rx.recv() => Err(err.unwrap_or(Error::ChannelClosed)),
    }
}

/// Telemetry tick: probe target latency and emit the CHECK_POINT line with
/// an empty pool.
async fn single_event_loop(endpoint: Arc<Endpoint>) -> Result<()> {
    let cancel = endpoint.cancel_token();
    let mut ticker = tokio::time::interval(*REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = ticker.tick() => {}
        }
        let ping = endpoint.targets.probe_best_target().await;
        endpoint.emit_checkpoint(ping.max(0) as u64, 0);
    }
}

async fn single_tcp_loop(endpoint: Arc<Endpoint>, listener: TcpListener) -> Result<()> {
    let cancel = endpoint.cancel_token();
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((conn, peer)) => {
                let _ = conn.set_nodelay(true);
                debug!("Tunnel connection: {:?} <-> {}", conn.local_addr(), peer);
                let endpoint = Arc::clone(&endpoint);
                tokio::spawn(async move { single_tcp_flow(endpoint, conn, peer).await });
            }
            Err(e) => {
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                error!("Tunnel accept failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
                }
            }
        }
    }
}

async fn single_tcp_flow(endpoint: Arc<Endpoint>, conn: TcpStream, peer: SocketAddr) {
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

    let target = match endpoint.targets.dial_tcp(*TCP_DIAL_TIMEOUT).await {
        Ok(target) => target,
        Err(e) => {
            error!("Target dial failed: {}", e);
            return;
        }
    };
    debug!("Target connection: {:?} <-> {:?}", target.local_addr(), target.peer_addr());

    let mut target: Stream = target.into_stream();
    if let Err(e) = send_proxy_v1(
        &mut target,
        endpoint.config.proxy_protocol,
        &peer.to_string(),
        local_addr,
    )
    .await
    {
        error!("PROXY v1 send failed: {}", e);
        return;
    }

    info!("Starting exchange: {} <-> target", peer);
    let (sent, received) = data_exchange(
        stream,
        target,
        endpoint.config.read_timeout,
        &endpoint.tcp_buffers,
        endpoint.limiter.clone(),
    )
    .await;
    info!("Exchange complete: {} bytes sent, {} bytes received", sent, received);
}

async fn single_udp_loop(endpoint: Arc<Endpoint>, socket: Arc<UdpSocket>) -> Result<()> {
    let cancel = endpoint.cancel_token();
    loop {
        let mut buf = endpoint.udp_buffers.get();
        let received = tokio::select! {
            _ = cancel.cancelled() => {
                endpoint.udp_buffers.put(buf);
                return Err(Error::Cancelled);
            }
            received = socket.recv_from(&mut buf) => received,
        };
        let (n, client_addr) = match received {
            Ok(received) => received,
            Err(e) => {
                endpoint.udp_buffers.put(buf);
                if cancel.is_cancelled() {
                    return Err(Error::Cancelled);
                }
                error!("Tunnel datagram receive failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
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
        let target = match endpoint.get_udp_session(&session_key) {
            Some(UdpSessionConn::Socket(target)) => {
                debug!("Using UDP session: {}", session_key);
                target
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
                let target = match endpoint.targets.dial_udp().await {
                    Ok(target) => Arc::new(target),
                    Err(e) => {
                        error!("Target dial failed: {}", e);
                        endpoint.slots.release(true);
                        endpoint.udp_buffers.put(buf);
                        continue;
                    }
                };
                debug!("Target connection: {:?} <-> {:?}", target.local_addr(), target.peer_addr());
                endpoint.insert_udp_session(session_key.clone(), UdpSessionConn::Socket(Arc::clone(&target)));

                let endpoint_pump = Arc::clone(&endpoint);
                let ingress = Arc::clone(&socket);
                let target_pump = Arc::clone(&target);
                let key_pump = session_key.clone();
                tokio::spawn(async move {
                    single_udp_return_pump(endpoint_pump, ingress, target_pump, client_addr, key_pump)
                        .await;
                });
                target
            }
        };

        debug!("Starting transfer: {} <-> target", client_addr);
        if let Err(e) = target.send(&buf[..n]).await {
            error!("Datagram send to target failed: {}", e);
            endpoint.remove_udp_session(&session_key);
            endpoint.udp_buffers.put(buf);
            return Err(Error::Io(e));
        }
        endpoint.udp_buffers.put(buf);
    }
}

/// Per-session reader: target replies become datagrams back to the flow
/// source. Idle timeout or error reaps the session and frees the slot.
async fn single_udp_return_pump(
    endpoint: Arc<Endpoint>,
    ingress: Arc<UdpSocket>,
    target: Arc<UdpSocket>,
    client_addr: SocketAddr,
    session_key: String,
) {
    let cancel = endpoint.cancel_token();
    let mut buf = endpoint.udp_buffers.get();

    loop {
        if cancel.is_cancelled() {
            break;
        }
        match tokio::time::timeout(*UDP_READ_TIMEOUT, target.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                if let Some(limiter) = &endpoint.limiter {
                    limiter.throttle(n).await;
                }
                match ingress.send_to(&buf[..n], client_addr).await {
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

    endpoint.remove_udp_session(&session_key);
    endpoint.slots.release(true);
    endpoint.udp_buffers.put(buf);
}
