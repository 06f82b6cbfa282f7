//! Control plane
//!
//! The pool connection parked under the reserved id becomes the control
//! connection. One writer task drains the bounded write channel onto it;
//! one reader task decodes newline-framed signals into the bounded signal
//! queue; the health task heartbeats and polices the pool; the dispatch
//! task reacts to inbound signals. The first of them to fail ends the run.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader, ReadHalf};
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::common::stream::Stream;
use crate::config::{
    CONTEXT_CHECK_INTERVAL, CONTROL_CONN_ID, HANDSHAKE_TIMEOUT, POOL_GET_TIMEOUT, REPORT_INTERVAL,
};
use crate::error::{Error, Result};
use crate::pool::TransportPool;
use crate::signal::{self, Signal, ACTION_FLUSH, ACTION_PING, ACTION_PONG, ACTION_TCP, ACTION_UDP, ACTION_VERIFY};

use super::endpoint::Endpoint;
use super::tunnel;

/// Claim the control connection and start the writer task. Returns the read
/// half for the signal queue loop.
pub async fn set_control_conn(
    endpoint: &Arc<Endpoint>,
    pool: &Arc<dyn TransportPool>,
    mut write_rx: mpsc::Receiver<Vec<u8>>,
) -> Result<ReadHalf<Stream>> {
    let cancel = endpoint.cancel_token();
    let started = std::time::Instant::now();
    while !(pool.ready() && pool.active() > 0) {
        if started.elapsed() > *HANDSHAKE_TIMEOUT {
            return Err(Error::Handshake("control connection timeout".into()));
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
        }
    }

    let control = pool.outgoing_get(CONTROL_CONN_ID, *POOL_GET_TIMEOUT).await?;
    let (read_half, mut write_half) = tokio::io::split(control.stream);
    info!(
        "Marking tunnel handshake as complete in {}ms",
        endpoint.handshake_start.lock().elapsed().as_millis()
    );

    let writer_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => return,
                line = write_rx.recv() => match line {
                    Some(line) => {
                        if let Err(e) = write_half.write_all(&line).await {
                            error!("Control write failed: {}", e);
                            return;
                        }
                        let _ = write_half.flush().await;
                    }
                    None => return,
                }
            }
        }
    });

    if endpoint.state.read().tls_code == 1 {
        info!("TLS code-1: RAM cert fingerprint verifying...");
    }
    Ok(read_half)
}

/// Run the control loops: signal queue, dispatcher, health check. Returns
/// the first failure.
pub async fn common_control(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    reader: ReadHalf<Stream>,
    signal_rx: mpsc::Receiver<Signal>,
) -> Result<()> {
    let cancel = endpoint.cancel_token();
    let (err_tx, mut err_rx) = mpsc::channel::<Error>(3);

    {
        let endpoint = Arc::clone(&endpoint);
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = common_queue(endpoint, reader).await {
                let _ = err_tx.send(e).await;
            }
        });
    }
    {
        let endpoint = Arc::clone(&endpoint);
        let pool = Arc::clone(&pool);
        let err_tx = err_tx.clone();
        tokio::spawn(async move {
            if let Err(e) = common_once(endpoint, pool, signal_rx).await {
                let _ = err_tx.send(e).await;
            }
        });
    }
    {
        let endpoint = Arc::clone(&endpoint);
        let pool = Arc::clone(&pool);
        tokio::spawn(async move {
            if let Err(e) = health_check(endpoint, pool).await {
                let _ = err_tx.send(e).await;
            }
        });
    }

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        err = err_rx.recv() => Err(err.unwrap_or(Error::ChannelClosed)),
    }
}

/// Reader loop: one newline-framed signal per iteration, with a deadline of
/// three report intervals so a silent control connection kills the run.
async fn common_queue(endpoint: Arc<Endpoint>, reader: ReadHalf<Stream>) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let cancel = endpoint.cancel_token();
    let read_deadline = 3 * *REPORT_INTERVAL;

    loop {
        let mut line = Vec::new();
        let read = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            read = tokio::time::timeout(read_deadline, reader.read_until(b'\n', &mut line)) => read,
        };
        match read {
            Err(_) => return Err(Error::Timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(0)) => return Err(Error::ChannelClosed),
            Ok(Ok(_)) => {}
        }

        match signal::decode_signal(&line, &endpoint.config.tunnel_key) {
            Ok(decoded) => endpoint.push_signal(decoded),
            Err(e) => {
                error!("Signal decode failed: {}", e);
                tokio::select! {
                    _ = cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
                }
            }
        }
    }
}

/// Heartbeat and pool health. Every report interval: flush the peer and the
/// local pool when errors exceed half the active count, refresh the
/// best-latency probe, and send a ping.
async fn health_check(endpoint: Arc<Endpoint>, pool: Arc<dyn TransportPool>) -> Result<()> {
    let cancel = endpoint.cancel_token();
    let mut ticker = tokio::time::interval(*REPORT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    if endpoint.state.read().tls_code == 1 {
        let endpoint = Arc::clone(&endpoint);
        let pool = Arc::clone(&pool);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(*REPORT_INTERVAL) => incoming_verify(endpoint, pool).await,
            }
        });
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = ticker.tick() => {}
        }

        if pool.error_count() > pool.active() / 2
            && endpoint.try_begin_flush(*REPORT_INTERVAL)
        {
            endpoint.emit_signal(&Signal::new(ACTION_FLUSH));
            pool.flush().await;
            pool.reset_error();

            let pool = Arc::clone(&pool);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(*REPORT_INTERVAL) => {
                        debug!("Tunnel pool flushed: {} active connections", pool.active());
                    }
                }
            });
        }

        if endpoint.config.lb_strategy == 1 && endpoint.targets.len() > 1 {
            endpoint.targets.probe_best_target().await;
        }

        endpoint.set_check_point();
        endpoint.emit_signal(&Signal::new(ACTION_PING));
    }
}

/// Dispatch loop: one task per inbound flow signal, plus the control
/// actions. Unknown actions are dropped.
async fn common_once(
    endpoint: Arc<Endpoint>,
    pool: Arc<dyn TransportPool>,
    mut signal_rx: mpsc::Receiver<Signal>,
) -> Result<()> {
    let cancel = endpoint.cancel_token();
    while !pool.ready() {
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            _ = tokio::time::sleep(CONTEXT_CHECK_INTERVAL) => {}
        }
    }

    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            received = signal_rx.recv() => received,
        };
        let received = received.ok_or(Error::ChannelClosed)?;

        match received.action.as_str() {
            ACTION_VERIFY => {
                if endpoint.state.read().tls_code == 1 {
                    let endpoint = Arc::clone(&endpoint);
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move { outgoing_verify(endpoint, pool, received).await });
                }
            }
            ACTION_TCP => {
                if !endpoint.config.disable_tcp {
                    let endpoint = Arc::clone(&endpoint);
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move {
                        tunnel::tunnel_tcp_once(endpoint, pool, received).await;
                    });
                }
            }
            ACTION_UDP => {
                if !endpoint.config.disable_udp {
                    let endpoint = Arc::clone(&endpoint);
                    let pool = Arc::clone(&pool);
                    tokio::spawn(async move {
                        tunnel::tunnel_udp_once(endpoint, pool, received).await;
                    });
                }
            }
            ACTION_FLUSH => {
                let endpoint = Arc::clone(&endpoint);
                let pool = Arc::clone(&pool);
                tokio::spawn(async move {
                    if !endpoint.try_begin_flush(*REPORT_INTERVAL) {
                        return;
                    }
                    pool.flush().await;
                    pool.reset_error();
                    let cancel = endpoint.cancel_token();
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        _ = tokio::time::sleep(*REPORT_INTERVAL) => {
                            debug!("Tunnel pool flushed: {} active connections", pool.active());
                        }
                    }
                });
            }
            ACTION_PING => {
                endpoint.emit_signal(&Signal::new(ACTION_PONG));
            }
            ACTION_PONG => {
                endpoint.emit_checkpoint(endpoint.check_point_elapsed_ms(), pool.active());
            }
            _ => {}
        }
    }
}

/// RAM-cert verification, sending side: reserve a pool connection and
/// publish the certificate hash tied to its flow id. The server publishes
/// its local cert hash; the client publishes the peer hash it observed.
async fn incoming_verify(endpoint: Arc<Endpoint>, pool: Arc<dyn TransportPool>) {
    let cancel = endpoint.cancel_token();
    while !(pool.ready() && pool.active() > 0) {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(CONTEXT_CHECK_INTERVAL).await;
    }

    let conn = match pool.incoming_get(*POOL_GET_TIMEOUT).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Verify reserve failed: {}", e);
            endpoint.cancel();
            return;
        }
    };

    let fingerprint = if endpoint.is_server() {
        endpoint
            .state
            .read()
            .tls
            .as_ref()
            .map(|identity| identity.fingerprint())
    } else {
        conn.peer_fingerprint.clone()
    };
    let fingerprint = fingerprint.unwrap_or_default();

    endpoint.emit_signal(&Signal::verify(&conn.id, &fingerprint));
    debug!("TLS code-1: verify signal: cid {} -> control", conn.id);
}

/// RAM-cert verification, receiving side: resolve the announced connection,
/// read the certificate hash on this side, and compare. A mismatch is fatal
/// for the run.
async fn outgoing_verify(endpoint: Arc<Endpoint>, pool: Arc<dyn TransportPool>, received: Signal) {
    let cancel = endpoint.cancel_token();
    while !pool.ready() {
        if cancel.is_cancelled() {
            return;
        }
        tokio::time::sleep(CONTEXT_CHECK_INTERVAL).await;
    }

    if received.fingerprint.is_empty() {
        error!("Verify signal carried no fingerprint");
        endpoint.cancel();
        return;
    }
    debug!("TLS verify signal: cid {} <- control", received.id);

    let conn = match pool.outgoing_get(&received.id, *POOL_GET_TIMEOUT).await {
        Ok(conn) => conn,
        Err(e) => {
            error!("Verify resolve failed: {}", e);
            endpoint.cancel();
            return;
        }
    };

    let (server_fingerprint, client_fingerprint) = if endpoint.is_server() {
        let local = endpoint
            .state
            .read()
            .tls
            .as_ref()
            .map(|identity| identity.fingerprint());
        match local {
            Some(local) => (local, received.fingerprint.clone()),
            None => {
                error!("Verify failed: no local certificate");
                endpoint.cancel();
                return;
            }
        }
    } else {
        match conn.peer_fingerprint.clone() {
            Some(observed) => (received.fingerprint.clone(), observed),
            None => return,
        }
    };

    if server_fingerprint != client_fingerprint {
        error!(
            "certificate fingerprint mismatch: server: {} - client: {}",
            server_fingerprint, client_fingerprint
        );
        endpoint.cancel();
        return;
    }

    info!(
        "TLS code-1: RAM cert fingerprint verified: {}",
        client_fingerprint
    );
    endpoint.verify_notify().notify_one();
}
