//! Shared endpoint state
//!
//! Everything a running server or client owns exclusively: counters, slots,
//! buffer pools, the UDP session table, the per-run cancellation token and
//! control channels, and the CHECK_POINT telemetry emitter the orchestrator
//! scrapes from stdout.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tokio::io::WriteHalf;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::stream::Stream;
use crate::config::{Scheme, TunnelConfig, SEMAPHORE_LIMIT, TCP_DATA_BUF_SIZE, UDP_DATA_BUF_SIZE};
use crate::crypto::TlsIdentity;
use crate::dns::{Dialer, DnsCache, TargetPool};
use crate::error::{Error, Result};
use crate::pool::TransportPool;
use crate::protocol::BlockList;
use crate::resource::{BufferPool, RateLimiter, Slots, Traffic};
use crate::signal::{self, Signal};

/// Mutable per-run state: what the mode probe and the handshake decide.
pub struct RunState {
    pub run_mode: u8,
    pub data_flow: char,
    pub client_ip: String,
    pub tls_code: u8,
    pub tls: Option<TlsIdentity>,
    pub max_pool_capacity: usize,
    pub pool_type: u8,
}

/// Channel receivers handed to the loops of one run.
pub struct RunChannels {
    pub cancel: CancellationToken,
    pub write_rx: mpsc::Receiver<Vec<u8>>,
    pub signal_rx: mpsc::Receiver<Signal>,
}

/// One stateful UDP association, keyed by the flow source address.
#[derive(Clone)]
pub enum UdpSessionConn {
    /// Listener side: datagrams are framed into the paired tunnel stream.
    Tunnel(Arc<tokio::sync::Mutex<WriteHalf<Stream>>>),
    /// Dialing side: datagrams go raw on the outbound socket.
    Socket(Arc<UdpSocket>),
}

pub struct Endpoint {
    pub config: TunnelConfig,
    pub cache: Arc<DnsCache>,
    pub dialer: Arc<Dialer>,
    pub targets: Arc<TargetPool>,
    pub traffic: Arc<Traffic>,
    pub slots: Arc<Slots>,
    pub limiter: Option<Arc<RateLimiter>>,
    pub tcp_buffers: Arc<BufferPool>,
    pub udp_buffers: Arc<BufferPool>,
    pub block: BlockList,

    pub state: RwLock<RunState>,
    pub udp_sessions: Mutex<HashMap<String, UdpSessionConn>>,
    pub handshake_start: Mutex<Instant>,

    cancel: Mutex<CancellationToken>,
    write_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    signal_tx: Mutex<Option<mpsc::Sender<Signal>>>,
    pool: Mutex<Option<Arc<dyn TransportPool>>>,
    verify_notify: Mutex<Arc<Notify>>,
    check_point: Mutex<Instant>,
    last_flush: Mutex<Option<Instant>>,
}

impl Endpoint {
    pub fn new(
        config: TunnelConfig,
        cache: Arc<DnsCache>,
        tls_code: u8,
        tls: Option<TlsIdentity>,
    ) -> Arc<Self> {
        let dialer = Arc::new(Dialer::new(config.dialer_ip));
        let targets = Arc::new(TargetPool::new(
            config.target_addrs.clone(),
            config.target_tcp_addrs.clone(),
            config.target_udp_addrs.clone(),
            config.lb_strategy,
            Arc::clone(&cache),
            Arc::clone(&dialer),
        ));
        let limiter = (config.rate_limit > 0).then(|| Arc::new(RateLimiter::new(config.rate_limit)));
        let block = BlockList {
            socks: config.block_socks,
            http: config.block_http,
            tls: config.block_tls,
        };
        let state = RunState {
            run_mode: config.run_mode,
            data_flow: '+',
            client_ip: String::new(),
            tls_code,
            tls,
            max_pool_capacity: config.max_pool_capacity,
            pool_type: config.pool_type,
        };

        Arc::new(Self {
            slots: Arc::new(Slots::new(config.slot_limit)),
            tcp_buffers: Arc::new(BufferPool::new(*TCP_DATA_BUF_SIZE)),
            udp_buffers: Arc::new(BufferPool::new(*UDP_DATA_BUF_SIZE)),
            traffic: Arc::new(Traffic::new()),
            udp_sessions: Mutex::new(HashMap::new()),
            handshake_start: Mutex::new(Instant::now()),
            cancel: Mutex::new(CancellationToken::new()),
            write_tx: Mutex::new(None),
            signal_tx: Mutex::new(None),
            pool: Mutex::new(None),
            verify_notify: Mutex::new(Arc::new(Notify::new())),
            check_point: Mutex::new(Instant::now()),
            last_flush: Mutex::new(None),
            config,
            cache,
            dialer,
            targets,
            limiter,
            block,
            state: RwLock::new(state),
        })
    }

    pub fn is_server(&self) -> bool {
        self.config.scheme == Scheme::Server
    }

    /// Rebuild the per-run cancellation token and channels. Must be called
    /// at the top of every (re)start; loops from a previous run hold the old
    /// token and die with it.
    pub fn init_run(&self) -> RunChannels {
        let token = CancellationToken::new();
        *self.cancel.lock() = token.clone();

        let queue_limit = (*SEMAPHORE_LIMIT).max(1);
        let (write_tx, write_rx) = mpsc::channel(queue_limit);
        let (signal_tx, signal_rx) = mpsc::channel(queue_limit);
        *self.write_tx.lock() = Some(write_tx);
        *self.signal_tx.lock() = Some(signal_tx);
        *self.verify_notify.lock() = Arc::new(Notify::new());
        *self.last_flush.lock() = None;
        *self.handshake_start.lock() = Instant::now();
        *self.check_point.lock() = Instant::now();

        RunChannels {
            cancel: token,
            write_rx,
            signal_rx,
        }
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub fn cancel(&self) {
        self.cancel.lock().cancel();
    }

    pub fn verify_notify(&self) -> Arc<Notify> {
        self.verify_notify.lock().clone()
    }

    pub fn set_pool(&self, pool: Arc<dyn TransportPool>) {
        *self.pool.lock() = Some(pool);
    }

    pub fn pool(&self) -> Option<Arc<dyn TransportPool>> {
        self.pool.lock().clone()
    }

    /// Queue an encoded signal for the control writer. Overflow drops the
    /// signal with an error log; the flow it announced will fail its
    /// pool-get and be retried upstream.
    pub fn emit_signal(&self, signal: &Signal) {
        let line = signal::encode_signal(signal, &self.config.tunnel_key);
        let tx = self.write_tx.lock().clone();
        if let Some(tx) = tx {
            match tx.try_send(line) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    error!("Control write queue limit reached: {}", *SEMAPHORE_LIMIT);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    /// Queue a decoded inbound signal for the dispatcher, dropping on
    /// overflow per the backpressure contract.
    pub fn push_signal(&self, signal: Signal) {
        let tx = self.signal_tx.lock().clone();
        if let Some(tx) = tx {
            match tx.try_send(signal) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    error!("Signal queue limit reached: {}", *SEMAPHORE_LIMIT);
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }
    }

    pub fn set_check_point(&self) {
        *self.check_point.lock() = Instant::now();
    }

    pub fn check_point_elapsed_ms(&self) -> u64 {
        self.check_point.lock().elapsed().as_millis() as u64
    }

    /// A flush ran less than one report interval ago: suppress the next one
    /// so both ends cannot thrash the pool with dueling flushes.
    pub fn try_begin_flush(&self, interval: std::time::Duration) -> bool {
        let mut last = self.last_flush.lock();
        if let Some(at) = *last {
            if at.elapsed() < interval {
                return false;
            }
        }
        *last = Some(Instant::now());
        true
    }

    pub fn insert_udp_session(&self, key: String, conn: UdpSessionConn) {
        self.udp_sessions.lock().insert(key, conn);
    }

    pub fn get_udp_session(&self, key: &str) -> Option<UdpSessionConn> {
        self.udp_sessions.lock().get(key).cloned()
    }

    pub fn remove_udp_session(&self, key: &str) {
        self.udp_sessions.lock().remove(key);
    }

    /// Emit the telemetry line on stdout at `event` priority.
    pub fn emit_checkpoint(&self, ping_ms: u64, pool_active: usize) {
        let state = self.state.read();
        let line = Checkpoint {
            mode: state.run_mode,
            ping_ms,
            pool: pool_active,
            tcps: self.slots.tcp(),
            udps: self.slots.udp(),
            tcp_rx: self.traffic.tcp_rx.load(std::sync::atomic::Ordering::Relaxed),
            tcp_tx: self.traffic.tcp_tx.load(std::sync::atomic::Ordering::Relaxed),
            udp_rx: self.traffic.udp_rx.load(std::sync::atomic::Ordering::Relaxed),
            udp_tx: self.traffic.udp_tx.load(std::sync::atomic::Ordering::Relaxed),
        };
        info!(target: "event", "{}", line);
    }

    /// Bind the target-side listeners this endpoint forwards for, honoring
    /// the notcp/noudp switches.
    pub async fn init_target_listener(&self) -> Result<(Option<TcpListener>, Option<Arc<UdpSocket>>)> {
        if self.config.target_tcp_addrs.is_empty() {
            return Err(Error::Config("no target address".into()));
        }

        let tcp = if !self.config.disable_tcp {
            let addr = self.config.target_tcp_addrs[0];
            Some(
                TcpListener::bind(addr)
                    .await
                    .map_err(|e| Error::Config(format!("target listen {} failed: {}", addr, e)))?,
            )
        } else {
            None
        };

        let udp = if !self.config.disable_udp {
            let addr = self.config.target_udp_addrs[0];
            Some(Arc::new(UdpSocket::bind(addr).await.map_err(|e| {
                Error::Config(format!("target listen {} failed: {}", addr, e))
            })?))
        } else {
            None
        };

        Ok((tcp, udp))
    }

    /// Bind the tunnel-side listeners (client single mode).
    pub async fn init_tunnel_listener(&self) -> Result<(Option<TcpListener>, Option<Arc<UdpSocket>>)> {
        let tcp_addr = self
            .config
            .tunnel_tcp_addr
            .ok_or_else(|| Error::Config("nil tunnel address".into()))?;

        let tcp = if !self.config.disable_tcp {
            Some(
                TcpListener::bind(tcp_addr)
                    .await
                    .map_err(|e| Error::Config(format!("tunnel listen {} failed: {}", tcp_addr, e)))?,
            )
        } else {
            None
        };

        let udp = if !self.config.disable_udp {
            let addr = self.config.tunnel_udp_addr.unwrap_or(tcp_addr);
            Some(Arc::new(UdpSocket::bind(addr).await.map_err(|e| {
                Error::Config(format!("tunnel listen {} failed: {}", addr, e))
            })?))
        } else {
            None
        };

        Ok((tcp, udp))
    }

    /// Tear down everything a run owns. Safe to call repeatedly; the
    /// supervisor runs it after every failure and once more at shutdown.
    pub fn stop(&self) {
        self.cancel.lock().cancel();

        if let Some(pool) = self.pool.lock().take() {
            let active = pool.active();
            pool.close();
            debug!("Tunnel connection closed: pool active {}", active);
        }

        self.udp_sessions.lock().clear();
        *self.write_tx.lock() = None;
        *self.signal_tx.lock() = None;

        if let Some(limiter) = &self.limiter {
            limiter.reset();
        }
        self.cache.clear();
    }
}

/// Supervision loop shared by server and client: run `start` until the
/// process is told to quit, recycling the endpoint after each failure with
/// a cool-down in between. SIGINT/SIGTERM trigger a bounded graceful stop.
pub async fn supervise<F, Fut>(endpoint: Arc<Endpoint>, role: &'static str, start: F)
where
    F: Fn(Arc<Endpoint>) -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let banner = endpoint.config.banner();
    info!("{} started: {}", role, banner);

    let root = CancellationToken::new();
    {
        let root = root.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            root.cancel();
        });
    }
    #[cfg(unix)]
    {
        let root = root.clone();
        tokio::spawn(async move {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut term) => {
                    term.recv().await;
                    root.cancel();
                }
                Err(e) => error!("SIGTERM handler failed: {}", e),
            }
        });
    }

    loop {
        let result = tokio::select! {
            _ = root.cancelled() => break,
            result = start(Arc::clone(&endpoint)) => result,
        };
        if let Err(e) = result {
            if !matches!(e, crate::error::Error::Cancelled) {
                error!("{} error: {}", role, e);
            }
        }
        endpoint.stop();

        tokio::select! {
            _ = root.cancelled() => break,
            _ = tokio::time::sleep(*crate::config::SERVICE_COOLDOWN) => {}
        }
        info!("{} restart: {}", role, banner);
    }

    let stopping = {
        let endpoint = Arc::clone(&endpoint);
        async move { endpoint.stop() }
    };
    if tokio::time::timeout(*crate::config::SHUTDOWN_TIMEOUT, stopping)
        .await
        .is_err()
    {
        error!("{} shutdown timed out", role);
    } else {
        info!("{} shutdown complete", role);
    }
}

/// One parsed or emitted CHECK_POINT telemetry record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub mode: u8,
    pub ping_ms: u64,
    pub pool: usize,
    pub tcps: i32,
    pub udps: i32,
    pub tcp_rx: u64,
    pub tcp_tx: u64,
    pub udp_rx: u64,
    pub udp_tx: u64,
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CHECK_POINT|MODE={}|PING={}ms|POOL={}|TCPS={}|UDPS={}|TCPRX={}|TCPTX={}|UDPRX={}|UDPTX={}",
            self.mode,
            self.ping_ms,
            self.pool,
            self.tcps,
            self.udps,
            self.tcp_rx,
            self.tcp_tx,
            self.udp_rx,
            self.udp_tx
        )
    }
}

impl Checkpoint {
    /// Parse a telemetry line, tolerating any log prefix before the
    /// `CHECK_POINT|` marker. This is the contract the orchestrator relies
    /// on when scraping child stdout.
    pub fn parse(line: &str) -> Option<Self> {
        let start = line.find("CHECK_POINT|")?;
        let mut fields = line[start..].trim_end().split('|');
        if fields.next() != Some("CHECK_POINT") {
            return None;
        }

        let mut checkpoint = Checkpoint {
            mode: 0,
            ping_ms: 0,
            pool: 0,
            tcps: 0,
            udps: 0,
            tcp_rx: 0,
            tcp_tx: 0,
            udp_rx: 0,
            udp_tx: 0,
        };
        for field in fields {
            let (key, value) = field.split_once('=')?;
            match key {
                "MODE" => checkpoint.mode = value.parse().ok()?,
                "PING" => checkpoint.ping_ms = value.strip_suffix("ms")?.parse().ok()?,
                "POOL" => checkpoint.pool = value.parse().ok()?,
                "TCPS" => checkpoint.tcps = value.parse().ok()?,
                "UDPS" => checkpoint.udps = value.parse().ok()?,
                "TCPRX" => checkpoint.tcp_rx = value.parse().ok()?,
                "TCPTX" => checkpoint.tcp_tx = value.parse().ok()?,
                "UDPRX" => checkpoint.udp_rx = value.parse().ok()?,
                "UDPTX" => checkpoint.udp_tx = value.parse().ok()?,
                _ => return None,
            }
        }
        Some(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_roundtrip() {
        let samples = [
            Checkpoint {
                mode: 2,
                ping_ms: 12,
                pool: 64,
                tcps: 3,
                udps: 1,
                tcp_rx: 1024,
                tcp_tx: 2048,
                udp_rx: 0,
                udp_tx: 17,
            },
            Checkpoint {
                mode: 0,
                ping_ms: 0,
                pool: 0,
                tcps: 0,
                udps: 0,
                tcp_rx: 0,
                tcp_tx: 0,
                udp_rx: 0,
                udp_tx: 0,
            },
            Checkpoint {
                mode: 1,
                ping_ms: u64::MAX,
                pool: usize::MAX,
                tcps: i32::MAX,
                udps: i32::MAX,
                tcp_rx: u64::MAX,
                tcp_tx: u64::MAX,
                udp_rx: u64::MAX,
                udp_tx: u64::MAX,
            },
        ];
        for sample in samples {
            let line = sample.to_string();
            assert!(line.starts_with("CHECK_POINT|MODE="));
            assert_eq!(Checkpoint::parse(&line), Some(sample));
        }
    }

    #[test]
    fn test_checkpoint_parse_with_log_prefix() {
        let line = "2026-08-02T10:00:00Z EVENT CHECK_POINT|MODE=1|PING=5ms|POOL=8|TCPS=1|UDPS=0|TCPRX=10|TCPTX=20|UDPRX=30|UDPTX=40";
        let checkpoint = Checkpoint::parse(line).unwrap();
        assert_eq!(checkpoint.mode, 1);
        assert_eq!(checkpoint.ping_ms, 5);
        assert_eq!(checkpoint.pool, 8);
        assert_eq!(checkpoint.udp_tx, 40);
    }

    #[test]
    fn test_checkpoint_parse_rejects_malformed() {
        assert!(Checkpoint::parse("no marker here").is_none());
        assert!(Checkpoint::parse("CHECK_POINT|MODE=x|PING=1ms").is_none());
        assert!(Checkpoint::parse("CHECK_POINT|PING=1").is_none());
    }
}
