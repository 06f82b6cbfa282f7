//! TCP transport pool
//!
//! The server pool accepts tunnel connections, assigns each a flow id, and
//! parks it; the client pool dials connections and parks them under the id
//! the server sent. The very first connection of a pool's life is the
//! control connection (`00000000`). Ids travel as 8 ASCII hex bytes written
//! by the server immediately after accept.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::common::stream::{IntoStream, Stream};
use crate::config::{
    CONTEXT_CHECK_INTERVAL, CONTROL_CONN_ID, MAX_POOL_INTERVAL, MIN_POOL_INTERVAL,
    POOL_GET_TIMEOUT,
};
use crate::crypto::{format_cert_fingerprint, insecure_client_config, sni_server_name};
use crate::error::{Error, Result};

use super::{PoolConn, TransportPool};

type DialFuture = Pin<Box<dyn Future<Output = Result<TcpStream>> + Send>>;
/// Async closure producing one raw tunnel connection.
pub type DialFn = Arc<dyn Fn() -> DialFuture + Send + Sync>;

/// State and bookkeeping shared by both pool flavors.
struct PoolCore {
    capacity: usize,
    state: Mutex<PoolState>,
    /// Wakes getters when a connection parks.
    park_notify: Notify,
    /// Wakes the manager when a connection is claimed or flushed.
    slot_notify: Notify,
    ready: AtomicBool,
    errors: AtomicUsize,
    interval_ms: AtomicU64,
    closed: CancellationToken,
}

#[derive(Default)]
struct PoolState {
    conns: HashMap<String, PoolConn>,
    /// Claim order for unclaimed ids; the control id never enters it.
    order: VecDeque<String>,
}

impl PoolCore {
    fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            capacity,
            state: Mutex::new(PoolState::default()),
            park_notify: Notify::new(),
            slot_notify: Notify::new(),
            ready: AtomicBool::new(false),
            errors: AtomicUsize::new(0),
            interval_ms: AtomicU64::new(MIN_POOL_INTERVAL.as_millis() as u64),
            closed: CancellationToken::new(),
        })
    }

    fn park(&self, conn: PoolConn) {
        let id = conn.id.clone();
        let mut state = self.state.lock();
        if id != CONTROL_CONN_ID {
            state.order.push_back(id.clone());
        }
        state.conns.insert(id, conn);
        drop(state);
        self.ready.store(true, Ordering::Release);
        self.park_notify.notify_waiters();
    }

    fn pop_unclaimed(&self) -> Option<PoolConn> {
        let mut state = self.state.lock();
        while let Some(id) = state.order.pop_front() {
            if let Some(conn) = state.conns.remove(&id) {
                drop(state);
                self.slot_notify.notify_waiters();
                return Some(conn);
            }
        }
        None
    }

    fn take(&self, id: &str) -> Option<PoolConn> {
        let conn = self.state.lock().conns.remove(id);
        if conn.is_some() {
            self.slot_notify.notify_waiters();
        }
        conn
    }

    fn contains(&self, id: &str) -> bool {
        self.state.lock().conns.contains_key(id)
    }

    fn active(&self) -> usize {
        self.state.lock().conns.len()
    }

    fn drain(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.conns.len();
        state.conns.clear();
        state.order.clear();
        drop(state);
        self.slot_notify.notify_waiters();
        count
    }

    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Relaxed))
    }

    /// The free list is draining: refill more aggressively.
    fn speed_up(&self) {
        let current = self.interval_ms.load(Ordering::Relaxed);
        let floor = MIN_POOL_INTERVAL.as_millis() as u64;
        self.interval_ms
            .store((current / 2).max(floor), Ordering::Relaxed);
    }

    /// The pool sat idle this cycle: back off.
    fn slow_down(&self) {
        let current = self.interval_ms.load(Ordering::Relaxed);
        let ceiling = MAX_POOL_INTERVAL.as_millis() as u64;
        self.interval_ms
            .store((current * 2).min(ceiling.max(1)), Ordering::Relaxed);
    }

    async fn incoming_get(&self, timeout: Duration) -> Result<PoolConn> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register the waiter before checking the pool: notify_waiters
            // stores no permit, so a park landing between the check and the
            // await would otherwise be lost.
            let notified = self.park_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.pop_unclaimed() {
                return Ok(conn);
            }
            if self.closed.is_cancelled() {
                return Err(Error::PoolClosed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::PoolTimeout("incoming".into()));
            }
        }
    }

    async fn outgoing_get(&self, id: &str, timeout: Duration) -> Result<PoolConn> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Same waiter-first ordering as incoming_get.
            let notified = self.park_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(conn) = self.take(id) {
                return Ok(conn);
            }
            if self.closed.is_cancelled() {
                return Err(Error::PoolClosed);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(Error::PoolTimeout(id.into()));
            }
        }
    }

    fn close(&self) {
        self.closed.cancel();
        self.drain();
        self.park_notify.notify_waiters();
    }
}

impl PoolCore {
    async fn flush_parked(&self) {
        let drained = self.drain();
        self.interval_ms
            .store(MIN_POOL_INTERVAL.as_millis() as u64, Ordering::Relaxed);
        debug!("Tunnel pool flush: {} connections dropped", drained);
    }
}

/// Listener side of the tunnel link: accepts pool connections, optionally
/// completes the TLS server handshake, mints flow ids, and parks.
pub struct TcpServerPool {
    core: Arc<PoolCore>,
    client_ip: String,
    tls: Option<TlsAcceptor>,
    report_interval: Duration,
    control_minted: AtomicBool,
}

impl TcpServerPool {
    pub fn new(
        capacity: usize,
        client_ip: String,
        tls_config: Option<Arc<ServerConfig>>,
        report_interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: PoolCore::new(capacity),
            client_ip,
            tls: tls_config.map(TlsAcceptor::from),
            report_interval,
            control_minted: AtomicBool::new(false),
        })
    }

    /// Accept loop. Runs until the pool is closed; stops accepting while the
    /// pool is at capacity.
    pub async fn server_manager(self: Arc<Self>, listener: TcpListener) {
        debug!("Server pool manager started: capacity {}", self.core.capacity);
        let mut report = tokio::time::interval(self.report_interval);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let slot_freed = self.core.slot_notify.notified();
            tokio::pin!(slot_freed);
            slot_freed.as_mut().enable();
            let has_capacity = self.core.active() < self.core.capacity;
            tokio::select! {
                _ = self.core.closed.cancelled() => return,
                _ = report.tick() => {
                    debug!("Tunnel pool report: {} active", self.core.active());
                }
                _ = slot_freed, if !has_capacity => {}
                accepted = listener.accept(), if has_capacity => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if !self.client_ip.is_empty() && peer.ip().to_string() != self.client_ip {
                                warn!("Server pool refused connection from {}", peer);
                                continue;
                            }
                            let pool = Arc::clone(&self);
                            tokio::spawn(async move { pool.induct(stream).await });
                        }
                        Err(e) => {
                            if self.core.closed.is_cancelled() {
                                return;
                            }
                            error!("Server pool accept failed: {}", e);
                            tokio::time::sleep(CONTEXT_CHECK_INTERVAL).await;
                        }
                    }
                }
            }
        }
    }

    async fn induct(&self, stream: TcpStream) {
        let _ = stream.set_nodelay(true);

        let mut boxed: Stream = match &self.tls {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls_stream) => tls_stream.into_stream(),
                Err(e) => {
                    debug!("Server pool TLS accept failed: {}", e);
                    return;
                }
            },
            None => stream.into_stream(),
        };

        let id = self.mint_id();
        if let Err(e) = boxed.write_all(id.as_bytes()).await {
            debug!("Server pool id write failed: {}", e);
            if id == CONTROL_CONN_ID {
                self.control_minted.store(false, Ordering::Release);
            }
            return;
        }
        let _ = boxed.flush().await;

        self.core.park(PoolConn {
            id,
            stream: boxed,
            peer_fingerprint: None,
        });
    }

    /// First id of a pool's life is the reserved control id; every other is
    /// a random 8-hex string unique among parked connections.
    fn mint_id(&self) -> String {
        if self
            .control_minted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            return CONTROL_CONN_ID.to_string();
        }
        loop {
            let id = format!("{:08x}", rand::random::<u32>());
            if id != CONTROL_CONN_ID && !self.core.contains(&id) {
                return id;
            }
        }
    }
}

#[async_trait]
impl TransportPool for TcpServerPool {
    async fn incoming_get(&self, timeout: Duration) -> Result<PoolConn> {
        self.core.incoming_get(timeout).await
    }

    async fn outgoing_get(&self, id: &str, timeout: Duration) -> Result<PoolConn> {
        self.core.outgoing_get(id, timeout).await
    }

    fn ready(&self) -> bool {
        self.core.ready.load(Ordering::Acquire)
    }

    fn active(&self) -> usize {
        self.core.active()
    }

    fn capacity(&self) -> usize {
        self.core.capacity
    }

    fn interval(&self) -> Duration {
        self.core.interval()
    }

    async fn flush(&self) {
        self.core.flush_parked().await;
    }

    fn add_error(&self) {
        self.core.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn error_count(&self) -> usize {
        self.core.errors.load(Ordering::Relaxed)
    }

    fn reset_error(&self) {
        self.core.errors.store(0, Ordering::Relaxed);
    }

    fn close(&self) {
        self.core.close();
    }
}

/// Dialing side of the tunnel link: keeps at least `min` connections parked
/// (bounded by `max`), adapting its refill cadence to demand.
pub struct TcpClientPool {
    core: Arc<PoolCore>,
    min_capacity: usize,
    tls: Option<TlsConnector>,
    server_name: String,
    dial: DialFn,
    report_interval: Duration,
}

impl TcpClientPool {
    pub fn new(
        min_capacity: usize,
        max_capacity: usize,
        report_interval: Duration,
        tls_code: u8,
        server_name: String,
        dial: DialFn,
    ) -> Arc<Self> {
        Arc::new(Self {
            core: PoolCore::new(max_capacity),
            min_capacity: min_capacity.min(max_capacity),
            tls: (tls_code > 0).then(|| TlsConnector::from(insecure_client_config())),
            server_name,
            dial,
            report_interval,
        })
    }

    /// Refill loop. Sleeps the adaptive interval between cycles, waking
    /// early whenever connections are claimed.
    pub async fn client_manager(self: Arc<Self>) {
        debug!(
            "Client pool manager started: min {} max {}",
            self.min_capacity, self.core.capacity
        );
        let mut report = tokio::time::interval(self.report_interval);
        report.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.core.closed.is_cancelled() {
                return;
            }

            // Claims landing while the refill runs must still cut the sleep
            // short, so the waiter registers before the free count is read.
            let claimed = self.core.slot_notify.notified();
            tokio::pin!(claimed);
            claimed.as_mut().enable();

            let mut created = 0usize;
            let free = self.core.active();
            if free < self.min_capacity {
                let want = (self.min_capacity - free).min(self.core.capacity - free);
                for _ in 0..want {
                    if self.core.closed.is_cancelled() {
                        return;
                    }
                    match self.establish().await {
                        Ok(conn) => {
                            self.core.park(conn);
                            created += 1;
                        }
                        Err(e) => {
                            error!("Client pool dial failed: {}", e);
                            self.core.errors.fetch_add(1, Ordering::Relaxed);
                            break;
                        }
                    }
                }
            }

            if created > 0 {
                self.core.speed_up();
            } else {
                self.core.slow_down();
            }

            tokio::select! {
                _ = self.core.closed.cancelled() => return,
                _ = tokio::time::sleep(self.core.interval()) => {}
                _ = claimed => {}
                _ = report.tick() => {
                    debug!("Tunnel pool report: {} active", self.core.active());
                }
            }
        }
    }

    /// Dial one tunnel connection, complete TLS when the handshake asked for
    /// it, and learn the flow id the server assigned.
    async fn establish(&self) -> Result<PoolConn> {
        let stream = (self.dial)().await?;
        let _ = stream.set_nodelay(true);

        let (mut stream, peer_fingerprint): (Stream, Option<String>) = match &self.tls {
            Some(connector) => {
                let name = sni_server_name(&self.server_name, "localhost");
                let tls_stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| Error::Tls(format!("pool TLS connect failed: {}", e)))?;
                let fingerprint = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| format_cert_fingerprint(cert.as_ref()));
                (tls_stream.into_stream(), fingerprint)
            }
            None => (stream.into_stream(), None),
        };

        let id = read_flow_id(&mut stream).await?;
        Ok(PoolConn {
            id,
            stream,
            peer_fingerprint,
        })
    }
}

#[async_trait]
impl TransportPool for TcpClientPool {
    async fn incoming_get(&self, timeout: Duration) -> Result<PoolConn> {
        self.core.incoming_get(timeout).await
    }

    async fn outgoing_get(&self, id: &str, timeout: Duration) -> Result<PoolConn> {
        self.core.outgoing_get(id, timeout).await
    }

    fn ready(&self) -> bool {
        self.core.ready.load(Ordering::Acquire)
    }

    fn active(&self) -> usize {
        self.core.active()
    }

    fn capacity(&self) -> usize {
        self.core.capacity
    }

    fn interval(&self) -> Duration {
        self.core.interval()
    }

    async fn flush(&self) {
        self.core.flush_parked().await;
    }

    fn add_error(&self) {
        self.core.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn error_count(&self) -> usize {
        self.core.errors.load(Ordering::Relaxed)
    }

    fn reset_error(&self) {
        self.core.errors.store(0, Ordering::Relaxed);
    }

    fn close(&self) {
        self.core.close();
    }
}

async fn read_flow_id(stream: &mut Stream) -> Result<String> {
    let mut id_bytes = [0u8; 8];
    tokio::time::timeout(*POOL_GET_TIMEOUT, stream.read_exact(&mut id_bytes))
        .await
        .map_err(|_| Error::PoolTimeout("flow id read".into()))?
        .map_err(|e| Error::Protocol(format!("flow id read failed: {}", e)))?;

    if !id_bytes.iter().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::Protocol("malformed flow id".into()));
    }
    Ok(String::from_utf8_lossy(&id_bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::REPORT_INTERVAL;
    use crate::crypto::new_ram_identity;

    async fn wait_ready(pool: &dyn TransportPool) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !(pool.ready() && pool.active() > 0) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "pool never became ready"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    fn dial_fn(addr: std::net::SocketAddr) -> DialFn {
        Arc::new(move || {
            Box::pin(async move {
                TcpStream::connect(addr)
                    .await
                    .map_err(|e| Error::Dial(e.to_string()))
            })
        })
    }

    async fn spawn_pool_pair(
        tls: Option<Arc<ServerConfig>>,
        tls_code: u8,
    ) -> (Arc<TcpServerPool>, Arc<TcpClientPool>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_pool = TcpServerPool::new(8, String::new(), tls, *REPORT_INTERVAL);
        tokio::spawn(Arc::clone(&server_pool).server_manager(listener));

        let client_pool = TcpClientPool::new(
            2,
            8,
            *REPORT_INTERVAL,
            tls_code,
            "localhost".to_string(),
            dial_fn(addr),
        );
        tokio::spawn(Arc::clone(&client_pool).client_manager());

        (server_pool, client_pool)
    }

    #[tokio::test]
    async fn test_rendezvous_over_plain_tcp() {
        let (server_pool, client_pool) = spawn_pool_pair(None, 0).await;
        wait_ready(server_pool.as_ref()).await;
        wait_ready(client_pool.as_ref()).await;

        // Both ends claim the reserved control connection first.
        let mut server_ctl = server_pool
            .outgoing_get(CONTROL_CONN_ID, Duration::from_secs(5))
            .await
            .unwrap();
        let mut client_ctl = client_pool
            .outgoing_get(CONTROL_CONN_ID, Duration::from_secs(5))
            .await
            .unwrap();
        server_ctl.stream.write_all(b"ctl\n").await.unwrap();
        let mut buf = [0u8; 4];
        client_ctl.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ctl\n");

        // Listener side reserves a data connection; the peer resolves the
        // same one by id.
        let mut reserved = server_pool
            .incoming_get(Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(reserved.id, CONTROL_CONN_ID);
        assert_eq!(reserved.id.len(), 8);

        let mut resolved = client_pool
            .outgoing_get(&reserved.id, Duration::from_secs(5))
            .await
            .unwrap();
        reserved.stream.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        resolved.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        resolved.stream.write_all(b"pong").await.unwrap();
        reserved.stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        server_pool.close();
        client_pool.close();
    }

    #[tokio::test]
    async fn test_tls_pool_captures_fingerprint() {
        let identity = new_ram_identity().unwrap();
        let expected = identity.fingerprint();
        let (server_pool, client_pool) = spawn_pool_pair(Some(identity.config), 1).await;
        wait_ready(client_pool.as_ref()).await;

        let conn = client_pool
            .outgoing_get(CONTROL_CONN_ID, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(conn.peer_fingerprint.as_deref(), Some(expected.as_str()));

        server_pool.close();
        client_pool.close();
    }

    #[tokio::test]
    async fn test_incoming_get_times_out_when_empty() {
        let pool = TcpServerPool::new(4, String::new(), None, *REPORT_INTERVAL);
        let err = pool.incoming_get(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::PoolTimeout(_)));
    }

    #[tokio::test]
    async fn test_flush_drains_and_refills() {
        let (server_pool, client_pool) = spawn_pool_pair(None, 0).await;
        wait_ready(client_pool.as_ref()).await;

        client_pool.flush().await;
        assert_eq!(client_pool.active(), 0);
        // The manager wakes on the drain notification and refills.
        wait_ready(client_pool.as_ref()).await;

        server_pool.close();
        client_pool.close();
    }

    #[tokio::test]
    async fn test_error_counter() {
        let pool = TcpServerPool::new(4, String::new(), None, *REPORT_INTERVAL);
        assert_eq!(pool.error_count(), 0);
        pool.add_error();
        pool.add_error();
        assert_eq!(pool.error_count(), 2);
        pool.reset_error();
        assert_eq!(pool.error_count(), 0);
    }

    #[test]
    fn test_adaptive_interval_bounds() {
        let core = PoolCore::new(4);
        let floor = *MIN_POOL_INTERVAL;
        let ceiling = *MAX_POOL_INTERVAL;

        for _ in 0..20 {
            core.slow_down();
        }
        assert_eq!(core.interval(), ceiling);
        for _ in 0..20 {
            core.speed_up();
        }
        assert_eq!(core.interval(), floor);
    }
}
