//! DNS cache and outbound dialing
//!
//! Name resolution goes through a TTL cache keyed on the original address
//! string; bare IP literals bypass it. The dialer can pin a source IP and
//! flips to system auto once, for the life of the endpoint, after the first
//! failure. Target selection rotates per the configured load-balancing
//! strategy.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpSocket, TcpStream, UdpSocket};
use tracing::{debug, error};

use crate::config::{FALLBACK_INTERVAL, REPORT_INTERVAL};
use crate::error::{Error, Result};

struct DnsCacheEntry {
    addr: SocketAddr,
    expires_at: Instant,
}

/// TTL-bound name resolution cache. Entries are immutable after insertion;
/// stale entries are evicted by whichever lookup finds them expired.
pub struct DnsCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, DnsCacheEntry>>,
}

impl DnsCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Resolve `host:port`, bypassing the cache for IP literals.
    pub async fn resolve_addr(&self, address: &str) -> Result<SocketAddr> {
        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }
        let host = address
            .rsplit_once(':')
            .map(|(h, _)| h)
            .ok_or_else(|| Error::Config(format!("invalid address: {}", address)))?;
        if host.is_empty() || host.parse::<IpAddr>().is_ok() {
            return lookup(address).await;
        }
        self.resolve(address).await
    }

    /// Cached resolution with evict-on-access for stale entries.
    async fn resolve(&self, address: &str) -> Result<SocketAddr> {
        let now = Instant::now();
        {
            let mut entries = self.entries.lock();
            if let Some(entry) = entries.get(address) {
                if now < entry.expires_at {
                    return Ok(entry.addr);
                }
                entries.remove(address);
            }
        }

        let addr = lookup(address).await?;
        self.store(address, addr, now + self.ttl);
        Ok(addr)
    }

    fn store(&self, address: &str, addr: SocketAddr, expires_at: Instant) {
        let mut entries = self.entries.lock();
        entries
            .entry(address.to_string())
            .or_insert(DnsCacheEntry { addr, expires_at });
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

async fn lookup(address: &str) -> Result<SocketAddr> {
    lookup_host(address)
        .await
        .map_err(|e| Error::Dial(format!("resolve {} failed: {}", address, e)))?
        .next()
        .ok_or_else(|| Error::Dial(format!("resolve {} returned no addresses", address)))
}

/// Outbound dialer with optional source-IP binding.
///
/// The first dial failure with a pinned source flips the endpoint to system
/// auto permanently; the flag is never cleared short of a restart.
pub struct Dialer {
    source_ip: Option<IpAddr>,
    fallback: AtomicBool,
}

impl Dialer {
    pub fn new(source_ip: Option<IpAddr>) -> Self {
        Self {
            source_ip,
            fallback: AtomicBool::new(false),
        }
    }

    fn bound_source(&self) -> Option<IpAddr> {
        if self.fallback.load(Ordering::Acquire) {
            None
        } else {
            self.source_ip
        }
    }

    pub async fn dial_tcp(&self, addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
        if let Some(source) = self.bound_source() {
            match tcp_connect_from(source, addr, timeout).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    if self
                        .fallback
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        error!("Dial fallback to system auto due to dialer failure: {}", e);
                    }
                }
            }
        }
        tcp_connect(addr, timeout).await
    }

    pub async fn dial_udp(&self, addr: SocketAddr) -> Result<UdpSocket> {
        if let Some(source) = self.bound_source() {
            match udp_connect_from(Some(source), addr).await {
                Ok(socket) => return Ok(socket),
                Err(e) => {
                    if self
                        .fallback
                        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        error!("Dial fallback to system auto due to dialer failure: {}", e);
                    }
                }
            }
        }
        udp_connect_from(None, addr).await
    }
}

async fn tcp_connect(addr: SocketAddr, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::Dial(format!("dial {} timed out", addr)))?
        .map_err(|e| Error::Dial(format!("dial {} failed: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn tcp_connect_from(
    source: IpAddr,
    addr: SocketAddr,
    timeout: Duration,
) -> Result<TcpStream> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    socket
        .bind(SocketAddr::new(source, 0))
        .map_err(|e| Error::Dial(format!("bind {} failed: {}", source, e)))?;
    let stream = tokio::time::timeout(timeout, socket.connect(addr))
        .await
        .map_err(|_| Error::Dial(format!("dial {} timed out", addr)))?
        .map_err(|e| Error::Dial(format!("dial {} failed: {}", addr, e)))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn udp_connect_from(source: Option<IpAddr>, addr: SocketAddr) -> Result<UdpSocket> {
    let local: SocketAddr = match (source, addr) {
        (Some(ip), _) => SocketAddr::new(ip, 0),
        (None, SocketAddr::V4(_)) => "0.0.0.0:0".parse().unwrap(),
        (None, SocketAddr::V6(_)) => "[::]:0".parse().unwrap(),
    };
    let socket = UdpSocket::bind(local)
        .await
        .map_err(|e| Error::Dial(format!("bind {} failed: {}", local, e)))?;
    socket
        .connect(addr)
        .await
        .map_err(|e| Error::Dial(format!("dial {} failed: {}", addr, e)))?;
    Ok(socket)
}

/// Configured upstream destinations plus the rotation state shared by every
/// flow: round-robin counter, best-latency index, and the periodic
/// primary-fallback reset.
pub struct TargetPool {
    targets: Vec<String>,
    tcp_addrs: Vec<SocketAddr>,
    udp_addrs: Vec<SocketAddr>,
    strategy: u8,
    target_idx: AtomicU64,
    best_latency: AtomicI32,
    last_fallback: Mutex<Instant>,
    cache: Arc<DnsCache>,
    dialer: Arc<Dialer>,
}

impl TargetPool {
    pub fn new(
        targets: Vec<String>,
        tcp_addrs: Vec<SocketAddr>,
        udp_addrs: Vec<SocketAddr>,
        strategy: u8,
        cache: Arc<DnsCache>,
        dialer: Arc<Dialer>,
    ) -> Self {
        Self {
            targets,
            tcp_addrs,
            udp_addrs,
            strategy,
            target_idx: AtomicU64::new(0),
            best_latency: AtomicI32::new(0),
            last_fallback: Mutex::new(Instant::now()),
            cache,
            dialer,
        }
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn best_latency(&self) -> i32 {
        self.best_latency.load(Ordering::Relaxed)
    }

    /// Round-robin index: each call advances the shared counter.
    fn next_idx(&self) -> usize {
        if self.targets.len() <= 1 {
            return 0;
        }
        (self.target_idx.fetch_add(1, Ordering::Relaxed) as usize) % self.targets.len()
    }

    /// Re-resolve a target through the cache, keeping the statically
    /// resolved address as fallback when resolution fails mid-run.
    async fn resolve_target(&self, idx: usize, udp: bool) -> SocketAddr {
        let static_addr = if udp {
            self.udp_addrs[idx]
        } else {
            self.tcp_addrs[idx]
        };
        match self.cache.resolve_addr(&self.targets[idx]).await {
            Ok(addr) => addr,
            Err(_) => static_addr,
        }
    }

    fn start_index(&self) -> usize {
        let count = self.targets.len();
        match self.strategy {
            1 => (self.target_idx.load(Ordering::Relaxed) as usize) % count,
            2 => {
                let mut last = self.last_fallback.lock();
                if last.elapsed() > *FALLBACK_INTERVAL {
                    *last = Instant::now();
                    self.target_idx.store(0, Ordering::Relaxed);
                }
                (self.target_idx.load(Ordering::Relaxed) as usize) % count
            }
            _ => self.next_idx(),
        }
    }

    fn record_success(&self, tried: usize, idx: usize) {
        if tried > 0 && (self.strategy == 1 || self.strategy == 2) {
            self.target_idx.store(idx as u64, Ordering::Relaxed);
        }
    }

    pub async fn dial_tcp(&self, timeout: Duration) -> Result<TcpStream> {
        let count = self.targets.len();
        if count == 0 {
            return Err(Error::Dial("no target addresses".into()));
        }
        if count == 1 {
            let addr = self.resolve_target(0, false).await;
            return self.dialer.dial_tcp(addr, timeout).await;
        }

        let start = self.start_index();
        let mut last_err = None;
        for i in 0..count {
            let idx = (start + i) % count;
            let addr = self.resolve_target(idx, false).await;
            match self.dialer.dial_tcp(addr, timeout).await {
                Ok(stream) => {
                    self.record_success(i, idx);
                    return Ok(stream);
                }
                Err(e) => {
                    debug!("Dial rotation miss at {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Dial(format!(
            "all {} targets failed: {}",
            count,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    pub async fn dial_udp(&self) -> Result<UdpSocket> {
        let count = self.targets.len();
        if count == 0 {
            return Err(Error::Dial("no target addresses".into()));
        }
        if count == 1 {
            let addr = self.resolve_target(0, true).await;
            return self.dialer.dial_udp(addr).await;
        }

        let start = self.start_index();
        let mut last_err = None;
        for i in 0..count {
            let idx = (start + i) % count;
            let addr = self.resolve_target(idx, true).await;
            match self.dialer.dial_udp(addr).await {
                Ok(socket) => {
                    self.record_success(i, idx);
                    return Ok(socket);
                }
                Err(e) => {
                    debug!("Dial rotation miss at {}: {}", addr, e);
                    last_err = Some(e);
                }
            }
        }
        Err(Error::Dial(format!(
            "all {} targets failed: {}",
            count,
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }

    /// TCP-dial every target in parallel and remember the index with the
    /// smallest non-zero round-trip. Returns the best latency in ms, 0 when
    /// every probe failed.
    pub async fn probe_best_target(self: &Arc<Self>) -> i32 {
        let count = self.targets.len();
        if count == 0 {
            return 0;
        }

        let mut probes = tokio::task::JoinSet::new();
        for idx in 0..count {
            let pool = Arc::clone(self);
            probes.spawn(async move { (idx, pool.tcp_ping(idx).await) });
        }

        let (mut best_idx, mut best_lat) = (0usize, 0i32);
        while let Some(result) = probes.join_next().await {
            if let Ok((idx, lat)) = result {
                if lat > 0 && (best_lat == 0 || lat < best_lat) {
                    best_idx = idx;
                    best_lat = lat;
                }
            }
        }

        if best_lat > 0 {
            self.target_idx.store(best_idx as u64, Ordering::Relaxed);
            self.best_latency.store(best_lat, Ordering::Relaxed);
        }
        best_lat
    }

    async fn tcp_ping(&self, idx: usize) -> i32 {
        let addr = self.resolve_target(idx, false).await;
        let start = Instant::now();
        match tcp_connect(addr, *REPORT_INTERVAL).await {
            Ok(_) => (start.elapsed().as_millis() as i32).max(1),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_ip_literal_bypasses_cache() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let addr = cache.resolve_addr("127.0.0.1:8080").await.unwrap();
        assert_eq!(addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(cache.len(), 0);
    }

    #[tokio::test]
    async fn test_cache_hit_within_ttl() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let parked: SocketAddr = "192.0.2.7:443".parse().unwrap();
        cache.store("park.test:443", parked, Instant::now() + Duration::from_secs(60));

        // Within TTL the parked entry is returned without touching the
        // resolver (192.0.2.0/24 would never resolve from here).
        let addr = cache.resolve_addr("park.test:443").await.unwrap();
        assert_eq!(addr, parked);
        let addr = cache.resolve_addr("park.test:443").await.unwrap();
        assert_eq!(addr, parked);
    }

    #[tokio::test]
    async fn test_cache_evicts_stale_on_access() {
        let cache = DnsCache::new(Duration::from_secs(60));
        let bogus: SocketAddr = "192.0.2.7:1234".parse().unwrap();
        cache.store("localhost:1234", bogus, Instant::now() - Duration::from_secs(1));

        // Stale entry is dropped and localhost re-resolves for real.
        let addr = cache.resolve_addr("localhost:1234").await.unwrap();
        assert_ne!(addr, bogus);
        assert_eq!(addr.port(), 1234);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_dialer_source_fallback() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = listener.accept().await;
        });

        // 192.0.2.1 is TEST-NET; binding it fails, which must flip the
        // dialer to system auto and still connect.
        let dialer = Dialer::new(Some("192.0.2.1".parse().unwrap()));
        let stream = dialer.dial_tcp(addr, Duration::from_secs(2)).await.unwrap();
        assert!(stream.peer_addr().is_ok());
        assert!(dialer.fallback.load(Ordering::Acquire));
    }

    async fn spawn_counting_listener() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        tokio::spawn(async move {
            while let Ok((_conn, _)) = listener.accept().await {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        (addr, count)
    }

    #[tokio::test]
    async fn test_round_robin_distribution() {
        let (addr_a, count_a) = spawn_counting_listener().await;
        let (addr_b, count_b) = spawn_counting_listener().await;

        let cache = Arc::new(DnsCache::new(Duration::from_secs(60)));
        let dialer = Arc::new(Dialer::new(None));
        let pool = TargetPool::new(
            vec![addr_a.to_string(), addr_b.to_string()],
            vec![addr_a, addr_b],
            vec![addr_a, addr_b],
            0,
            cache,
            dialer,
        );

        // Property: over 3N all-succeeding dials with N targets, each
        // target is selected exactly 3 times.
        let mut streams = Vec::new();
        for _ in 0..6 {
            streams.push(pool.dial_tcp(Duration::from_secs(2)).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count_a.load(Ordering::SeqCst), 3);
        assert_eq!(count_b.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_rotation_falls_through_dead_target() {
        let (addr_alive, count_alive) = spawn_counting_listener().await;
        // Grab a port and close it so the first target refuses connections.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr_dead = dead.local_addr().unwrap();
        drop(dead);

        let cache = Arc::new(DnsCache::new(Duration::from_secs(60)));
        let dialer = Arc::new(Dialer::new(None));
        let pool = TargetPool::new(
            vec![addr_dead.to_string(), addr_alive.to_string()],
            vec![addr_dead, addr_alive],
            vec![addr_dead, addr_alive],
            2,
            cache,
            dialer,
        );

        // Primary-with-fallback always starts at index 0, falls through to
        // the live target, then sticks to it.
        let _s1 = pool.dial_tcp(Duration::from_secs(2)).await.unwrap();
        assert_eq!(pool.target_idx.load(Ordering::Relaxed), 1);
        let _s2 = pool.dial_tcp(Duration::from_secs(2)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count_alive.load(Ordering::SeqCst), 2);
    }
}
