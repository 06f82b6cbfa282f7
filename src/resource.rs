//! Resource accounting
//!
//! Fixed-size buffer free-lists, atomic slot counters split TCP/UDP under a
//! combined limit, rx/tx traffic counters, and the token-bucket rate limiter
//! shared by every wired connection.

use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Free-list of fixed-size byte buffers. Callers must return exactly what
/// they took; oversized or foreign buffers are dropped on `put`.
pub struct BufferPool {
    size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self) -> Vec<u8> {
        let mut buffers = self.buffers.lock();
        match buffers.pop() {
            Some(mut buf) => {
                buf.resize(self.size, 0);
                buf
            }
            None => vec![0u8; self.size],
        }
    }

    pub fn put(&self, buf: Vec<u8>) {
        if buf.capacity() >= self.size {
            self.buffers.lock().push(buf);
        }
    }
}

/// TCP/UDP slot counters bounded by one combined limit. A limit of 0
/// disables accounting entirely.
pub struct Slots {
    limit: i32,
    tcp: AtomicI32,
    udp: AtomicI32,
}

impl Slots {
    pub fn new(limit: i32) -> Self {
        Self {
            limit,
            tcp: AtomicI32::new(0),
            udp: AtomicI32::new(0),
        }
    }

    pub fn limit(&self) -> i32 {
        self.limit
    }

    pub fn try_acquire(&self, udp: bool) -> bool {
        if self.limit == 0 {
            return true;
        }
        let total = self.tcp.load(Ordering::SeqCst) + self.udp.load(Ordering::SeqCst);
        if total >= self.limit {
            return false;
        }
        if udp {
            self.udp.fetch_add(1, Ordering::SeqCst);
        } else {
            self.tcp.fetch_add(1, Ordering::SeqCst);
        }
        true
    }

    pub fn release(&self, udp: bool) {
        if self.limit == 0 {
            return;
        }
        let counter = if udp { &self.udp } else { &self.tcp };
        // Never underflows: a racing release can only see a stale positive
        // value after an acquire it pairs with.
        if counter.load(Ordering::SeqCst) > 0 {
            counter.fetch_add(-1, Ordering::SeqCst);
        }
    }

    pub fn tcp(&self) -> i32 {
        self.tcp.load(Ordering::SeqCst)
    }

    pub fn udp(&self) -> i32 {
        self.udp.load(Ordering::SeqCst)
    }

    /// Acquire with release-on-drop semantics for flow handlers whose exits
    /// are all early returns.
    pub fn try_acquire_guard(self: &Arc<Self>, udp: bool) -> Option<SlotGuard> {
        if self.try_acquire(udp) {
            Some(SlotGuard {
                slots: Arc::clone(self),
                udp,
            })
        } else {
            None
        }
    }
}

pub struct SlotGuard {
    slots: Arc<Slots>,
    udp: bool,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.slots.release(self.udp);
    }
}

/// Endpoint-wide rx/tx byte counters, split TCP/UDP.
#[derive(Default)]
pub struct Traffic {
    pub tcp_rx: AtomicU64,
    pub tcp_tx: AtomicU64,
    pub udp_rx: AtomicU64,
    pub udp_tx: AtomicU64,
}

impl Traffic {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Token bucket limiter: capacity and refill rate both equal the configured
/// bytes/s. `throttle` debits the bucket and sleeps out any deficit, which
/// paces every copy loop that shares the limiter.
pub struct RateLimiter {
    rate: u64,
    capacity: f64,
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last: Instant,
}

impl RateLimiter {
    pub fn new(rate: u64) -> Self {
        Self {
            rate,
            capacity: rate as f64,
            state: Mutex::new(BucketState {
                tokens: rate as f64,
                last: Instant::now(),
            }),
        }
    }

    pub async fn throttle(&self, n: usize) {
        if self.rate == 0 || n == 0 {
            return;
        }
        let wait = {
            let mut state = self.state.lock();
            let now = Instant::now();
            let refill = now.duration_since(state.last).as_secs_f64() * self.rate as f64;
            state.tokens = (state.tokens + refill).min(self.capacity);
            state.last = now;

            if state.tokens >= n as f64 {
                state.tokens -= n as f64;
                Duration::ZERO
            } else {
                let deficit = n as f64 - state.tokens;
                state.tokens = 0.0;
                Duration::from_secs_f64(deficit / self.rate as f64)
            }
        };
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.tokens = self.capacity;
        state.last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_pool_reuse() {
        let pool = BufferPool::new(64);
        let buf = pool.get();
        assert_eq!(buf.len(), 64);
        pool.put(buf);
        let buf = pool.get();
        assert_eq!(buf.len(), 64);
        // Undersized buffers are not pooled.
        pool.put(vec![0u8; 8]);
        assert_eq!(pool.buffers.lock().len(), 0);
    }

    #[test]
    fn test_slots_combined_limit() {
        let slots = Slots::new(3);
        assert!(slots.try_acquire(false));
        assert!(slots.try_acquire(false));
        assert!(slots.try_acquire(true));
        // tcp + udp never exceeds the combined limit.
        assert!(!slots.try_acquire(false));
        assert!(!slots.try_acquire(true));
        assert_eq!(slots.tcp(), 2);
        assert_eq!(slots.udp(), 1);

        slots.release(true);
        assert!(slots.try_acquire(false));
        assert_eq!(slots.tcp(), 3);
    }

    #[test]
    fn test_slots_release_never_negative() {
        let slots = Slots::new(4);
        slots.release(false);
        slots.release(true);
        assert_eq!(slots.tcp(), 0);
        assert_eq!(slots.udp(), 0);
    }

    #[test]
    fn test_slots_zero_limit_disables_accounting() {
        let slots = Slots::new(0);
        for _ in 0..100_000 {
            assert!(slots.try_acquire(false));
        }
        assert_eq!(slots.tcp(), 0);
    }

    #[tokio::test]
    async fn test_rate_limiter_paces() {
        // 1 MB/s bucket starts full: the first 1 MB passes immediately,
        // the next 500 KB has to wait ~0.5 s.
        let limiter = RateLimiter::new(1_000_000);
        let start = Instant::now();
        limiter.throttle(1_000_000).await;
        assert!(start.elapsed() < Duration::from_millis(100));
        limiter.throttle(500_000).await;
        assert!(start.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_rate_limiter_unlimited() {
        let limiter = RateLimiter::new(0);
        let start = Instant::now();
        for _ in 0..1000 {
            limiter.throttle(usize::MAX / 2).await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
