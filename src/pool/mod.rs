//! Transport pool contract
//!
//! A pool pre-establishes tunnel-carrying connections and acts as the
//! rendezvous between the two endpoints: the listener side reserves a
//! connection with `incoming_get` and announces its flow id over the control
//! channel; the peer resolves the same connection with `outgoing_get`.
//!
//! Concrete pools exist per wire type (TCP, QUIC, WebSocket, HTTP/2); the
//! TCP pool ships in this crate, the others register against the same
//! contract.

mod tcp;

pub use tcp::{DialFn, TcpClientPool, TcpServerPool};

use std::time::Duration;

use async_trait::async_trait;

use crate::common::stream::Stream;
use crate::error::Result;

/// One pooled tunnel connection, addressed by its 8-hex-char flow id.
/// `peer_fingerprint` carries the sha256 of the peer TLS certificate when
/// the pool dialed over TLS; trust-by-fingerprint verification reads it.
pub struct PoolConn {
    pub id: String,
    pub stream: Stream,
    pub peer_fingerprint: Option<String>,
}

impl std::fmt::Debug for PoolConn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolConn")
            .field("id", &self.id)
            .field("peer_fingerprint", &self.peer_fingerprint)
            .finish()
    }
}

/// Contract every transport pool satisfies (§ pool semantics):
/// `incoming_get` draws the next unclaimed connection and its id;
/// `outgoing_get` resolves a specific id announced by the peer.
#[async_trait]
pub trait TransportPool: Send + Sync {
    /// Reserve the next unclaimed connection, yielding its flow id.
    async fn incoming_get(&self, timeout: Duration) -> Result<PoolConn>;

    /// Fetch the connection parked under `id`.
    async fn outgoing_get(&self, id: &str, timeout: Duration) -> Result<PoolConn>;

    /// True once the manager is warmed up and a connection has parked.
    fn ready(&self) -> bool;

    /// Currently parked connections.
    fn active(&self) -> usize;

    /// Maximum pool capacity.
    fn capacity(&self) -> usize;

    /// Current adaptive refill interval.
    fn interval(&self) -> Duration;

    /// Drain every parked connection; the manager refills afterwards.
    async fn flush(&self);

    fn add_error(&self);
    fn error_count(&self) -> usize;
    fn reset_error(&self);

    /// Shut down the pool and its manager.
    fn close(&self);
}
