//! NodePass - Universal TCP/UDP tunneling
//!
//! # Architecture
//!
//! ```text
//! ingress flow → listener endpoint → pool reserve (flow id)
//!                                  → launch signal over control channel
//! peer endpoint → pool resolve (flow id) → dial target → splice bytes
//! ```
//!
//! Two endpoints cooperate over one authenticated, TLS-protected tunnel
//! port: a pre-warmed pool of data connections absorbs per-flow handshake
//! latency, and a single designated control connection carries xor-keyed,
//! base64-framed JSON signals that pair flows with pool connections.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Stream abstraction, byte shuttling, UDP framing
//! ├── pool/            # Transport pool contract + TCP pools
//! ├── app/             # Endpoints: handshake, control plane, dispatch
//! ├── config.rs        # Env knobs + command-URL resolver
//! ├── crypto.rs        # XOR, auth token, fingerprints, TLS identities
//! ├── dns.rs           # DNS cache, dialer, target rotation
//! ├── resource.rs      # Buffers, slots, counters, rate limiter
//! ├── signal.rs        # Control-channel signal codec
//! └── protocol.rs      # Protocol screening + PROXY v1
//! ```

pub mod app;
pub mod common;
pub mod config;
pub mod crypto;
pub mod dns;
pub mod error;
pub mod pool;
pub mod protocol;
pub mod resource;
pub mod signal;

// Re-exports for convenience
pub use app::{Client, Endpoint, Server};
pub use common::Stream;
pub use config::TunnelConfig;
pub use error::{Error, Result};
pub use pool::TransportPool;
