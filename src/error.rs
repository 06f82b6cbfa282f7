//! Error types for NodePass

use thiserror::Error;

/// Main error type for NodePass
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Tunnel port {0} conflicts with target address {1}")]
    PortConflict(u16, String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Pool get timeout for id {0}")]
    PoolTimeout(String),

    #[error("Pool closed")]
    PoolClosed,

    #[error("Dial failed: {0}")]
    Dial(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Certificate fingerprint mismatch: server: {server} - client: {client}")]
    FingerprintMismatch { server: String, client: String },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Context cancelled")]
    Cancelled,

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for NodePass
pub type Result<T> = std::result::Result<T, Error>;
