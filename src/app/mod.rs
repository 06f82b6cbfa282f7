//! Endpoint runtime
//!
//! One endpoint process is either a server or a client bound to a single
//! configuration URL. The shared machinery lives in `endpoint`; `handshake`,
//! `control`, `tunnel`, and `single` implement the phases of a run;
//! `server`/`client` own construction and supervision.

pub mod client;
pub mod control;
pub mod endpoint;
pub mod handshake;
pub mod server;
pub mod single;
pub mod tunnel;

pub use client::Client;
pub use endpoint::Endpoint;
pub use server::Server;
