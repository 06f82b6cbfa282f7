//! Core types shared by every layer: the boxed stream abstraction and the
//! byte-shuttling primitives built on it.

pub mod relay;
pub mod stream;

pub use relay::{data_exchange, read_udp_frame, write_udp_frame};
pub use stream::{IntoStream, PrefixedStream, StatStream, Stream};
