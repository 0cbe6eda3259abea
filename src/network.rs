//! Networking of the peer: the wire codec and the TCP transport.

pub mod codec;
mod transport;

pub use transport::{Dial, TcpTransport, Transport};
