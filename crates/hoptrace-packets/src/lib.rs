//! Raw socket I/O for hoptrace.
//!
//! Provides the [`Transport`](hoptrace_core::Transport) that sends Echo
//! Requests and reads ICMP replies over raw sockets.

mod connection;
mod transport;

pub use connection::RawIcmpConnection;
pub use transport::IcmpTransport;
