//! Error types for traceroute operations.

use crate::config::{AddressFamily, Network};
use std::net::IpAddr;
use thiserror::Error;

/// Main error type for traceroute operations.
#[derive(Error, Debug)]
pub enum TracerouteError {
    // Socket/IO errors
    #[error("Failed to create socket: {0}")]
    SocketCreation(#[source] std::io::Error),

    #[error("Failed to bind to address {addr}: {source}")]
    SocketBind {
        addr: IpAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to set socket option {option}: {source}")]
    SocketOption {
        option: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("Read timeout exceeded")]
    ReadTimeout,

    #[error("Receive failed: {0}")]
    ReceiveFailed(#[source] std::io::Error),

    #[error("Write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    // Packet errors
    #[error("Packet size {requested} is smaller than the {minimum}-byte ICMP header")]
    PacketTooSmall { minimum: usize, requested: usize },

    #[error("Malformed packet: {0}")]
    MalformedPacket(String),

    // Setup errors
    #[error("Unsupported network: {0}")]
    UnsupportedNetwork(Network),

    #[error("Address family mismatch: expected {expected}, got {actual}")]
    AddressFamilyMismatch {
        expected: AddressFamily,
        actual: IpAddr,
    },

    // DNS errors
    #[error("Failed to resolve hostname {hostname}: {reason}")]
    DnsResolutionFailed { hostname: String, reason: String },

    // Configuration errors
    #[error("Invalid TTL range: first={first_ttl}, max={max_ttl}")]
    InvalidTtlRange { first_ttl: u8, max_ttl: u8 },

    #[error("Unknown network: {0}")]
    UnknownNetwork(String),

    #[error("Invalid packet size: {0}")]
    InvalidPacketSize(usize),

    #[error("Per-probe timeout must be greater than zero")]
    InvalidTimeout,

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl TracerouteError {
    /// Returns true if this error only affects a single probe attempt.
    ///
    /// Retryable errors are folded into the per-hop retry policy instead of
    /// aborting the run: a timeout, a reply we could not make sense of, or a
    /// probe the kernel refused to send all count as "no reply" for that
    /// attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::ReadTimeout | Self::MalformedPacket(_) | Self::WriteFailed(_)
        )
    }
}
