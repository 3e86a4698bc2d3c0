//! Traits at the seams between the orchestrator, the packet codec, and the
//! socket transport.

use crate::{AddressFamily, ProbeConfig, ProbeIdentity, Received, ReplyMatch, TracerouteError};
use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::time::Instant;

/// Translates between probe identities and wire bytes.
pub trait ProbeCodec: Send + Sync {
    /// Builds an Echo Request for `identity` that is exactly `packet_size`
    /// bytes long.
    fn build_echo_request(
        &self,
        identity: ProbeIdentity,
        packet_size: usize,
    ) -> Result<Vec<u8>, TracerouteError>;

    /// Classifies an inbound ICMP message against `identity`.
    ///
    /// Never fails: bytes that can't be parsed are a [`ReplyMatch::NoMatch`].
    fn classify_reply(&self, bytes: &[u8], identity: ProbeIdentity) -> ReplyMatch;
}

/// A connection probes are sent and received on.
#[async_trait]
pub trait ProbeConnection: Send + Sync {
    /// Sets the TTL (hop limit) and TOS (traffic class) of future packets.
    fn set_ttl_and_tos(&self, ttl: u8, tos: u8) -> Result<(), TracerouteError>;

    /// Sends `packet` to `destination`.
    async fn send_to(&self, packet: &[u8], destination: IpAddr) -> Result<usize, TracerouteError>;

    /// Receives one ICMP message into `buf`.
    ///
    /// Returns `Ok(None)` once `deadline` passes without a datagram.
    async fn recv_from(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<Option<Received>, TracerouteError>;
}

/// Owns the one connection used for a run.
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: ProbeConnection;

    /// Returns the transport's connection, creating it on first use.
    ///
    /// Later calls return the same connection.
    async fn acquire_connection(
        &self,
        config: &ProbeConfig,
        family: AddressFamily,
    ) -> Result<Arc<Self::Connection>, TracerouteError>;
}
