//! Core types for traceroute operations.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Identifier and sequence number carried by one Echo Request.
///
/// The identifier is fixed for a whole run; the sequence number is bumped for
/// every probe sent, so no two probes of a run share an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProbeIdentity {
    pub identifier: u16,
    pub sequence: u16,
}

impl ProbeIdentity {
    pub fn new(identifier: u16, sequence: u16) -> Self {
        Self {
            identifier,
            sequence,
        }
    }

    /// Returns the identity of the next probe of the same run.
    pub fn next(self) -> Self {
        Self {
            identifier: self.identifier,
            sequence: self.sequence.wrapping_add(1),
        }
    }
}

/// Echo identifier for this process.
///
/// Derived from the process id so concurrent runs on the same host don't
/// claim each other's replies.
pub fn process_identifier() -> u16 {
    (std::process::id() & 0xffff) as u16
}

/// Outcome of classifying one inbound ICMP message against a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyMatch {
    /// An Echo Reply carrying the probe's identifier and sequence.
    EchoReply,
    /// A Time-Exceeded message quoting the probe.
    TimeExceeded,
    /// Anything else: other message types, malformed bytes, other probes.
    NoMatch,
}

impl ReplyMatch {
    pub fn is_match(self) -> bool {
        !matches!(self, ReplyMatch::NoMatch)
    }
}

/// A datagram read from the probe connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Number of bytes written into the receive buffer.
    pub len: usize,
    /// Address the datagram came from.
    pub from: IpAddr,
}
