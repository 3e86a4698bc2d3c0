//! ICMP Echo codec.

use crate::packet::{build_echo_request, classify_reply};
use hoptrace_core::{AddressFamily, ProbeCodec, ProbeIdentity, ReplyMatch, TracerouteError};
use std::net::IpAddr;

/// [`ProbeCodec`] for ICMP Echo probes of one address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IcmpCodec {
    family: AddressFamily,
}

impl IcmpCodec {
    pub fn new(family: AddressFamily) -> Self {
        Self { family }
    }

    /// Codec matching the family of `destination`.
    pub fn for_destination(destination: IpAddr) -> Self {
        Self::new(AddressFamily::of(destination))
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }
}

impl ProbeCodec for IcmpCodec {
    fn build_echo_request(
        &self,
        identity: ProbeIdentity,
        packet_size: usize,
    ) -> Result<Vec<u8>, TracerouteError> {
        build_echo_request(self.family, identity, packet_size)
    }

    fn classify_reply(&self, bytes: &[u8], identity: ProbeIdentity) -> ReplyMatch {
        classify_reply(self.family, bytes, identity)
    }
}
