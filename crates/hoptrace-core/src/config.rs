//! Probe configuration.

use crate::TracerouteError;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Size of the ICMP Echo header (type, code, checksum, identifier, sequence).
pub const ICMP_HEADER_SIZE: usize = 8;

/// Largest IPv4 datagram payload: the 16-bit total length minus a bare header.
const MAX_IPV4_PAYLOAD: usize = 65_535 - 20;

/// Largest IPv6 payload without jumbograms.
const MAX_IPV6_PAYLOAD: usize = 65_535;

/// Network used to carry probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    /// Raw IP with ICMP Echo probes.
    #[default]
    Ip,
    /// UDP probing. Accepted by configuration, reserved for a future transport.
    Udp,
}

impl std::fmt::Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Ip => write!(f, "ip"),
            Network::Udp => write!(f, "udp"),
        }
    }
}

impl std::str::FromStr for Network {
    type Err = TracerouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ip" | "icmp" => Ok(Network::Ip),
            "udp" => Ok(Network::Udp),
            _ => Err(TracerouteError::UnknownNetwork(s.to_string())),
        }
    }
}

/// IP address family of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Returns the family of the given address.
    pub fn of(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub fn matches(self, addr: IpAddr) -> bool {
        Self::of(addr) == self
    }

    /// Largest ICMP message a single datagram of this family can carry.
    pub fn max_packet_size(self) -> usize {
        match self {
            AddressFamily::V4 => MAX_IPV4_PAYLOAD,
            AddressFamily::V6 => MAX_IPV6_PAYLOAD,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::V4 => write!(f, "ipv4"),
            AddressFamily::V6 => write!(f, "ipv6"),
        }
    }
}

/// Parameters for a single traceroute run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Network carrying the probes.
    pub network: Network,
    /// Address family. Derived from the destination when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address_family: Option<AddressFamily>,
    /// Local address outgoing probes are bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<IpAddr>,
    /// TTL of the first probe.
    pub first_ttl: u8,
    /// Highest TTL probed, inclusive.
    pub max_ttl: u8,
    /// TOS (IPv4) or traffic class (IPv6) byte of outgoing probes.
    pub tos: u8,
    /// Size of each ICMP message on the wire, header included.
    pub packet_size: usize,
    /// Retries before a TTL is given up on.
    pub max_retries_per_hop: u32,
    /// How long to wait for the reply to a single probe.
    #[serde(with = "duration_ms")]
    pub per_probe_timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            network: Network::Ip,
            address_family: None,
            source: None,
            first_ttl: 1,
            max_ttl: 64,
            tos: 0,
            packet_size: 54,
            max_retries_per_hop: 3,
            per_probe_timeout: Duration::from_millis(500),
        }
    }
}

impl ProbeConfig {
    /// Validates the parameters.
    pub fn validate(&self) -> Result<(), TracerouteError> {
        if self.first_ttl == 0 || self.first_ttl > self.max_ttl {
            return Err(TracerouteError::InvalidTtlRange {
                first_ttl: self.first_ttl,
                max_ttl: self.max_ttl,
            });
        }
        // Without a family, only the looser IPv6 bound is known here.
        let max_packet_size = self
            .address_family
            .map_or(MAX_IPV6_PAYLOAD, AddressFamily::max_packet_size);
        if self.packet_size < ICMP_HEADER_SIZE || self.packet_size > max_packet_size {
            return Err(TracerouteError::InvalidPacketSize(self.packet_size));
        }
        if self.per_probe_timeout.is_zero() {
            return Err(TracerouteError::InvalidTimeout);
        }
        if let (Some(family), Some(source)) = (self.address_family, self.source) {
            if !family.matches(source) {
                return Err(TracerouteError::AddressFamilyMismatch {
                    expected: family,
                    actual: source,
                });
            }
        }
        Ok(())
    }

    /// Resolves the address family used to reach `destination`.
    ///
    /// Fails when an explicit family or the source address disagrees with the
    /// destination, or when `packet_size` does not fit that family's datagrams.
    pub fn family_for(&self, destination: IpAddr) -> Result<AddressFamily, TracerouteError> {
        let family = AddressFamily::of(destination);
        if let Some(expected) = self.address_family {
            if expected != family {
                return Err(TracerouteError::AddressFamilyMismatch {
                    expected,
                    actual: destination,
                });
            }
        }
        if let Some(source) = self.source {
            if !family.matches(source) {
                return Err(TracerouteError::AddressFamilyMismatch {
                    expected: family,
                    actual: source,
                });
            }
        }
        if self.packet_size > family.max_packet_size() {
            return Err(TracerouteError::InvalidPacketSize(self.packet_size));
        }
        Ok(family)
    }
}

/// Serde helper for durations stored as whole milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
