//! ICMP Echo packet construction and reply parsing using pnet.
//!
//! All functions work on bare ICMP messages. The outer IP header of a
//! received packet is expected to be stripped already.

use hoptrace_core::{AddressFamily, ProbeIdentity, ReplyMatch, TracerouteError, ICMP_HEADER_SIZE};
use pnet_packet::icmp::echo_reply::EchoReplyPacket;
use pnet_packet::icmp::echo_request::MutableEchoRequestPacket;
use pnet_packet::icmp::{IcmpCode, IcmpPacket, IcmpType, IcmpTypes};
use pnet_packet::icmpv6::Icmpv6Types;
use pnet_packet::ip::{IpNextHeaderProtocol, IpNextHeaderProtocols};
use pnet_packet::ipv4::Ipv4Packet;
use pnet_packet::ipv6::Ipv6Packet;
use tracing::trace;

/// Filler written into every probe's payload.
pub const PAYLOAD_PATTERN: &[u8] = b"HELLO-R-U-THERE";

/// Byte used to pad the payload past the end of [`PAYLOAD_PATTERN`].
pub const PAYLOAD_PADDING: u8 = 0x01;

/// Time-Exceeded code for a TTL (ICMPv4) or hop limit (ICMPv6) that expired
/// in transit. Code 1, fragment reassembly timeout, says nothing about a hop.
const EXCEEDED_IN_TRANSIT: u8 = 0;

const IPV4_MIN_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// ICMP message types used for tracing, per address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EchoTypes {
    pub request: u8,
    pub reply: u8,
    pub time_exceeded: u8,
}

impl EchoTypes {
    pub const V4: EchoTypes = EchoTypes {
        request: IcmpTypes::EchoRequest.0,
        reply: IcmpTypes::EchoReply.0,
        time_exceeded: IcmpTypes::TimeExceeded.0,
    };

    pub const V6: EchoTypes = EchoTypes {
        request: Icmpv6Types::EchoRequest.0,
        reply: Icmpv6Types::EchoReply.0,
        time_exceeded: Icmpv6Types::TimeExceeded.0,
    };

    pub fn for_family(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => Self::V4,
            AddressFamily::V6 => Self::V6,
        }
    }
}

/// Builds an ICMP Echo Request that is exactly `packet_size` bytes long.
///
/// The ICMPv4 checksum is filled in. The ICMPv6 checksum is left zero since
/// it covers a pseudo-header only the kernel knows.
pub fn build_echo_request(
    family: AddressFamily,
    identity: ProbeIdentity,
    packet_size: usize,
) -> Result<Vec<u8>, TracerouteError> {
    if packet_size < ICMP_HEADER_SIZE {
        return Err(TracerouteError::PacketTooSmall {
            minimum: ICMP_HEADER_SIZE,
            requested: packet_size,
        });
    }

    let mut buffer = vec![0u8; packet_size];
    {
        let mut echo = MutableEchoRequestPacket::new(&mut buffer)
            .ok_or_else(|| TracerouteError::Internal("Failed to create ICMP packet".to_string()))?;

        echo.set_icmp_type(IcmpType::new(EchoTypes::for_family(family).request));
        echo.set_icmp_code(IcmpCode::new(0));
        echo.set_identifier(identity.identifier);
        echo.set_sequence_number(identity.sequence);
    }
    fill_payload(&mut buffer[ICMP_HEADER_SIZE..]);

    if family == AddressFamily::V4 {
        let icmp_view = IcmpPacket::new(&buffer)
            .ok_or_else(|| TracerouteError::Internal("Failed to create ICMP view".to_string()))?;
        let checksum = pnet_packet::icmp::checksum(&icmp_view);
        buffer[2..4].copy_from_slice(&checksum.to_be_bytes());
    }

    Ok(buffer)
}

/// Writes the payload pattern, truncated or padded to fill `payload`.
fn fill_payload(payload: &mut [u8]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = PAYLOAD_PATTERN.get(i).copied().unwrap_or(PAYLOAD_PADDING);
    }
}

/// Decides whether `bytes` answer the probe carrying `identity`.
///
/// An Echo Reply matches if it echoes the identity. A Time-Exceeded for an
/// expired TTL matches if the datagram it quotes is an Echo Request carrying
/// the identity. Everything
/// else, including truncated or garbled messages, is [`ReplyMatch::NoMatch`].
pub fn classify_reply(family: AddressFamily, bytes: &[u8], identity: ProbeIdentity) -> ReplyMatch {
    let types = EchoTypes::for_family(family);
    let Some(icmp) = IcmpPacket::new(bytes) else {
        return ReplyMatch::NoMatch;
    };
    let icmp_type = icmp.get_icmp_type().0;

    if icmp_type == types.reply {
        if parse_echo(bytes, types.reply) == Some(identity) {
            return ReplyMatch::EchoReply;
        }
    } else if icmp_type == types.time_exceeded {
        let code = icmp.get_icmp_code().0;
        if code != EXCEEDED_IN_TRANSIT {
            trace!(icmp_code = code, "Ignoring Time-Exceeded that is not a hop expiry");
            return ReplyMatch::NoMatch;
        }
        let quoted = bytes
            .get(ICMP_HEADER_SIZE..)
            .and_then(|payload| embedded_icmp(family, payload));
        if quoted.and_then(|icmp| parse_echo(icmp, types.request)) == Some(identity) {
            return ReplyMatch::TimeExceeded;
        }
    } else {
        trace!(icmp_type = icmp_type, "Ignoring unrelated ICMP message");
    }

    ReplyMatch::NoMatch
}

/// Reads the identifier and sequence of an echo message of `expected_type`.
///
/// Echo Request and Echo Reply share a layout in both ICMPv4 and ICMPv6.
fn parse_echo(bytes: &[u8], expected_type: u8) -> Option<ProbeIdentity> {
    let echo = EchoReplyPacket::new(bytes)?;
    if echo.get_icmp_type().0 != expected_type {
        return None;
    }
    Some(ProbeIdentity::new(
        echo.get_identifier(),
        echo.get_sequence_number(),
    ))
}

/// Returns the ICMP message inside an IP datagram quoted by an ICMP error.
fn embedded_icmp(family: AddressFamily, quoted: &[u8]) -> Option<&[u8]> {
    match family {
        AddressFamily::V4 => embedded_icmp_v4(quoted),
        AddressFamily::V6 => embedded_icmp_v6(quoted),
    }
}

fn embedded_icmp_v4(quoted: &[u8]) -> Option<&[u8]> {
    let ip = Ipv4Packet::new(quoted)?;
    if ip.get_version() != 4 {
        return None;
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < IPV4_MIN_HEADER_LEN || ip.get_next_level_protocol() != IpNextHeaderProtocols::Icmp
    {
        return None;
    }
    quoted.get(header_len..)
}

fn embedded_icmp_v6(quoted: &[u8]) -> Option<&[u8]> {
    let ip = Ipv6Packet::new(quoted)?;
    if ip.get_version() != 6 {
        return None;
    }
    let offset = skip_ipv6_extension_headers(quoted, ip.get_next_header())?;
    quoted.get(offset..)
}

/// Walks IPv6 extension headers and returns the offset of the ICMPv6 message.
///
/// Fragments are rejected: a quoted fragment can't be matched to a probe.
fn skip_ipv6_extension_headers(data: &[u8], first: IpNextHeaderProtocol) -> Option<usize> {
    let mut next_header = first;
    let mut offset = IPV6_HEADER_LEN;

    loop {
        match next_header {
            IpNextHeaderProtocols::Icmpv6 => return Some(offset),
            IpNextHeaderProtocols::Hopopt
            | IpNextHeaderProtocols::Ipv6Route
            | IpNextHeaderProtocols::Ipv6Opts => {
                // Next Header, then length in 8-octet units not counting the first 8.
                let header = data.get(offset..offset + 2)?;
                next_header = IpNextHeaderProtocol::new(header[0]);
                offset += (header[1] as usize + 1) * 8;
                if offset > data.len() {
                    return None;
                }
            }
            _ => return None,
        }
    }
}
