//! ICMP Echo probes for hoptrace.
//!
//! Builds Echo Requests and recognizes the Echo Replies and Time-Exceeded
//! messages they provoke, for both ICMPv4 and ICMPv6.

mod codec;
mod packet;

pub use codec::IcmpCodec;
pub use packet::{
    build_echo_request, classify_reply, EchoTypes, PAYLOAD_PADDING, PAYLOAD_PATTERN,
};
