//! Raw ICMP socket connection.

use async_trait::async_trait;
use hoptrace_core::{AddressFamily, ProbeConnection, Received, TracerouteError};
use pnet_packet::ipv4::Ipv4Packet;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;
use tracing::{debug, trace};

/// A raw ICMP (or ICMPv6) socket registered with the tokio reactor.
///
/// Received ICMPv4 messages are returned without their IPv4 header, so both
/// families hand the codec a bare ICMP message.
pub struct RawIcmpConnection {
    socket: AsyncFd<Socket>,
    family: AddressFamily,
}

impl RawIcmpConnection {
    /// Opens a raw socket for `family`, bound to `source` if one is given.
    ///
    /// Requires `CAP_NET_RAW` (or root) on Linux.
    pub fn open(family: AddressFamily, source: Option<IpAddr>) -> Result<Self, TracerouteError> {
        let (domain, protocol) = match family {
            AddressFamily::V4 => (Domain::IPV4, Protocol::ICMPV4),
            AddressFamily::V6 => (Domain::IPV6, Protocol::ICMPV6),
        };

        let socket =
            Socket::new(domain, Type::RAW, Some(protocol)).map_err(TracerouteError::SocketCreation)?;
        socket
            .set_nonblocking(true)
            .map_err(|source| TracerouteError::SocketOption {
                option: "O_NONBLOCK",
                source,
            })?;

        if let Some(addr) = source {
            socket
                .bind(&SockAddr::from(SocketAddr::new(addr, 0)))
                .map_err(|source| TracerouteError::SocketBind { addr, source })?;
        }

        let socket = AsyncFd::new(socket).map_err(TracerouteError::SocketCreation)?;
        debug!(family = %family, source = ?source, "Opened raw ICMP socket");

        Ok(Self { socket, family })
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    async fn recv_once(&self, buf: &mut [u8]) -> Result<Received, TracerouteError> {
        loop {
            let mut guard = self
                .socket
                .readable()
                .await
                .map_err(TracerouteError::ReceiveFailed)?;

            let result = guard.try_io(|inner| {
                // SAFETY: `recv_from` only writes initialized bytes into the
                // buffer, and a `u8` slice is always initialized already.
                let uninit = unsafe { &mut *(&mut *buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
                inner.get_ref().recv_from(uninit)
            });

            let (len, addr) = match result {
                Ok(Ok(received)) => received,
                Ok(Err(e)) => return Err(TracerouteError::ReceiveFailed(e)),
                Err(_would_block) => continue,
            };
            let len = len.min(buf.len());

            let from = addr.as_socket().map(|a| a.ip()).ok_or_else(|| {
                TracerouteError::MalformedPacket("datagram without an IP source".to_string())
            })?;

            let len = match self.family {
                AddressFamily::V4 => {
                    let offset = ipv4_payload_offset(&buf[..len])?;
                    buf.copy_within(offset..len, 0);
                    len - offset
                }
                // The kernel never passes the IPv6 header to raw ICMPv6 sockets.
                AddressFamily::V6 => len,
            };

            trace!(from = %from, len = len, "Received ICMP message");
            return Ok(Received { len, from });
        }
    }
}

#[async_trait]
impl ProbeConnection for RawIcmpConnection {
    fn set_ttl_and_tos(&self, ttl: u8, tos: u8) -> Result<(), TracerouteError> {
        let socket = self.socket.get_ref();
        match self.family {
            AddressFamily::V4 => {
                socket
                    .set_ttl(u32::from(ttl))
                    .map_err(|source| TracerouteError::SocketOption {
                        option: "IP_TTL",
                        source,
                    })?;
                socket
                    .set_tos(u32::from(tos))
                    .map_err(|source| TracerouteError::SocketOption {
                        option: "IP_TOS",
                        source,
                    })?;
            }
            AddressFamily::V6 => {
                socket
                    .set_unicast_hops_v6(u32::from(ttl))
                    .map_err(|source| TracerouteError::SocketOption {
                        option: "IPV6_UNICAST_HOPS",
                        source,
                    })?;
                socket
                    .set_tclass_v6(u32::from(tos))
                    .map_err(|source| TracerouteError::SocketOption {
                        option: "IPV6_TCLASS",
                        source,
                    })?;
            }
        }
        Ok(())
    }

    async fn send_to(&self, packet: &[u8], destination: IpAddr) -> Result<usize, TracerouteError> {
        let addr = SockAddr::from(SocketAddr::new(destination, 0));
        loop {
            let mut guard = self
                .socket
                .writable()
                .await
                .map_err(TracerouteError::WriteFailed)?;

            match guard.try_io(|inner| inner.get_ref().send_to(packet, &addr)) {
                Ok(result) => return result.map_err(TracerouteError::WriteFailed),
                Err(_would_block) => continue,
            }
        }
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<Option<Received>, TracerouteError> {
        match tokio::time::timeout_at(deadline, self.recv_once(buf)).await {
            Ok(received) => received.map(Some),
            Err(_elapsed) => Ok(None),
        }
    }
}

/// Returns the offset of the payload of an IPv4 packet.
fn ipv4_payload_offset(packet: &[u8]) -> Result<usize, TracerouteError> {
    let ip = Ipv4Packet::new(packet)
        .ok_or_else(|| TracerouteError::MalformedPacket("truncated IPv4 header".to_string()))?;
    if ip.get_version() != 4 {
        return Err(TracerouteError::MalformedPacket(format!(
            "unexpected IP version {}",
            ip.get_version()
        )));
    }
    let header_len = ip.get_header_length() as usize * 4;
    if header_len < 20 || header_len > packet.len() {
        return Err(TracerouteError::MalformedPacket(format!(
            "invalid IPv4 header length {header_len}"
        )));
    }
    Ok(header_len)
}
