//! End-to-end runs of the tracer with real ICMP packets and a scripted network.

use async_trait::async_trait;
use hoptrace_core::{
    AddressFamily, Hop, ProbeConfig, ProbeConnection, Received, Tracer, TracerouteError,
    TracerouteResult, Transport,
};
use hoptrace_icmp::{build_echo_request, IcmpCodec};
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const IDENTIFIER: u16 = 0x4242;
const TIMEOUT: Duration = Duration::from_millis(500);

const DESTINATION: IpAddr = IpAddr::V4(Ipv4Addr::new(203, 0, 113, 9));
const SOURCE: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 10);
const ROUTER_A: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1));
const ROUTER_B: IpAddr = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 1));

/// What the simulated network does with one probe.
enum Response {
    Reply {
        from: IpAddr,
        bytes: Vec<u8>,
        after: Duration,
    },
    Silent,
    SendError,
}

/// A probe as seen by the simulated network.
#[derive(Debug, Clone)]
struct SentProbe {
    ttl: u8,
    tos: u8,
    packet: Vec<u8>,
}

impl SentProbe {
    fn sequence(&self) -> u16 {
        u16::from_be_bytes([self.packet[6], self.packet[7]])
    }

    fn identifier(&self) -> u16 {
        u16::from_be_bytes([self.packet[4], self.packet[5]])
    }
}

type Script = dyn Fn(&SentProbe) -> Response + Send + Sync;

struct Pending {
    ready_at: Instant,
    from: IpAddr,
    bytes: Vec<u8>,
}

struct ScriptedConnection {
    options: Mutex<(u8, u8)>,
    script: Box<Script>,
    sent: Mutex<Vec<SentProbe>>,
    inbox: Mutex<VecDeque<Pending>>,
}

#[async_trait]
impl ProbeConnection for ScriptedConnection {
    fn set_ttl_and_tos(&self, ttl: u8, tos: u8) -> Result<(), TracerouteError> {
        *self.options.lock().unwrap() = (ttl, tos);
        Ok(())
    }

    async fn send_to(&self, packet: &[u8], destination: IpAddr) -> Result<usize, TracerouteError> {
        assert_eq!(destination, DESTINATION);
        let (ttl, tos) = *self.options.lock().unwrap();
        let probe = SentProbe {
            ttl,
            tos,
            packet: packet.to_vec(),
        };
        let response = (self.script)(&probe);
        self.sent.lock().unwrap().push(probe);

        match response {
            Response::Reply { from, bytes, after } => {
                self.inbox.lock().unwrap().push_back(Pending {
                    ready_at: Instant::now() + after,
                    from,
                    bytes,
                });
                Ok(packet.len())
            }
            Response::Silent => Ok(packet.len()),
            Response::SendError => Err(TracerouteError::WriteFailed(std::io::Error::from(
                std::io::ErrorKind::PermissionDenied,
            ))),
        }
    }

    async fn recv_from(
        &self,
        buf: &mut [u8],
        deadline: Instant,
    ) -> Result<Option<Received>, TracerouteError> {
        let next_ready = self.inbox.lock().unwrap().front().map(|p| p.ready_at);
        match next_ready {
            Some(ready_at) if ready_at <= deadline => {
                tokio::time::sleep_until(ready_at).await;
                let pending = self.inbox.lock().unwrap().pop_front();
                match pending {
                    Some(pending) => {
                        // Like a datagram socket, drop what doesn't fit.
                        let len = pending.bytes.len().min(buf.len());
                        buf[..len].copy_from_slice(&pending.bytes[..len]);
                        Ok(Some(Received {
                            len,
                            from: pending.from,
                        }))
                    }
                    None => Ok(None),
                }
            }
            _ => {
                tokio::time::sleep_until(deadline).await;
                Ok(None)
            }
        }
    }
}

#[derive(Clone)]
struct ScriptedTransport {
    conn: Arc<ScriptedConnection>,
}

impl ScriptedTransport {
    fn new(script: impl Fn(&SentProbe) -> Response + Send + Sync + 'static) -> Self {
        Self {
            conn: Arc::new(ScriptedConnection {
                options: Mutex::new((0, 0)),
                script: Box::new(script),
                sent: Mutex::new(Vec::new()),
                inbox: Mutex::new(VecDeque::new()),
            }),
        }
    }

    fn sent(&self) -> Vec<SentProbe> {
        self.conn.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Connection = ScriptedConnection;

    async fn acquire_connection(
        &self,
        _config: &ProbeConfig,
        family: AddressFamily,
    ) -> Result<Arc<ScriptedConnection>, TracerouteError> {
        assert_eq!(family, AddressFamily::V4);
        Ok(self.conn.clone())
    }
}

/// Time-Exceeded from a router, quoting the probe's IP header and ICMP message.
fn time_exceeded(probe: &SentProbe) -> Vec<u8> {
    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[1] = probe.tos;
    ip[2..4].copy_from_slice(&((20 + probe.packet.len()) as u16).to_be_bytes());
    ip[8] = 1;
    ip[9] = 1;
    ip[12..16].copy_from_slice(&SOURCE.octets());
    if let IpAddr::V4(dst) = DESTINATION {
        ip[16..20].copy_from_slice(&dst.octets());
    }

    let mut msg = vec![11, 0, 0, 0, 0, 0, 0, 0];
    msg.extend_from_slice(&ip);
    msg.extend_from_slice(&probe.packet);
    msg
}

/// Echo Reply from the destination, echoing the probe.
fn echo_reply(probe: &SentProbe) -> Vec<u8> {
    let mut msg = probe.packet.clone();
    msg[0] = 0;
    msg
}

fn reply(from: IpAddr, bytes: Vec<u8>, after_ms: u64) -> Response {
    Response::Reply {
        from,
        bytes,
        after: Duration::from_millis(after_ms),
    }
}

fn config(first_ttl: u8, max_ttl: u8, retries: u32) -> ProbeConfig {
    ProbeConfig {
        first_ttl,
        max_ttl,
        max_retries_per_hop: retries,
        per_probe_timeout: TIMEOUT,
        ..Default::default()
    }
}

async fn trace(
    transport: &ScriptedTransport,
    config: ProbeConfig,
) -> (Result<TracerouteResult, TracerouteError>, Vec<Hop>) {
    let tracer = Tracer::new(transport.clone(), IcmpCodec::new(AddressFamily::V4), config)
        .unwrap()
        .with_identifier(IDENTIFIER);
    let (tx, mut rx) = mpsc::channel(1);
    let cancel = CancellationToken::new();

    let run = tracer.run(DESTINATION, tx, &cancel);
    let collect = async {
        let mut hops = Vec::new();
        while let Some(hop) = rx.recv().await {
            hops.push(hop);
        }
        hops
    };
    tokio::join!(run, collect)
}

/// Three-hop path: two routers, then the destination.
fn three_hop_path(probe: &SentProbe) -> Response {
    match probe.ttl {
        1 => reply(ROUTER_A, time_exceeded(probe), 5),
        2 => reply(ROUTER_B, time_exceeded(probe), 12),
        _ => reply(DESTINATION, echo_reply(probe), 20),
    }
}

#[tokio::test(start_paused = true)]
async fn test_reaches_destination() {
    let transport = ScriptedTransport::new(three_hop_path);

    let (result, streamed) = trace(&transport, config(1, 3, 3)).await;
    let result = result.unwrap();

    assert!(result.destination_reached);
    assert_eq!(result.destination, DESTINATION);
    assert_eq!(result.hops.len(), 3);
    assert!(result.hops.iter().all(|h| h.success));

    let from: Vec<_> = result.hops.iter().map(|h| h.from.unwrap()).collect();
    assert_eq!(from, vec![ROUTER_A, ROUTER_B, DESTINATION]);

    let rtts: Vec<_> = result.hops.iter().map(|h| h.elapsed.unwrap()).collect();
    assert_eq!(
        rtts,
        vec![
            Duration::from_millis(5),
            Duration::from_millis(12),
            Duration::from_millis(20)
        ]
    );

    // Time-Exceeded quotes 20 IP bytes plus the 54-byte probe.
    assert_eq!(result.hops[0].bytes_received, 8 + 20 + 54);
    assert_eq!(result.hops[2].bytes_received, 54);

    // Hops were streamed live, in order, and match the summary.
    assert_eq!(streamed, result.hops);

    // Nothing was sent past the destination.
    let ttls: Vec<u8> = transport.sent().iter().map(|p| p.ttl).collect();
    assert_eq!(ttls, vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn test_stops_at_destination_before_max_ttl() {
    let transport = ScriptedTransport::new(three_hop_path);

    let (result, _) = trace(&transport, config(1, 30, 3)).await;
    let result = result.unwrap();

    assert!(result.destination_reached);
    assert_eq!(result.hops.len(), 3);
    assert_eq!(transport.sent().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_silent_hop_fails_after_retries() {
    let transport = ScriptedTransport::new(|probe| match probe.ttl {
        1 => Response::Silent,
        _ => reply(DESTINATION, echo_reply(probe), 3),
    });

    let start = Instant::now();
    let (result, _) = trace(&transport, config(1, 2, 1)).await;
    let result = result.unwrap();

    assert_eq!(result.hops.len(), 2);
    let failed = &result.hops[0];
    assert_eq!(failed.ttl, 1);
    assert!(!failed.success);
    assert_eq!(failed.from, None);
    assert_eq!(failed.elapsed, None);
    assert_eq!(failed.error, None);

    assert_eq!(result.hops[1].ttl, 2);
    assert!(result.hops[1].success);

    // One send plus one retry at TTL 1, each waiting out the full timeout.
    let ttls: Vec<u8> = transport.sent().iter().map(|p| p.ttl).collect();
    assert_eq!(ttls, vec![1, 1, 2]);
    assert_eq!(
        start.elapsed(),
        TIMEOUT * 2 + Duration::from_millis(3)
    );
}

#[tokio::test(start_paused = true)]
async fn test_stale_reply_is_ignored() {
    // The first probe's reply arrives after its deadline, during the retry.
    let transport = ScriptedTransport::new(|probe| match (probe.ttl, probe.sequence()) {
        (1, 1) => reply(ROUTER_A, time_exceeded(probe), 600),
        (1, 2) => Response::Silent,
        (1, _) => reply(ROUTER_A, time_exceeded(probe), 7),
        _ => reply(DESTINATION, echo_reply(probe), 1),
    });

    let (result, _) = trace(&transport, config(1, 2, 3)).await;
    let result = result.unwrap();

    // The stale reply counted for nothing: TTL 1 needed a third attempt.
    let sequences: Vec<u16> = transport
        .sent()
        .iter()
        .filter(|p| p.ttl == 1)
        .map(SentProbe::sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let hop = &result.hops[0];
    assert!(hop.success);
    assert_eq!(hop.from, Some(ROUTER_A));
    assert_eq!(hop.elapsed, Some(Duration::from_millis(7)));
}

#[tokio::test(start_paused = true)]
async fn test_probe_identities() {
    let transport = ScriptedTransport::new(|probe| match probe.ttl {
        1 | 3 => Response::Silent,
        _ => reply(ROUTER_B, time_exceeded(probe), 2),
    });

    let (result, _) = trace(&transport, config(1, 3, 2)).await;
    assert_eq!(result.unwrap().hops.len(), 3);

    let sent = transport.sent();
    // 3 attempts at TTL 1, 1 at TTL 2, 3 at TTL 3.
    assert_eq!(sent.len(), 7);
    for (i, probe) in sent.iter().enumerate() {
        assert_eq!(probe.identifier(), IDENTIFIER);
        assert_eq!(probe.sequence(), i as u16 + 1);
        assert_eq!(probe.packet.len(), 54);
        assert_eq!(probe.tos, 0);
    }
}

#[tokio::test(start_paused = true)]
async fn test_tos_and_packet_size_applied() {
    let transport = ScriptedTransport::new(three_hop_path);
    let config = ProbeConfig {
        tos: 0x10,
        packet_size: 100,
        ..config(1, 3, 0)
    };

    let (result, _) = trace(&transport, config).await;
    result.unwrap();

    for probe in transport.sent() {
        assert_eq!(probe.tos, 0x10);
        assert_eq!(probe.packet.len(), 100);
        assert_eq!(
            probe.packet,
            build_echo_request(
                AddressFamily::V4,
                hoptrace_core::ProbeIdentity::new(IDENTIFIER, probe.sequence()),
                100
            )
            .unwrap()
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_jumbo_packets_received_whole() {
    let transport = ScriptedTransport::new(|probe| match probe.ttl {
        1 => reply(ROUTER_A, time_exceeded(probe), 2),
        _ => reply(DESTINATION, echo_reply(probe), 5),
    });
    let config = ProbeConfig {
        packet_size: 3000,
        ..config(1, 4, 0)
    };

    let (result, _) = trace(&transport, config).await;
    let result = result.unwrap();

    assert!(result.destination_reached);
    assert_eq!(result.hops.len(), 2);
    // The router quotes the IP header and the whole request.
    assert_eq!(result.hops[0].bytes_received, 8 + 20 + 3000);
    assert_eq!(result.hops[1].bytes_received, 3000);
}

#[tokio::test(start_paused = true)]
async fn test_max_ttl_exhausted() {
    let transport = ScriptedTransport::new(|probe| {
        reply(ROUTER_A, time_exceeded(probe), 1)
    });

    let (result, streamed) = trace(&transport, config(3, 6, 0)).await;
    let result = result.unwrap();

    assert!(!result.destination_reached);
    let ttls: Vec<u8> = result.hops.iter().map(|h| h.ttl).collect();
    assert_eq!(ttls, vec![3, 4, 5, 6]);
    assert_eq!(streamed.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_reply_from_router_never_marks_destination() {
    // A router answering with an Echo Reply isn't the destination.
    let transport = ScriptedTransport::new(|probe| {
        reply(ROUTER_A, echo_reply(probe), 1)
    });

    let (result, _) = trace(&transport, config(1, 2, 0)).await;
    let result = result.unwrap();

    assert!(!result.destination_reached);
    assert_eq!(result.hops.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_send_failures_recorded_on_hop() {
    let transport = ScriptedTransport::new(|probe| match probe.ttl {
        1 => Response::SendError,
        _ => reply(DESTINATION, echo_reply(probe), 4),
    });

    let (result, _) = trace(&transport, config(1, 4, 2)).await;
    let result = result.unwrap();

    assert_eq!(result.hops.len(), 2);
    assert!(!result.hops[0].success);
    assert_eq!(
        result.hops[0].error.as_deref(),
        Some("Write failed: permission denied")
    );
    assert!(result.destination_reached);

    let ttls: Vec<u8> = transport.sent().iter().map(|p| p.ttl).collect();
    assert_eq!(ttls, vec![1, 1, 1, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_identical_runs_produce_identical_results() {
    let script = |probe: &SentProbe| match (probe.ttl, probe.sequence() % 2) {
        (1, _) => reply(ROUTER_A, time_exceeded(probe), 4),
        (2, 0) => Response::Silent,
        (2, _) => reply(ROUTER_B, time_exceeded(probe), 9),
        _ => reply(DESTINATION, echo_reply(probe), 15),
    };

    let first = ScriptedTransport::new(script);
    let second = ScriptedTransport::new(script);

    let (a, _) = trace(&first, config(1, 5, 3)).await;
    let (b, _) = trace(&second, config(1, 5, 3)).await;
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert_eq!(a.to_json().unwrap(), b.to_json().unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_mid_run() {
    let transport = ScriptedTransport::new(|probe| match probe.ttl {
        1 => reply(ROUTER_A, time_exceeded(probe), 2),
        _ => Response::Silent,
    });
    let tracer = Tracer::new(
        transport.clone(),
        IcmpCodec::new(AddressFamily::V4),
        config(1, 30, 3),
    )
    .unwrap()
    .with_identifier(IDENTIFIER);

    let cancel = CancellationToken::new();
    let (mut rx, handle) = tracer.spawn(DESTINATION, cancel.clone());

    let first = rx.recv().await.unwrap();
    assert_eq!(first.ttl, 1);
    assert!(first.success);

    // TTL 2 is silent; cancel while the tracer waits on it.
    tokio::time::sleep(Duration::from_millis(100)).await;
    cancel.cancel();

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(TracerouteError::Cancelled)));
    // The stream closes with no further hops.
    assert!(rx.recv().await.is_none());
}
