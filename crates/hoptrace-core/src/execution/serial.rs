//! Serial traceroute execution.
//!
//! Sends one probe at a time and waits for its reply (or the per-probe
//! deadline) before sending the next. Hops are therefore resolved, emitted and
//! recorded in strictly increasing TTL order.

use crate::{
    process_identifier, Hop, ProbeCodec, ProbeConfig, ProbeConnection, ProbeIdentity, ReplyMatch,
    TracerouteError, TracerouteResult, Transport, ICMP_HEADER_SIZE,
};
use std::net::IpAddr;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Smallest receive buffer, one standard-MTU datagram.
const MIN_RECV_BUFFER_SIZE: usize = 1500;

/// Room for the headers around a reply's echoed ICMP message: the outer IPv4
/// header with options, an ICMP error header, and the quoted IP header.
const RECV_HEADROOM: usize = 60 + ICMP_HEADER_SIZE + 60;

/// Sequence number of the first probe of a run.
const FIRST_SEQUENCE: u16 = 1;

/// A matching reply to the probe in flight.
#[derive(Debug, Clone, Copy)]
struct Reply {
    from: IpAddr,
    len: usize,
    kind: ReplyMatch,
    received_at: Instant,
}

/// Drives the TTL-stepping probe loop for one destination.
pub struct Tracer<T, C> {
    transport: T,
    codec: C,
    config: ProbeConfig,
    identifier: u16,
}

impl<T: Transport, C: ProbeCodec> Tracer<T, C> {
    /// Creates a tracer, rejecting invalid configurations up front.
    pub fn new(transport: T, codec: C, config: ProbeConfig) -> Result<Self, TracerouteError> {
        config.validate()?;
        Ok(Self {
            transport,
            codec,
            config,
            identifier: process_identifier(),
        })
    }

    /// Overrides the Echo identifier, which defaults to the process id.
    pub fn with_identifier(mut self, identifier: u16) -> Self {
        self.identifier = identifier;
        self
    }

    /// Traces the path to `destination`.
    ///
    /// Every hop is sent on `hops` as soon as it is resolved and also
    /// collected into the returned result. `hops` is dropped, closing the
    /// stream, whenever this returns. A full channel blocks the run until the
    /// consumer catches up; a closed one is ignored.
    pub async fn run(
        &self,
        destination: IpAddr,
        hops: mpsc::Sender<Hop>,
        cancel: &CancellationToken,
    ) -> Result<TracerouteResult, TracerouteError> {
        let family = self.config.family_for(destination)?;
        let conn = self
            .transport
            .acquire_connection(&self.config, family)
            .await?;

        let mut result = TracerouteResult::new(destination);
        let mut identity = ProbeIdentity::new(self.identifier, FIRST_SEQUENCE);
        let mut ttl = self.config.first_ttl;
        let mut retries = 0u32;
        let mut last_error: Option<String> = None;
        let mut buf = vec![0u8; recv_buffer_size(self.config.packet_size)];

        loop {
            if cancel.is_cancelled() {
                debug!(ttl = ttl, "Traceroute cancelled");
                return Err(TracerouteError::Cancelled);
            }

            conn.set_ttl_and_tos(ttl, self.config.tos)?;
            let packet = self
                .codec
                .build_echo_request(identity, self.config.packet_size)?;

            trace!(
                ttl = ttl,
                id = identity.identifier,
                seq = identity.sequence,
                "Sending probe"
            );
            let sent_at = Instant::now();
            let reply = match conn.send_to(&packet, destination).await {
                Ok(_) => {
                    let deadline = sent_at + self.config.per_probe_timeout;
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(ttl = ttl, "Traceroute cancelled while waiting for reply");
                            return Err(TracerouteError::Cancelled);
                        }
                        reply = self.await_reply(conn.as_ref(), &mut buf, identity, deadline) => reply?,
                    }
                }
                Err(e) if e.is_retryable() => {
                    warn!(ttl = ttl, seq = identity.sequence, error = %e, "Failed to send probe");
                    last_error = Some(e.to_string());
                    None
                }
                Err(e) => return Err(e),
            };

            let resolved = match reply {
                Some(reply) => {
                    let elapsed = reply.received_at.duration_since(sent_at);
                    debug!(
                        ttl = ttl,
                        ip = %reply.from,
                        kind = ?reply.kind,
                        rtt_ms = elapsed.as_secs_f64() * 1000.0,
                        "Received probe response"
                    );
                    if reply.from == destination {
                        result.destination_reached = true;
                    }
                    Some(Hop::reached(ttl, reply.from, reply.len, elapsed))
                }
                None => {
                    retries += 1;
                    if retries > self.config.max_retries_per_hop {
                        debug!(ttl = ttl, attempts = retries, "No response, giving up on hop");
                        Some(Hop::failed(ttl, last_error.take()))
                    } else {
                        trace!(ttl = ttl, attempt = retries, "No response, retrying");
                        None
                    }
                }
            };

            if let Some(hop) = resolved {
                emit(&hops, &mut result, hop).await;

                if result.destination_reached {
                    debug!(ttl = ttl, "Reached destination, stopping");
                    break;
                }
                if ttl >= self.config.max_ttl {
                    debug!(max_ttl = self.config.max_ttl, "Reached max TTL, stopping");
                    break;
                }
                ttl += 1;
                retries = 0;
                last_error = None;
            }

            identity = identity.next();
        }

        Ok(result)
    }

    /// Reads until a reply matching `identity` arrives or `deadline` passes.
    ///
    /// Replies to other probes, including stale ones from earlier attempts,
    /// are discarded.
    async fn await_reply(
        &self,
        conn: &T::Connection,
        buf: &mut [u8],
        identity: ProbeIdentity,
        deadline: Instant,
    ) -> Result<Option<Reply>, TracerouteError> {
        loop {
            let received = match conn.recv_from(buf, deadline).await {
                Ok(Some(received)) => received,
                Ok(None) | Err(TracerouteError::ReadTimeout) => return Ok(None),
                Err(e) if e.is_retryable() => {
                    trace!(error = %e, "Retryable error, continuing");
                    continue;
                }
                Err(e) => return Err(e),
            };

            let len = received.len.min(buf.len());
            let kind = self.codec.classify_reply(&buf[..len], identity);
            if kind.is_match() {
                return Ok(Some(Reply {
                    from: received.from,
                    len,
                    kind,
                    received_at: Instant::now(),
                }));
            }
            trace!(
                from = %received.from,
                seq = identity.sequence,
                "Ignored reply that did not match probe"
            );
        }
    }
}

impl<T, C> Tracer<T, C>
where
    T: Transport + 'static,
    C: ProbeCodec + 'static,
{
    /// Runs the trace on a background task.
    ///
    /// Returns the live hop stream and a handle resolving to the summary. The
    /// stream holds a single hop, so a consumer that stops reading pauses the
    /// run.
    pub fn spawn(
        self,
        destination: IpAddr,
        cancel: CancellationToken,
    ) -> (
        mpsc::Receiver<Hop>,
        JoinHandle<Result<TracerouteResult, TracerouteError>>,
    ) {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(async move { self.run(destination, tx, &cancel).await });
        (rx, handle)
    }
}

/// Size of a buffer that holds any reply to a `packet_size` probe whole.
fn recv_buffer_size(packet_size: usize) -> usize {
    packet_size
        .saturating_add(RECV_HEADROOM)
        .max(MIN_RECV_BUFFER_SIZE)
}

async fn emit(hops: &mpsc::Sender<Hop>, result: &mut TracerouteResult, hop: Hop) {
    if hops.send(hop.clone()).await.is_err() {
        trace!(ttl = hop.ttl, "Hop receiver closed");
    }
    result.hops.push(hop);
}
