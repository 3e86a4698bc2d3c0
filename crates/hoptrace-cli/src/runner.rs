//! Traceroute runner: resolves the target, drives the tracer, prints hops.

use hickory_resolver::TokioAsyncResolver;
use hoptrace_core::{AddressFamily, Hop, ProbeConfig, Tracer, TracerouteError, TracerouteResult};
use hoptrace_icmp::IcmpCodec;
use hoptrace_packets::IcmpTransport;
use std::collections::HashMap;
use std::net::IpAddr;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How results are presented.
#[derive(Debug, Clone, Copy, Default)]
pub struct Output {
    /// Print the final result as JSON instead of live hop lines.
    pub json: bool,
    /// Look up PTR names for responding hops.
    pub reverse_dns: bool,
}

/// Resolve a hostname to an IP address.
///
/// With a `family`, only addresses of that family are acceptable. Without
/// one, IPv4 is preferred.
pub async fn resolve_hostname(
    hostname: &str,
    family: Option<AddressFamily>,
) -> Result<IpAddr, TracerouteError> {
    // First check if it's already an IP address
    if let Ok(ip) = hostname.parse::<IpAddr>() {
        return match family {
            Some(expected) if !expected.matches(ip) => {
                Err(TracerouteError::AddressFamilyMismatch {
                    expected,
                    actual: ip,
                })
            }
            _ => Ok(ip),
        };
    }

    let resolver = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
        TracerouteError::DnsResolutionFailed {
            hostname: hostname.to_string(),
            reason: format!("failed to create DNS resolver: {}", e),
        }
    })?;

    let lookup = resolver
        .lookup_ip(hostname)
        .await
        .map_err(|e| TracerouteError::DnsResolutionFailed {
            hostname: hostname.to_string(),
            reason: e.to_string(),
        })?;

    select_address(lookup.iter(), family).ok_or_else(|| TracerouteError::DnsResolutionFailed {
        hostname: hostname.to_string(),
        reason: match family {
            Some(family) => format!("no {} address found", family),
            None => "no addresses found".to_string(),
        },
    })
}

/// Picks the address to trace from a resolver answer.
fn select_address(
    addrs: impl Iterator<Item = IpAddr>,
    family: Option<AddressFamily>,
) -> Option<IpAddr> {
    let addrs: Vec<IpAddr> = addrs.collect();
    match family {
        Some(family) => addrs.into_iter().find(|ip| family.matches(*ip)),
        None => addrs
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| addrs.first())
            .copied(),
    }
}

/// Cached reverse DNS lookups.
struct ReverseNames {
    resolver: TokioAsyncResolver,
    names: HashMap<IpAddr, Option<String>>,
}

impl ReverseNames {
    fn new() -> Option<Self> {
        match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => Some(Self {
                resolver,
                names: HashMap::new(),
            }),
            Err(e) => {
                warn!("Failed to create DNS resolver for reverse lookup: {}", e);
                None
            }
        }
    }

    async fn lookup(&mut self, ip: IpAddr) -> Option<String> {
        if let Some(name) = self.names.get(&ip) {
            return name.clone();
        }

        let name = match self.resolver.reverse_lookup(ip).await {
            Ok(names) => names
                .iter()
                .next()
                .map(|name| name.to_string().trim_end_matches('.').to_string()),
            Err(e) => {
                // Reverse DNS not available for this IP
                debug!(ip = %ip, error = %e, "Reverse lookup failed");
                None
            }
        };
        self.names.insert(ip, name.clone());
        name
    }
}

/// Formats one hop as a line of output.
pub fn format_hop(hop: &Hop, name: Option<&str>) -> String {
    match (hop.from, hop.rtt_ms()) {
        (Some(ip), Some(rtt)) if hop.success => match name {
            Some(name) => format!("{:>3}  {} ({})  {:.3} ms", hop.ttl, name, ip, rtt),
            None => format!("{:>3}  {}  {:.3} ms", hop.ttl, ip, rtt),
        },
        _ => format!("{:>3}  *", hop.ttl),
    }
}

/// Run a traceroute to `target`, printing hops as they resolve.
pub async fn run_traceroute(
    target: &str,
    config: ProbeConfig,
    output: Output,
    cancel: CancellationToken,
) -> Result<TracerouteResult, TracerouteError> {
    let destination = resolve_hostname(target, config.address_family).await?;
    info!(
        target = %target,
        destination = %destination,
        first_ttl = config.first_ttl,
        max_ttl = config.max_ttl,
        "Starting traceroute"
    );

    if !output.json {
        println!(
            "traceroute to {} ({}), {} hops max, {} byte packets",
            target, destination, config.max_ttl, config.packet_size
        );
    }

    let mut names = if output.reverse_dns && !output.json {
        ReverseNames::new()
    } else {
        None
    };

    let tracer = Tracer::new(
        IcmpTransport::new(),
        IcmpCodec::for_destination(destination),
        config,
    )?;
    let (mut hops, handle) = tracer.spawn(destination, cancel);

    while let Some(hop) = hops.recv().await {
        if output.json {
            continue;
        }
        let name = match (names.as_mut(), hop.from) {
            (Some(names), Some(ip)) => names.lookup(ip).await,
            _ => None,
        };
        println!("{}", format_hop(&hop, name.as_deref()));
    }

    let result = handle
        .await
        .map_err(|e| TracerouteError::Internal(format!("traceroute task failed: {}", e)))??;

    info!(
        destination = %destination,
        hops = result.hops.len(),
        reached = result.destination_reached,
        "Traceroute finished"
    );
    Ok(result)
}
