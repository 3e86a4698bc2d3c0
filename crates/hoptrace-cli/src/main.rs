//! CLI for hoptrace.

mod runner;

use clap::Parser;
use hoptrace_core::{AddressFamily, Network, ProbeConfig, TracerouteError};
use std::net::IpAddr;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// hoptrace - trace the route to a host with ICMP Echo probes.
#[derive(Parser, Debug)]
#[command(name = "hoptrace")]
#[command(version)]
#[command(about = "Trace the route to a host with ICMP Echo probes")]
pub struct Args {
    /// Target hostname or IP address.
    #[arg(required = true)]
    pub target: String,

    /// TTL of the first probe.
    #[arg(short = 'f', long = "first-ttl", default_value = "1")]
    pub first_ttl: u8,

    /// Maximum TTL.
    #[arg(short = 'm', long = "max-ttl", default_value = "64")]
    pub max_ttl: u8,

    /// Type of service (traffic class for IPv6).
    #[arg(short = 't', long, default_value = "0")]
    pub tos: u8,

    /// Size of each ICMP message in bytes, header included.
    #[arg(short = 's', long = "packet-size", default_value = "54")]
    pub packet_size: usize,

    /// Retries per hop after the first probe goes unanswered.
    #[arg(short = 'q', long, default_value = "3")]
    pub queries: u32,

    /// Timeout per probe in milliseconds.
    #[arg(short = 'w', long, default_value = "500")]
    pub timeout: u64,

    /// Local address to send probes from.
    #[arg(short = 'i', long)]
    pub source: Option<IpAddr>,

    /// Network to probe over (ip, udp).
    #[arg(short = 'n', long, default_value = "ip")]
    pub network: String,

    /// Use IPv4 only.
    #[arg(short = '4', conflicts_with = "ipv6")]
    pub ipv4: bool,

    /// Use IPv6 only.
    #[arg(short = '6')]
    pub ipv6: bool,

    /// Perform reverse DNS lookups on responding hops.
    #[arg(long = "reverse-dns")]
    pub reverse_dns: bool,

    /// Print the result as JSON instead of hop lines.
    #[arg(long)]
    pub json: bool,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    /// Convert CLI args to a ProbeConfig.
    fn to_config(&self) -> Result<ProbeConfig, TracerouteError> {
        let network: Network = self.network.parse()?;

        let address_family = match (self.ipv4, self.ipv6) {
            (true, _) => Some(AddressFamily::V4),
            (_, true) => Some(AddressFamily::V6),
            _ => None,
        };

        let config = ProbeConfig {
            network,
            address_family,
            source: self.source,
            first_ttl: self.first_ttl,
            max_ttl: self.max_ttl,
            tos: self.tos,
            packet_size: self.packet_size,
            max_retries_per_hop: self.queries,
            per_probe_timeout: Duration::from_millis(self.timeout),
        };
        config.validate()?;
        Ok(config)
    }

    fn output(&self) -> runner::Output {
        runner::Output {
            json: self.json,
            reverse_dns: self.reverse_dns,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Logs go to stderr so stdout only carries results.
    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .with_writer(std::io::stderr)
        .init();

    let config = match args.to_config() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("Interrupted, cancelling traceroute");
                cancel.cancel();
            }
        });
    }

    match runner::run_traceroute(&args.target, config, args.output(), cancel).await {
        Ok(result) => {
            if args.json {
                match result.to_json() {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Failed to serialize results: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Err(TracerouteError::Cancelled) => {
            eprintln!("Traceroute cancelled");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Traceroute failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
