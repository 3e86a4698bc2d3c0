//! Result types for traceroute output.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::time::Duration;

/// Resolved outcome of one TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hop {
    /// The TTL this hop was probed with.
    pub ttl: u8,
    /// Whether a matching reply arrived before retries ran out.
    pub success: bool,
    /// The address that replied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from: Option<IpAddr>,
    /// Size of the matching reply.
    pub bytes_received: usize,
    /// Time from sending the matched probe to receiving its reply.
    #[serde(
        rename = "rtt_ms",
        default,
        skip_serializing_if = "Option::is_none",
        with = "optional_duration_ms"
    )]
    pub elapsed: Option<Duration>,
    /// Last send error seen while probing this TTL, if it failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Hop {
    /// A hop that was answered.
    pub fn reached(ttl: u8, from: IpAddr, bytes_received: usize, elapsed: Duration) -> Self {
        Self {
            ttl,
            success: true,
            from: Some(from),
            bytes_received,
            elapsed: Some(elapsed),
            error: None,
        }
    }

    /// A hop whose retries were exhausted without a matching reply.
    pub fn failed(ttl: u8, error: Option<String>) -> Self {
        Self {
            ttl,
            success: false,
            from: None,
            bytes_received: 0,
            elapsed: None,
            error,
        }
    }

    /// Round-trip time in milliseconds.
    pub fn rtt_ms(&self) -> Option<f64> {
        self.elapsed.map(|d| d.as_nanos() as f64 / 1_000_000.0)
    }
}

/// Summary of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracerouteResult {
    /// The address being traced.
    pub destination: IpAddr,
    /// One entry per TTL resolved, in increasing TTL order.
    pub hops: Vec<Hop>,
    /// Whether a matching reply came from the destination itself.
    pub destination_reached: bool,
}

impl TracerouteResult {
    pub fn new(destination: IpAddr) -> Self {
        Self {
            destination,
            hops: Vec::new(),
            destination_reached: false,
        }
    }

    /// Serializes the result to JSON with indentation.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

mod optional_duration_ms {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_nanos() as f64 / 1_000_000.0)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = Option::<f64>::deserialize(deserializer)?;
        Ok(millis.map(|ms| Duration::from_secs_f64(ms / 1000.0)))
    }
}
