//! Core types, traits, and the probe orchestrator for hoptrace.
//!
//! This crate provides the protocol-independent half of the tracer:
//!
//! - [`ProbeConfig`] and its validation
//! - [`ProbeCodec`], [`ProbeConnection`] and [`Transport`], the seams a wire
//!   format and a socket layer plug into
//! - [`Tracer`], which steps the TTL and emits one [`Hop`] per TTL
//! - [`TracerouteError`] for error handling

pub mod config;
pub mod error;
pub mod execution;
pub mod result;
pub mod traits;
pub mod types;

pub use config::{AddressFamily, Network, ProbeConfig, ICMP_HEADER_SIZE};
pub use error::TracerouteError;
pub use execution::Tracer;
pub use result::{Hop, TracerouteResult};
pub use traits::{ProbeCodec, ProbeConnection, Transport};
pub use types::{process_identifier, ProbeIdentity, Received, ReplyMatch};
