//! Probe execution.
//!
//! Probes are sent one at a time; see [`serial`].

pub mod serial;

pub use serial::Tracer;
