//! statsd-compatible metrics aggregation daemon.
//!
//! Samples arrive over UDP, are aggregated in memory by a single worker
//! task and are flushed to the configured backends at a fixed interval.
//! A TCP management console exposes and mutates the live buckets.

pub mod backend;
pub mod bus;
pub mod config;
pub mod console;
pub mod daemon;
pub mod export;
pub mod flush;
pub mod protocol;
pub mod sampler;
pub mod stats;
pub mod store;
