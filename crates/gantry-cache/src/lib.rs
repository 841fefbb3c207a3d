//! Key/value cache adapters for Gantry.
//!
//! The cache only holds advisory state (job quota counters, debug builder
//! names, heartbeat markers, container locks); everything in it can be
//! lost without corrupting a build.

pub mod keys;
mod memory;
mod nats;

pub use memory::MemoryKv;
pub use nats::NatsKv;

/// A counter that no longer parses is an error, never a fresh start.
pub(crate) fn parse_counter(key: &str, value: &str) -> gantry_core::Result<i64> {
    value
        .parse::<i64>()
        .map_err(|e| gantry_core::Error::Cache(format!("counter {key} holds {value:?}: {e}")))
}
