//! Partitioned transport and event reassembly for a durable task hub.
//!
//! Events are routed between partitions, clients and the load monitor by
//! per-destination batch senders. Oversized partition events are split into
//! fragments and put back together on the receiving partition.

pub mod config;
pub mod durability;
pub mod error;
pub mod event;
mod hex;
pub mod reassembly;
pub mod transport;
pub mod wire;
pub mod worker;

pub use error::Error;
