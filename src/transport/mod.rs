//! Routing between partitions, clients and the load monitor.
//!
//! Each node holds one sender per destination kind. Senders batch events and
//! hand encoded frames to a [`Transport`]; endpoints receive frames, decode
//! them and submit the events to the local partition or client.

use std::{fmt, sync::Arc};

use async_trait::async_trait;

use crate::{
    config::TransportConfig,
    durability::DurabilityListeners,
    error::Error,
    event::{ClientEvent, ClientId, Event, LoadMonitorEvent, PartitionEvent, PartitionId},
    hex::HexDisplayExt,
};

mod client_endpoint;
mod error_handler;
mod memory;
mod partition_endpoint;
mod senders;

pub use client_endpoint::{ClientEndpoint, ClientRouter};
pub use error_handler::PartitionErrorHandler;
pub use memory::MemoryTransport;
pub use partition_endpoint::{PartitionEndpoint, PartitionRouter};
pub use senders::{ClientSender, LoadMonitorSender, PartitionSender};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Destination {
    Partition(PartitionId),
    Client(ClientId),
    LoadMonitor,
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Destination::Partition(id) => write!(f, "partition {:02}", id),
            Destination::Client(id) => write!(f, "client {}", id.hex().prefix(7)),
            Destination::LoadMonitor => f.write_str("load monitor"),
        }
    }
}

/// Moves encoded frames between nodes.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, destination: Destination, frame: Vec<u8>) -> Result<(), Error>;
}

/// Accepts events addressed to other components.
pub trait Sender: Send + Sync {
    fn submit(&self, event: Event) -> Result<(), Error>;
}

/// A partition state machine. Replication and storage live behind this trait.
#[async_trait]
pub trait Partition: Send + Sync {
    fn submit_event(&self, event: PartitionEvent);

    fn submit_events(&self, events: Vec<PartitionEvent>);

    /// Submits an event that runs against a snapshot, in parallel with the
    /// partition's event stream.
    fn submit_parallel_event(&self, event: PartitionEvent);

    /// Loads or creates partition state. Returns the input queue position to
    /// resume from.
    async fn create_or_restore(
        &self,
        error_handler: Arc<PartitionErrorHandler>,
        config: &TransportConfig,
        continuation_token: &str,
    ) -> Result<u64, Error>;

    async fn stop(&self, is_forced: bool) -> Result<(), Error>;

    /// Hook for processing that starts as soon as an event is received.
    fn on_submit(&self, _event: &PartitionEvent) {}

    /// Listener table confirmed by the partition's commit path.
    fn durability(&self) -> &DurabilityListeners;
}

#[async_trait]
pub trait Client: Send + Sync {
    fn client_id(&self) -> ClientId;

    fn process(&self, event: ClientEvent);

    async fn stop(&self) -> Result<(), Error>;
}

pub trait LoadMonitor: Send + Sync {
    fn process(&self, event: LoadMonitorEvent);
}

/// Creates the partitions and clients that endpoints deliver to.
pub trait Host: Send + Sync {
    fn add_partition(
        &self,
        partition_id: PartitionId,
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Partition>;

    fn add_client(
        &self,
        client_id: ClientId,
        taskhub_guid: [u8; 16],
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Client>;

    fn create_error_handler(&self, partition_id: PartitionId) -> Arc<PartitionErrorHandler> {
        Arc::new(PartitionErrorHandler::new(partition_id))
    }
}

pub(crate) fn misrouted(event: &Event, role: &'static str) -> Error {
    use crate::event::Identified;

    Error::Misrouted {
        event_id: event.event_id().clone(),
        kind: event.kind_name(),
        role,
    }
}
