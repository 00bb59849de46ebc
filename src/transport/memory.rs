use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{
    misrouted, ClientEndpoint, Destination, Host, LoadMonitor, PartitionEndpoint,
    Transport,
};
use crate::{
    config::TransportConfig,
    error::Error,
    event::{ClientId, Event, PartitionId},
    wire::FrameCodec,
};

/// Delivers frames to endpoints in the same process. Sends to a partition
/// resolve once the partition has made the batch durable.
pub struct MemoryTransport {
    partitions: RwLock<HashMap<PartitionId, Arc<PartitionEndpoint>>>,
    clients: RwLock<HashMap<ClientId, Arc<ClientEndpoint>>>,
    load_monitor: RwLock<Option<Arc<dyn LoadMonitor>>>,
    codec: FrameCodec,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashMap::new()),
            load_monitor: RwLock::new(None),
            // only decodes
            codec: FrameCodec::new(usize::MAX),
        }
    }

    pub fn start_partition(
        self: &Arc<Self>,
        partition_id: PartitionId,
        config: Arc<TransportConfig>,
        host: Arc<dyn Host>,
        shutdown: &CancellationToken,
    ) -> Arc<PartitionEndpoint> {
        let endpoint =
            PartitionEndpoint::start(partition_id, config, self.clone(), host, shutdown);
        self.partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(partition_id, endpoint.clone());
        endpoint
    }

    pub fn connect_client(
        self: &Arc<Self>,
        client_id: ClientId,
        config: Arc<TransportConfig>,
        host: Arc<dyn Host>,
        shutdown: &CancellationToken,
    ) -> Arc<ClientEndpoint> {
        let endpoint = ClientEndpoint::connect(client_id, config, self.clone(), host, shutdown);
        self.clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(client_id, endpoint.clone());
        endpoint
    }

    pub fn set_load_monitor(&self, monitor: Arc<dyn LoadMonitor>) {
        *self.load_monitor.write().unwrap_or_else(PoisonError::into_inner) = Some(monitor);
    }

    fn partition(&self, partition_id: PartitionId) -> Option<Arc<PartitionEndpoint>> {
        self.partitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&partition_id)
            .cloned()
    }

    fn client(&self, client_id: &ClientId) -> Option<Arc<ClientEndpoint>> {
        self.clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(client_id)
            .cloned()
    }

    fn monitor(&self) -> Option<Arc<dyn LoadMonitor>> {
        self.load_monitor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stops and forgets every registered endpoint.
    pub async fn shutdown(&self, is_forced: bool) {
        let partitions: Vec<_> = self
            .partitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();
        let clients: Vec<_> = self
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();

        for endpoint in clients {
            if let Err(e) = endpoint.stop().await {
                warn!("client did not stop cleanly: {}", e);
            }
        }
        for endpoint in partitions {
            if let Err(e) = endpoint.stop(is_forced).await {
                warn!(
                    "partition {:02} did not stop cleanly: {}",
                    endpoint.partition_id(),
                    e
                );
            }
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, destination: Destination, frame: Vec<u8>) -> Result<(), Error> {
        match destination {
            Destination::Partition(partition_id) => {
                let endpoint = self
                    .partition(partition_id)
                    .ok_or(Error::UnknownDestination(destination))?;
                endpoint.deliver(&frame).await
            }
            Destination::Client(client_id) => {
                let endpoint = self
                    .client(&client_id)
                    .ok_or(Error::UnknownDestination(destination))?;
                endpoint.deliver(&frame)
            }
            Destination::LoadMonitor => {
                let monitor = self
                    .monitor()
                    .ok_or(Error::UnknownDestination(destination))?;
                match self.codec.decode_event(&frame)? {
                    Event::LoadMonitor(event) => {
                        monitor.process(event);
                        Ok(())
                    }
                    other => Err(misrouted(&other, "load monitor")),
                }
            }
        }
    }
}
