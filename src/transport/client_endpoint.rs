use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{misrouted, Client, Host, PartitionSender, Sender, Transport};
use crate::{
    config::TransportConfig,
    error::Error,
    event::{ClientId, Event},
    hex::HexDisplayExt,
    wire::FrameCodec,
};

/// Outgoing side of a client. Clients only ever talk to partitions.
pub struct ClientRouter {
    partitions: Vec<PartitionSender>,
    shutdown: CancellationToken,
}

impl ClientRouter {
    pub fn new(
        config: Arc<TransportConfig>,
        transport: Arc<dyn Transport>,
        shutdown: &CancellationToken,
    ) -> Self {
        let shutdown = shutdown.child_token();
        let partitions = (0..config.partition_count)
            .map(|id| {
                PartitionSender::spawn(id, config.clone(), transport.clone(), &shutdown)
            })
            .collect();
        Self {
            partitions,
            shutdown,
        }
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        for sender in &self.partitions {
            sender.stop().await;
        }
    }
}

impl Sender for ClientRouter {
    fn submit(&self, event: Event) -> Result<(), Error> {
        match event {
            Event::Partition(event) => self
                .partitions
                .get(event.partition_id as usize)
                .ok_or(Error::UnknownPartition(event.partition_id))?
                .submit(event),
            other => Err(misrouted(&other, "client sender")),
        }
    }
}

/// Incoming side of a client connected on this node.
pub struct ClientEndpoint {
    client_id: ClientId,
    client: Arc<dyn Client>,
    router: Arc<ClientRouter>,
    codec: FrameCodec,
}

impl ClientEndpoint {
    pub fn connect(
        client_id: ClientId,
        config: Arc<TransportConfig>,
        transport: Arc<dyn Transport>,
        host: Arc<dyn Host>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let codec = config.codec();
        let taskhub_guid = config.taskhub_guid;
        let router = Arc::new(ClientRouter::new(config, transport, shutdown));
        let client = host.add_client(client_id, taskhub_guid, router.clone());
        debug!(client = %client_id.hex().prefix(7), "client connected");
        Arc::new(Self {
            client_id,
            client,
            router,
            codec,
        })
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn client(&self) -> &Arc<dyn Client> {
        &self.client
    }

    pub fn deliver(&self, frame: &[u8]) -> Result<(), Error> {
        match self.codec.decode_event(frame)? {
            Event::Client(event) if event.client_id == self.client_id => {
                trace!("delivering {} to client", event.id);
                self.client.process(event);
                Ok(())
            }
            other => Err(misrouted(&other, "client endpoint")),
        }
    }

    pub async fn stop(&self) -> Result<(), Error> {
        let result = self.client.stop().await;
        self.router.stop().await;
        debug!(client = %self.client_id.hex().prefix(7), "client disconnected");
        result
    }
}
