use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use hashbrown::HashMap;
use tokio::{select, sync::watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

use super::{
    ClientSender, Host, LoadMonitorSender, Partition, PartitionErrorHandler,
    PartitionSender, Sender, Transport,
};
use crate::{
    config::TransportConfig,
    durability::DurabilityWaiter,
    error::Error,
    event::{ClientId, Event, PartitionId},
    hex::HexDisplayExt,
    wire::FrameCodec,
};

/// Outgoing side of a partition: one sender per partition, one per client
/// the partition has answered, and one for the load monitor.
pub struct PartitionRouter {
    config: Arc<TransportConfig>,
    transport: Arc<dyn Transport>,
    partitions: Vec<PartitionSender>,
    clients: RwLock<HashMap<ClientId, Arc<ClientSender>>>,
    load_monitor: LoadMonitorSender,
    shutdown: CancellationToken,
}

impl PartitionRouter {
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
        let load_monitor = LoadMonitorSender::spawn(&config, transport.clone(), &shutdown);
        Self {
            config,
            transport,
            partitions,
            clients: RwLock::new(HashMap::new()),
            load_monitor,
            shutdown,
        }
    }

    /// Returns the sender for a client, creating it on first use. Concurrent
    /// first uses end up with the same sender.
    pub fn client_sender(&self, client_id: ClientId) -> Arc<ClientSender> {
        if let Some(sender) = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&client_id)
        {
            return sender.clone();
        }

        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients
            .entry(client_id)
            .or_insert_with(|| {
                debug!(client = %client_id.hex().prefix(7), "created client sender");
                Arc::new(ClientSender::spawn(
                    client_id,
                    &self.config,
                    self.transport.clone(),
                    &self.shutdown,
                ))
            })
            .clone()
    }

    pub fn client_sender_count(&self) -> usize {
        self.clients.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn partition_sender(&self, partition_id: PartitionId) -> Option<&PartitionSender> {
        self.partitions.get(partition_id as usize)
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        for sender in &self.partitions {
            sender.stop().await;
        }
        let clients: Vec<_> = self
            .clients
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for sender in clients {
            sender.stop().await;
        }
        self.load_monitor.stop().await;
    }
}

impl Sender for PartitionRouter {
    fn submit(&self, event: Event) -> Result<(), Error> {
        match event {
            Event::Partition(event) => self
                .partition_sender(event.partition_id)
                .ok_or(Error::UnknownPartition(event.partition_id))?
                .submit(event),
            Event::Client(event) => self.client_sender(event.client_id).submit(event),
            Event::LoadMonitor(event) => self.load_monitor.submit(event),
        }
    }
}

#[derive(Clone, Debug)]
enum Startup {
    Pending,
    Started,
    Failed(String),
}

/// Incoming side of a partition hosted on this node.
pub struct PartitionEndpoint {
    partition_id: PartitionId,
    router: Arc<PartitionRouter>,
    codec: FrameCodec,
    partition: OnceLock<Arc<dyn Partition>>,
    error_handler: OnceLock<Arc<PartitionErrorHandler>>,
    startup: watch::Sender<Startup>,
    shutdown: CancellationToken,
}

impl PartitionEndpoint {
    /// Creates the endpoint and starts the partition in the background.
    /// Deliveries wait until the partition has started.
    pub fn start(
        partition_id: PartitionId,
        config: Arc<TransportConfig>,
        transport: Arc<dyn Transport>,
        host: Arc<dyn Host>,
        shutdown: &CancellationToken,
    ) -> Arc<Self> {
        let shutdown = shutdown.child_token();
        let router = Arc::new(PartitionRouter::new(config.clone(), transport, &shutdown));
        let (startup, _) = watch::channel(Startup::Pending);
        let endpoint = Arc::new(Self {
            partition_id,
            router,
            codec: config.codec(),
            partition: OnceLock::new(),
            error_handler: OnceLock::new(),
            startup,
            shutdown,
        });

        let span = debug_span!("partition", id = partition_id);
        let starting = endpoint.clone();
        tokio::spawn(async move { starting.run_startup(config, host).await }.instrument(span));
        endpoint
    }

    async fn run_startup(&self, config: Arc<TransportConfig>, host: Arc<dyn Host>) {
        let partition = host.add_partition(self.partition_id, self.router.clone());
        let _ = self.partition.set(partition.clone());
        let error_handler = host.create_error_handler(self.partition_id);
        let _ = self.error_handler.set(error_handler.clone());

        // partition state is tied to this task hub instance
        let continuation_token = config.taskhub_guid.hex().to_string();
        match partition
            .create_or_restore(error_handler.clone(), &config, &continuation_token)
            .await
        {
            Ok(position) => {
                debug!("partition started at input position {}", position);
                self.startup.send_replace(Startup::Started);
            }
            Err(e) => {
                error_handler.handle_error(
                    "PartitionEndpoint.start",
                    "could not create or restore partition",
                    Some(&e),
                    true,
                );
                self.startup.send_replace(Startup::Failed(e.to_string()));
            }
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    pub fn error_handler(&self) -> Option<&Arc<PartitionErrorHandler>> {
        self.error_handler.get()
    }

    /// Waits for the partition to finish starting.
    pub async fn started(&self) -> Result<Arc<dyn Partition>, Error> {
        let mut startup = self.startup.subscribe();
        let state = select! {
            state = startup.wait_for(|s| !matches!(s, Startup::Pending)) => match state {
                Ok(state) => (*state).clone(),
                Err(_) => return Err(Error::Cancelled),
            },
            _ = self.shutdown.cancelled() => return Err(Error::Cancelled),
        };
        match state {
            Startup::Started => self
                .partition
                .get()
                .cloned()
                .ok_or_else(|| Error::Startup(self.partition_id, "no partition".into())),
            Startup::Failed(reason) => Err(Error::Startup(self.partition_id, reason)),
            Startup::Pending => Err(Error::Cancelled),
        }
    }

    /// Submits a received batch to the partition. Returns once the last
    /// update event of the batch is durable; a batch without updates returns
    /// as soon as it is submitted.
    pub async fn deliver(&self, frame: &[u8]) -> Result<(), Error> {
        let partition = self.started().await?;
        let mut events = self.codec.decode_partition_batch(frame)?;
        if let Some(stray) = events.iter().find(|e| e.partition_id != self.partition_id) {
            return Err(Error::Misrouted {
                event_id: stray.id.clone(),
                kind: stray.kind.name(),
                role: "partition endpoint",
            });
        }
        for event in &mut events {
            event.stamp_received();
        }

        // confirming the last update implies the earlier ones are durable too
        let waiter = events
            .iter()
            .rev()
            .find(|e| e.is_update())
            .map(|e| DurabilityWaiter::register(partition.durability(), e));
        trace!(
            partition = self.partition_id,
            "delivering batch of {} events",
            events.len()
        );
        partition.submit_events(events);

        let Some(waiter) = waiter else {
            return Ok(());
        };
        select! {
            result = waiter.wait() => result,
            _ = self.shutdown.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Releases pending deliveries, then stops the partition and its senders.
    /// Frames the senders still had in flight are abandoned.
    pub async fn stop(&self, is_forced: bool) -> Result<(), Error> {
        self.shutdown.cancel();
        let result = match self.partition.get() {
            Some(partition) => partition.stop(is_forced).await,
            None => Ok(()),
        };
        self.router.stop().await;
        debug!(partition = self.partition_id, "partition endpoint stopped");
        result
    }
}
