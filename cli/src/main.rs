use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use taskhub::{
    config::TransportConfig,
    durability::DurabilityListeners,
    event::{
        ClientEvent, ClientId, Event, LoadMonitorEvent, PartitionEvent,
        PartitionEventKind, PartitionId, PartitionLoadInfo, UpdateEvent,
    },
    reassembly::{EffectTracker, ReassemblyState},
    transport::{
        Client, Host, LoadMonitor, MemoryTransport, Partition, PartitionErrorHandler,
        Sender,
    },
    worker::{LoadPublishWorker, LoadPublisher},
    Error,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Applies updates by answering the client that sent them.
struct DemoPartition {
    partition_id: PartitionId,
    sender: Arc<dyn Sender>,
    durability: DurabilityListeners,
    reassembly: Mutex<ReassemblyState>,
}

struct Effects<'a> {
    partition: &'a DemoPartition,
    applied: Vec<PartitionEvent>,
}

impl EffectTracker for Effects<'_> {
    fn is_replaying(&self) -> bool {
        false
    }

    fn partition(&self) -> &dyn Partition {
        self.partition
    }

    fn determine_effects(&mut self, event: PartitionEvent) -> Result<(), Error> {
        self.applied.push(event);
        Ok(())
    }
}

impl DemoPartition {
    fn apply(&self, event: &PartitionEvent) {
        let PartitionEventKind::Update(update) = &event.kind else {
            return;
        };
        info!(
            partition = self.partition_id,
            "applied {} ({} bytes)",
            event,
            update.payload.len()
        );
        let reply = ClientEvent::new(
            format!("{}R", event.id),
            [0xC1; 16],
            1,
            (update.payload.len() as u64).to_le_bytes().to_vec(),
        );
        if let Err(e) = self.sender.submit(reply.into()) {
            warn!("could not answer {}: {}", event.id, e);
        }
        let load = LoadMonitorEvent::new(
            format!("{}L", event.id),
            self.partition_id,
            PartitionLoadInfo {
                instances: 1,
                worker_id: "demo".into(),
                ..Default::default()
            },
        );
        if let Err(e) = self.sender.submit(load.into()) {
            warn!("could not report load: {}", e);
        }
    }

    fn accept(&self, event: PartitionEvent) {
        if let PartitionEventKind::Fragment(_) = event.kind {
            let applied = {
                let mut reassembly = self
                    .reassembly
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                let mut effects = Effects {
                    partition: self,
                    applied: Vec::new(),
                };
                if let Err(e) = reassembly.process(event.reissue(), &mut effects) {
                    warn!("reassembly failed: {}", e);
                }
                effects.applied
            };
            for update in &applied {
                self.apply(update);
            }
        } else {
            self.apply(&event);
        }

        if event.is_update() {
            // the log is in memory, so receipt is commit
            self.durability.confirm_all(&event);
        }
    }
}

#[async_trait]
impl Partition for DemoPartition {
    fn submit_event(&self, event: PartitionEvent) {
        self.accept(event);
    }

    fn submit_events(&self, events: Vec<PartitionEvent>) {
        for event in events {
            self.accept(event);
        }
    }

    fn submit_parallel_event(&self, event: PartitionEvent) {
        self.accept(event);
    }

    async fn create_or_restore(
        &self,
        _error_handler: Arc<PartitionErrorHandler>,
        config: &TransportConfig,
        _continuation_token: &str,
    ) -> Result<u64, Error> {
        info!(
            partition = self.partition_id,
            "starting in task hub {}", config.taskhub_name
        );
        Ok(0)
    }

    async fn stop(&self, _is_forced: bool) -> Result<(), Error> {
        Ok(())
    }

    fn durability(&self) -> &DurabilityListeners {
        &self.durability
    }
}

struct DemoClient {
    client_id: ClientId,
    replies: Notify,
}

#[async_trait]
impl Client for DemoClient {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn process(&self, event: ClientEvent) {
        info!("client received {} ({} bytes)", event.id, event.payload.len());
        self.replies.notify_one();
    }

    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
struct DemoHost {
    clients: Mutex<Vec<(Arc<DemoClient>, Arc<dyn Sender>)>>,
}

impl Host for DemoHost {
    fn add_partition(
        &self,
        partition_id: PartitionId,
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Partition> {
        Arc::new(DemoPartition {
            partition_id,
            sender,
            durability: DurabilityListeners::new(),
            reassembly: Mutex::new(ReassemblyState::new()),
        })
    }

    fn add_client(
        &self,
        client_id: ClientId,
        _taskhub_guid: [u8; 16],
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Client> {
        let client = Arc::new(DemoClient {
            client_id,
            replies: Notify::new(),
        });
        self.clients
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((client.clone(), sender));
        client
    }
}

struct LogMonitor;

impl LoadMonitor for LogMonitor {
    fn process(&self, event: LoadMonitorEvent) {
        info!(
            "partition {:02} reports {} instances",
            event.partition_id, event.load.instances
        );
    }
}

struct LogPublisher;

#[async_trait]
impl LoadPublisher for LogPublisher {
    async fn publish(
        &self,
        loads: HashMap<PartitionId, PartitionLoadInfo>,
        _cancellation: CancellationToken,
    ) -> Result<(), Error> {
        let mut partitions: Vec<_> = loads.keys().copied().collect();
        partitions.sort_unstable();
        info!("published load of partitions {:?}", partitions);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt::init();

    let config = TransportConfig::builder()
        .partition_count(4)
        .taskhub_name("demo")
        .max_message_size(4096)
        .fragment_timeout(Duration::from_secs(30))
        .publish_interval(Duration::from_millis(500))
        .build();
    config.validate()?;
    info!("{:?}", config);
    let config = Arc::new(config);

    let shutdown = CancellationToken::new();
    let transport = Arc::new(MemoryTransport::new());
    let host = Arc::new(DemoHost::default());
    transport.set_load_monitor(Arc::new(LogMonitor));
    for partition_id in 0..config.partition_count {
        transport.start_partition(partition_id, config.clone(), host.clone(), &shutdown);
    }
    transport.connect_client([0xC1; 16], config.clone(), host.clone(), &shutdown);

    let (client, sender) = host
        .clients
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .first()
        .cloned()
        .ok_or_else(|| Error::Config("client was not created".into()))?;

    let instance = "orders@42";
    let update = PartitionEvent::update(
        "C1-1",
        config.partition_for(instance),
        UpdateEvent {
            instance_id: Some(instance.into()),
            // big enough to be fragmented
            payload: vec![0x2A; 20_000],
        },
    );
    sender.submit(Event::from(update))?;
    client.replies.notified().await;

    let publisher = LoadPublishWorker::spawn(
        Arc::new(LogPublisher),
        config.publish_interval,
        &shutdown,
    );
    for partition_id in 0..config.partition_count {
        publisher.submit(
            partition_id,
            PartitionLoadInfo {
                work_items: partition_id,
                worker_id: "demo".into(),
                ..Default::default()
            },
        )?;
    }
    publisher.flush().await;
    publisher.stop().await;

    transport.shutdown(false).await;
    shutdown.cancel();
    Ok(())
}
