#![allow(dead_code)]

use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use taskhub::{
    config::TransportConfig,
    durability::DurabilityListeners,
    event::{
        AttemptId, ClientEvent, ClientId, EventId, Identified, PartitionEvent,
        PartitionEventKind, PartitionId, PartitionLoadInfo,
    },
    reassembly::{EffectTracker, ReassemblyState},
    transport::{Client, Host, LoadMonitor, Partition, PartitionErrorHandler, Sender},
    worker::LoadPublisher,
    Error,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const PATIENCE: Duration = Duration::from_secs(5);

/// Routes `tracing` output through the test harness. Safe to call repeatedly.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("taskhub=debug")
        .try_init();
}

/// Waits until the counter reaches `n`, failing the test after a while.
pub async fn reach(counter: &watch::Sender<usize>, n: usize) {
    let mut rx = counter.subscribe();
    tokio::time::timeout(PATIENCE, rx.wait_for(|count| *count >= n))
        .await
        .expect("timed out")
        .expect("counter dropped");
}

/// Identity of an event whose durability is still outstanding.
#[derive(Clone, Debug)]
pub struct Uncommitted {
    id: EventId,
    attempt: AttemptId,
}

impl Identified for Uncommitted {
    fn event_id(&self) -> &EventId {
        &self.id
    }

    fn attempt(&self) -> AttemptId {
        self.attempt
    }
}

/// Effect pipeline that just remembers the updates it was given.
pub struct RecordingEffects<'a> {
    pub partition: &'a dyn Partition,
    pub replaying: bool,
    pub updates: Vec<PartitionEvent>,
}

impl<'a> RecordingEffects<'a> {
    pub fn new(partition: &'a dyn Partition) -> Self {
        Self {
            partition,
            replaying: false,
            updates: Vec::new(),
        }
    }
}

impl EffectTracker for RecordingEffects<'_> {
    fn is_replaying(&self) -> bool {
        self.replaying
    }

    fn partition(&self) -> &dyn Partition {
        self.partition
    }

    fn determine_effects(&mut self, event: PartitionEvent) -> Result<(), Error> {
        self.updates.push(event);
        Ok(())
    }
}

/// Partition double. Fragments are reassembled; every other event is
/// recorded. Updates are confirmed durable on receipt unless commits are
/// manual.
pub struct TestPartition {
    pub partition_id: PartitionId,
    pub sender: Arc<dyn Sender>,
    pub manual_commit: bool,
    pub fail_startup: bool,
    durability: DurabilityListeners,
    reassembly: Mutex<ReassemblyState>,
    applied: Mutex<Vec<PartitionEvent>>,
    parallel: Mutex<Vec<PartitionEvent>>,
    uncommitted: Mutex<Vec<Uncommitted>>,
    pub applied_count: watch::Sender<usize>,
    pub on_submit_calls: AtomicUsize,
    pub stopped: AtomicBool,
}

impl TestPartition {
    pub fn new(partition_id: PartitionId, sender: Arc<dyn Sender>) -> Self {
        Self {
            partition_id,
            sender,
            manual_commit: false,
            fail_startup: false,
            durability: DurabilityListeners::new(),
            reassembly: Mutex::new(ReassemblyState::new()),
            applied: Mutex::new(Vec::new()),
            parallel: Mutex::new(Vec::new()),
            uncommitted: Mutex::new(Vec::new()),
            applied_count: watch::channel(0).0,
            on_submit_calls: AtomicUsize::new(0),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn applied<R>(&self, inspect: impl FnOnce(&[PartitionEvent]) -> R) -> R {
        inspect(&self.applied.lock().unwrap())
    }

    pub fn parallel(&self) -> usize {
        self.parallel.lock().unwrap().len()
    }

    pub fn pending_fragments(&self) -> usize {
        self.reassembly.lock().unwrap().pending()
    }

    /// Confirms every update received so far.
    pub fn commit(&self) -> usize {
        let uncommitted = std::mem::take(&mut *self.uncommitted.lock().unwrap());
        uncommitted
            .iter()
            .map(|event| self.durability.confirm_all(event))
            .sum()
    }

    fn record(&self, event: PartitionEvent) {
        self.applied.lock().unwrap().push(event);
        self.applied_count.send_modify(|count| *count += 1);
    }

    fn accept(&self, event: PartitionEvent) {
        let commit = event.is_update().then(|| Uncommitted {
            id: event.id.clone(),
            attempt: event.attempt(),
        });

        if let PartitionEventKind::Fragment(_) = event.kind {
            let updates = {
                let mut reassembly = self.reassembly.lock().unwrap();
                let mut effects = RecordingEffects::new(self);
                reassembly
                    .process(event, &mut effects)
                    .expect("fragment processing failed");
                effects.updates
            };
            for update in updates {
                self.record(update);
            }
        } else {
            self.record(event);
        }

        if let Some(commit) = commit {
            if self.manual_commit {
                self.uncommitted.lock().unwrap().push(commit);
            } else {
                self.durability.confirm_all(&commit);
            }
        }
    }
}

#[async_trait]
impl Partition for TestPartition {
    fn submit_event(&self, event: PartitionEvent) {
        self.accept(event);
    }

    fn submit_events(&self, events: Vec<PartitionEvent>) {
        for event in events {
            self.accept(event);
        }
    }

    fn submit_parallel_event(&self, event: PartitionEvent) {
        self.parallel.lock().unwrap().push(event);
    }

    async fn create_or_restore(
        &self,
        _error_handler: Arc<PartitionErrorHandler>,
        _config: &TransportConfig,
        _continuation_token: &str,
    ) -> Result<u64, Error> {
        if self.fail_startup {
            return Err(Error::Config("storage unavailable".into()));
        }
        Ok(0)
    }

    async fn stop(&self, _is_forced: bool) -> Result<(), Error> {
        self.stopped.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn on_submit(&self, _event: &PartitionEvent) {
        self.on_submit_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn durability(&self) -> &DurabilityListeners {
        &self.durability
    }
}

pub struct TestClient {
    pub client_id: ClientId,
    pub sender: Arc<dyn Sender>,
    pub received: Mutex<Vec<ClientEvent>>,
    pub received_count: watch::Sender<usize>,
}

#[async_trait]
impl Client for TestClient {
    fn client_id(&self) -> ClientId {
        self.client_id
    }

    fn process(&self, event: ClientEvent) {
        self.received.lock().unwrap().push(event);
        self.received_count.send_modify(|count| *count += 1);
    }

    async fn stop(&self) -> Result<(), Error> {
        Ok(())
    }
}

#[derive(Default)]
pub struct TestHost {
    pub manual_commit: bool,
    pub fail_startup: bool,
    pub partitions: Mutex<HashMap<PartitionId, Arc<TestPartition>>>,
    pub clients: Mutex<HashMap<ClientId, Arc<TestClient>>>,
}

impl TestHost {
    pub fn partition(&self, partition_id: PartitionId) -> Arc<TestPartition> {
        self.partitions.lock().unwrap()[&partition_id].clone()
    }

    pub fn client(&self, client_id: ClientId) -> Arc<TestClient> {
        self.clients.lock().unwrap()[&client_id].clone()
    }
}

impl Host for TestHost {
    fn add_partition(
        &self,
        partition_id: PartitionId,
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Partition> {
        let mut partition = TestPartition::new(partition_id, sender);
        partition.manual_commit = self.manual_commit;
        partition.fail_startup = self.fail_startup;
        let partition = Arc::new(partition);
        self.partitions
            .lock()
            .unwrap()
            .insert(partition_id, partition.clone());
        partition
    }

    fn add_client(
        &self,
        client_id: ClientId,
        _taskhub_guid: [u8; 16],
        sender: Arc<dyn Sender>,
    ) -> Arc<dyn Client> {
        let client = Arc::new(TestClient {
            client_id,
            sender,
            received: Mutex::new(Vec::new()),
            received_count: watch::channel(0).0,
        });
        self.clients.lock().unwrap().insert(client_id, client.clone());
        client
    }
}

pub struct RecordingMonitor {
    pub reports: Mutex<Vec<(PartitionId, PartitionLoadInfo)>>,
    pub count: watch::Sender<usize>,
}

impl Default for RecordingMonitor {
    fn default() -> Self {
        Self {
            reports: Mutex::new(Vec::new()),
            count: watch::channel(0).0,
        }
    }
}

impl LoadMonitor for RecordingMonitor {
    fn process(&self, event: taskhub::event::LoadMonitorEvent) {
        self.reports
            .lock()
            .unwrap()
            .push((event.partition_id, event.load));
        self.count.send_modify(|count| *count += 1);
    }
}

/// Load publisher that records every published table. The first
/// `failures` calls fail.
pub struct RecordingPublisher {
    pub published: Mutex<Vec<HashMap<PartitionId, PartitionLoadInfo>>>,
    pub calls: watch::Sender<usize>,
    pub failures: AtomicUsize,
    pub delay: Option<Duration>,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            published: Mutex::new(Vec::new()),
            calls: watch::channel(0).0,
            failures: AtomicUsize::new(0),
            delay: None,
        }
    }
}

#[async_trait]
impl LoadPublisher for RecordingPublisher {
    async fn publish(
        &self,
        loads: HashMap<PartitionId, PartitionLoadInfo>,
        cancellation: CancellationToken,
    ) -> Result<(), Error> {
        if let Some(delay) = self.delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancellation.cancelled() => return Err(Error::Cancelled),
            }
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let result = if failing {
            Err(Error::Publish("table unavailable".into()))
        } else {
            self.published.lock().unwrap().push(loads);
            Ok(())
        };
        self.calls.send_modify(|calls| *calls += 1);
        result
    }
}

pub fn load(work_items: u32) -> PartitionLoadInfo {
    PartitionLoadInfo {
        work_items,
        worker_id: "node-a".into(),
        ..Default::default()
    }
}

/// Sender that drops everything.
pub struct NullSender;

impl Sender for NullSender {
    fn submit(&self, _event: taskhub::event::Event) -> Result<(), Error> {
        Ok(())
    }
}

pub fn detached_partition(partition_id: PartitionId) -> TestPartition {
    TestPartition::new(partition_id, Arc::new(NullSender))
}
