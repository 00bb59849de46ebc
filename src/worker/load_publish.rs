use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use hashbrown::HashMap;
use tokio::{select, sync::Notify};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

use super::{BatchProcessor, BatchWorker, BatchWorkerConfig, Completion};
use crate::{
    error::Error,
    event::{PartitionId, PartitionLoadInfo},
};

/// Writes partition load snapshots to the shared load table.
#[async_trait]
pub trait LoadPublisher: Send + Sync + 'static {
    /// May return [`Error::Cancelled`] once `cancellation` fires; the worker
    /// ignores that error.
    async fn publish(
        &self,
        loads: HashMap<PartitionId, PartitionLoadInfo>,
        cancellation: CancellationToken,
    ) -> Result<(), Error>;
}

#[derive(Default)]
struct Flushes {
    pending: AtomicUsize,
    wake: Notify,
}

/// Marks a flush as pending for as long as it lives.
struct PendingFlush<'a>(&'a Flushes);

impl<'a> PendingFlush<'a> {
    fn enter(flushes: &'a Flushes) -> Self {
        flushes.pending.fetch_add(1, Ordering::AcqRel);
        flushes.wake.notify_waiters();
        Self(flushes)
    }
}

impl Drop for PendingFlush<'_> {
    fn drop(&mut self) {
        self.0.pending.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Publish {
    publisher: Arc<dyn LoadPublisher>,
    interval: Duration,
    flushes: Arc<Flushes>,
    cancellation: CancellationToken,
}

impl Publish {
    async fn pause(&self) {
        // created before the check so a flush entering right after it still
        // wakes us
        let woken = self.flushes.wake.notified();
        if self.flushes.pending.load(Ordering::Acquire) > 0
            || self.cancellation.is_cancelled()
        {
            return;
        }
        select! {
            _ = tokio::time::sleep(self.interval) => {}
            _ = woken => trace!("publish pause cut short by a flush"),
            _ = self.cancellation.cancelled() => {}
        }
    }
}

#[async_trait]
impl BatchProcessor<(PartitionId, PartitionLoadInfo)> for Publish {
    async fn process(
        &mut self,
        batch: Vec<(PartitionId, PartitionLoadInfo)>,
    ) -> Result<(), Error> {
        let submitted = batch.len();
        let mut loads = HashMap::with_capacity(submitted);
        for (partition_id, info) in batch {
            // later reports replace earlier ones
            loads.insert(partition_id, info);
        }
        let partitions = loads.len();

        match self.publisher.publish(loads, self.cancellation.clone()).await {
            Ok(()) => trace!(
                "published load of {} partitions ({} reports)",
                partitions,
                submitted
            ),
            Err(Error::Cancelled) => {}
            Err(e) => error!("could not publish load information: {}", e),
        }

        self.pause().await;
        Ok(())
    }
}

/// Collects load reports from the partitions on this node and publishes them
/// at most once per interval.
pub struct LoadPublishWorker {
    worker: BatchWorker<(PartitionId, PartitionLoadInfo)>,
    flushes: Arc<Flushes>,
    cancellation: CancellationToken,
}

impl LoadPublishWorker {
    pub fn spawn(
        publisher: Arc<dyn LoadPublisher>,
        interval: Duration,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancellation = shutdown.child_token();
        let flushes = Arc::new(Flushes::default());
        let worker = BatchWorker::spawn(
            "load-publish",
            BatchWorkerConfig::default(),
            Publish {
                publisher,
                interval,
                flushes: flushes.clone(),
                cancellation: cancellation.clone(),
            },
            &cancellation,
        );
        Self {
            worker,
            flushes,
            cancellation,
        }
    }

    pub fn submit(
        &self,
        partition_id: PartitionId,
        info: PartitionLoadInfo,
    ) -> Result<(), Error> {
        self.worker.submit((partition_id, info))
    }

    /// Interrupts the pause between cycles and waits until every report
    /// submitted before this call has been published.
    pub async fn flush(&self) -> Completion {
        let _pending = PendingFlush::enter(&self.flushes);
        self.worker.wait_for_completion().await
    }

    pub async fn stop(&self) {
        self.cancellation.cancel();
        self.worker.stop().await;
    }
}
