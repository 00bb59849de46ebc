use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::DoubleWorkItemQueue;
use crate::{
    config::TransportConfig,
    durability::DurabilityListener,
    event::PartitionId,
    hex::HexDisplayExt,
};

pub type WorkerId = [u8; 16];

/// An activity invocation sent by an orchestration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskMessage {
    pub instance_id: String,
    pub name: String,
    pub payload: Vec<u8>,
}

/// A request for this worker to run an activity.
#[derive(Clone, Debug)]
pub struct ActivityRequest {
    pub message: TaskMessage,
    /// Work item of the orchestration step that scheduled the activity.
    pub origin_work_item_id: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkItemSource {
    /// Completed on this node without crossing the transport.
    Local,
    Remote,
}

pub struct ActivityWorkItem {
    pub work_item_id: String,
    pub partition_id: PartitionId,
    pub message: TaskMessage,
    pub origin_work_item: String,
    pub sequence: u64,
    /// Confirmed once the activity result is durable.
    pub listener: Option<Arc<dyn DurabilityListener>>,
    pub source: WorkItemSource,
}

impl fmt::Debug for ActivityWorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActivityWorkItem")
            .field("work_item_id", &self.work_item_id)
            .field("partition_id", &self.partition_id)
            .field("message", &self.message)
            .field("origin_work_item", &self.origin_work_item)
            .field("sequence", &self.sequence)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// Turns activity requests into work items for the local activity queue.
pub struct ActivityDispatcher {
    worker_id: WorkerId,
    short_id: String,
    config: Arc<TransportConfig>,
    sequence: AtomicU64,
    queue: Arc<DoubleWorkItemQueue<ActivityWorkItem>>,
    shutdown: CancellationToken,
}

impl ActivityDispatcher {
    pub fn new(
        config: Arc<TransportConfig>,
        queue: Arc<DoubleWorkItemQueue<ActivityWorkItem>>,
        shutdown: &CancellationToken,
    ) -> Self {
        let worker_id: WorkerId = rand::random();
        let short_id = worker_id.hex().prefix(7);
        debug!(worker = %short_id, "activity dispatcher started");
        Self {
            worker_id,
            short_id,
            config,
            sequence: AtomicU64::new(0),
            queue,
            shutdown: shutdown.child_token(),
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// First seven upper-case hex digits of the worker id.
    pub fn short_id(&self) -> &str {
        &self.short_id
    }

    pub fn work_item_id(&self, sequence: u64) -> String {
        format!("W{}A{}", self.short_id, sequence)
    }

    pub fn queue(&self) -> &Arc<DoubleWorkItemQueue<ActivityWorkItem>> {
        &self.queue
    }

    fn work_item(
        &self,
        request: ActivityRequest,
        listener: Option<Arc<dyn DurabilityListener>>,
        source: WorkItemSource,
    ) -> ActivityWorkItem {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        ActivityWorkItem {
            work_item_id: self.work_item_id(sequence),
            partition_id: self.config.partition_for(&request.message.instance_id),
            message: request.message,
            origin_work_item: request.origin_work_item_id,
            sequence,
            listener,
            source,
        }
    }

    /// Enqueues a request that arrived over the transport.
    pub fn process(
        &self,
        request: ActivityRequest,
        listener: Option<Arc<dyn DurabilityListener>>,
    ) {
        if self.shutdown.is_cancelled() {
            debug!("dropping activity request after shutdown");
            return;
        }
        let item = self.work_item(request, listener, WorkItemSource::Remote);
        trace!(
            partition = item.partition_id,
            work_item = %item.work_item_id,
            origin = %item.origin_work_item,
            "task message {} for {} received",
            item.message.name,
            item.message.instance_id
        );
        self.queue.add_remote(item);
    }

    /// Enqueues a request raised by a partition on this node.
    pub fn process_local(&self, request: ActivityRequest) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let item = self.work_item(request, None, WorkItemSource::Local);
        self.queue.add_local(item);
    }

    pub async fn stop(&self) {
        self.shutdown.cancel();
        debug!(worker = %self.short_id, "activity dispatcher stopped");
    }
}
