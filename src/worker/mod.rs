//! Background workers that run next to the partitions of a node.

mod activity;
mod batch;
mod load_publish;
mod queue;

pub use activity::{
    ActivityDispatcher, ActivityRequest, ActivityWorkItem, TaskMessage,
    WorkItemSource, WorkerId,
};
pub use batch::{BatchProcessor, BatchWorker, BatchWorkerConfig, Completion};
pub use load_publish::{LoadPublishWorker, LoadPublisher};
pub use queue::DoubleWorkItemQueue;
