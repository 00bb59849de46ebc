use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{error, warn};

use crate::{error::Error, event::PartitionId};

/// Reports errors raised while a partition runs. Fatal errors terminate the
/// partition.
#[derive(Debug)]
pub struct PartitionErrorHandler {
    partition_id: PartitionId,
    terminated: CancellationToken,
}

impl PartitionErrorHandler {
    pub fn new(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            terminated: CancellationToken::new(),
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn handle_error(
        &self,
        context: &str,
        message: &str,
        error: Option<&Error>,
        terminate_partition: bool,
    ) {
        match (error, terminate_partition) {
            (Some(e), true) => error!(
                partition = self.partition_id,
                "{}: {}, terminating partition: {}", context, message, e
            ),
            (None, true) => error!(
                partition = self.partition_id,
                "{}: {}, terminating partition", context, message
            ),
            (Some(e), false) => warn!(
                partition = self.partition_id,
                "{}: {}: {}", context, message, e
            ),
            (None, false) => warn!(partition = self.partition_id, "{}: {}", context, message),
        }
        if terminate_partition {
            self.terminated.cancel();
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.is_cancelled()
    }

    /// Resolves once a fatal error terminated the partition.
    pub fn terminated(&self) -> WaitForCancellationFuture<'_> {
        self.terminated.cancelled()
    }
}
