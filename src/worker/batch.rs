//! A queue drained by a single task that hands everything queued so far to a
//! processor, one batch at a time.
//!
//! Producers call [`BatchWorker::submit`] from anywhere; it never waits. The
//! worker wakes, takes the queued items (up to `max_batch_size`), awaits the
//! processor, publishes its progress and goes back to sleep once the queue is
//! empty. Batches never overlap.

use std::{
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::{
    select,
    sync::{watch, Notify},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, error, trace, warn, Instrument};
use typed_builder::TypedBuilder;

use crate::error::Error;

tokio::task_local! {
    /// Id of the worker whose processor is running on this task.
    static CURRENT_WORKER: u64;
}

#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct BatchWorkerConfig {
    /// Upper bound on the items handed to one processor call. Unbounded when
    /// unset.
    #[builder(default, setter(strip_option))]
    pub max_batch_size: Option<usize>,
    /// Submissions beyond this many queued items are rejected with
    /// [`Error::QueueFull`]. Unbounded when unset.
    #[builder(default, setter(strip_option))]
    pub max_queue_depth: Option<usize>,
}

#[async_trait]
pub trait BatchProcessor<T: Send + 'static>: Send + 'static {
    /// Errors are traced by the worker, which then carries on with the next
    /// batch.
    async fn process(&mut self, batch: Vec<T>) -> Result<(), Error>;
}

/// How a [`BatchWorker::wait_for_completion`] call ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Everything queued at call time was processed.
    Processed,
    /// Called from inside this worker's own processor; returned immediately.
    Reentrant,
    /// The worker shut down before reaching the items.
    Stopped,
}

#[derive(Clone, Copy, Debug, Default)]
struct Progress {
    /// Count of items whose batch has completed.
    completed: u64,
    stopped: bool,
}

struct Queue<T> {
    items: Vec<T>,
    submitted: u64,
    taken: u64,
    stopped: bool,
}

struct Shared<T> {
    id: u64,
    name: &'static str,
    config: BatchWorkerConfig,
    queue: Mutex<Queue<T>>,
    wake: Notify,
    progress: watch::Sender<Progress>,
    shutdown: CancellationToken,
}

impl<T> Shared<T> {
    fn queue(&self) -> MutexGuard<'_, Queue<T>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn admit(&self, queue: &Queue<T>, incoming: usize) -> Result<(), Error> {
        if queue.stopped || self.shutdown.is_cancelled() {
            return Err(Error::WorkerStopped(self.name));
        }
        if let Some(max) = self.config.max_queue_depth {
            if queue.items.len() + incoming > max {
                return Err(Error::QueueFull {
                    name: self.name,
                    depth: queue.items.len(),
                });
            }
        }
        Ok(())
    }

    /// Takes the next batch along with the completion count it reaches.
    fn take_batch(&self) -> Option<(Vec<T>, u64)> {
        let mut queue = self.queue();
        if queue.items.is_empty() {
            return None;
        }
        let available = queue.items.len();
        let take = self
            .config
            .max_batch_size
            .map_or(available, |max| max.clamp(1, available));
        let batch: Vec<T> = if take == available {
            std::mem::take(&mut queue.items)
        } else {
            queue.items.drain(..take).collect()
        };
        queue.taken += take as u64;
        Some((batch, queue.taken))
    }

    fn stop(&self) {
        let dropped = {
            let mut queue = self.queue();
            queue.stopped = true;
            let dropped = queue.items.len();
            queue.items.clear();
            dropped
        };
        if dropped > 0 {
            debug!("dropped {} queued items on shutdown", dropped);
        }
        self.progress.send_modify(|p| p.stopped = true);
    }
}

pub struct BatchWorker<T> {
    shared: Arc<Shared<T>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> BatchWorker<T> {
    /// Starts the worker task. It stops when `shutdown` (or the worker's own
    /// child of it) is cancelled.
    pub fn spawn<P: BatchProcessor<T>>(
        name: &'static str,
        config: BatchWorkerConfig,
        processor: P,
        shutdown: &CancellationToken,
    ) -> Self {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        let (progress, _) = watch::channel(Progress::default());
        let shared = Arc::new(Shared {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            config,
            queue: Mutex::new(Queue {
                items: Vec::new(),
                submitted: 0,
                taken: 0,
                stopped: false,
            }),
            wake: Notify::new(),
            progress,
            shutdown: shutdown.child_token(),
        });
        let span = debug_span!("batch_worker", name, id = shared.id);
        let handle = tokio::spawn(Self::run(shared.clone(), processor).instrument(span));
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    async fn run<P: BatchProcessor<T>>(shared: Arc<Shared<T>>, mut processor: P) {
        debug!("batch worker started");
        loop {
            if shared.shutdown.is_cancelled() {
                break;
            }
            let (batch, target) = match shared.take_batch() {
                Some(next) => next,
                None => {
                    select! {
                        _ = shared.wake.notified() => {}
                        _ = shared.shutdown.cancelled() => {}
                    }
                    continue;
                }
            };

            let len = batch.len();
            let result = AssertUnwindSafe(
                CURRENT_WORKER.scope(shared.id, processor.process(batch)),
            )
            .catch_unwind()
            .await;
            match result {
                Ok(Ok(())) => trace!("processed batch of {}", len),
                Ok(Err(e)) => warn!("failed to process batch of {}: {}", len, e),
                Err(_) => error!("processor panicked on a batch of {}", len),
            }
            shared.progress.send_modify(|p| p.completed = target);
        }
        shared.stop();
        debug!("batch worker stopped");
    }

    pub fn name(&self) -> &'static str {
        self.shared.name
    }

    /// Enqueues an item and wakes the worker.
    pub fn submit(&self, item: T) -> Result<(), Error> {
        {
            let mut queue = self.shared.queue();
            self.shared.admit(&queue, 1)?;
            queue.items.push(item);
            queue.submitted += 1;
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Enqueues all items or none of them.
    pub fn submit_all(&self, items: Vec<T>) -> Result<(), Error> {
        if items.is_empty() {
            return Ok(());
        }
        {
            let mut queue = self.shared.queue();
            self.shared.admit(&queue, items.len())?;
            queue.submitted += items.len() as u64;
            queue.items.extend(items);
        }
        self.shared.wake.notify_one();
        Ok(())
    }

    /// Number of items waiting for a batch.
    pub fn queued(&self) -> usize {
        self.shared.queue().items.len()
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.progress.borrow().stopped
    }

    /// Waits until every item submitted before this call has been part of a
    /// completed batch.
    pub async fn wait_for_completion(&self) -> Completion {
        let reentrant = CURRENT_WORKER
            .try_with(|id| *id == self.shared.id)
            .unwrap_or(false);
        if reentrant {
            // the batch in flight includes our own caller
            return Completion::Reentrant;
        }

        let target = self.shared.queue().submitted;
        let mut progress = self.shared.progress.subscribe();
        let reached = progress
            .wait_for(|p| p.completed >= target || p.stopped)
            .await
            .map(|p| *p);
        match reached {
            Ok(p) if p.completed >= target => Completion::Processed,
            _ => Completion::Stopped,
        }
    }

    /// Stops accepting work, lets the current batch finish and waits for the
    /// worker task to exit. Items still queued are dropped.
    pub async fn stop(&self) {
        self.shared.shutdown.cancel();
        let reentrant = CURRENT_WORKER
            .try_with(|id| *id == self.shared.id)
            .unwrap_or(false);
        if reentrant {
            return;
        }
        let handle = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("batch worker {} did not exit cleanly: {}", self.shared.name, e);
            }
        }
    }
}

impl<T> Drop for BatchWorker<T> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    struct Sleepy;

    #[async_trait]
    impl BatchProcessor<u32> for Sleepy {
        async fn process(&mut self, _batch: Vec<u32>) -> Result<(), Error> {
            tokio::time::sleep(Duration::from_millis(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn counts_taken_items_against_waiters() {
        let shutdown = CancellationToken::new();
        let worker = BatchWorker::spawn(
            "sleepy",
            BatchWorkerConfig::builder().max_batch_size(2).build(),
            Sleepy,
            &shutdown,
        );
        worker.submit_all(vec![1, 2, 3, 4, 5]).unwrap();
        assert_eq!(worker.wait_for_completion().await, Completion::Processed);
        assert_eq!(worker.queued(), 0);
        worker.stop().await;
        assert!(worker.is_stopped());
    }
}
