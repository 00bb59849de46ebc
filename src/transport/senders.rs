use std::{fmt, mem, slice, sync::Arc};

use async_trait::async_trait;
use chrono::Utc;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use super::{Destination, Transport};
use crate::{
    config::TransportConfig,
    error::Error,
    event::{ClientEvent, ClientId, Event, LoadMonitorEvent, PartitionEvent, PartitionId},
    reassembly::{empty_fragment, fragment_archived, FragmentOptions},
    wire::{self, FrameCodec},
    worker::{BatchProcessor, BatchWorker, Completion},
};

/// Archive padding can grow by up to one alignment unit once a fragment
/// carries bytes.
const ARCHIVE_ALIGN: usize = 8;

/// Sends a frame unless the sender is stopped first. Failures other than
/// cancellation are traced and only lose this frame; `Ok(false)` reports
/// them.
async fn send_frame(
    transport: &dyn Transport,
    destination: Destination,
    frame: Vec<u8>,
    what: &(dyn fmt::Display + Sync),
    cancellation: &CancellationToken,
) -> Result<bool, Error> {
    let len = frame.len();
    let result = select! {
        result = transport.send(destination, frame) => result,
        _ = cancellation.cancelled() => Err(Error::Cancelled),
    };
    match result {
        Ok(()) => {
            trace!("sent {} to {} ({} bytes)", what, destination, len);
            Ok(true)
        }
        Err(Error::Cancelled) => Err(Error::Cancelled),
        Err(e) => {
            warn!("dropped {} for {}: {}", what, destination, e);
            Ok(false)
        }
    }
}

/// Packs partition events into batch frames of at most `max_message_size`
/// bytes. Events that do not fit a frame on their own are fragmented first.
struct PartitionFrames {
    partition_id: PartitionId,
    config: Arc<TransportConfig>,
    codec: FrameCodec,
    transport: Arc<dyn Transport>,
    cancellation: CancellationToken,
}

struct FrameOf<'a>(&'a [PartitionEvent]);

impl fmt::Display for FrameOf<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            [event] => write!(f, "{}", event),
            [first, ..] => write!(f, "{} events from {}", self.0.len(), first.id),
            [] => f.write_str("empty frame"),
        }
    }
}

impl PartitionFrames {
    fn destination(&self) -> Destination {
        Destination::Partition(self.partition_id)
    }

    fn fragment_options(&self) -> Result<FragmentOptions, Error> {
        let Some(timeout) = self.config.fragment_timeout else {
            return Ok(FragmentOptions::default());
        };
        let timeout = chrono::Duration::from_std(timeout)
            .map_err(|_| Error::Config("fragment timeout out of range".into()))?;
        Ok(FragmentOptions::builder().timeout(Utc::now() + timeout).build())
    }

    /// Sends events in as few frames as the limit allows. The sizes used for
    /// packing are estimates, so each frame is checked once sealed.
    async fn send_packed(&self, mut events: Vec<PartitionEvent>) -> Result<(), Error> {
        let max = self.config.max_message_size;
        while !events.is_empty() {
            let mut take = events.len();
            let frame = loop {
                let frame = self.codec.encode_partition_batch(&events[..take])?;
                if frame.len() <= max || take == 1 {
                    break frame;
                }
                take -= 1;
            };
            let rest = events.split_off(take);
            send_frame(
                self.transport.as_ref(),
                self.destination(),
                frame,
                &FrameOf(&events),
                &self.cancellation,
            )
            .await?;
            events = rest;
        }
        Ok(())
    }

    /// Splits an event into fragment frames that each fit the limit.
    fn fragment_frames(
        &self,
        event: &PartitionEvent,
        bytes: &[u8],
    ) -> Result<Vec<(PartitionEvent, Vec<u8>)>, Error> {
        let max = self.config.max_message_size;
        let too_small = || {
            Error::Config(format!(
                "max message size {} cannot carry fragments of {}",
                max, event.id
            ))
        };
        let options = self.fragment_options()?;
        let overhead = self
            .codec
            .encode_partition_batch(slice::from_ref(&empty_fragment(event, &options)))?
            .len();
        let mut chunk = max
            .checked_sub(overhead + ARCHIVE_ALIGN)
            .filter(|chunk| *chunk > 0)
            .ok_or_else(too_small)?;

        loop {
            let fragments = fragment_archived(event, bytes, chunk, &options)?;
            let frames = fragments
                .iter()
                .map(|f| self.codec.encode_partition_batch(slice::from_ref(f)))
                .collect::<Result<Vec<_>, _>>()?;
            let largest = frames.iter().map(Vec::len).max().unwrap_or(0);
            if largest <= max {
                return Ok(fragments.into_iter().zip(frames).collect());
            }
            chunk = chunk
                .checked_sub(largest - max)
                .filter(|chunk| *chunk > 0)
                .ok_or_else(too_small)?;
        }
    }

    /// Sends the fragments of one event, one per frame. A lost fragment makes
    /// the rest of its group useless, so they are not sent.
    async fn send_fragmented(&self, event: &PartitionEvent) -> Result<(), Error> {
        let frames = wire::archive(event)
            .and_then(|bytes| self.fragment_frames(event, &bytes));
        let frames = match frames {
            Ok(frames) => frames,
            Err(e) => {
                warn!("dropping {}: {}", event, e);
                return Ok(());
            }
        };
        trace!("split {} into {} fragments", event, frames.len());

        for (fragment, frame) in frames {
            let sent = send_frame(
                self.transport.as_ref(),
                self.destination(),
                frame,
                &fragment,
                &self.cancellation,
            )
            .await?;
            if !sent {
                warn!("abandoned the remaining fragments of {}", event.id);
                break;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BatchProcessor<PartitionEvent> for PartitionFrames {
    async fn process(&mut self, batch: Vec<PartitionEvent>) -> Result<(), Error> {
        let max = self.config.max_message_size;
        let mut pending = Vec::new();
        let mut pending_size = 0;

        for event in batch {
            if self.cancellation.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let size = match self.codec.encode_partition_batch(slice::from_ref(&event)) {
                Ok(frame) => frame.len(),
                Err(e) => {
                    warn!("dropping {}: {}", event, e);
                    continue;
                }
            };

            if size > max {
                // fragments travel after whatever came before
                self.send_packed(mem::take(&mut pending)).await?;
                pending_size = 0;
                self.send_fragmented(&event).await?;
                continue;
            }

            if !pending.is_empty() && pending_size + size > max {
                self.send_packed(mem::take(&mut pending)).await?;
                pending_size = 0;
            }
            pending_size += size;
            pending.push(event);
        }

        self.send_packed(pending).await
    }
}

/// Sends each event in a frame of its own.
struct EventFrames {
    destination: Destination,
    codec: FrameCodec,
    transport: Arc<dyn Transport>,
    cancellation: CancellationToken,
}

#[async_trait]
impl BatchProcessor<Event> for EventFrames {
    async fn process(&mut self, batch: Vec<Event>) -> Result<(), Error> {
        for event in batch {
            let frame = match self.codec.encode_event(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("dropping {}: {}", event, e);
                    continue;
                }
            };
            send_frame(
                self.transport.as_ref(),
                self.destination,
                frame,
                &event,
                &self.cancellation,
            )
            .await?;
        }
        Ok(())
    }
}

/// Batches events addressed to one partition.
pub struct PartitionSender {
    partition_id: PartitionId,
    worker: BatchWorker<PartitionEvent>,
    cancellation: CancellationToken,
}

impl PartitionSender {
    pub fn spawn(
        partition_id: PartitionId,
        config: Arc<TransportConfig>,
        transport: Arc<dyn Transport>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancellation = shutdown.child_token();
        let worker = BatchWorker::spawn(
            "partition-sender",
            config.sender_batch.clone(),
            PartitionFrames {
                partition_id,
                codec: config.codec(),
                config,
                transport,
                cancellation: cancellation.clone(),
            },
            &cancellation,
        );
        Self {
            partition_id,
            worker,
            cancellation,
        }
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn submit(&self, mut event: PartitionEvent) -> Result<(), Error> {
        event.stamp_issued();
        self.worker.submit(event)
    }

    pub async fn wait_for_completion(&self) -> Completion {
        self.worker.wait_for_completion().await
    }

    /// Stops the worker. A frame still in flight is abandoned.
    pub async fn stop(&self) {
        self.cancellation.cancel();
        self.worker.stop().await
    }
}

impl Drop for PartitionSender {
    fn drop(&mut self) {
        self.cancellation.cancel();
    }
}

/// Batches events addressed to one client.
pub struct ClientSender {
    client_id: ClientId,
    worker: BatchWorker<Event>,
    cancellation: CancellationToken,
}

impl ClientSender {
    pub fn spawn(
        client_id: ClientId,
        config: &TransportConfig,
        transport: Arc<dyn Transport>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancellation = shutdown.child_token();
        let worker = BatchWorker::spawn(
            "client-sender",
            config.sender_batch.clone(),
            EventFrames {
                destination: Destination::Client(client_id),
                codec: config.codec(),
                transport,
                cancellation: cancellation.clone(),
            },
            &cancellation,
        );
        Self {
            client_id,
            worker,
            cancellation,
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn submit(&self, event: ClientEvent) -> Result<(), Error> {
        self.worker.submit(Event::Client(event))
    }

    pub async fn wait_for_completion(&self) -> Completion {
        self.worker.wait_for_completion().await
    }

    pub async fn stop(&self) {
        self.cancellation.cancel();
        self.worker.stop().await
    }
}

/// Forwards load reports to the load monitor.
pub struct LoadMonitorSender {
    worker: BatchWorker<Event>,
    cancellation: CancellationToken,
}

impl LoadMonitorSender {
    pub fn spawn(
        config: &TransportConfig,
        transport: Arc<dyn Transport>,
        shutdown: &CancellationToken,
    ) -> Self {
        let cancellation = shutdown.child_token();
        let worker = BatchWorker::spawn(
            "load-monitor-sender",
            config.sender_batch.clone(),
            EventFrames {
                destination: Destination::LoadMonitor,
                codec: config.codec(),
                transport,
                cancellation: cancellation.clone(),
            },
            &cancellation,
        );
        Self {
            worker,
            cancellation,
        }
    }

    pub fn submit(&self, event: LoadMonitorEvent) -> Result<(), Error> {
        self.worker.submit(Event::LoadMonitor(event))
    }

    pub async fn wait_for_completion(&self) -> Completion {
        self.worker.wait_for_completion().await
    }

    pub async fn stop(&self) {
        self.cancellation.cancel();
        self.worker.stop().await
    }
}
