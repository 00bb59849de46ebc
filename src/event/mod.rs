//! The closed set of events that flow between partitions, clients and the
//! load monitor.
//!
//! Every event carries a wire identity ([`EventId`]) and a process-local
//! [`AttemptId`]. The attempt id is never serialized: it is assigned when an
//! event is built, decoded or re-issued, and it is the key under which
//! durability listeners are registered. Two passes of the same logical event
//! through the pipeline therefore never share listeners.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        OnceLock,
    },
    time::Instant,
};

use rkyv::{with::Skip, Archive, Deserialize, Serialize};

mod fragment;
mod load;
mod partition;

pub use fragment::{DedupPosition, InputPosition, PartitionEventFragment};
pub use load::PartitionLoadInfo;
pub use partition::{
    EventFlags, PartitionEvent, PartitionEventKind, QueryEvent, ReadEvent,
    UpdateEvent,
};

pub type PartitionId = u32;
pub type ClientId = [u8; 16];

#[derive(
    Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord,
)]
#[archive(check_bytes)]
pub struct EventId(pub String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EventId {
    fn from(id: &str) -> Self {
        Self(id.to_owned())
    }
}

impl From<String> for EventId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one pass of an event through the processing pipeline.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct AttemptId(u64);

impl AttemptId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

/// Anything durability listeners can be attached to.
pub trait Identified {
    fn event_id(&self) -> &EventId;
    fn attempt(&self) -> AttemptId;
}

/// Milliseconds since the first call in this process. Used for the transient
/// received/issued timestamps.
pub fn timestamp() -> f64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_secs_f64() * 1000.
}

/// An event addressed to a client.
#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub struct ClientEvent {
    pub id: EventId,
    pub client_id: ClientId,
    pub request_id: u64,
    pub payload: Vec<u8>,
    #[with(Skip)]
    attempt: AttemptId,
}

impl ClientEvent {
    pub fn new(
        id: impl Into<EventId>,
        client_id: ClientId,
        request_id: u64,
        payload: Vec<u8>,
    ) -> Self {
        Self {
            id: id.into(),
            client_id,
            request_id,
            payload,
            attempt: AttemptId::next(),
        }
    }
}

impl PartialEq for ClientEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.client_id == other.client_id
            && self.request_id == other.request_id
            && self.payload == other.payload
    }
}

/// Load information reported by a partition to the load monitor.
#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub struct LoadMonitorEvent {
    pub id: EventId,
    pub partition_id: PartitionId,
    pub load: PartitionLoadInfo,
    #[with(Skip)]
    attempt: AttemptId,
}

impl LoadMonitorEvent {
    pub fn new(
        id: impl Into<EventId>,
        partition_id: PartitionId,
        load: PartitionLoadInfo,
    ) -> Self {
        Self {
            id: id.into(),
            partition_id,
            load,
            attempt: AttemptId::next(),
        }
    }
}

impl PartialEq for LoadMonitorEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.partition_id == other.partition_id
            && self.load == other.load
    }
}

#[derive(Archive, Serialize, Deserialize, Debug, PartialEq)]
#[archive(check_bytes)]
pub enum Event {
    Partition(PartitionEvent),
    Client(ClientEvent),
    LoadMonitor(LoadMonitorEvent),
}

impl Event {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Event::Partition(e) => e.kind.name(),
            Event::Client(_) => "client",
            Event::LoadMonitor(_) => "load-monitor",
        }
    }

    /// Gives a freshly decoded event its own attempt id.
    pub(crate) fn assign_attempt(&mut self) {
        match self {
            Event::Partition(e) => e.assign_attempt(),
            Event::Client(e) => e.attempt = AttemptId::next(),
            Event::LoadMonitor(e) => e.attempt = AttemptId::next(),
        }
    }
}

impl Identified for Event {
    fn event_id(&self) -> &EventId {
        match self {
            Event::Partition(e) => &e.id,
            Event::Client(e) => &e.id,
            Event::LoadMonitor(e) => &e.id,
        }
    }

    fn attempt(&self) -> AttemptId {
        match self {
            Event::Partition(e) => e.attempt(),
            Event::Client(e) => e.attempt,
            Event::LoadMonitor(e) => e.attempt,
        }
    }
}

impl Identified for ClientEvent {
    fn event_id(&self) -> &EventId {
        &self.id
    }

    fn attempt(&self) -> AttemptId {
        self.attempt
    }
}

impl Identified for LoadMonitorEvent {
    fn event_id(&self) -> &EventId {
        &self.id
    }

    fn attempt(&self) -> AttemptId {
        self.attempt
    }
}

impl From<PartitionEvent> for Event {
    fn from(event: PartitionEvent) -> Self {
        Event::Partition(event)
    }
}

impl From<ClientEvent> for Event {
    fn from(event: ClientEvent) -> Self {
        Event::Client(event)
    }
}

impl From<LoadMonitorEvent> for Event {
    fn from(event: LoadMonitorEvent) -> Self {
        Event::LoadMonitor(event)
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Partition(e) => write!(f, "{}", e),
            _ => write!(f, "{} {}", self.kind_name(), self.event_id()),
        }
    }
}
