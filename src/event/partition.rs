use std::fmt;

use rkyv::{with::Skip, Archive, Deserialize, Serialize};

use super::{
    timestamp, AttemptId, EventId, Identified, PartitionEventFragment,
    PartitionId,
};

#[derive(Archive, Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct EventFlags {
    /// The input cursor must be reset instead of advanced past this event.
    pub reset_input_queue: bool,
    /// Whether processing this event counts towards partition activity when
    /// deciding if the partition is idle.
    pub counts_as_partition_activity: bool,
}

impl Default for EventFlags {
    fn default() -> Self {
        Self {
            reset_input_queue: false,
            counts_as_partition_activity: true,
        }
    }
}

/// Mutates partition state; its effects must eventually be confirmed durable.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct UpdateEvent {
    pub instance_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Reads partition state without mutating it.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ReadEvent {
    pub instance_id: String,
    pub payload: Vec<u8>,
}

/// Runs against a snapshot of partition state, in parallel with other work.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct QueryEvent {
    pub query: Vec<u8>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub enum PartitionEventKind {
    Update(UpdateEvent),
    Read(ReadEvent),
    Query(QueryEvent),
    Fragment(PartitionEventFragment),
}

impl PartitionEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            PartitionEventKind::Update(_) => "update",
            PartitionEventKind::Read(_) => "read",
            PartitionEventKind::Query(_) => "query",
            PartitionEventKind::Fragment(_) => "fragment",
        }
    }
}

/// An event processed by a partition.
#[derive(Archive, Serialize, Deserialize, Debug)]
#[archive(check_bytes)]
pub struct PartitionEvent {
    pub id: EventId,
    pub partition_id: PartitionId,
    /// For events read from an input queue, the queue position after this
    /// event. Zero for internally generated events.
    pub next_input_queue_position: u64,
    pub flags: EventFlags,
    pub kind: PartitionEventKind,
    #[with(Skip)]
    pub received_timestamp: f64,
    #[with(Skip)]
    pub issued_timestamp: f64,
    #[with(Skip)]
    attempt: AttemptId,
}

impl PartitionEvent {
    pub fn new(
        id: impl Into<EventId>,
        partition_id: PartitionId,
        kind: PartitionEventKind,
    ) -> Self {
        Self {
            id: id.into(),
            partition_id,
            next_input_queue_position: 0,
            flags: EventFlags::default(),
            kind,
            received_timestamp: 0.,
            issued_timestamp: 0.,
            attempt: AttemptId::next(),
        }
    }

    pub fn update(
        id: impl Into<EventId>,
        partition_id: PartitionId,
        update: UpdateEvent,
    ) -> Self {
        Self::new(id, partition_id, PartitionEventKind::Update(update))
    }

    pub fn with_next_input_queue_position(mut self, position: u64) -> Self {
        self.next_input_queue_position = position;
        self
    }

    pub fn with_flags(mut self, flags: EventFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Update events mutate partition state. Fragments count as updates: they
    /// mutate the reassembly table.
    pub fn is_update(&self) -> bool {
        matches!(
            self.kind,
            PartitionEventKind::Update(_) | PartitionEventKind::Fragment(_)
        )
    }

    pub fn reset_input_queue(&self) -> bool {
        self.flags.reset_input_queue
    }

    pub fn counts_as_partition_activity(&self) -> bool {
        self.flags.counts_as_partition_activity
    }

    /// The orchestration instance this event concerns, or an empty string.
    pub fn traced_instance_id(&self) -> &str {
        match &self.kind {
            PartitionEventKind::Update(u) => u.instance_id.as_deref().unwrap_or(""),
            PartitionEventKind::Read(r) => &r.instance_id,
            _ => "",
        }
    }

    pub fn stamp_received(&mut self) {
        self.received_timestamp = timestamp();
    }

    pub fn stamp_issued(&mut self) {
        self.issued_timestamp = timestamp();
    }

    /// Copies this event so it can run through the pipeline a second time.
    ///
    /// The copy carries all data fields but gets its own attempt id, so it
    /// shares no durability listeners with `self`. It is not an input queue
    /// position marker and has not been issued yet.
    pub fn reissue(&self) -> PartitionEvent {
        PartitionEvent {
            id: self.id.clone(),
            partition_id: self.partition_id,
            next_input_queue_position: 0,
            flags: self.flags,
            kind: self.kind.clone(),
            received_timestamp: self.received_timestamp,
            issued_timestamp: 0.,
            attempt: AttemptId::next(),
        }
    }

    /// Copy for encoding. Keeps the attempt id, so it must not be submitted.
    pub(crate) fn wire_copy(&self) -> PartitionEvent {
        PartitionEvent {
            id: self.id.clone(),
            partition_id: self.partition_id,
            next_input_queue_position: self.next_input_queue_position,
            flags: self.flags,
            kind: self.kind.clone(),
            received_timestamp: self.received_timestamp,
            issued_timestamp: self.issued_timestamp,
            attempt: self.attempt,
        }
    }

    pub(crate) fn assign_attempt(&mut self) {
        self.attempt = AttemptId::next();
    }
}

impl Identified for PartitionEvent {
    fn event_id(&self) -> &EventId {
        &self.id
    }

    fn attempt(&self) -> AttemptId {
        self.attempt
    }
}

/// Compares wire data only; timestamps and attempt ids are transient.
impl PartialEq for PartitionEvent {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.partition_id == other.partition_id
            && self.next_input_queue_position == other.next_input_queue_position
            && self.flags == other.flags
            && self.kind == other.kind
    }
}

impl fmt::Display for PartitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} p{:02}", self.kind.name(), self.id, self.partition_id)
    }
}
