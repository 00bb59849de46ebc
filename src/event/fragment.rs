use rkyv::{Archive, Deserialize, Serialize};

use super::EventId;

/// A position in an input queue. Ordered by offset, then by index within the
/// batch at that offset.
#[derive(
    Archive,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Debug,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
)]
#[archive(check_bytes)]
pub struct InputPosition {
    pub offset: u64,
    pub batch_index: u32,
}

impl InputPosition {
    pub fn new(offset: u64, batch_index: u32) -> Self {
        Self {
            offset,
            batch_index,
        }
    }
}

/// Where the original of a fragmented event was read from. Once the receiving
/// partition has processed that queue at or past this position, the original
/// has been superseded and its leftover fragments can be dropped.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct DedupPosition {
    pub queue: String,
    pub position: InputPosition,
}

/// One piece of an event that was too large for a single transport message.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PartitionEventFragment {
    pub original_event_id: EventId,
    /// Zero-based index within the group.
    pub fragment: u32,
    pub is_last: bool,
    /// Absolute expiry in unix microseconds.
    pub timeout: Option<i64>,
    pub dedup_position: Option<DedupPosition>,
    pub bytes: Vec<u8>,
}
