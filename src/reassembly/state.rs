use std::fmt;

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::{debug, trace};

use super::fragmentation::reassemble;
use crate::{
    error::Error,
    event::{
        EventId, InputPosition, PartitionEvent, PartitionEventFragment,
        PartitionEventKind,
    },
    transport::Partition,
    wire::{self, FrameCodec, FrameKind},
};

/// The partition's effect pipeline, as seen by the reassembly table.
pub trait EffectTracker {
    /// True while the partition replays its log during recovery.
    fn is_replaying(&self) -> bool;

    fn partition(&self) -> &dyn Partition;

    /// Runs an update event through effect determination.
    fn determine_effects(&mut self, event: PartitionEvent) -> Result<(), Error>;
}

/// Signals that partition recovery finished.
#[derive(Clone, Debug)]
pub struct RecoveryCompleted {
    pub timestamp: DateTime<Utc>,
    /// Highest position processed so far, per input queue.
    pub receive_positions: HashMap<String, InputPosition>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReassemblyOutcome {
    /// The fragment was stored; `fragments` is the group size so far.
    Stored {
        original_event_id: EventId,
        fragments: usize,
    },
    /// The group completed and the reassembled event was dispatched.
    Reassembled {
        event_id: EventId,
        kind: &'static str,
        fragments: usize,
    },
}

/// Fragments received so far, per original event. Owned by one partition and
/// only mutated on its event processing path.
#[derive(Debug, Default)]
pub struct ReassemblyState {
    fragments: HashMap<EventId, Vec<PartitionEventFragment>>,
}

impl ReassemblyState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of incomplete groups.
    pub fn pending(&self) -> usize {
        self.fragments.len()
    }

    pub fn pending_fragments(&self, original_event_id: &EventId) -> Option<usize> {
        self.fragments.get(original_event_id).map(Vec::len)
    }

    /// Stores a fragment, or reassembles and dispatches the original event
    /// when the fragment is the last of its group.
    pub fn process(
        &mut self,
        event: PartitionEvent,
        effects: &mut dyn EffectTracker,
    ) -> Result<ReassemblyOutcome, Error> {
        let next_input_queue_position = event.next_input_queue_position;
        let PartitionEvent { id, kind, .. } = event;
        let fragment = match kind {
            PartitionEventKind::Fragment(fragment) => fragment,
            other => {
                return Err(Error::UnexpectedEvent {
                    event_id: id,
                    kind: other.name(),
                    operation: "reassembly",
                })
            }
        };
        let key = fragment.original_event_id.clone();

        if fragment.is_last {
            let stored = if fragment.fragment == 0 {
                // a lone last fragment replaces any group left under its id
                if let Some(stale) = self.fragments.remove(&key) {
                    debug!("discarded {} stale fragments of {}", stale.len(), key);
                }
                Vec::new()
            } else {
                self.fragments.remove(&key).ok_or_else(|| {
                    Error::MissingFirstFragment {
                        original_event_id: key.clone(),
                        fragment: fragment.fragment,
                    }
                })?
            };
            let count = stored.len() + 1;
            let reassembled =
                reassemble(&stored, &fragment, next_input_queue_position)?;
            debug!("reassembled {} from {} fragments", reassembled, count);

            let outcome = ReassemblyOutcome::Reassembled {
                event_id: reassembled.id.clone(),
                kind: reassembled.kind.name(),
                fragments: count,
            };
            Self::dispatch(reassembled, effects)?;
            Ok(outcome)
        } else {
            let list = if fragment.fragment == 0 {
                let list = self.fragments.entry(key.clone()).or_default();
                list.clear();
                list
            } else {
                match self.fragments.get_mut(&key) {
                    Some(list) => list,
                    None => {
                        return Err(Error::MissingFirstFragment {
                            original_event_id: key,
                            fragment: fragment.fragment,
                        })
                    }
                }
            };
            list.push(fragment);
            let fragments = list.len();
            trace!("stored fragment {} of {}", fragments - 1, key);
            Ok(ReassemblyOutcome::Stored {
                original_event_id: key,
                fragments,
            })
        }
    }

    fn dispatch(
        event: PartitionEvent,
        effects: &mut dyn EffectTracker,
    ) -> Result<(), Error> {
        match event.kind {
            PartitionEventKind::Update(_) => {
                if !effects.is_replaying() {
                    effects.partition().on_submit(&event);
                }
                effects.determine_effects(event)
            }
            PartitionEventKind::Read(_) => {
                effects.partition().submit_event(event);
                Ok(())
            }
            PartitionEventKind::Query(_) => {
                effects.partition().submit_parallel_event(event);
                Ok(())
            }
            PartitionEventKind::Fragment(_) => Err(Error::UnexpectedReassembledEvent {
                event_id: event.id,
                kind: "fragment",
            }),
        }
    }

    /// Drops incomplete groups whose original is known to be abandoned.
    /// Returns the number of groups removed. Nothing is dispatched.
    pub fn process_recovery_completed(
        &mut self,
        evt: &RecoveryCompleted,
        effects: &dyn EffectTracker,
    ) -> usize {
        let expired: Vec<EventId> = self
            .fragments
            .iter()
            .filter(|(_, list)| Self::is_expired(list, evt))
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(list) = self.fragments.remove(id) {
                if !effects.is_replaying() {
                    debug!(
                        "dropped {} expired fragments for id={} during recovery",
                        list.len(),
                        id
                    );
                }
            }
        }
        expired.len()
    }

    /// Decided by the first fragment of the group alone, so replaying the same
    /// recovery event gives the same answer.
    fn is_expired(list: &[PartitionEventFragment], evt: &RecoveryCompleted) -> bool {
        let Some(first) = list.first() else {
            return false;
        };
        if let Some(timeout) = first.timeout {
            timeout < evt.timestamp.timestamp_micros()
        } else if let Some(dedup) = &first.dedup_position {
            let last_processed = evt
                .receive_positions
                .get(&dedup.queue)
                .copied()
                .unwrap_or_default();
            last_processed >= dedup.position
        } else {
            false
        }
    }

    /// Key-ordered copy of the table, for persisting with partition state.
    pub fn snapshot(&self) -> ReassemblySnapshot {
        let mut groups: Vec<FragmentGroup> = self
            .fragments
            .iter()
            .map(|(id, fragments)| FragmentGroup {
                original_event_id: id.clone(),
                fragments: fragments.clone(),
            })
            .collect();
        groups.sort_by(|a, b| a.original_event_id.cmp(&b.original_event_id));
        ReassemblySnapshot { groups }
    }

    pub fn restore(snapshot: ReassemblySnapshot) -> Self {
        Self {
            fragments: snapshot
                .groups
                .into_iter()
                .map(|g| (g.original_event_id, g.fragments))
                .collect(),
        }
    }

    pub fn encode(&self, codec: &FrameCodec) -> Result<Vec<u8>, Error> {
        let payload = wire::archive(&self.snapshot())?;
        codec.seal(FrameKind::ReassemblySnapshot, &payload)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, Error> {
        let payload = wire::open(frame, FrameKind::ReassemblySnapshot)?;
        Ok(Self::restore(wire::unarchive(&payload)?))
    }
}

impl fmt::Display for ReassemblyState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reassembly ({} pending)", self.fragments.len())
    }
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct FragmentGroup {
    pub original_event_id: EventId,
    pub fragments: Vec<PartitionEventFragment>,
}

#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct ReassemblySnapshot {
    pub groups: Vec<FragmentGroup>,
}
