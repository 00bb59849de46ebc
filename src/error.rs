use std::io;

use thiserror::Error;

use crate::{
    event::{EventId, PartitionId},
    transport::Destination,
};

#[derive(Debug, Error)]
pub enum Error {
    /// A fragment with a non-zero index arrived for a group whose first
    /// fragment was never stored. The transport reordered or lost fragments.
    #[error("fragment {fragment} of event {original_event_id} arrived before its first fragment")]
    MissingFirstFragment {
        original_event_id: EventId,
        fragment: u32,
    },
    /// Reassembly produced an event that has no dispatch path.
    #[error("reassembled event {event_id} is a {kind} event and cannot be dispatched")]
    UnexpectedReassembledEvent { event_id: EventId, kind: &'static str },
    /// An operation received an event variant it does not handle.
    #[error("{operation} cannot handle {kind} event {event_id}")]
    UnexpectedEvent {
        event_id: EventId,
        kind: &'static str,
        operation: &'static str,
    },
    /// An event was submitted to a sender or endpoint that does not serve its
    /// destination kind.
    #[error("{kind} event {event_id} was misrouted to a {role}")]
    Misrouted {
        event_id: EventId,
        kind: &'static str,
        role: &'static str,
    },
    #[error("partition {0} is out of range")]
    UnknownPartition(PartitionId),
    #[error("no endpoint is registered for {0}")]
    UnknownDestination(Destination),
    #[error("codec error: {0}")]
    Codec(&'static str),
    #[error("malformed frame: {0}")]
    Frame(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("batch worker {0} has stopped")]
    WorkerStopped(&'static str),
    #[error("batch worker {name} is full ({depth} queued items)")]
    QueueFull { name: &'static str, depth: usize },
    #[error("operation was cancelled")]
    Cancelled,
    #[error("event {0} was abandoned before it became durable")]
    Abandoned(EventId),
    #[error("partition {0} failed to start: {1}")]
    Startup(PartitionId, String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("load publish failed: {0}")]
    Publish(String),
}
