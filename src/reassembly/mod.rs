//! Oversized events cross the transport as ordered fragment groups and are
//! put back together by the receiving partition.
//!
//! The transport must deliver the fragments of one group in order and exactly
//! once. Reordering or loss surfaces as [`Error::MissingFirstFragment`] and
//! is not recovered from here.
//!
//! [`Error::MissingFirstFragment`]: crate::Error::MissingFirstFragment

mod fragmentation;
mod state;

pub use fragmentation::{fragment, reassemble, FragmentOptions};
pub(crate) use fragmentation::{empty_fragment, fragment_archived};
pub use state::{
    EffectTracker, FragmentGroup, ReassemblyOutcome, ReassemblySnapshot,
    ReassemblyState, RecoveryCompleted,
};
