use chrono::{DateTime, Utc};
use typed_builder::TypedBuilder;

use crate::{
    error::Error,
    event::{
        DedupPosition, PartitionEvent, PartitionEventFragment, PartitionEventKind,
    },
    wire,
};

/// Expiry hints stamped on every fragment of a group.
#[derive(Clone, Debug, Default, TypedBuilder)]
pub struct FragmentOptions {
    /// After this instant an incomplete group may be dropped on recovery.
    #[builder(default, setter(strip_option))]
    pub timeout: Option<DateTime<Utc>>,
    /// Queue position of the original; once processed past it, an incomplete
    /// group may be dropped on recovery.
    #[builder(default, setter(strip_option))]
    pub dedup_position: Option<DedupPosition>,
}

/// Splits an event into fragments carrying at most `max_fragment_size`
/// archived bytes each.
pub fn fragment(
    event: &PartitionEvent,
    max_fragment_size: usize,
    options: &FragmentOptions,
) -> Result<Vec<PartitionEvent>, Error> {
    let bytes = wire::archive(event)?;
    fragment_archived(event, &bytes, max_fragment_size, options)
}

/// Same as [`fragment`], for callers that already hold the archived bytes.
pub(crate) fn fragment_archived(
    event: &PartitionEvent,
    bytes: &[u8],
    max_fragment_size: usize,
    options: &FragmentOptions,
) -> Result<Vec<PartitionEvent>, Error> {
    if max_fragment_size == 0 {
        return Err(Error::Config("fragment size must be positive".into()));
    }
    let count = bytes.len().div_ceil(max_fragment_size);
    let fragments = bytes
        .chunks(max_fragment_size)
        .enumerate()
        .map(|(index, chunk)| {
            fragment_event(event, index as u32, index + 1 == count, options, chunk.to_vec())
        })
        .collect();
    Ok(fragments)
}

/// A payload-free fragment of `event` with the widest possible index. Its
/// archived size bounds the space every fragment needs besides its bytes.
pub(crate) fn empty_fragment(event: &PartitionEvent, options: &FragmentOptions) -> PartitionEvent {
    fragment_event(event, u32::MAX, false, options, Vec::new())
}

fn fragment_event(
    event: &PartitionEvent,
    index: u32,
    is_last: bool,
    options: &FragmentOptions,
    bytes: Vec<u8>,
) -> PartitionEvent {
    let fragment = PartitionEventFragment {
        original_event_id: event.id.clone(),
        fragment: index,
        is_last,
        timeout: options.timeout.map(|t| t.timestamp_micros()),
        dedup_position: options.dedup_position.clone(),
        bytes,
    };
    PartitionEvent::new(
        format!("{}F{}", event.id, index),
        event.partition_id,
        PartitionEventKind::Fragment(fragment),
    )
    .with_next_input_queue_position(event.next_input_queue_position)
}

/// Rebuilds the original event from the stored fragments followed by the
/// last one. The result takes its input queue position from the last
/// fragment.
pub fn reassemble(
    stored: &[PartitionEventFragment],
    last: &PartitionEventFragment,
    next_input_queue_position: u64,
) -> Result<PartitionEvent, Error> {
    let len = stored.iter().map(|f| f.bytes.len()).sum::<usize>() + last.bytes.len();
    let mut bytes = Vec::with_capacity(len);
    for fragment in stored {
        bytes.extend_from_slice(&fragment.bytes);
    }
    bytes.extend_from_slice(&last.bytes);

    let mut event: PartitionEvent = wire::unarchive(&bytes)?;
    event.assign_attempt();
    event.next_input_queue_position = next_input_queue_position;
    Ok(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::UpdateEvent;

    #[test]
    fn only_the_final_fragment_is_last() {
        let event = PartitionEvent::update(
            "U1",
            2,
            UpdateEvent {
                instance_id: None,
                payload: vec![9; 300],
            },
        );
        let fragments = fragment(&event, 64, &FragmentOptions::default()).unwrap();
        assert!(fragments.len() > 1);
        for (index, f) in fragments.iter().enumerate() {
            let PartitionEventKind::Fragment(inner) = &f.kind else {
                panic!("expected a fragment");
            };
            assert_eq!(inner.fragment as usize, index);
            assert_eq!(inner.is_last, index + 1 == fragments.len());
            assert_eq!(f.partition_id, 2);
            assert_eq!(f.id.as_str(), format!("U1F{}", index));
        }
    }

    #[test]
    fn zero_sized_fragments_are_rejected() {
        let event = PartitionEvent::update(
            "U2",
            0,
            UpdateEvent {
                instance_id: None,
                payload: vec![],
            },
        );
        assert!(matches!(
            fragment(&event, 0, &FragmentOptions::default()),
            Err(Error::Config(_))
        ));
    }
}
