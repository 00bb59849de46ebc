use std::borrow::Cow;

use byteorder::{ByteOrder, LittleEndian};
use rkyv::{
    bytecheck::CheckBytes, de::deserializers::SharedDeserializeMap,
    ser::serializers::AllocSerializer,
    validation::validators::DefaultValidator, AlignedVec, Archive, Deserialize,
    Serialize,
};

use crate::{
    error::Error,
    event::{Event, PartitionEvent},
};

/// Scratch space reserved on the stack when archiving a value.
const SCRATCH: usize = 1024;

/// prefix | len (u32 LE)
pub const HEADER_LEN: usize = 1 + 4;

/// Frame prefix is 8 bits. The first bit specifies whether the payload is
/// compressed. The last 6 bits specify the frame kind.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePrefix(u8);

impl FramePrefix {
    pub fn new(compressed: bool, kind: FrameKind) -> Self {
        let mut prefix = 0b0000_0000;
        if compressed {
            prefix |= 0b1000_0000;
        }
        prefix |= kind as u8;
        Self(prefix)
    }

    pub fn compressed(&self) -> bool {
        self.0 & 0b1000_0000 != 0
    }

    pub fn kind(&self) -> Result<FrameKind, Error> {
        FrameKind::try_from(self.0 & 0b0011_1111)
    }

    pub fn byte(&self) -> u8 {
        self.0
    }
}

impl From<u8> for FramePrefix {
    fn from(byte: u8) -> Self {
        Self(byte)
    }
}

impl From<FramePrefix> for u8 {
    fn from(prefix: FramePrefix) -> Self {
        prefix.0
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// Exactly one event of any kind
    Event = 1,
    /// An ordered batch of partition events
    PartitionBatch = 2,
    /// Persisted reassembly table of a partition
    ReassemblySnapshot = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Event),
            2 => Ok(FrameKind::PartitionBatch),
            3 => Ok(FrameKind::ReassemblySnapshot),
            _ => Err(Error::Frame("unknown frame kind")),
        }
    }
}

#[derive(Archive, Serialize, Deserialize)]
#[archive(check_bytes)]
struct PartitionBatch {
    events: Vec<PartitionEvent>,
}

/// Encodes events into frames and back.
#[derive(Clone, Copy, Debug)]
pub struct FrameCodec {
    compress_threshold: usize,
}

impl FrameCodec {
    /// Payloads of at least `compress_threshold` bytes are compressed when the
    /// `compression` feature is enabled.
    pub fn new(compress_threshold: usize) -> Self {
        Self { compress_threshold }
    }

    pub fn encode_event(&self, event: &Event) -> Result<Vec<u8>, Error> {
        let payload = archive(event)?;
        self.seal(FrameKind::Event, &payload)
    }

    pub fn decode_event(&self, frame: &[u8]) -> Result<Event, Error> {
        let payload = open(frame, FrameKind::Event)?;
        let mut event: Event = unarchive(&payload)?;
        event.assign_attempt();
        Ok(event)
    }

    pub fn encode_partition_batch(
        &self,
        events: &[PartitionEvent],
    ) -> Result<Vec<u8>, Error> {
        let events = events.iter().map(PartitionEvent::wire_copy).collect();
        let payload = archive(&PartitionBatch { events })?;
        self.seal(FrameKind::PartitionBatch, &payload)
    }

    pub fn decode_partition_batch(
        &self,
        frame: &[u8],
    ) -> Result<Vec<PartitionEvent>, Error> {
        let payload = open(frame, FrameKind::PartitionBatch)?;
        let PartitionBatch { mut events } = unarchive(&payload)?;
        for event in &mut events {
            event.assign_attempt();
        }
        Ok(events)
    }

    pub(crate) fn seal(
        &self,
        kind: FrameKind,
        payload: &[u8],
    ) -> Result<Vec<u8>, Error> {
        let (compressed, body) =
            match compress_above(payload, self.compress_threshold)? {
                Some(compressed) => (true, Cow::Owned(compressed)),
                None => (false, Cow::Borrowed(payload)),
            };
        let len = u32::try_from(body.len())
            .map_err(|_| Error::Frame("payload exceeds u32 length"))?;
        let mut frame = Vec::with_capacity(HEADER_LEN + body.len());
        frame.push(FramePrefix::new(compressed, kind).byte()); // 1 byte
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, len);
        frame.extend_from_slice(&len_buf); // 4 bytes
        frame.extend_from_slice(&body); // len bytes
        Ok(frame)
    }
}

/// Reads the header of a frame, checks its kind and returns the (inflated)
/// payload.
pub(crate) fn open(frame: &[u8], expected: FrameKind) -> Result<Cow<'_, [u8]>, Error> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Frame("truncated header"));
    }
    let prefix = FramePrefix::from(frame[0]);
    if prefix.kind()? != expected {
        return Err(Error::Frame("unexpected frame kind"));
    }
    let len = LittleEndian::read_u32(&frame[1..HEADER_LEN]) as usize;
    let payload = &frame[HEADER_LEN..];
    if payload.len() != len {
        return Err(Error::Frame("payload length does not match header"));
    }
    if prefix.compressed() {
        Ok(Cow::Owned(decompress(payload)?))
    } else {
        Ok(Cow::Borrowed(payload))
    }
}

/// Archives a value without framing.
pub(crate) fn archive<T>(value: &T) -> Result<AlignedVec, Error>
where
    T: Serialize<AllocSerializer<SCRATCH>>,
{
    rkyv::to_bytes::<_, SCRATCH>(value)
        .map_err(|_| Error::Codec("could not archive value"))
}

/// Validates and deserializes an archived value. The bytes are copied into an
/// aligned buffer first, so they may come from any slice.
pub(crate) fn unarchive<T>(bytes: &[u8]) -> Result<T, Error>
where
    T: Archive,
    T::Archived: for<'a> CheckBytes<DefaultValidator<'a>>
        + Deserialize<T, SharedDeserializeMap>,
{
    let mut aligned = AlignedVec::with_capacity(bytes.len());
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<T>(&aligned)
        .map_err(|_| Error::Codec("archived value failed validation"))
}

#[cfg(feature = "compression")]
fn compress_above(payload: &[u8], threshold: usize) -> Result<Option<Vec<u8>>, Error> {
    if payload.len() < threshold {
        return Ok(None);
    }
    Ok(Some(zstd::encode_all(payload, 0)?))
}

#[cfg(not(feature = "compression"))]
fn compress_above(_payload: &[u8], _threshold: usize) -> Result<Option<Vec<u8>>, Error> {
    Ok(None)
}

#[cfg(feature = "compression")]
fn decompress(payload: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(zstd::decode_all(payload)?)
}

#[cfg(not(feature = "compression"))]
fn decompress(_payload: &[u8]) -> Result<Vec<u8>, Error> {
    Err(Error::Frame("compressed frames need the compression feature"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClientEvent, Identified, ReadEvent, PartitionEventKind};

    #[test]
    fn prefix_keeps_kind_and_compression_apart() {
        let prefix = FramePrefix::new(true, FrameKind::PartitionBatch);
        assert!(prefix.compressed());
        assert_eq!(prefix.kind().unwrap(), FrameKind::PartitionBatch);
        assert!(FramePrefix::from(0b0000_0111).kind().is_err());
    }

    #[test]
    fn decoded_events_get_fresh_attempts() {
        let codec = FrameCodec::new(usize::MAX);
        let event = Event::from(ClientEvent::new("C1", [7; 16], 9, b"done".to_vec()));
        let frame = codec.encode_event(&event).unwrap();
        let decoded = codec.decode_event(&frame).unwrap();
        assert_eq!(decoded, event);
        assert_ne!(decoded.attempt(), event.attempt());
    }

    #[test]
    fn rejects_frames_of_the_wrong_kind() {
        let codec = FrameCodec::new(usize::MAX);
        let read = PartitionEvent::new(
            "R1",
            0,
            PartitionEventKind::Read(ReadEvent {
                instance_id: "a".into(),
                payload: vec![],
            }),
        );
        let frame = codec.encode_partition_batch(&[read]).unwrap();
        assert!(matches!(
            codec.decode_event(&frame),
            Err(Error::Frame("unexpected frame kind"))
        ));
        assert!(matches!(
            codec.decode_partition_batch(&frame[..3]),
            Err(Error::Frame("truncated header"))
        ));
    }

    #[cfg(feature = "compression")]
    #[test]
    fn large_payloads_are_compressed() {
        let codec = FrameCodec::new(64);
        let event = PartitionEvent::new(
            "R2",
            1,
            PartitionEventKind::Read(ReadEvent {
                instance_id: "b".into(),
                payload: vec![0u8; 4096],
            }),
        );
        let frame = codec.encode_partition_batch(&[event]).unwrap();
        assert!(FramePrefix::from(frame[0]).compressed());
        assert!(frame.len() < 4096);
        let events = codec.decode_partition_batch(&frame).unwrap();
        assert_eq!(events[0].partition_id, 1);
    }
}
