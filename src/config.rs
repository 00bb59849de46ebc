use std::{fmt, sync::Arc, time::Duration};

use byteorder::{ByteOrder, LittleEndian};
use typed_builder::TypedBuilder;

use crate::{
    error::Error, event::PartitionId, hex::HexDisplayExt, wire::FrameCodec,
    worker::BatchWorkerConfig,
};

/// Maps an orchestration instance id to a hash; the partition is the hash
/// modulo the partition count.
pub type InstanceHasher = Arc<dyn Fn(&str) -> u32 + Send + Sync>;

pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_secs(2);
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 64 * 1024;

/// Smallest message size that still leaves room for fragment payloads.
pub const MIN_MESSAGE_SIZE: usize = 512;

/// blake3 of the instance id, first four bytes read little-endian.
pub fn default_instance_hasher() -> InstanceHasher {
    Arc::new(|instance_id: &str| {
        let digest = blake3::hash(instance_id.as_bytes());
        LittleEndian::read_u32(&digest.as_bytes()[..4])
    })
}

#[derive(Clone, TypedBuilder)]
pub struct TransportConfig {
    pub partition_count: u32,
    #[builder(default = String::from("taskhub"), setter(into))]
    pub taskhub_name: String,
    #[builder(default = rand::random())]
    pub taskhub_guid: [u8; 16],
    #[builder(default = default_instance_hasher())]
    pub instance_hasher: InstanceHasher,
    /// Pause between load publish cycles.
    #[builder(default = DEFAULT_PUBLISH_INTERVAL)]
    pub publish_interval: Duration,
    /// Events whose archive exceeds this many bytes are fragmented.
    #[builder(default = DEFAULT_MAX_MESSAGE_SIZE)]
    pub max_message_size: usize,
    /// Fragments get an absolute timeout this far in the future.
    #[builder(default, setter(strip_option))]
    pub fragment_timeout: Option<Duration>,
    #[builder(default = DEFAULT_COMPRESS_THRESHOLD)]
    pub compress_threshold: usize,
    /// Settings shared by the per-destination senders.
    #[builder(default)]
    pub sender_batch: BatchWorkerConfig,
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.partition_count == 0 {
            return Err(Error::Config("partition count must be positive".into()));
        }
        if self.max_message_size < MIN_MESSAGE_SIZE {
            return Err(Error::Config(format!(
                "max message size must be at least {} bytes",
                MIN_MESSAGE_SIZE
            )));
        }
        if self.publish_interval.is_zero() {
            return Err(Error::Config("publish interval must be positive".into()));
        }
        Ok(())
    }

    pub fn partition_for(&self, instance_id: &str) -> PartitionId {
        (self.instance_hasher)(instance_id) % self.partition_count.max(1)
    }

    pub fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.compress_threshold)
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("partition_count", &self.partition_count)
            .field("taskhub_name", &self.taskhub_name)
            .field("taskhub_guid", &self.taskhub_guid.hex())
            .field("publish_interval", &self.publish_interval)
            .field("max_message_size", &self.max_message_size)
            .field("fragment_timeout", &self.fragment_timeout)
            .field("compress_threshold", &self.compress_threshold)
            .field("sender_batch", &self.sender_batch)
            .finish_non_exhaustive()
    }
}
