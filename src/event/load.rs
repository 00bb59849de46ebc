use rkyv::{Archive, Deserialize, Serialize};

/// Point-in-time load of one partition, as used for scaling decisions.
#[derive(Archive, Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[archive(check_bytes)]
pub struct PartitionLoadInfo {
    pub work_items: u32,
    pub activities: u32,
    pub timers: u32,
    pub requests: u32,
    pub outbox: u32,
    pub instances: u64,
    /// Unix microseconds of the next timer, if any.
    pub wake_at: Option<i64>,
    pub worker_id: String,
}
