use chatlake_core::types::{DateRange, RunStatus};

/// A persisted analysis run. One row per (chatroom, date range); re-runs
/// overwrite in place.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    pub chatroom: String,
    pub date_range: DateRange,
    pub status: RunStatus,
    pub error: Option<String>,
    pub batches_total: u32,
    pub batches_failed: u32,
    pub message_count: u64,
    pub topic_count: u32,
    /// RFC3339 timestamps.
    pub started_at: String,
    pub finished_at: Option<String>,
    pub updated_at: String,
}

/// Cached statistics for one partition directory.
#[derive(Debug, Clone)]
pub struct PartitionMeta {
    pub dataset: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub file_count: u64,
    pub row_count: u64,
    pub total_bytes: u64,
    pub min_ts: Option<i64>,
    pub max_ts: Option<i64>,
}
