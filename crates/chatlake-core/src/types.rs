use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One webhook delivery as captured by the HTTP endpoint, before any
/// interpretation of the body.
#[derive(Debug, Clone)]
pub struct RawDelivery {
    pub received_at: DateTime<Utc>,
    pub client_addr: String,
    /// Header pairs in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// One line of a day-log. Field order matters: it is the on-disk wire
/// format consumed by the compaction engine and external tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRecord {
    pub received_at: DateTime<Utc>,
    pub client_ip: String,
    pub headers: Vec<(String, String)>,
    /// Lossy UTF-8 decode of the body. Binary payloads survive here.
    pub body_text: String,
    pub body_bytes_length: usize,
    /// Present when the body parsed as JSON or form-urlencoded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed_object: Option<serde_json::Value>,
    /// Present when it did not. Exactly one of the two is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
    pub processing_time_ms: u64,
}

/// Normalized messaging record as stored in the columnar lake.
///
/// `msg_id` is the primary identity: it appears at most once across all
/// published partitions. `create_time` and `ingestion_time` are epoch
/// seconds, UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalMessage {
    pub msg_id: String,
    pub from_user: String,
    pub to_user: String,
    /// Empty for direct messages.
    pub chatroom: String,
    /// Empty for direct messages.
    pub chatroom_sender: String,
    pub msg_type: i32,
    pub create_time: i64,
    pub is_chatroom_msg: bool,
    pub content: String,
    /// Upstream payloads carry this as integer or string; canonical form is
    /// always string.
    pub source: String,
    pub guid: String,
    pub notify_type: i64,
    pub ingestion_time: i64,
}

impl CanonicalMessage {
    /// UTC calendar date this message partitions under.
    pub fn partition_date(&self) -> NaiveDate {
        DateTime::<Utc>::from_timestamp(self.create_time, 0)
            .unwrap_or_default()
            .date_naive()
    }
}

/// Contact-sync record. Append-only; readers resolve the latest row per
/// `username`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactRecord {
    pub username: String,
    pub nickname: String,
    pub remark: String,
    pub avatar: String,
    pub contact_type: String,
    pub ingestion_time: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointStatus {
    Processing,
    Completed,
    Failed,
}

impl fmt::Display for CheckpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CheckpointStatus::Processing => "processing",
            CheckpointStatus::Completed => "completed",
            CheckpointStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Per-source compaction progress. One checkpoint file per day-log,
/// atomically replaced on every advance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub source_path: String,
    /// Byte offset into the source; monotonically non-decreasing.
    pub last_processed_offset: u64,
    /// msg_id of the last canonical record emitted, for de-duplication.
    pub last_processed_key: Option<String>,
    pub record_count: u64,
    pub status: CheckpointStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// sha256 of the source file content at completion time. A match on the
    /// next run makes compaction a no-op.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_hash: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(source_path: impl Into<String>) -> Self {
        Self {
            source_path: source_path.into(),
            last_processed_offset: 0,
            last_processed_key: None,
            record_count: 0,
            status: CheckpointStatus::Processing,
            error: None,
            source_hash: None,
            updated_at: Utc::now(),
        }
    }
}

/// Inclusive calendar date range, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    pub fn single(day: NaiveDate) -> Self {
        Self {
            start: day,
            end: day,
        }
    }

    pub fn contains(&self, day: NaiveDate) -> bool {
        day >= self.start && day <= self.end
    }

    /// Every day in the range, in order.
    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let mut current = self.start;
        let end = self.end;
        std::iter::from_fn(move || {
            if current > end {
                return None;
            }
            let day = current;
            current = current.succ_opt()?;
            Some(day)
        })
    }
}

impl fmt::Display for DateRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// One clustered conversation topic, the final output of analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicSummary {
    pub chatroom: String,
    pub date_range: DateRange,
    pub title: String,
    pub summary_text: String,
    pub keywords: Vec<String>,
    pub participants: Vec<String>,
    pub message_ids: Vec<String>,
    /// In [0, 1].
    pub confidence: f32,
    /// "HH:MM-HH:MM".
    pub time_range: String,
    pub notes: String,
}

/// Lifecycle of one analysis run: pending → running → terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    CompletedPartial,
    Failed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::CompletedPartial => "completed-partial",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "completed-partial" => Ok(RunStatus::CompletedPartial),
            "failed" => Ok(RunStatus::Failed),
            other => Err(format!("unknown run status: {other}")),
        }
    }
}
