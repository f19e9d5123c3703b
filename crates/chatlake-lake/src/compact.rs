//! Day-log → partitioned columnar conversion with exactly-once publication.
//!
//! The engine holds the partition-root lock for the whole run, streams the
//! source from the checkpointed offset, classifies each delivery, filters
//! against already-published msg_ids, and publishes per-partition batches
//! via write-to-`.tmp`-then-rename. The checkpoint only advances after a
//! publish, so a crash at any point either re-reads data the dedup index
//! filters out, or never observes the torn batch (cleaned from `.tmp` on the
//! next run).

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use chatlake_core::types::{
    CanonicalMessage, Checkpoint, CheckpointStatus, ContactRecord, RawRecord,
};

use crate::checkpoint::{content_hash, CheckpointStore};
use crate::columnar::{list_columnar_files, read_msg_ids, write_contacts, write_messages};
use crate::dedup::{DedupIndex, DedupSizing};
use crate::error::{classify_io, IoReason, LakeError, Result};
use crate::lock::DirLock;
use crate::partition::{contacts_root, partition_dir, TMP_DIR};

/// Which dataset a published file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dataset {
    Messages,
    Contacts,
}

/// One published file, for the metadata partition cache and lineage.
#[derive(Debug, Clone)]
pub struct PartitionWrite {
    pub dataset: Dataset,
    pub date: NaiveDate,
    pub rows: usize,
    pub bytes: u64,
    pub min_create_time: i64,
    pub max_create_time: i64,
}

#[derive(Debug, Default)]
pub struct CompactionStats {
    pub new_records: u64,
    pub duplicates: u64,
    pub malformed_lines: u64,
    pub unclassified: u64,
    pub contacts: u64,
    pub writes: Vec<PartitionWrite>,
}

pub struct Compactor {
    partition_root: PathBuf,
    checkpoints: CheckpointStore,
    batch_size: usize,
    compression: String,
    dedup_sizing: DedupSizing,
    lock_timeout: Duration,
}

struct PartitionAcc {
    dedup: DedupIndex,
    pending: Vec<CanonicalMessage>,
}

/// Streaming run state: accumulators plus the offset/key the checkpoint will
/// advance to at the next flush.
struct RunState {
    messages: HashMap<NaiveDate, PartitionAcc>,
    contacts: HashMap<NaiveDate, Vec<ContactRecord>>,
    pending_total: usize,
    consumed_offset: u64,
    last_key: Option<String>,
    stats: CompactionStats,
    /// First few unrecognized payload shapes, for one summary log line.
    unknown_shapes: Vec<String>,
}

impl Compactor {
    pub fn new(
        partition_root: impl Into<PathBuf>,
        checkpoints: CheckpointStore,
        batch_size: usize,
        compression: impl Into<String>,
        dedup_sizing: DedupSizing,
        lock_timeout: Duration,
    ) -> Self {
        Self {
            partition_root: partition_root.into(),
            checkpoints,
            batch_size: batch_size.max(1),
            compression: compression.into(),
            dedup_sizing,
            lock_timeout,
        }
    }

    /// Compact one day-log into the lake. Idempotent: a completed checkpoint
    /// with a matching content hash short-circuits; anything else resumes
    /// from the recorded offset with dedup filtering re-reads.
    pub fn compact(&self, source_path: &Path) -> Result<CompactionStats> {
        std::fs::create_dir_all(&self.partition_root)
            .map_err(|e| classify_io(e, "create partition root"))?;

        let lock_path = self.partition_root.join(".compactor.lock");
        let _lock = match DirLock::acquire(&lock_path, self.lock_timeout) {
            Ok(lock) => lock,
            Err(e) if e.io_reason() == Some(IoReason::Timeout) => {
                return Err(LakeError::CheckpointConflict(format!(
                    "another compactor holds {}",
                    lock_path.display()
                )));
            }
            Err(e) => return Err(e),
        };

        self.clean_stale_tmp();

        let source_hash = content_hash(source_path)?;
        let checkpoint = self.checkpoints.load(source_path)?;
        let start_offset = match &checkpoint {
            Some(cp) if cp.status == CheckpointStatus::Completed => {
                if cp.source_hash.as_deref() == Some(source_hash.as_str()) {
                    debug!(source = %source_path.display(), "source unchanged since completion; no-op");
                    return Ok(CompactionStats::default());
                }
                // Same source grew (still receiving); resume from the end of
                // what was already processed.
                cp.last_processed_offset
            }
            Some(cp) => cp.last_processed_offset,
            None => 0,
        };
        let prior_count = checkpoint.as_ref().map(|cp| cp.record_count).unwrap_or(0);

        info!(
            source = %source_path.display(),
            start_offset,
            "compaction starting"
        );

        let mut file = File::open(source_path).map_err(|e| classify_io(e, "open source"))?;
        file.seek(SeekFrom::Start(start_offset))
            .map_err(|e| classify_io(e, "seek source"))?;
        let mut reader = BufReader::new(file);

        let mut state = RunState {
            messages: HashMap::new(),
            contacts: HashMap::new(),
            pending_total: 0,
            consumed_offset: start_offset,
            last_key: None,
            stats: CompactionStats::default(),
            unknown_shapes: Vec::new(),
        };

        let ingestion_time = Utc::now().timestamp();
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| classify_io(e, "read source line"))?;
            if read == 0 {
                break;
            }
            if !line.ends_with(b"\n") {
                // Torn final line: leave it for the next run, when the
                // writer has finished it.
                debug!(source = %source_path.display(), "trailing partial line deferred");
                break;
            }

            self.consume_line(&mut state, &line, ingestion_time)?;
            state.consumed_offset += read as u64;

            if state.pending_total >= self.batch_size {
                self.flush(source_path, &mut state, prior_count, None)?;
            }
        }

        self.flush(source_path, &mut state, prior_count, Some(&source_hash))?;

        if !state.unknown_shapes.is_empty() {
            warn!(
                source = %source_path.display(),
                skipped = state.stats.unclassified,
                shapes = ?state.unknown_shapes,
                "deliveries matched no known schema"
            );
        }
        info!(
            source = %source_path.display(),
            new_records = state.stats.new_records,
            duplicates = state.stats.duplicates,
            malformed = state.stats.malformed_lines,
            contacts = state.stats.contacts,
            "compaction finished"
        );
        Ok(state.stats)
    }

    fn consume_line(&self, state: &mut RunState, line: &[u8], ingestion_time: i64) -> Result<()> {
        let record: RawRecord = match serde_json::from_slice(line) {
            Ok(record) => record,
            Err(e) => {
                state.stats.malformed_lines += 1;
                warn!(error = %e, "malformed raw-log line skipped");
                return Ok(());
            }
        };
        let Some(payload) = record.parsed_object else {
            state.stats.unclassified += 1;
            return Ok(());
        };

        match classify(&payload) {
            Classification::Message => match normalize_message(&payload, ingestion_time) {
                Some(msg) => self.accept_message(state, msg)?,
                None => {
                    state.stats.unclassified += 1;
                    remember_shape(&mut state.unknown_shapes, &payload);
                }
            },
            Classification::Contact => {
                let contact = normalize_contact(&payload, ingestion_time);
                state
                    .contacts
                    .entry(record.received_at.date_naive())
                    .or_default()
                    .push(contact);
                state.stats.contacts += 1;
                state.pending_total += 1;
            }
            Classification::Unknown => {
                state.stats.unclassified += 1;
                remember_shape(&mut state.unknown_shapes, &payload);
            }
        }
        Ok(())
    }

    fn accept_message(&self, state: &mut RunState, msg: CanonicalMessage) -> Result<()> {
        let date = msg.partition_date();
        if !state.messages.contains_key(&date) {
            let dedup = self.load_dedup(date)?;
            state.messages.insert(
                date,
                PartitionAcc {
                    dedup,
                    pending: Vec::new(),
                },
            );
        }
        let acc = state.messages.get_mut(&date).expect("inserted above");
        if acc.dedup.probably_contains(&msg.msg_id) {
            state.stats.duplicates += 1;
            debug!(msg_id = %msg.msg_id, "duplicate skipped");
            return Ok(());
        }
        acc.dedup.insert(&msg.msg_id);
        state.last_key = Some(msg.msg_id.clone());
        acc.pending.push(msg);
        state.pending_total += 1;
        state.stats.new_records += 1;
        Ok(())
    }

    /// Seed the dedup index with every msg_id already published for `date`.
    fn load_dedup(&self, date: NaiveDate) -> Result<DedupIndex> {
        let dir = partition_dir(&self.partition_root, date);
        let files = list_columnar_files(&dir)?;
        let mut all_ids = Vec::new();
        for file in files {
            match read_msg_ids(&file) {
                Ok(ids) => all_ids.extend(ids),
                // A torn file from a crashed publish never made it out of
                // .tmp, so a read failure here is corruption worth surfacing.
                Err(e) => {
                    return Err(LakeError::Columnar(format!(
                        "published file unreadable {}: {e}",
                        file.display()
                    )))
                }
            }
        }
        let mut index = DedupIndex::with_capacity(all_ids.len(), self.dedup_sizing);
        for id in &all_ids {
            index.insert(id);
        }
        debug!(date = %date, published = index.len(), "dedup index loaded");
        Ok(index)
    }

    /// Publish all pending batches, then advance the checkpoint to the
    /// consumed offset. `final_hash` marks the terminal flush of a run.
    fn flush(
        &self,
        source_path: &Path,
        state: &mut RunState,
        prior_count: u64,
        final_hash: Option<&str>,
    ) -> Result<()> {
        let has_pending = state.pending_total > 0;
        if has_pending {
            let batch_id = Uuid::new_v4().to_string();
            let tmp_dir = self.partition_root.join(TMP_DIR).join(&batch_id);
            if let Err(e) = self.publish_batch(state, &batch_id, &tmp_dir) {
                // Failed publishes leave nothing visible; the checkpoint
                // stays where it was, so a rerun covers this range again.
                let _ = std::fs::remove_dir_all(&tmp_dir);
                return Err(e);
            }
            state.pending_total = 0;
        }

        if !has_pending && final_hash.is_none() {
            return Ok(());
        }

        let checkpoint = Checkpoint {
            source_path: source_path.to_string_lossy().into_owned(),
            last_processed_offset: state.consumed_offset,
            last_processed_key: state.last_key.clone(),
            record_count: prior_count + state.stats.new_records,
            status: if final_hash.is_some() {
                CheckpointStatus::Completed
            } else {
                CheckpointStatus::Processing
            },
            error: None,
            source_hash: final_hash.map(String::from),
            updated_at: Utc::now(),
        };
        self.checkpoints.save(&checkpoint)
    }

    fn publish_batch(&self, state: &mut RunState, batch_id: &str, tmp_dir: &Path) -> Result<()> {
        std::fs::create_dir_all(tmp_dir).map_err(|e| classify_io(e, "create batch tmp dir"))?;

        let mut seq = 0usize;
        for (date, acc) in state.messages.iter_mut() {
            if acc.pending.is_empty() {
                continue;
            }
            let tmp_file = tmp_dir.join(format!("messages-{seq}.col"));
            let written = write_messages(&tmp_file, &acc.pending, &self.compression)?;

            let target_dir = partition_dir(&self.partition_root, *date);
            std::fs::create_dir_all(&target_dir)
                .map_err(|e| classify_io(e, "create partition dir"))?;
            let target = target_dir.join(format!("part-{batch_id}-{seq}.col"));
            crate::atomic::rename_durable(&tmp_file, &target)?;

            info!(
                partition = %date,
                rows = written.rows,
                bytes = written.bytes,
                "batch published"
            );
            state.stats.writes.push(PartitionWrite {
                dataset: Dataset::Messages,
                date: *date,
                rows: written.rows,
                bytes: written.bytes,
                min_create_time: written.min_create_time,
                max_create_time: written.max_create_time,
            });
            acc.pending.clear();
            seq += 1;
        }

        let contacts_base = contacts_root(&self.partition_root);
        for (date, pending) in state.contacts.iter_mut() {
            if pending.is_empty() {
                continue;
            }
            let tmp_file = tmp_dir.join(format!("contacts-{seq}.col"));
            let written = write_contacts(&tmp_file, pending, &self.compression)?;

            let target_dir = partition_dir(&contacts_base, *date);
            std::fs::create_dir_all(&target_dir)
                .map_err(|e| classify_io(e, "create contacts partition dir"))?;
            let target = target_dir.join(format!("part-{batch_id}-{seq}.col"));
            crate::atomic::rename_durable(&tmp_file, &target)?;

            state.stats.writes.push(PartitionWrite {
                dataset: Dataset::Contacts,
                date: *date,
                rows: written.rows,
                bytes: written.bytes,
                min_create_time: written.min_create_time,
                max_create_time: written.max_create_time,
            });
            pending.clear();
            seq += 1;
        }

        let _ = std::fs::remove_dir_all(tmp_dir);
        Ok(())
    }

    /// Drop leftovers of batches that crashed mid-publish. Runs under the
    /// compactor lock, so nothing here is in flight.
    fn clean_stale_tmp(&self) {
        let tmp_root = self.partition_root.join(TMP_DIR);
        if tmp_root.exists() {
            if let Err(e) = std::fs::remove_dir_all(&tmp_root) {
                warn!(error = %e, "could not clean stale .tmp directory");
            } else {
                debug!("stale .tmp batches cleaned");
            }
        }
    }
}

enum Classification {
    Message,
    Contact,
    Unknown,
}

/// Shape-match a parsed delivery against the known payload schemas.
fn classify(payload: &serde_json::Value) -> Classification {
    let Some(obj) = payload.as_object() else {
        return Classification::Unknown;
    };
    const MESSAGE_FIELDS: [&str; 6] = [
        "msg_id",
        "from_username",
        "to_username",
        "msg_type",
        "create_time",
        "content",
    ];
    if MESSAGE_FIELDS.iter().all(|f| obj.contains_key(*f)) {
        return Classification::Message;
    }
    let contact_detail =
        ["nickname", "remark", "avatar"].iter().any(|f| obj.contains_key(*f));
    if obj.contains_key("username") && contact_detail && !obj.contains_key("msg_id") {
        return Classification::Contact;
    }
    Classification::Unknown
}

/// The `source` field arrives as integer or string; canonical form is string.
fn coerce_source(value: Option<&serde_json::Value>) -> String {
    match value {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(serde_json::Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn str_field(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    obj.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn int_field(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> Option<i64> {
    match obj.get(key) {
        Some(serde_json::Value::Number(n)) => n.as_i64(),
        Some(serde_json::Value::String(s)) => s.parse().ok(),
        _ => None,
    }
}

/// Build a canonical message from a classified payload. `None` when a
/// required field is missing or malformed (counted as a schema mismatch).
fn normalize_message(payload: &serde_json::Value, ingestion_time: i64) -> Option<CanonicalMessage> {
    let obj = payload.as_object()?;
    let msg_id = str_field(obj, "msg_id");
    if msg_id.is_empty() {
        return None;
    }
    let create_time = int_field(obj, "create_time")?;
    if create_time <= 0 {
        return None;
    }
    let is_chatroom_msg = match obj.get("is_chatroom_msg") {
        Some(serde_json::Value::Bool(b)) => *b,
        Some(serde_json::Value::Number(n)) => n.as_i64().unwrap_or(0) != 0,
        _ => false,
    };

    Some(CanonicalMessage {
        msg_id,
        from_user: str_field(obj, "from_username"),
        to_user: str_field(obj, "to_username"),
        chatroom: str_field(obj, "chatroom"),
        chatroom_sender: str_field(obj, "chatroom_sender"),
        msg_type: int_field(obj, "msg_type").unwrap_or(0) as i32,
        create_time,
        is_chatroom_msg,
        content: str_field(obj, "content"),
        source: coerce_source(obj.get("source")),
        guid: str_field(obj, "guid"),
        notify_type: int_field(obj, "notify_type").unwrap_or(0),
        ingestion_time,
    })
}

fn normalize_contact(payload: &serde_json::Value, ingestion_time: i64) -> ContactRecord {
    let empty = serde_json::Map::new();
    let obj = payload.as_object().unwrap_or(&empty);
    ContactRecord {
        username: str_field(obj, "username"),
        nickname: str_field(obj, "nickname"),
        remark: str_field(obj, "remark"),
        avatar: str_field(obj, "avatar"),
        contact_type: str_field(obj, "contact_type"),
        ingestion_time,
    }
}

/// Keep a compact fingerprint of the first few unknown payload shapes.
fn remember_shape(shapes: &mut Vec<String>, payload: &serde_json::Value) {
    if shapes.len() >= 3 {
        return;
    }
    let fingerprint = match payload.as_object() {
        Some(obj) => {
            let mut keys: Vec<&str> = obj.keys().map(String::as_str).take(6).collect();
            keys.sort_unstable();
            format!("{{{}}}", keys.join(","))
        }
        None => format!("non-object:{}", type_name(payload)),
    };
    if !shapes.contains(&fingerprint) {
        shapes.push(fingerprint);
    }
}

fn type_name(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}
