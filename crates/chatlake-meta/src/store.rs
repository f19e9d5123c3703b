use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rusqlite::Connection;
use tracing::{debug, info};
use uuid::Uuid;

use chatlake_core::types::{Checkpoint, DateRange, RunStatus, TopicSummary};
use chatlake_lake::lock::DirLock;

use crate::db::init_db;
use crate::error::{MetaError, Result};
use crate::types::{PartitionMeta, RunRecord};

/// Thread-safe handle on the embedded metadata database.
///
/// SQLite already gives multi-reader + single-writer semantics; the file
/// advisory lock on `<db>.lock` extends the single-writer guarantee across
/// processes, held only for the duration of each write.
pub struct MetadataStore {
    db: Mutex<Connection>,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl MetadataStore {
    pub fn open(path: &Path, lock_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| MetaError::Lock(format!("create database directory: {e}")))?;
        }
        let conn = Connection::open(path)?;
        init_db(&conn)?;
        info!(path = %path.display(), "metadata store opened");
        Ok(Self {
            db: Mutex::new(conn),
            lock_path: path.with_extension("db.lock"),
            lock_timeout,
        })
    }

    /// In-memory store for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_db(&conn)?;
        Ok(Self {
            db: Mutex::new(conn),
            lock_path: std::env::temp_dir().join(format!("chatlake-meta-{}.lock", Uuid::new_v4())),
            lock_timeout: Duration::from_secs(1),
        })
    }

    fn write_lock(&self) -> Result<DirLock> {
        DirLock::acquire(&self.lock_path, self.lock_timeout)
            .map_err(|e| MetaError::Lock(e.to_string()))
    }

    // ── Runs ─────────────────────────────────────────────────────────────

    /// Create or reset the run row for (chatroom, range) and mark it running.
    /// Re-running a finished analysis overwrites the previous outcome.
    pub fn begin_run(&self, chatroom: &str, range: DateRange) -> Result<RunRecord> {
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let id = Uuid::new_v4().to_string();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO runs
               (id, chatroom, date_start, date_end, status, error,
                batches_total, batches_failed, message_count, topic_count,
                started_at, finished_at, updated_at)
             VALUES (?1,?2,?3,?4,'running',NULL,0,0,0,0,?5,NULL,?5)
             ON CONFLICT(chatroom, date_start, date_end) DO UPDATE SET
               status='running', error=NULL,
               batches_total=0, batches_failed=0, message_count=0, topic_count=0,
               started_at=excluded.started_at, finished_at=NULL,
               updated_at=excluded.updated_at",
            rusqlite::params![
                id,
                chatroom,
                range.start.to_string(),
                range.end.to_string(),
                now
            ],
        )?;

        let record = db.query_row(
            "SELECT id, chatroom, date_start, date_end, status, error,
                    batches_total, batches_failed, message_count, topic_count,
                    started_at, finished_at, updated_at
             FROM runs WHERE chatroom=?1 AND date_start=?2 AND date_end=?3",
            rusqlite::params![chatroom, range.start.to_string(), range.end.to_string()],
            row_to_run,
        )?;
        debug!(run_id = %record.id, chatroom, range = %range, "run started");
        Ok(record)
    }

    /// Record a run's terminal state and counters.
    #[allow(clippy::too_many_arguments)]
    pub fn finish_run(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<&str>,
        batches_total: u32,
        batches_failed: u32,
        message_count: u64,
        topic_count: u32,
    ) -> Result<()> {
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        let n = db.execute(
            "UPDATE runs SET status=?1, error=?2, batches_total=?3,
               batches_failed=?4, message_count=?5, topic_count=?6,
               finished_at=?7, updated_at=?7
             WHERE id=?8",
            rusqlite::params![
                status.to_string(),
                error,
                batches_total,
                batches_failed,
                message_count,
                topic_count,
                now,
                id
            ],
        )?;
        if n == 0 {
            return Err(MetaError::RunNotFound { id: id.to_string() });
        }
        info!(run_id = %id, status = %status, "run finished");
        Ok(())
    }

    pub fn get_run(&self, chatroom: &str, range: DateRange) -> Result<Option<RunRecord>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT id, chatroom, date_start, date_end, status, error,
                    batches_total, batches_failed, message_count, topic_count,
                    started_at, finished_at, updated_at
             FROM runs WHERE chatroom=?1 AND date_start=?2 AND date_end=?3",
            rusqlite::params![chatroom, range.start.to_string(), range.end.to_string()],
            row_to_run,
        ) {
            Ok(r) => Ok(Some(r)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MetaError::Database(e)),
        }
    }

    // ── Topics ───────────────────────────────────────────────────────────

    /// Replace the stored topics for a run. Overwrite semantics: the old
    /// rows disappear with the new ones in a single transaction.
    pub fn replace_topics(&self, run_id: &str, topics: &[TopicSummary]) -> Result<()> {
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let mut db = self.db.lock().unwrap();
        let tx = db.transaction()?;
        tx.execute("DELETE FROM run_topics WHERE run_id=?1", [run_id])?;
        for topic in topics {
            tx.execute(
                "INSERT INTO run_topics
                   (run_id, chatroom, date_start, date_end, title, summary_text,
                    keywords, participants, message_ids, confidence, time_range,
                    notes, created_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
                rusqlite::params![
                    run_id,
                    topic.chatroom,
                    topic.date_range.start.to_string(),
                    topic.date_range.end.to_string(),
                    topic.title,
                    topic.summary_text,
                    serde_json::to_string(&topic.keywords)?,
                    serde_json::to_string(&topic.participants)?,
                    serde_json::to_string(&topic.message_ids)?,
                    topic.confidence,
                    topic.time_range,
                    topic.notes,
                    now
                ],
            )?;
        }
        tx.commit()?;
        debug!(run_id, topics = topics.len(), "topics replaced");
        Ok(())
    }

    pub fn topics_for_run(&self, run_id: &str) -> Result<Vec<TopicSummary>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT chatroom, date_start, date_end, title, summary_text,
                    keywords, participants, message_ids, confidence, time_range, notes
             FROM run_topics WHERE run_id=?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([run_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, f64>(8)?,
                    row.get::<_, String>(9)?,
                    row.get::<_, String>(10)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .filter_map(
                |(
                    chatroom,
                    start,
                    end,
                    title,
                    summary_text,
                    keywords,
                    participants,
                    message_ids,
                    confidence,
                    time_range,
                    notes,
                )| {
                    Some(TopicSummary {
                        chatroom,
                        date_range: DateRange::new(start.parse().ok()?, end.parse().ok()?),
                        title,
                        summary_text,
                        keywords: serde_json::from_str(&keywords).ok()?,
                        participants: serde_json::from_str(&participants).ok()?,
                        message_ids: serde_json::from_str(&message_ids).ok()?,
                        confidence: confidence as f32,
                        time_range,
                        notes,
                    })
                },
            )
            .collect();
        Ok(rows)
    }

    // ── Partition cache ──────────────────────────────────────────────────

    /// Fold one published file into the partition statistics cache.
    pub fn record_partition_write(
        &self,
        dataset: &str,
        date: NaiveDate,
        rows: u64,
        bytes: u64,
        min_ts: i64,
        max_ts: i64,
    ) -> Result<()> {
        use chrono::Datelike;
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO partitions
               (dataset, year, month, day, file_count, row_count, total_bytes,
                min_ts, max_ts, updated_at)
             VALUES (?1,?2,?3,?4,1,?5,?6,?7,?8,?9)
             ON CONFLICT(dataset, year, month, day) DO UPDATE SET
               file_count = file_count + 1,
               row_count = row_count + excluded.row_count,
               total_bytes = total_bytes + excluded.total_bytes,
               min_ts = MIN(COALESCE(min_ts, excluded.min_ts), excluded.min_ts),
               max_ts = MAX(COALESCE(max_ts, excluded.max_ts), excluded.max_ts),
               updated_at = excluded.updated_at",
            rusqlite::params![
                dataset,
                date.year(),
                date.month(),
                date.day(),
                rows,
                bytes,
                min_ts,
                max_ts,
                now
            ],
        )?;
        Ok(())
    }

    pub fn partition_meta(&self, dataset: &str, date: NaiveDate) -> Result<Option<PartitionMeta>> {
        use chrono::Datelike;
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT dataset, year, month, day, file_count, row_count,
                    total_bytes, min_ts, max_ts
             FROM partitions WHERE dataset=?1 AND year=?2 AND month=?3 AND day=?4",
            rusqlite::params![dataset, date.year(), date.month(), date.day()],
            |row| {
                Ok(PartitionMeta {
                    dataset: row.get(0)?,
                    year: row.get(1)?,
                    month: row.get(2)?,
                    day: row.get(3)?,
                    file_count: row.get(4)?,
                    row_count: row.get(5)?,
                    total_bytes: row.get(6)?,
                    min_ts: row.get(7)?,
                    max_ts: row.get(8)?,
                })
            },
        ) {
            Ok(meta) => Ok(Some(meta)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MetaError::Database(e)),
        }
    }

    // ── Schema registry mirror ───────────────────────────────────────────

    /// Mirror a registry entry. Registration is append-only, so replays are
    /// ignored rather than erroring.
    pub fn mirror_schema_version(&self, name: &str, version: u32, schema_json: &str) -> Result<()> {
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT OR IGNORE INTO schema_versions (name, version, schema_json, created_at)
             VALUES (?1,?2,?3,?4)",
            rusqlite::params![name, version, schema_json, now],
        )?;
        Ok(())
    }

    pub fn latest_schema_version(&self, name: &str) -> Result<Option<u32>> {
        let db = self.db.lock().unwrap();
        match db.query_row(
            "SELECT MAX(version) FROM schema_versions WHERE name=?1",
            [name],
            |row| row.get::<_, Option<u32>>(0),
        ) {
            Ok(v) => Ok(v),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(MetaError::Database(e)),
        }
    }

    // ── Checkpoint mirror ────────────────────────────────────────────────

    /// Reflect the current state of a checkpoint file. Last write wins; the
    /// files stay authoritative.
    pub fn mirror_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let _lock = self.write_lock()?;
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO checkpoints
               (source_path, offset, last_key, record_count, status, error,
                source_hash, updated_at)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
             ON CONFLICT(source_path) DO UPDATE SET
               offset=excluded.offset, last_key=excluded.last_key,
               record_count=excluded.record_count, status=excluded.status,
               error=excluded.error, source_hash=excluded.source_hash,
               updated_at=excluded.updated_at",
            rusqlite::params![
                checkpoint.source_path,
                checkpoint.last_processed_offset,
                checkpoint.last_processed_key,
                checkpoint.record_count,
                checkpoint.status.to_string(),
                checkpoint.error,
                checkpoint.source_hash,
                checkpoint.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Compaction progress per source, for the operator surface.
    pub fn checkpoint_summaries(&self) -> Result<Vec<(String, u64, String)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT source_path, record_count, status
             FROM checkpoints ORDER BY source_path",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, u64>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Lineage ──────────────────────────────────────────────────────────

    pub fn record_lineage(
        &self,
        source_path: &str,
        dataset: &str,
        partition_day: NaiveDate,
        record_count: u64,
    ) -> Result<()> {
        let _lock = self.write_lock()?;
        let now = Utc::now().to_rfc3339();
        let db = self.db.lock().unwrap();
        db.execute(
            "INSERT INTO lineage (source_path, dataset, partition_day, record_count, created_at)
             VALUES (?1,?2,?3,?4,?5)",
            rusqlite::params![source_path, dataset, partition_day.to_string(), record_count, now],
        )?;
        Ok(())
    }

    pub fn lineage_for_source(&self, source_path: &str) -> Result<Vec<(String, String, u64)>> {
        let db = self.db.lock().unwrap();
        let mut stmt = db.prepare(
            "SELECT dataset, partition_day, record_count
             FROM lineage WHERE source_path=?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map([source_path], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, u64>(2)?,
                ))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<RunRecord> {
    let start: String = row.get(2)?;
    let end: String = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(RunRecord {
        id: row.get(0)?,
        chatroom: row.get(1)?,
        date_range: DateRange::new(
            start.parse().unwrap_or_default(),
            end.parse().unwrap_or_default(),
        ),
        status: status.parse().unwrap_or(RunStatus::Failed),
        error: row.get(5)?,
        batches_total: row.get(6)?,
        batches_failed: row.get(7)?,
        message_count: row.get(8)?,
        topic_count: row.get(9)?,
        started_at: row.get(10)?,
        finished_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range() -> DateRange {
        DateRange::single(NaiveDate::from_ymd_opt(2026, 1, 23).unwrap())
    }

    fn topic(title: &str) -> TopicSummary {
        TopicSummary {
            chatroom: "room".to_string(),
            date_range: range(),
            title: title.to_string(),
            summary_text: format!("summary of {title}"),
            keywords: vec!["launch".to_string(), "plan".to_string()],
            participants: vec!["alice".to_string()],
            message_ids: vec!["m1".to_string(), "m2".to_string()],
            confidence: 0.9,
            time_range: "09:00-09:30".to_string(),
            notes: String::new(),
        }
    }

    #[test]
    fn run_lifecycle() {
        let store = MetadataStore::open_in_memory().unwrap();
        let run = store.begin_run("room", range()).unwrap();
        assert_eq!(run.status, RunStatus::Running);

        store
            .finish_run(&run.id, RunStatus::Completed, None, 3, 0, 150, 4)
            .unwrap();
        let loaded = store.get_run("room", range()).unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Completed);
        assert_eq!(loaded.batches_total, 3);
        assert_eq!(loaded.message_count, 150);
        assert!(loaded.finished_at.is_some());
    }

    #[test]
    fn rerun_overwrites_same_row() {
        let store = MetadataStore::open_in_memory().unwrap();
        let first = store.begin_run("room", range()).unwrap();
        store
            .finish_run(&first.id, RunStatus::Failed, Some("llm down"), 2, 2, 10, 0)
            .unwrap();

        let second = store.begin_run("room", range()).unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.status, RunStatus::Running);
        assert!(second.error.is_none());
    }

    #[test]
    fn finish_unknown_run_errors() {
        let store = MetadataStore::open_in_memory().unwrap();
        let err = store
            .finish_run("nope", RunStatus::Completed, None, 0, 0, 0, 0)
            .unwrap_err();
        assert!(matches!(err, MetaError::RunNotFound { .. }));
    }

    #[test]
    fn topics_replace_previous_set() {
        let store = MetadataStore::open_in_memory().unwrap();
        let run = store.begin_run("room", range()).unwrap();

        store.replace_topics(&run.id, &[topic("a"), topic("b")]).unwrap();
        store.replace_topics(&run.id, &[topic("c")]).unwrap();

        let topics = store.topics_for_run(&run.id).unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].title, "c");
        assert_eq!(topics[0].keywords, vec!["launch", "plan"]);
        assert_eq!(topics[0].date_range, range());
    }

    #[test]
    fn partition_cache_accumulates() {
        let store = MetadataStore::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap();
        store
            .record_partition_write("canonical_messages", day, 100, 4096, 1000, 2000)
            .unwrap();
        store
            .record_partition_write("canonical_messages", day, 50, 2048, 500, 2500)
            .unwrap();

        let meta = store
            .partition_meta("canonical_messages", day)
            .unwrap()
            .unwrap();
        assert_eq!(meta.file_count, 2);
        assert_eq!(meta.row_count, 150);
        assert_eq!(meta.total_bytes, 6144);
        assert_eq!(meta.min_ts, Some(500));
        assert_eq!(meta.max_ts, Some(2500));
    }

    #[test]
    fn schema_mirror_is_idempotent() {
        let store = MetadataStore::open_in_memory().unwrap();
        store
            .mirror_schema_version("canonical_messages", 1, "{}")
            .unwrap();
        store
            .mirror_schema_version("canonical_messages", 1, "{}")
            .unwrap();
        assert_eq!(
            store.latest_schema_version("canonical_messages").unwrap(),
            Some(1)
        );
    }

    #[test]
    fn checkpoint_mirror_upserts() {
        use chatlake_core::types::CheckpointStatus;
        let store = MetadataStore::open_in_memory().unwrap();
        let mut cp = Checkpoint::new("/raw/2026-01-23.jsonl");
        cp.last_processed_offset = 100;
        cp.record_count = 2;
        store.mirror_checkpoint(&cp).unwrap();

        cp.last_processed_offset = 250;
        cp.record_count = 5;
        cp.status = CheckpointStatus::Completed;
        store.mirror_checkpoint(&cp).unwrap();

        let summaries = store.checkpoint_summaries().unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].1, 5);
        assert_eq!(summaries[0].2, "completed");
    }

    #[test]
    fn lineage_appends() {
        let store = MetadataStore::open_in_memory().unwrap();
        let day = NaiveDate::from_ymd_opt(2026, 1, 23).unwrap();
        store
            .record_lineage("/raw/2026-01-23.jsonl", "canonical_messages", day, 3)
            .unwrap();
        store
            .record_lineage("/raw/2026-01-23.jsonl", "contacts", day, 1)
            .unwrap();
        let entries = store.lineage_for_source("/raw/2026-01-23.jsonl").unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].2, 3);
    }
}
