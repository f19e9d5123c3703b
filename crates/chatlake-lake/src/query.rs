//! Partition-pruned reads over the message dataset.
//!
//! The file set is snapshotted when a scan opens: a publish landing between
//! two queries is visible to the second, never half-visible to the first.
//! Dot-prefixed names and files that fail to open (torn by definition —
//! completed publishes are fsynced) are skipped, not fatal.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tracing::{debug, warn};

use chatlake_core::types::{CanonicalMessage, ContactRecord, DateRange};

use crate::columnar::{batch_to_messages, list_columnar_files, ColumnarReader};
use crate::error::{LakeError, QueryErrorKind, Result};
use crate::partition::{all_partitions, list_partitions};

/// Row predicates pushed into the scan.
#[derive(Debug, Clone, Default)]
pub struct MessageFilters {
    pub chatroom: Option<String>,
    pub from_user: Option<String>,
    pub msg_type: Option<i32>,
}

impl MessageFilters {
    fn matches(&self, msg: &CanonicalMessage) -> bool {
        if let Some(chatroom) = &self.chatroom {
            if &msg.chatroom != chatroom {
                return false;
            }
        }
        if let Some(from_user) = &self.from_user {
            if &msg.from_user != from_user {
                return false;
            }
        }
        if let Some(msg_type) = self.msg_type {
            if msg.msg_type != msg_type {
                return false;
            }
        }
        true
    }

    /// Columns the predicate needs even when the caller projects them away.
    fn required_columns(&self) -> Vec<&'static str> {
        let mut cols = Vec::new();
        if self.chatroom.is_some() {
            cols.push("chatroom");
        }
        if self.from_user.is_some() {
            cols.push("from_user");
        }
        if self.msg_type.is_some() {
            cols.push("msg_type");
        }
        cols
    }
}

pub struct LakeQuery {
    partition_root: PathBuf,
}

impl LakeQuery {
    pub fn new(partition_root: impl Into<PathBuf>) -> Self {
        Self {
            partition_root: partition_root.into(),
        }
    }

    /// Messages within `range` matching `filters`, lazily.
    ///
    /// `columns` limits what is decoded from disk; filter columns are read
    /// regardless so predicates can evaluate. Rows stream in file order —
    /// callers needing chronology sort by `create_time`.
    pub fn query_messages(
        &self,
        range: DateRange,
        filters: MessageFilters,
        columns: Option<&[&str]>,
    ) -> Result<MessageScan> {
        if range.start > range.end {
            return Err(LakeError::query(
                QueryErrorKind::InvalidRange,
                format!("start {} is after end {}", range.start, range.end),
            ));
        }
        if !self.partition_root.is_dir() {
            return Err(LakeError::query(
                QueryErrorKind::MissingPartition,
                format!("partition root missing: {}", self.partition_root.display()),
            ));
        }

        let mut files = Vec::new();
        for (_, dir) in list_partitions(&self.partition_root, range) {
            files.extend(list_columnar_files(&dir)?);
        }
        debug!(files = files.len(), range = %range, "message scan opened");

        let projection = effective_projection(columns, &filters.required_columns());
        let time_range = Some((
            day_start_epoch(range.start),
            day_end_epoch(range.end),
        ));
        Ok(MessageScan::new(
            files,
            projection,
            time_range,
            Box::new(move |msg| filters.matches(msg)),
        ))
    }

    /// Resolve the contact-sync dataset to its latest record per username.
    ///
    /// The store is append-only; later syncs logically supersede earlier
    /// ones, so "latest" is decided here at read time by `ingestion_time`
    /// (partition date breaking ties only through scan order).
    pub fn latest_contacts(&self) -> Result<HashMap<String, ContactRecord>> {
        let contacts_base = crate::partition::contacts_root(&self.partition_root);
        let mut latest: HashMap<String, ContactRecord> = HashMap::new();
        for (_, dir) in all_partitions(&contacts_base) {
            for file in list_columnar_files(&dir)? {
                let reader = match ColumnarReader::open(&file, None, None) {
                    Ok(reader) => reader,
                    Err(e) => {
                        warn!(file = %file.display(), error = %e, "skipping unreadable contacts file");
                        continue;
                    }
                };
                for batch in reader {
                    let batch = match batch {
                        Ok(batch) => batch,
                        Err(e) => {
                            warn!(file = %file.display(), error = %e, "truncated contacts file; remainder skipped");
                            break;
                        }
                    };
                    for contact in crate::columnar::batch_to_contacts(&batch)? {
                        if contact.username.is_empty() {
                            continue;
                        }
                        match latest.get(&contact.username) {
                            Some(existing) if existing.ingestion_time > contact.ingestion_time => {}
                            _ => {
                                latest.insert(contact.username.clone(), contact);
                            }
                        }
                    }
                }
            }
        }
        Ok(latest)
    }

    /// Look up specific msg_ids across the whole lake.
    pub fn query_by_ids(&self, msg_ids: &[String], columns: Option<&[&str]>) -> Result<MessageScan> {
        if !self.partition_root.is_dir() {
            return Err(LakeError::query(
                QueryErrorKind::MissingPartition,
                format!("partition root missing: {}", self.partition_root.display()),
            ));
        }

        let mut files = Vec::new();
        for (_, dir) in all_partitions(&self.partition_root) {
            files.extend(list_columnar_files(&dir)?);
        }

        let wanted: HashSet<String> = msg_ids.iter().cloned().collect();
        let projection = effective_projection(columns, &["msg_id"]);
        Ok(MessageScan::new(
            files,
            projection,
            None,
            Box::new(move |msg| wanted.contains(&msg.msg_id)),
        ))
    }
}

/// Union of the caller's projection with predicate columns. `None` keeps the
/// full schema.
fn effective_projection(
    columns: Option<&[&str]>,
    required: &[&'static str],
) -> Option<Vec<String>> {
    let requested = columns?;
    let mut cols: Vec<String> = requested.iter().map(|c| c.to_string()).collect();
    for col in required {
        if !cols.iter().any(|c| c == col) {
            cols.push(col.to_string());
        }
    }
    Some(cols)
}

fn day_start_epoch(day: NaiveDate) -> i64 {
    day.and_hms_opt(0, 0, 0)
        .expect("midnight exists")
        .and_utc()
        .timestamp()
}

fn day_end_epoch(day: NaiveDate) -> i64 {
    day.and_hms_opt(23, 59, 59)
        .expect("valid time")
        .and_utc()
        .timestamp()
}

type RowPredicate = Box<dyn Fn(&CanonicalMessage) -> bool + Send>;

/// Forward-only iterator over matching messages. File list is fixed at
/// construction; unreadable files are skipped with a warning.
pub struct MessageScan {
    files: std::vec::IntoIter<PathBuf>,
    file_count: usize,
    projection: Option<Vec<String>>,
    time_range: Option<(i64, i64)>,
    predicate: RowPredicate,
    current: Option<ColumnarReader>,
    buffered: std::vec::IntoIter<CanonicalMessage>,
}

impl std::fmt::Debug for MessageScan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageScan")
            .field("file_count", &self.file_count)
            .field("projection", &self.projection)
            .field("time_range", &self.time_range)
            .finish()
    }
}

impl MessageScan {
    fn new(
        files: Vec<PathBuf>,
        projection: Option<Vec<String>>,
        time_range: Option<(i64, i64)>,
        predicate: RowPredicate,
    ) -> Self {
        Self {
            file_count: files.len(),
            files: files.into_iter(),
            projection,
            time_range,
            predicate,
            current: None,
            buffered: Vec::new().into_iter(),
        }
    }

    /// How many files the snapshot covers — partition pruning is observable
    /// here: a two-day range over a four-day lake lists two days' files.
    pub fn file_count(&self) -> usize {
        self.file_count
    }

    fn open_next_file(&mut self) -> bool {
        loop {
            let Some(path) = self.files.next() else {
                return false;
            };
            match self.open_reader(&path) {
                Ok(reader) => {
                    self.current = Some(reader);
                    return true;
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "skipping unreadable columnar file");
                }
            }
        }
    }

    fn open_reader(&self, path: &Path) -> Result<ColumnarReader> {
        let cols: Option<Vec<&str>> = self
            .projection
            .as_ref()
            .map(|cols| cols.iter().map(String::as_str).collect());
        match ColumnarReader::open(path, cols.as_deref(), self.time_range) {
            Ok(reader) => Ok(reader),
            // Files written under an older schema may lack a projected
            // column; fall back to a full read, the decoder defaults it.
            Err(LakeError::Schema(_)) => ColumnarReader::open(path, None, self.time_range),
            Err(e) => Err(e),
        }
    }
}

impl Iterator for MessageScan {
    type Item = CanonicalMessage;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            for msg in self.buffered.by_ref() {
                if (self.predicate)(&msg) {
                    return Some(msg);
                }
            }

            let batch = match self.current.as_mut() {
                Some(reader) => reader.next(),
                None => {
                    if !self.open_next_file() {
                        return None;
                    }
                    continue;
                }
            };

            match batch {
                Some(Ok(batch)) => match batch_to_messages(&batch) {
                    Ok(msgs) => self.buffered = msgs.into_iter(),
                    Err(e) => {
                        warn!(error = %e, "undecodable batch skipped");
                        self.current = None;
                    }
                },
                Some(Err(e)) => {
                    warn!(error = %e, "truncated columnar file; remainder skipped");
                    self.current = None;
                }
                None => self.current = None,
            }
        }
    }
}
