//! Append-only day-log capture of webhook deliveries.
//!
//! One JSON line per delivery, one file per UTC calendar day. Writes are
//! serialized by a per-day advisory lock so multiple gateway workers (or
//! processes) never interleave partial lines. Nothing is ever rejected for
//! being unparseable: binary bodies are preserved as lossy text plus a
//! `parse_error`.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};
use tracing::{debug, warn};

use chatlake_core::types::{RawDelivery, RawRecord};

use crate::error::{classify_io, IoReason, LakeError, Result};
use crate::lock::DirLock;

/// Shared writer state observed by the health endpoint.
///
/// `writable` reflects the most recent append or probe; `message_count`
/// counts durably appended deliveries since process start.
#[derive(Clone, Default)]
pub struct WriterHealth {
    inner: Arc<HealthInner>,
}

#[derive(Default)]
struct HealthInner {
    degraded: AtomicBool,
    message_count: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl WriterHealth {
    pub fn is_writable(&self) -> bool {
        !self.inner.degraded.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.inner.message_count.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.lock().unwrap().clone()
    }

    /// Force the degraded state from outside the writer, e.g. when a probe
    /// blocks past its budget instead of failing.
    pub fn set_unwritable(&self, reason: impl Into<String>) {
        self.inner.degraded.store(true, Ordering::Relaxed);
        *self.inner.last_error.lock().unwrap() = Some(reason.into());
    }

    fn record_success(&self) {
        self.inner.degraded.store(false, Ordering::Relaxed);
        *self.inner.last_error.lock().unwrap() = None;
    }

    fn record_failure(&self, err: &LakeError) {
        self.inner.degraded.store(true, Ordering::Relaxed);
        *self.inner.last_error.lock().unwrap() = Some(err.to_string());
    }
}

/// Durably captures webhook deliveries into per-day JSONL files.
pub struct DayLogWriter {
    raw_log_dir: PathBuf,
    lock_timeout: Duration,
    health: WriterHealth,
}

impl DayLogWriter {
    pub fn new(raw_log_dir: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            raw_log_dir: raw_log_dir.into(),
            lock_timeout,
            health: WriterHealth::default(),
        }
    }

    pub fn health(&self) -> WriterHealth {
        self.health.clone()
    }

    /// Path of the day-log for a given instant's UTC date.
    pub fn day_log_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.day_path(at.date_naive())
    }

    fn day_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_log_dir.join(format!("{day}.jsonl"))
    }

    fn lock_path(&self, day: NaiveDate) -> PathBuf {
        self.raw_log_dir.join(".locks").join(format!("{day}.lock"))
    }

    /// Append one delivery to its day bucket.
    ///
    /// Lock-timeout failures propagate without degrading the writer: the
    /// filesystem is fine, we just lost a race. Disk-full and permission
    /// failures flip the writer into the degraded state the health surface
    /// reports.
    pub fn append(&self, delivery: &RawDelivery) -> Result<()> {
        let started = Instant::now();
        let day = delivery.received_at.date_naive();
        let record = encode_delivery(delivery, started);

        let mut line = serde_json::to_string(&record)
            .map_err(|e| LakeError::Parse(format!("encode raw record: {e}")))?;
        line.push('\n');

        let result = self.append_line(day, line.as_bytes());
        match &result {
            Ok(()) => {
                self.health.record_success();
                self.inc_count();
                debug!(day = %day, bytes = line.len(), "delivery appended");
            }
            Err(e) if e.io_reason() == Some(IoReason::Timeout) => {
                warn!(day = %day, error = %e, "day-log lock timed out");
            }
            Err(e) => {
                self.health.record_failure(e);
                warn!(day = %day, error = %e, "day-log append failed; writer degraded");
            }
        }
        result
    }

    fn append_line(&self, day: NaiveDate, line: &[u8]) -> Result<()> {
        std::fs::create_dir_all(&self.raw_log_dir)
            .map_err(|e| classify_io(e, "create raw log directory"))?;

        let _lock = DirLock::acquire(&self.lock_path(day), self.lock_timeout)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.day_path(day))
            .map_err(|e| classify_io(e, "open day-log"))?;
        file.write_all(line)
            .map_err(|e| classify_io(e, "append day-log record"))?;
        file.flush().map_err(|e| classify_io(e, "flush day-log"))?;
        Ok(())
    }

    fn inc_count(&self) {
        self.health.inner.message_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Probe-write: proves the log directory is writable even when no
    /// traffic is arriving. Cheap enough to run every few seconds.
    pub fn probe(&self) -> Result<()> {
        std::fs::create_dir_all(&self.raw_log_dir)
            .map_err(|e| classify_io(e, "create raw log directory"))?;
        let probe_path = self.raw_log_dir.join(".probe");
        let payload = Utc::now().to_rfc3339();
        let result = crate::atomic::publish_atomic(payload.as_bytes(), &probe_path);
        match &result {
            Ok(()) => self.health.record_success(),
            Err(e) => {
                self.health.record_failure(e);
                warn!(error = %e, "health probe-write failed");
            }
        }
        result
    }

    /// Delete day-logs older than `retention_days`, measured against today's
    /// UTC date. Returns the deleted paths.
    pub fn apply_retention(
        &self,
        retention_days: u32,
        is_compacted: impl Fn(&Path) -> bool,
        require_compaction: bool,
    ) -> Result<Vec<PathBuf>> {
        let today = Utc::now().date_naive();
        let mut deleted = Vec::new();
        let entries = match std::fs::read_dir(&self.raw_log_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(deleted),
            Err(e) => return Err(classify_io(e, "read raw log directory")),
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Some(day) = day_log_date(&path) else {
                continue;
            };
            let age = today.signed_duration_since(day).num_days();
            if age <= i64::from(retention_days) {
                continue;
            }
            if require_compaction && !is_compacted(&path) {
                debug!(path = %path.display(), "retention deferred: not compacted yet");
                continue;
            }
            std::fs::remove_file(&path).map_err(|e| classify_io(e, "delete expired day-log"))?;
            deleted.push(path);
        }
        Ok(deleted)
    }
}

/// Recover the date from a `YYYY-MM-DD.jsonl` file name.
pub fn day_log_date(path: &Path) -> Option<NaiveDate> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".jsonl")?;
    stem.parse().ok()
}

/// Build the on-disk record for a delivery, attempting a structured parse
/// of the body (JSON first, then form-urlencoded).
fn encode_delivery(delivery: &RawDelivery, started: Instant) -> RawRecord {
    let body_text = String::from_utf8_lossy(&delivery.body).into_owned();
    let (parsed_object, parse_error) = match parse_body(&delivery.body, &body_text) {
        Ok(v) => (Some(v), None),
        Err(e) => (None, Some(e)),
    };

    RawRecord {
        received_at: delivery.received_at,
        client_ip: delivery.client_addr.clone(),
        headers: delivery.headers.clone(),
        body_text,
        body_bytes_length: delivery.body.len(),
        parsed_object,
        parse_error,
        processing_time_ms: started.elapsed().as_millis() as u64,
    }
}

fn parse_body(body: &[u8], body_text: &str) -> std::result::Result<serde_json::Value, String> {
    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(v) if v.is_object() || v.is_array() => return Ok(v),
        Ok(_) | Err(_) => {}
    }
    parse_form_urlencoded(body_text)
        .ok_or_else(|| "body is neither JSON nor form-urlencoded".to_string())
}

/// Best-effort `k=v&k2=v2` decode. Every pair must split on `=` for the body
/// to count as a form; otherwise plain text would masquerade as one.
fn parse_form_urlencoded(text: &str) -> Option<serde_json::Value> {
    if text.is_empty() || !text.contains('=') {
        return None;
    }
    let mut map = serde_json::Map::new();
    for pair in text.split('&') {
        let (k, v) = pair.split_once('=')?;
        let key = urlencoding::decode(k).ok()?.into_owned();
        let value = urlencoding::decode(v).ok()?.into_owned();
        map.insert(key, serde_json::Value::String(value));
    }
    Some(serde_json::Value::Object(map))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(body: &[u8], at: &str) -> RawDelivery {
        RawDelivery {
            received_at: at.parse().unwrap(),
            client_addr: "10.0.0.1".to_string(),
            headers: vec![("Content-Type".to_string(), "application/json".to_string())],
            body: body.to_vec(),
        }
    }

    fn writer(dir: &Path) -> DayLogWriter {
        DayLogWriter::new(dir, Duration::from_secs(5))
    }

    #[test]
    fn append_writes_one_line_per_delivery() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.append(&delivery(br#"{"msg_id":"m1"}"#, "2026-01-23T02:00:00Z"))
            .unwrap();
        w.append(&delivery(br#"{"msg_id":"m2"}"#, "2026-01-23T03:00:00Z"))
            .unwrap();

        let content = std::fs::read_to_string(tmp.path().join("2026-01-23.jsonl")).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: RawRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.parsed_object.unwrap()["msg_id"], "m1");
        assert_eq!(w.health().message_count(), 2);
    }

    #[test]
    fn deliveries_bucket_by_utc_date() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.append(&delivery(b"{}", "2026-01-22T23:59:59Z")).unwrap();
        w.append(&delivery(b"{}", "2026-01-23T00:00:00Z")).unwrap();
        assert!(tmp.path().join("2026-01-22.jsonl").exists());
        assert!(tmp.path().join("2026-01-23.jsonl").exists());
    }

    #[test]
    fn binary_body_is_preserved_with_parse_error() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.append(&delivery(&[0xff, 0xfe, 0x01], "2026-01-23T02:00:00Z"))
            .unwrap();
        let content = std::fs::read_to_string(tmp.path().join("2026-01-23.jsonl")).unwrap();
        let rec: RawRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert!(rec.parsed_object.is_none());
        assert!(rec.parse_error.is_some());
        assert_eq!(rec.body_bytes_length, 3);
    }

    #[test]
    fn form_urlencoded_body_parses() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.append(&delivery(b"msg_id=m1&content=hello%20there", "2026-01-23T02:00:00Z"))
            .unwrap();
        let content = std::fs::read_to_string(tmp.path().join("2026-01-23.jsonl")).unwrap();
        let rec: RawRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        let obj = rec.parsed_object.unwrap();
        assert_eq!(obj["msg_id"], "m1");
        assert_eq!(obj["content"], "hello there");
    }

    #[test]
    fn scalar_json_is_not_a_parsed_object() {
        // A bare number is valid JSON but not a webhook payload shape.
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.append(&delivery(b"42", "2026-01-23T02:00:00Z")).unwrap();
        let content = std::fs::read_to_string(tmp.path().join("2026-01-23.jsonl")).unwrap();
        let rec: RawRecord = serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert!(rec.parsed_object.is_none());
    }

    #[test]
    fn probe_marks_writer_healthy() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        w.probe().unwrap();
        assert!(w.health().is_writable());
        assert!(tmp.path().join(".probe").exists());
    }

    #[test]
    fn retention_deletes_only_expired_logs() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        let old = tmp.path().join("2020-01-01.jsonl");
        let recent_day = Utc::now().date_naive();
        let recent = tmp.path().join(format!("{recent_day}.jsonl"));
        std::fs::write(&old, "x\n").unwrap();
        std::fs::write(&recent, "y\n").unwrap();

        let deleted = w.apply_retention(7, |_| true, false).unwrap();
        assert_eq!(deleted, vec![old.clone()]);
        assert!(!old.exists());
        assert!(recent.exists());
    }

    #[test]
    fn retention_can_require_compaction() {
        let tmp = tempfile::tempdir().unwrap();
        let w = writer(tmp.path());
        let old = tmp.path().join("2020-01-01.jsonl");
        std::fs::write(&old, "x\n").unwrap();

        let deleted = w.apply_retention(7, |_| false, true).unwrap();
        assert!(deleted.is_empty());
        assert!(old.exists());
    }
}
