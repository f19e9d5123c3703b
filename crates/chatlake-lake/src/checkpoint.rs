//! Per-source compaction checkpoints: one JSON file per day-log, replaced
//! atomically on every advance so a crash never leaves a half-written one.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;

use chatlake_core::types::Checkpoint;

use crate::atomic::publish_atomic;
use crate::error::{classify_io, LakeError, Result};

pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Checkpoint file for a source path. The file stem keeps the source's
    /// name for operator friendliness; the hash suffix disambiguates
    /// same-named logs from different directories.
    pub fn path_for(&self, source_path: &Path) -> PathBuf {
        let stem = source_path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("source");
        let digest = Sha256::digest(source_path.to_string_lossy().as_bytes());
        let short = hex::encode(&digest[..4]);
        self.dir.join(format!("{stem}-{short}.json"))
    }

    pub fn load(&self, source_path: &Path) -> Result<Option<Checkpoint>> {
        let path = self.path_for(source_path);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(classify_io(e, "read checkpoint")),
        };
        let checkpoint: Checkpoint = serde_json::from_slice(&bytes)
            .map_err(|e| LakeError::Parse(format!("decode checkpoint {}: {e}", path.display())))?;
        Ok(Some(checkpoint))
    }

    /// Persist a checkpoint, enforcing offset monotonicity against whatever
    /// is already on disk.
    pub fn save(&self, checkpoint: &Checkpoint) -> Result<()> {
        let source = Path::new(&checkpoint.source_path);
        if let Some(existing) = self.load(source)? {
            if checkpoint.last_processed_offset < existing.last_processed_offset {
                return Err(LakeError::Parse(format!(
                    "checkpoint offset would regress: {} < {}",
                    checkpoint.last_processed_offset, existing.last_processed_offset
                )));
            }
        }
        let payload = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| LakeError::Parse(format!("encode checkpoint: {e}")))?;
        let path = self.path_for(source);
        publish_atomic(&payload, &path)?;
        debug!(
            source = %checkpoint.source_path,
            offset = checkpoint.last_processed_offset,
            status = %checkpoint.status,
            "checkpoint saved"
        );
        Ok(())
    }

    /// Administrative removal. Compaction never calls this.
    pub fn delete(&self, source_path: &Path) -> Result<()> {
        let path = self.path_for(source_path);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(classify_io(e, "delete checkpoint")),
        }
    }
}

/// sha256 of a file's full contents, hex-encoded. Used to detect whether a
/// completed source changed since its checkpoint.
pub fn content_hash(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).map_err(|e| classify_io(e, "read source for hashing"))?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatlake_core::types::CheckpointStatus;

    #[test]
    fn load_missing_returns_none() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        assert!(store.load(Path::new("/logs/2026-01-23.jsonl")).unwrap().is_none());
    }

    #[test]
    fn save_then_load_round_trips() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let mut cp = Checkpoint::new("/logs/2026-01-23.jsonl");
        cp.last_processed_offset = 512;
        cp.record_count = 3;
        cp.status = CheckpointStatus::Completed;
        cp.source_hash = Some("abcd".to_string());
        store.save(&cp).unwrap();

        let loaded = store
            .load(Path::new("/logs/2026-01-23.jsonl"))
            .unwrap()
            .unwrap();
        assert_eq!(loaded.last_processed_offset, 512);
        assert_eq!(loaded.record_count, 3);
        assert_eq!(loaded.status, CheckpointStatus::Completed);
    }

    #[test]
    fn offsets_never_regress() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let mut cp = Checkpoint::new("/logs/a.jsonl");
        cp.last_processed_offset = 100;
        store.save(&cp).unwrap();

        cp.last_processed_offset = 50;
        assert!(store.save(&cp).is_err());
    }

    #[test]
    fn same_name_different_dirs_do_not_collide() {
        let tmp = tempfile::tempdir().unwrap();
        let store = CheckpointStore::new(tmp.path());
        let a = store.path_for(Path::new("/a/2026-01-23.jsonl"));
        let b = store.path_for(Path::new("/b/2026-01-23.jsonl"));
        assert_ne!(a, b);
    }

    #[test]
    fn content_hash_tracks_changes() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("log.jsonl");
        std::fs::write(&file, "one\n").unwrap();
        let h1 = content_hash(&file).unwrap();
        std::fs::write(&file, "one\ntwo\n").unwrap();
        let h2 = content_hash(&file).unwrap();
        assert_ne!(h1, h2);
    }
}
