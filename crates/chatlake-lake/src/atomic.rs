//! Write-temp-then-rename publish. Any concurrent reader of the target sees
//! either the old contents (or nothing) or the complete new contents.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::{classify_io, IoReason, LakeError, Result};

/// Publish `payload` at `target` atomically.
///
/// Contract: sibling temp file in the same directory, fsync the file, rename
/// over the target, fsync the directory. Rename is atomic on a single
/// filesystem; the temp file never escapes the target's directory.
pub fn publish_atomic(payload: &[u8], target: &Path) -> Result<()> {
    let dir = target.parent().ok_or_else(|| {
        LakeError::io(
            IoReason::Other,
            format!("target has no parent directory: {}", target.display()),
        )
    })?;
    std::fs::create_dir_all(dir).map_err(|e| classify_io(e, "create target directory"))?;

    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .map_err(|e| classify_io(e, "create temp file"))?;
    tmp.write_all(payload)
        .map_err(|e| classify_io(e, "write temp file"))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| classify_io(e, "fsync temp file"))?;

    tmp.persist(target)
        .map_err(|e| classify_io(e.error, "rename over target"))?;

    fsync_dir(dir)
}

/// Durably rename `src` to `dst` (same filesystem), fsyncing `dst`'s parent.
pub fn rename_durable(src: &Path, dst: &Path) -> Result<()> {
    let dir = dst.parent().ok_or_else(|| {
        LakeError::io(
            IoReason::Other,
            format!("destination has no parent directory: {}", dst.display()),
        )
    })?;
    std::fs::rename(src, dst).map_err(|e| classify_io(e, "rename"))?;
    fsync_dir(dir)
}

/// fsync a directory so a completed rename survives power loss.
pub fn fsync_dir(dir: &Path) -> Result<()> {
    let handle = File::open(dir).map_err(|e| classify_io(e, "open directory"))?;
    handle
        .sync_all()
        .map_err(|e| classify_io(e, "fsync directory"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_creates_target_with_payload() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.json");
        publish_atomic(b"{\"a\":1}", &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"{\"a\":1}");
    }

    #[test]
    fn publish_replaces_existing_contents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.json");
        publish_atomic(b"old", &target).unwrap();
        publish_atomic(b"new-and-longer", &target).unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"new-and-longer");
    }

    #[test]
    fn publish_leaves_no_temp_files_behind() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        publish_atomic(&[0u8; 4096], &target).unwrap();
        let entries: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(entries, vec![std::ffi::OsString::from("out.bin")]);
    }

    #[test]
    fn rename_durable_moves_file() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("a");
        let dst = dir.path().join("b");
        std::fs::write(&src, b"x").unwrap();
        rename_durable(&src, &dst).unwrap();
        assert!(!src.exists());
        assert_eq!(std::fs::read(&dst).unwrap(), b"x");
    }
}
