//! Advisory exclusive locks between cooperating processes.
//!
//! flock(2)-based: the lock dies with the file descriptor, so a crashed
//! holder releases automatically. Lock files are never deleted — unlinking a
//! locked path races against a third process recreating it.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::{classify_io, IoReason, LakeError, Result};

/// How long to sleep between non-blocking acquisition attempts.
const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// An exclusive advisory lock, held until drop.
#[derive(Debug)]
pub struct DirLock {
    file: File,
    path: PathBuf,
}

impl DirLock {
    /// Acquire the lock at `path`, polling until `timeout` elapses.
    ///
    /// Fails with `IoReason::Timeout` when another holder outlasts the
    /// deadline. A zero timeout makes exactly one attempt.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| classify_io(e, "create lock directory"))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .map_err(|e| classify_io(e, "open lock file"))?;

        let deadline = Instant::now() + timeout;
        loop {
            match try_flock_exclusive(&file) {
                Ok(()) => {
                    debug!(path = %path.display(), "acquired advisory lock");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Err(LakeError::io(
                            IoReason::Timeout,
                            format!(
                                "lock {} not acquired within {:?}",
                                path.display(),
                                timeout
                            ),
                        ));
                    }
                    std::thread::sleep(RETRY_INTERVAL.min(
                        deadline.saturating_duration_since(Instant::now()),
                    ));
                }
                Err(e) => return Err(classify_io(e, "flock")),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            unsafe {
                libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
            }
        }
        debug!(path = %self.path.display(), "released advisory lock");
    }
}

#[cfg(unix)]
fn try_flock_exclusive(file: &File) -> io::Result<()> {
    use std::os::unix::io::AsRawFd;
    let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(unix))]
fn try_flock_exclusive(_file: &File) -> io::Result<()> {
    // Non-unix targets fall back to create-exclusive semantics at a higher
    // level; single-process deployments still serialize via the in-process
    // mutexes upstream.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_reacquire_after_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.lock");
        let lock = DirLock::acquire(&path, Duration::from_millis(100)).unwrap();
        drop(lock);
        DirLock::acquire(&path, Duration::from_millis(100)).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn second_holder_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("day.lock");
        // flock locks taken through independent open()s contend even within
        // one process, so this models a second compactor faithfully.
        let _held = DirLock::acquire(&path, Duration::from_millis(100)).unwrap();

        let err = DirLock::acquire(&path, Duration::from_millis(200)).unwrap_err();
        assert_eq!(err.io_reason(), Some(IoReason::Timeout));
    }

    #[test]
    fn lock_file_survives_release() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.lock");
        drop(DirLock::acquire(&path, Duration::from_millis(50)).unwrap());
        assert!(path.exists());
    }
}
