//! Whole-file locking with a dotlock fallback.
//!
//! The preferred primitive is the platform's exclusive file lock. Dotlocks
//! (a sidecar file moved into place with a no-clobber rename) work on any
//! filesystem that renames atomically, including NFS mounts where kernel
//! locks are unreliable, and are therefore the default.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use fs2::FileExt as _;
use log::{debug, warn};
use tempfile::NamedTempFile;

use crate::error::{Error, Result};

/// How long to wait for a contended lock before giving up.
pub(crate) const DOTLOCK_TIMEOUT: Duration = Duration::from_secs(60);
/// A lock file untouched for this long is considered abandoned and broken.
pub(crate) const DOTLOCK_STALE_TIMEOUT: Duration = Duration::from_secs(60);

/// Suffix of the dotlock guarding appends to an existing log file.
const LOCK_SUFFIX: &str = ".lock";
/// Suffix of the dotlock guarding creation of a new log file.
pub(crate) const NEW_LOCK_SUFFIX: &str = ".newlock";

const RETRY_SLEEP: Duration = Duration::from_millis(100);

/// Cross-process lock acquisition settings.
#[derive(Clone, Copy, Debug)]
pub struct DotlockSettings {
    /// Prefer the platform's exclusive file lock over dotlocks.
    pub use_excl_lock: bool,
    /// See [`DOTLOCK_TIMEOUT`].
    pub timeout: Duration,
    /// See [`DOTLOCK_STALE_TIMEOUT`].
    pub stale_timeout: Duration,
}

impl Default for DotlockSettings {
    fn default() -> Self {
        Self {
            use_excl_lock: false,
            timeout: DOTLOCK_TIMEOUT,
            stale_timeout: DOTLOCK_STALE_TIMEOUT,
        }
    }
}

/// A held whole-file lock. Dropping it releases the lock.
#[derive(Debug)]
pub(crate) enum HeldLock {
    /// Exclusive lock held through a duplicate handle of the locked file.
    Excl(ExclLock),
    /// Rename-based sidecar lock.
    Dotlock(Dotlock),
}

/// A held exclusive lock. `flock(2)` locks belong to the open file
/// description, which the backing descriptor keeps alive after this
/// duplicate closes, so the lock must be released explicitly.
#[derive(Debug)]
pub(crate) struct ExclLock(File);

impl Drop for ExclLock {
    fn drop(&mut self) {
        if let Err(e) = self.0.unlock() {
            warn!("failed to release file lock: {e}");
        }
    }
}

/// A held dotlock; the sidecar file is removed on drop.
#[derive(Debug)]
pub(crate) struct Dotlock {
    path: PathBuf,
}

impl Drop for Dotlock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("{}: failed to remove lock file: {e}", self.path.display());
            }
        }
    }
}

/// Acquire an exclusive whole-file lock on `path`.
///
/// `file` is the open handle of the file being locked; it is required for
/// the exclusive-lock flavor and ignored by dotlocks.
pub(crate) fn acquire(path: &Path, file: Option<&File>, settings: &DotlockSettings) -> Result<HeldLock> {
    if settings.use_excl_lock {
        if let Some(file) = file {
            return acquire_excl(path, file, settings);
        }
    }
    acquire_dotlock(path, LOCK_SUFFIX, settings).map(HeldLock::Dotlock)
}

fn acquire_excl(path: &Path, file: &File, settings: &DotlockSettings) -> Result<HeldLock> {
    let handle = file.try_clone().map_err(|e| Error::io(path, "dup", e))?;
    let deadline = Instant::now() + settings.timeout;
    loop {
        match handle.try_lock_exclusive() {
            Ok(()) => return Ok(HeldLock::Excl(ExclLock(handle))),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout { path: path.to_owned() });
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(Error::io(path, "flock", e)),
        }
    }
}

/// Acquire the rename-based dotlock `<path><suffix>`.
pub(crate) fn acquire_dotlock(path: &Path, suffix: &str, settings: &DotlockSettings) -> Result<Dotlock> {
    let lock_path = sibling_path(path, suffix);
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let deadline = Instant::now() + settings.timeout;
    loop {
        let tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(&lock_path, "open", e))?;
        match tmp.persist_noclobber(&lock_path) {
            Ok(_) => {
                debug!("{}: acquired dotlock", lock_path.display());
                return Ok(Dotlock { path: lock_path });
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                if break_stale(&lock_path, settings) {
                    continue;
                }
                if Instant::now() >= deadline {
                    return Err(Error::LockTimeout { path: lock_path });
                }
                thread::sleep(RETRY_SLEEP);
            }
            Err(e) => return Err(Error::io(&lock_path, "rename", e.error)),
        }
    }
}

/// Remove `lock_path` if its holder looks dead. Returns `true` if the lock
/// was broken (or vanished) and acquisition should be retried at once.
fn break_stale(lock_path: &Path, settings: &DotlockSettings) -> bool {
    let meta = match fs::metadata(lock_path) {
        Ok(meta) => meta,
        // Holder released it between our rename and this stat.
        Err(_) => return true,
    };
    let age = meta
        .modified()
        .ok()
        .and_then(|mtime| SystemTime::now().duration_since(mtime).ok());
    match age {
        Some(age) if age >= settings.stale_timeout => {
            warn!(
                "{}: breaking stale lock ({}s old)",
                lock_path.display(),
                age.as_secs()
            );
            match fs::remove_file(lock_path) {
                Ok(()) => true,
                Err(e) => e.kind() == io::ErrorKind::NotFound,
            }
        }
        _ => false,
    }
}

/// `<path><suffix>`, e.g. `mailbox.log` -> `mailbox.log.newlock`.
pub(crate) fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(suffix);
    PathBuf::from(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    fn settings(timeout_ms: u64, stale_ms: u64) -> DotlockSettings {
        DotlockSettings {
            use_excl_lock: false,
            timeout: Duration::from_millis(timeout_ms),
            stale_timeout: Duration::from_millis(stale_ms),
        }
    }

    #[test]
    fn dotlock_acquire_release() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");
        let lock_path = sibling_path(&path, ".lock");

        let held = acquire_dotlock(&path, ".lock", &settings(1000, 60_000)).unwrap();
        assert!(lock_path.exists());
        drop(held);
        assert!(!lock_path.exists());
    }

    #[test]
    fn dotlock_contended_times_out() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let _held = acquire_dotlock(&path, ".lock", &settings(1000, 60_000)).unwrap();
        let err = acquire_dotlock(&path, ".lock", &settings(50, 60_000)).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }), "{err}");
    }

    #[test]
    fn dotlock_breaks_stale_lock() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");
        let lock_path = sibling_path(&path, ".lock");
        fs::write(&lock_path, b"").unwrap();

        // Zero stale timeout treats any pre-existing lock as abandoned.
        let held = acquire_dotlock(&path, ".lock", &settings(1000, 0)).unwrap();
        assert!(lock_path.exists());
        drop(held);
    }

    #[test]
    fn excl_lock_conflicts_between_handles() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");
        let file = File::create(&path).unwrap();
        let other = File::open(&path).unwrap();

        let settings = DotlockSettings {
            use_excl_lock: true,
            timeout: Duration::from_millis(50),
            stale_timeout: DOTLOCK_STALE_TIMEOUT,
        };
        let held = acquire(&path, Some(&file), &settings).unwrap();
        let err = acquire(&path, Some(&other), &settings).unwrap_err();
        assert!(matches!(err, Error::LockTimeout { .. }), "{err}");
        drop(held);
        acquire(&path, Some(&other), &settings).unwrap();
    }
}
