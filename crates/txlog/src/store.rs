//! Low-level filesystem plumbing.
//!
//! Networked filesystems may fail syscalls with `ESTALE` when a file is
//! rename-replaced while a client still holds the old handle. The wrappers
//! here retry a bounded number of times; everything else is passed through.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use log::warn;
use nix::errno::Errno;

use crate::txlog::ROTATED_SUFFIX;

/// How many times to retry a syscall that failed with `ESTALE`.
const ESTALE_RETRY_COUNT: u32 = 10;

pub(crate) fn is_estale(err: &io::Error) -> bool {
    err.raw_os_error() == Some(Errno::ESTALE as i32)
}

/// `stat(2)` with bounded retries on stale NFS handles.
pub(crate) fn nfs_safe_stat(path: &Path) -> io::Result<fs::Metadata> {
    let mut attempts = 0;
    loop {
        match fs::metadata(path) {
            Err(e) if is_estale(&e) && attempts < ESTALE_RETRY_COUNT => attempts += 1,
            res => return res,
        }
    }
}

/// Open `path` read-write, with the same retry policy as [`nfs_safe_stat`].
pub(crate) fn nfs_safe_open(path: &Path) -> io::Result<File> {
    let mut attempts = 0;
    loop {
        match File::options().read(true).write(true).open(path) {
            Err(e) if is_estale(&e) && attempts < ESTALE_RETRY_COUNT => attempts += 1,
            res => return res,
        }
    }
}

/// Stat identity used to detect rename-replacement by another process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct StatSig {
    pub dev: u64,
    pub ino: u64,
    pub size: u64,
    pub mtime: i64,
}

impl From<&fs::Metadata> for StatSig {
    fn from(meta: &fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt as _;
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
            size: meta.len(),
            mtime: meta.mtime(),
        }
    }
}

impl StatSig {
    /// `true` if both signatures name the same inode.
    pub(crate) fn same_file(&self, other: &StatSig) -> bool {
        self.dev == other.dev && self.ino == other.ino
    }
}

/// Path of the immediately-previous rotated segment, `<path>.2`.
pub(crate) fn rotated_path(path: &Path) -> PathBuf {
    crate::lock::sibling_path(path, ROTATED_SUFFIX)
}

/// Seconds since the unix epoch; zero if the clock reads before it.
pub(crate) fn unix_now() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Best-effort fsync of the directory containing `path`, making a rename in
/// it durable.
pub(crate) fn sync_parent_dir(path: &Path) {
    let Some(dir) = path.parent() else { return };
    if let Err(e) = File::open(dir).and_then(|d| d.sync_all()) {
        warn!("{}: fsync() of directory failed: {e}", dir.display());
    }
}
