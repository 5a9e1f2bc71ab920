//! Append-only transaction log for an on-disk mailbox index.
//!
//! A mailbox index records every mutation (flag changes, appends, expunges)
//! in a transaction log before applying it. The log is a chain of segment
//! files linked by `(prev_file_seq, prev_file_offset)`. The newest segment,
//! the *head*, is the only one accepting appends, and is guarded by a
//! whole-file lock shared between processes.
//!
//! The main entry point is [`TxLog`]:
//!
//! - [`TxLog::open`] / [`TxLog::create`] establish the head segment,
//! - [`TxLog::sync_lock`] / [`TxLog::append`] / [`TxLog::sync_unlock`] drive
//!   the write path,
//! - [`TxLog::rotate`] retires a head which [`TxLog::want_rotate`] deems too
//!   large or too old,
//! - [`TxLog::open_view`] pins a segment for a reader, keeping it alive
//!   across rotations until the view is closed.
//!
//! Segments created by *other* processes (the log file is rename-replaced on
//! rotation) are detected by comparing stat identity and adopted
//! transparently; see [`TxLog::find_file`].
//!
//! When the owning index is not durable, the log runs fully in memory and
//! all filesystem interaction is bypassed.

use std::time::Duration;

mod error;
mod lock;
mod segment;
mod store;
mod txlog;
mod view;

pub use crate::{
    error::{Error, Result},
    lock::DotlockSettings,
    segment::{FileHeader, LogFile, FRAME_PREFIX_LEN, LOG_VERSION, MAGIC},
    txlog::{OpenOutcome, TxLog, LOG_SUFFIX, ROTATED_SUFFIX},
    view::ViewId,
};

#[cfg(test)]
pub(crate) mod testutil;

/// Transaction log tuning knobs.
#[derive(Clone, Copy, Debug)]
pub struct Options {
    /// Whole-file lock acquisition settings.
    pub dotlock: DotlockSettings,
    /// Rotate once the head exceeds this size *and* is older than
    /// [`Options::rotate_time`].
    ///
    /// Default: 32 KiB
    pub rotate_min_size: u64,
    /// Rotate unconditionally once the head exceeds this size.
    ///
    /// Default: 1 MiB
    pub rotate_max_size: u64,
    /// Minimum age of a head considered for size-based rotation at
    /// [`Options::rotate_min_size`].
    ///
    /// Default: 5 minutes
    pub rotate_time: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            dotlock: DotlockSettings::default(),
            rotate_min_size: 32 * 1024,
            rotate_max_size: 1024 * 1024,
            rotate_time: Duration::from_secs(5 * 60),
        }
    }
}
