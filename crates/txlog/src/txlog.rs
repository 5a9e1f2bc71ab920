use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Error, Result};
use crate::segment::{FileHeader, LogFile};
use crate::store::{self, unix_now, StatSig};
use crate::view::Views;
use crate::Options;

/// Suffix appended to the index path to name the canonical log file.
pub const LOG_SUFFIX: &str = ".log";
/// Suffix of the immediately-previous rotated segment.
pub const ROTATED_SUFFIX: &str = ".2";

/// Outcome of [`TxLog::open`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[must_use]
pub enum OpenOutcome {
    /// The canonical log file exists and is now the head.
    Opened,
    /// No log file yet; the caller should [`TxLog::create`] one.
    NotFound,
}

pub(crate) struct FileEntry {
    pub(crate) file: LogFile,
    pub(crate) refcount: u32,
}

/// The transaction log manager.
///
/// Owns the head segment and every older segment still pinned by a reader,
/// keyed by `file_seq`. All mutation of the head happens between
/// [`TxLog::sync_lock`] and [`TxLog::sync_unlock`].
pub struct TxLog {
    /// Canonical path of the head segment, `<index>.log`.
    filepath: PathBuf,
    opts: Options,
    in_memory: bool,
    /// Every materialized segment, the head included.
    pub(crate) files: BTreeMap<u32, FileEntry>,
    pub(crate) head_seq: Option<u32>,
    /// Stat signature carried from an [`TxLog::open`] that found nothing,
    /// letting [`TxLog::create`] detect a concurrent creator.
    pending_open: Option<StatSig>,
    /// Set between `sync_lock` and `sync_unlock`.
    log_locked: bool,
    pub(crate) views: Views,
}

impl TxLog {
    /// Bind a new, empty log to the index at `index_path`.
    ///
    /// No file is touched yet; call [`TxLog::open`] and, on
    /// [`OpenOutcome::NotFound`], [`TxLog::create`].
    pub fn new(index_path: impl AsRef<Path>, opts: Options) -> Self {
        let mut filepath = index_path.as_ref().as_os_str().to_os_string();
        filepath.push(LOG_SUFFIX);
        Self {
            filepath: filepath.into(),
            opts,
            in_memory: false,
            files: BTreeMap::new(),
            head_seq: None,
            pending_open: None,
            log_locked: false,
            views: Views::default(),
        }
    }

    /// Bind a log whose owning index is not durable; every segment lives in
    /// process memory and the filesystem is never touched.
    pub fn new_in_memory(opts: Options) -> Self {
        let mut log = Self::new("(in-memory index)", opts);
        log.in_memory = true;
        log
    }

    pub fn is_in_memory(&self) -> bool {
        self.in_memory
    }

    /// The segment currently accepting appends, if any.
    pub fn head(&self) -> Option<&LogFile> {
        self.head_seq.map(|seq| &self.files[&seq].file)
    }

    pub(crate) fn entry(&self, seq: u32) -> &FileEntry {
        self.files.get(&seq).expect("unknown transaction log file_seq")
    }

    pub(crate) fn entry_mut(&mut self, seq: u32) -> &mut FileEntry {
        self.files.get_mut(&seq).expect("unknown transaction log file_seq")
    }

    pub(crate) fn pin(&mut self, seq: u32) {
        self.entry_mut(seq).refcount += 1;
    }

    pub(crate) fn unpin(&mut self, seq: u32) {
        let entry = self.entry_mut(seq);
        debug_assert!(entry.refcount > 0, "unbalanced unpin of file_seq {seq}");
        entry.refcount = entry.refcount.saturating_sub(1);
    }

    /// Drop segments nobody references anymore. The head is always kept.
    pub(crate) fn purge(&mut self) {
        let head = self.head_seq;
        self.files.retain(|seq, entry| {
            let keep = entry.refcount > 0 || Some(*seq) == head;
            if !keep {
                debug!(
                    "{}: dropping log file_seq={seq}",
                    entry.file.filepath().display()
                );
            }
            keep
        });
    }

    /// Install `file` as the new head, holding the head's own pin on it.
    fn set_head(&mut self, file: LogFile) {
        let seq = file.hdr.file_seq;
        debug_assert_ne!(Some(seq), self.head_seq, "head replaced by itself");
        let prev = self.files.insert(seq, FileEntry { file, refcount: 1 });
        debug_assert!(prev.is_none(), "duplicate file_seq {seq}");
        self.head_seq = Some(seq);
    }

    /// Open the canonical log file and install it as head.
    ///
    /// [`OpenOutcome::NotFound`] is not an error: the failed attempt is
    /// remembered so that [`TxLog::create`] can detect a log created by
    /// another process in the meantime. In-memory logs report `NotFound`
    /// unconditionally.
    pub fn open(&mut self) -> Result<OpenOutcome> {
        debug_assert!(self.head_seq.is_none(), "open with a live head");
        self.pending_open = None;

        if self.in_memory {
            return Ok(OpenOutcome::NotFound);
        }
        match LogFile::open(&self.filepath)? {
            Some(file) => {
                self.set_head(file);
                Ok(OpenOutcome::Opened)
            }
            None => {
                self.pending_open = Some(StatSig::default());
                Ok(OpenOutcome::NotFound)
            }
        }
    }

    /// Create the initial log file and install it as head.
    ///
    /// If another process created a log between our failed [`TxLog::open`]
    /// and now, its file is adopted instead of being clobbered; no duplicate
    /// `file_seq` is ever produced.
    pub fn create(&mut self) -> Result<()> {
        let hdr = FileHeader {
            file_seq: 1,
            prev_file_seq: 0,
            prev_file_offset: 0,
            create_stamp: unix_now(),
        };
        if self.in_memory {
            self.set_head(LogFile::create_in_memory(hdr));
            return Ok(());
        }
        let expected = self.pending_open.take();
        let file = LogFile::create(&self.filepath, hdr, expected, &self.opts.dotlock, false)?;
        self.set_head(file);
        Ok(())
    }

    /// Close every view and release every segment.
    pub fn close(&mut self) {
        self.close_views();
        self.pending_open = None;
        self.log_locked = false;
        if let Some(seq) = self.head_seq.take() {
            self.unpin(seq);
        }
        self.purge();
        debug_assert!(self.files.is_empty(), "segments still referenced at close");
    }

    /// Convert every segment to its in-memory representation.
    ///
    /// Used when the underlying storage is becoming non-durable. Identity
    /// (`file_seq`) and contents are preserved; descriptors and mappings are
    /// released, and later operations stay off the filesystem.
    pub fn move_to_memory(&mut self) -> Result<()> {
        for entry in self.files.values_mut() {
            entry.file.move_to_memory()?;
        }
        self.pending_open = None;
        self.in_memory = true;
        Ok(())
    }

    /// Adopt the canonical file if another process rename-replaced it.
    ///
    /// While the head is locked this is a no-op: creating a replacement
    /// requires the same lock, so none can exist.
    pub(crate) fn refresh(&mut self) -> Result<()> {
        let head_seq = self.head_seq.expect("refresh without head");
        if self.entry(head_seq).file.is_in_memory() {
            return Ok(());
        }

        // Losing the canonical file under a live head is an error, ENOENT
        // included.
        let meta =
            store::nfs_safe_stat(&self.filepath).map_err(|e| Error::io(&self.filepath, "stat", e))?;
        let sig = StatSig::from(&meta);
        if self.entry(head_seq).file.sig.same_file(&sig) {
            return Ok(());
        }

        let Some(file) = LogFile::open(&self.filepath)? else {
            return Err(Error::io(&self.filepath, "open", io::ErrorKind::NotFound.into()));
        };
        debug_assert!(!file.is_locked());
        debug!(
            "{}: head replaced, file_seq {head_seq} -> {}",
            self.filepath.display(),
            file.hdr.file_seq
        );
        self.unpin(head_seq);
        self.set_head(file);
        self.purge();
        Ok(())
    }

    /// Look up the segment with `file_seq`, materializing it from the
    /// rotation archive if needed. `Ok(None)` when it cannot be found.
    pub fn find_file(&mut self, file_seq: u32) -> Result<Option<&LogFile>> {
        let found = self.find_file_seq(file_seq)?;
        Ok(found.map(|seq| &self.files[&seq].file))
    }

    pub(crate) fn find_file_seq(&mut self, file_seq: u32) -> Result<Option<u32>> {
        let head_seq = self.head_seq.expect("find_file without head");
        if file_seq > head_seq {
            if self.entry(head_seq).file.is_locked() {
                // We hold the lock, so no newer file can exist.
                return Ok(None);
            }
            self.refresh()?;
            if file_seq > self.head_seq.expect("head after refresh") {
                return Ok(None);
            }
        }

        if self.files.contains_key(&file_seq) {
            return Ok(Some(file_seq));
        }
        if self.in_memory {
            return Ok(None);
        }

        // Maybe it is the immediately-previous rotated segment.
        let path = store::rotated_path(&self.filepath);
        let file = match LogFile::open(&path) {
            Ok(Some(file)) => file,
            Ok(None) => return Ok(None),
            Err(Error::Corrupt { path, reason }) => {
                // Indistinguishable from absence for the caller.
                warn!("{}: ignoring corrupt rotated log: {reason}", path.display());
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        if file.hdr.file_seq != file_seq {
            return Ok(None);
        }
        debug!("{}: materialized rotated file_seq={file_seq}", path.display());
        self.files.insert(file_seq, FileEntry { file, refcount: 0 });
        Ok(Some(file_seq))
    }

    /// Lock the head, revalidating that it is still the canonical head.
    ///
    /// Another process may rotate the log between us choosing the head and
    /// locking it; then the superseded lock is dropped and the new head is
    /// tried. A replacement can only appear while the head is unlocked, so
    /// once a locked head survives a refresh the loop is done.
    pub(crate) fn lock_head(&mut self) -> Result<()> {
        loop {
            let seq = self.head_seq.expect("lock_head without head");
            let settings = self.opts.dotlock;
            self.entry_mut(seq).file.lock(&settings)?;

            self.pin(seq);
            let refreshed = self.refresh();
            self.unpin(seq);
            self.purge();
            let gone = !self.files.contains_key(&seq);

            if refreshed.is_ok() && self.head_seq == Some(seq) {
                return Ok(());
            }
            if !gone {
                self.entry_mut(seq).file.unlock();
            }
            refreshed?;
        }
    }

    /// Lock the head for writing and surface the write position.
    ///
    /// The mapped window is extended through end of file first, so
    /// `sync_offset` reflects everything other writers committed before us.
    pub fn sync_lock(&mut self) -> Result<(u32, u64)> {
        assert!(!self.log_locked, "transaction log already locked");
        self.lock_head()?;

        let seq = self.head_seq.expect("head after lock_head");
        let entry = self.entry_mut(seq);
        let sync_offset = entry.file.sync_offset();
        if let Err(e) = entry.file.map(sync_offset, u64::MAX) {
            entry.file.unlock();
            return Err(e);
        }

        self.log_locked = true;
        let file = &self.entry(seq).file;
        Ok((file.hdr.file_seq, file.sync_offset()))
    }

    pub fn sync_unlock(&mut self) {
        assert!(self.log_locked, "sync_unlock without sync_lock");
        self.log_locked = false;
        let seq = self.head_seq.expect("sync_unlock without head");
        self.entry_mut(seq).file.unlock();
    }

    /// Current write position. Only meaningful while the log is locked.
    pub fn get_head(&self) -> (u32, u64) {
        assert!(self.log_locked, "get_head without sync_lock");
        let file = self.head().expect("get_head without head");
        (file.hdr.file_seq, file.sync_offset())
    }

    /// Append one record frame to the head. Requires [`TxLog::sync_lock`].
    pub fn append(&mut self, record: &[u8]) -> Result<()> {
        assert!(self.log_locked, "append without sync_lock");
        let seq = self.head_seq.expect("append without head");
        self.entry_mut(seq).file.append(record)
    }

    /// `true` when the head is both large and old enough to rotate, or has
    /// outgrown the hard size limit.
    pub fn want_rotate(&self) -> bool {
        let Some(file) = self.head() else { return false };
        let age = unix_now().saturating_sub(file.hdr.create_stamp);
        (file.sync_offset() > self.opts.rotate_min_size && age > self.opts.rotate_time.as_secs())
            || file.sync_offset() > self.opts.rotate_max_size
    }

    /// Retire the locked head and install a fresh segment as the write
    /// point, linking the two by `(prev_file_seq, prev_file_offset)`.
    ///
    /// The old head stays materialized for its remaining readers; once the
    /// last one closes it is purged. The new head is installed locked, so
    /// the surrounding `sync_lock`/`sync_unlock` pairing is undisturbed.
    pub fn rotate(&mut self) -> Result<()> {
        let old_seq = self.head_seq.expect("rotate without head");
        assert!(self.entry(old_seq).file.is_locked(), "rotate on unlocked head");

        let old = &self.entry(old_seq).file;
        let hdr = FileHeader {
            file_seq: old_seq + 1,
            prev_file_seq: old_seq,
            prev_file_offset: old.sync_offset(),
            create_stamp: unix_now(),
        };

        let mut file = if old.is_in_memory() {
            LogFile::create_in_memory(hdr)
        } else {
            // Holding the lock there is no ESTALE to worry about; fstat the
            // head so create() can verify the canonical path still points at
            // it before archiving. An exclusive lock binds to the inode and
            // must be taken on the new file right away; a dotlock guards the
            // canonical path and is carried over below instead.
            let sig = old.fstat_sig()?;
            let keep_locked = self.opts.dotlock.use_excl_lock;
            LogFile::create(&self.filepath, hdr, Some(sig), &self.opts.dotlock, keep_locked)?
        };

        self.unpin(old_seq);
        if file.is_locked() {
            self.entry_mut(old_seq).file.unlock();
        } else {
            file.steal_lock(&mut self.entry_mut(old_seq).file);
        }
        let old_refcount = self.entry(old_seq).refcount;
        self.set_head(file);
        if old_refcount == 0 {
            self.purge();
        }
        debug!(
            "{}: rotated file_seq {old_seq} -> {}",
            self.filepath.display(),
            old_seq + 1
        );
        Ok(())
    }

    /// `true` iff `(file_seq, offset)` is the position the head was rotated
    /// from. Readers use it to detect that they just fell off the end of a
    /// retired predecessor.
    pub fn is_head_prev(&self, file_seq: u32, offset: u64) -> bool {
        self.head()
            .is_some_and(|f| f.hdr.prev_file_seq == file_seq && f.hdr.prev_file_offset == offset)
    }

    /// The highest position the mailbox itself has been synced to.
    pub fn get_mailbox_sync_pos(&self) -> (u32, u64) {
        let file = self.head().expect("no head");
        (file.hdr.file_seq, file.mailbox_sync_max_offset)
    }

    /// Raise the mailbox-synced watermark. It never moves backwards.
    pub fn set_mailbox_sync_pos(&mut self, file_seq: u32, offset: u64) {
        let seq = self.head_seq.expect("no head");
        let file = &mut self.entry_mut(seq).file;
        assert_eq!(file_seq, file.hdr.file_seq, "sync position for a non-head file");
        assert!(
            offset >= file.mailbox_sync_saved_offset,
            "sync position behind the saved offset"
        );
        debug_assert!(offset <= file.sync_offset());
        if offset >= file.mailbox_sync_max_offset {
            file.mailbox_sync_max_offset = offset;
        }
    }
}

impl Drop for TxLog {
    fn drop(&mut self) {
        self.close();
    }
}
