use std::fs::{self, File};
use std::io::{self, Read as _, Seek as _};
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::debug;
use memmap2::Mmap;
use tempfile::NamedTempFile;

use crate::error::{Error, Result};
use crate::lock::{self, DotlockSettings, HeldLock};
use crate::store::{self, StatSig};

pub const MAGIC: [u8; 6] = [b'm', b'x', b'l', b'o', b'g', 0xfe];

pub const LOG_VERSION: u8 = 1;

/// Every record is framed as a `u32` little-endian payload length followed
/// by the payload itself. The payload bytes are opaque to this crate.
pub const FRAME_PREFIX_LEN: usize = 4;

/// A file shorter than its header may be a creation still in progress in
/// another process; poll it briefly before declaring it corrupt.
const HEADER_RETRY_COUNT: u32 = 10;
const HEADER_RETRY_SLEEP: Duration = Duration::from_millis(10);

fn invalid_data(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

/// On-disk header of one transaction log segment.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileHeader {
    /// Monotonic identity of this segment within its log. Never zero.
    pub file_seq: u32,
    /// Segment this one was rotated from; zero for the first segment.
    pub prev_file_seq: u32,
    /// Write position of the predecessor at rotation time.
    pub prev_file_offset: u64,
    /// Creation time, unix seconds.
    pub create_stamp: u64,
}

impl FileHeader {
    pub const LEN: usize = MAGIC.len() + /* version + reserved */ 2 + 4 + 4 + 8 + 8;

    pub fn encode(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[..6].copy_from_slice(&MAGIC);
        buf[6] = LOG_VERSION;
        buf[8..12].copy_from_slice(&self.file_seq.to_le_bytes());
        buf[12..16].copy_from_slice(&self.prev_file_seq.to_le_bytes());
        buf[16..24].copy_from_slice(&self.prev_file_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.create_stamp.to_le_bytes());
        buf
    }

    pub fn write<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(&self.encode())
    }

    pub fn decode<R: io::Read>(mut read: R) -> io::Result<Self> {
        let mut buf = [0; Self::LEN];
        read.read_exact(&mut buf)?;

        if !buf.starts_with(&MAGIC) {
            return Err(invalid_data("header does not start with magic"));
        }
        let version = buf[MAGIC.len()];
        if version == 0 || version > LOG_VERSION {
            return Err(invalid_data(format!("unsupported log version {version}")));
        }

        let u32_at = |pos: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&buf[pos..pos + 4]);
            u32::from_le_bytes(b)
        };
        let file_seq = u32_at(8);
        let prev_file_seq = u32_at(12);
        if file_seq == 0 {
            return Err(invalid_data("zero file_seq"));
        }

        let u64_at = |pos: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[pos..pos + 8]);
            u64::from_le_bytes(b)
        };

        Ok(Self {
            file_seq,
            prev_file_seq,
            prev_file_offset: u64_at(16),
            create_stamp: u64_at(24),
        })
    }
}

#[derive(Debug)]
enum Backing {
    Disk { file: File, mmap: Option<Mmap> },
    Memory,
}

/// A single segment of the transaction log.
///
/// Disk-backed segments expose their bytes through a memory map covering
/// `[0, buffer_offset)` plus a tail buffer holding everything appended since
/// the last remap; [`LogFile::bytes`] addresses both uniformly. In-memory
/// segments keep the whole file, header included, in the tail buffer.
#[derive(Debug)]
pub struct LogFile {
    pub hdr: FileHeader,
    pub(crate) filepath: PathBuf,
    backing: Backing,
    /// Last observed stat identity; compared on refresh.
    pub(crate) sig: StatSig,
    /// Bytes past the mapped window, starting at `buffer_offset`.
    buffer: Vec<u8>,
    buffer_offset: u64,
    /// End of the last complete record frame known durable. Readers must
    /// never be handed bytes past this boundary.
    pub(crate) sync_offset: u64,
    pub(crate) mailbox_sync_max_offset: u64,
    pub(crate) mailbox_sync_saved_offset: u64,
    locked: bool,
    lock: Option<HeldLock>,
}

impl LogFile {
    /// Open an existing log file. `Ok(None)` when `path` does not exist.
    pub(crate) fn open(path: &Path) -> Result<Option<LogFile>> {
        let file = match store::nfs_safe_open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::io(path, "open", e)),
        };

        let mut attempts = 0;
        let meta = loop {
            let meta = file.metadata().map_err(|e| Error::io(path, "fstat", e))?;
            if meta.len() >= FileHeader::LEN as u64 {
                break meta;
            }
            if attempts >= HEADER_RETRY_COUNT {
                return Err(Error::corrupt(path, "file shorter than its header"));
            }
            attempts += 1;
            thread::sleep(HEADER_RETRY_SLEEP);
        };

        let mut hdr_bytes = [0u8; FileHeader::LEN];
        {
            use std::os::unix::fs::FileExt as _;
            file.read_exact_at(&mut hdr_bytes, 0)
                .map_err(|e| Error::io(path, "pread", e))?;
        }
        let hdr = FileHeader::decode(&hdr_bytes[..]).map_err(|e| Error::corrupt(path, e.to_string()))?;

        debug!("{}: opened log file_seq={}", path.display(), hdr.file_seq);
        Ok(Some(Self::from_disk(path.to_owned(), file, hdr, StatSig::from(&meta))))
    }

    /// Create a new log file at `path` with `hdr`.
    ///
    /// The whole sequence is guarded by a `.newlock` dotlock. If a file
    /// exists at `path` whose identity differs from `expected`, another
    /// process created a log since `expected` was captured; that file is
    /// adopted instead of being clobbered. Otherwise any existing file (ours,
    /// during rotation) is archived to `<path>.2`, the header is written to a
    /// temporary file, fsynced, and renamed into place.
    ///
    /// With `keep_locked` the returned file holds the whole-file lock.
    pub(crate) fn create(
        path: &Path,
        hdr: FileHeader,
        expected: Option<StatSig>,
        settings: &DotlockSettings,
        keep_locked: bool,
    ) -> Result<LogFile> {
        let dotlock = lock::acquire_dotlock(path, lock::NEW_LOCK_SUFFIX, settings)?;

        let existing = match store::nfs_safe_stat(path) {
            Ok(meta) => Some(StatSig::from(&meta)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(Error::io(path, "stat", e)),
        };
        if let Some(sig) = existing {
            let ours = expected.is_some_and(|e| sig.same_file(&e));
            if !ours {
                // Lost the race; use the winner's file.
                debug!("{}: adopting concurrently created log", path.display());
                drop(dotlock);
                let Some(mut file) = Self::open(path)? else {
                    return Err(Error::io(path, "open", io::ErrorKind::NotFound.into()));
                };
                if keep_locked {
                    file.lock(settings)?;
                }
                return Ok(file);
            }
            // Keep the previous segment reachable for readers lagging one
            // rotation behind.
            let archive = store::rotated_path(path);
            fs::rename(path, &archive).map_err(|e| Error::io(path, "rename", e))?;
            debug!("{}: archived to {}", path.display(), archive.display());
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = NamedTempFile::new_in(dir).map_err(|e| Error::io(path, "open", e))?;
        hdr.write(&mut tmp).map_err(|e| Error::io(path, "write", e))?;
        tmp.as_file().sync_data().map_err(|e| Error::io(path, "fdatasync", e))?;
        let file = tmp
            .persist(path)
            .map_err(|e| Error::io(path, "rename", e.error))?;
        store::sync_parent_dir(path);

        let meta = file.metadata().map_err(|e| Error::io(path, "fstat", e))?;
        let mut file = Self::from_disk(path.to_owned(), file, hdr, StatSig::from(&meta));
        if keep_locked {
            // Still holding the .newlock, so nobody can slip in between the
            // rename and this lock.
            file.lock(settings)?;
        }
        drop(dotlock);

        debug!("{}: created log file_seq={}", path.display(), hdr.file_seq);
        Ok(file)
    }

    fn from_disk(filepath: PathBuf, file: File, hdr: FileHeader, sig: StatSig) -> LogFile {
        LogFile {
            hdr,
            filepath,
            backing: Backing::Disk { file, mmap: None },
            sig,
            buffer: Vec::new(),
            buffer_offset: FileHeader::LEN as u64,
            sync_offset: FileHeader::LEN as u64,
            mailbox_sync_max_offset: FileHeader::LEN as u64,
            mailbox_sync_saved_offset: FileHeader::LEN as u64,
            locked: false,
            lock: None,
        }
    }

    /// A segment backed by process memory only.
    pub(crate) fn create_in_memory(hdr: FileHeader) -> LogFile {
        LogFile {
            hdr,
            filepath: PathBuf::from("(in-memory transaction log)"),
            backing: Backing::Memory,
            sig: StatSig::default(),
            buffer: hdr.encode().to_vec(),
            buffer_offset: 0,
            sync_offset: FileHeader::LEN as u64,
            mailbox_sync_max_offset: FileHeader::LEN as u64,
            mailbox_sync_saved_offset: FileHeader::LEN as u64,
            locked: false,
            lock: None,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        matches!(self.backing, Backing::Memory)
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn sync_offset(&self) -> u64 {
        self.sync_offset
    }

    pub fn filepath(&self) -> &Path {
        &self.filepath
    }

    /// One past the last byte currently addressable without remapping.
    pub(crate) fn end_offset(&self) -> u64 {
        self.buffer_offset + self.buffer.len() as u64
    }

    /// Acquire the exclusive whole-file lock. A no-op if already held; an
    /// in-memory segment has no other processes to exclude.
    pub(crate) fn lock(&mut self, settings: &DotlockSettings) -> Result<()> {
        if self.locked {
            return Ok(());
        }
        if !self.is_in_memory() {
            let file = match &self.backing {
                Backing::Disk { file, .. } => Some(file),
                Backing::Memory => None,
            };
            self.lock = Some(lock::acquire(&self.filepath, file, settings)?);
        }
        self.locked = true;
        Ok(())
    }

    pub(crate) fn unlock(&mut self) {
        debug_assert!(self.locked, "unlock on unlocked transaction log file");
        self.locked = false;
        self.lock = None;
    }

    /// Append one opaque record. Requires the whole-file lock and a window
    /// mapped through end of file (see [`crate::TxLog::sync_lock`]).
    ///
    /// The record is framed with its length prefix, written, and fsynced;
    /// `sync_offset` advances only after the fsync succeeded.
    pub(crate) fn append(&mut self, record: &[u8]) -> Result<()> {
        assert!(self.locked, "append on unlocked transaction log file");
        assert!(!record.is_empty(), "empty record frame");
        let len = u32::try_from(record.len()).expect("record frame too large");

        let end = self.end_offset();
        debug_assert!(end >= self.sig.size, "append without mapping to end of file");
        if let Backing::Disk { file, .. } = &mut self.backing {
            use std::os::unix::fs::FileExt as _;
            file.write_all_at(&len.to_le_bytes(), end)
                .map_err(|e| Error::io(&self.filepath, "pwrite", e))?;
            file.write_all_at(record, end + FRAME_PREFIX_LEN as u64)
                .map_err(|e| Error::io(&self.filepath, "pwrite", e))?;
            file.sync_data()
                .map_err(|e| Error::io(&self.filepath, "fdatasync", e))?;
        }

        self.buffer.extend_from_slice(&len.to_le_bytes());
        self.buffer.extend_from_slice(record);
        self.sync_offset = end + FRAME_PREFIX_LEN as u64 + record.len() as u64;
        self.sig.size = self.sig.size.max(self.sync_offset);
        Ok(())
    }

    /// Ensure `[start, end)` is addressable via [`LogFile::bytes`], then
    /// advance `sync_offset` over any newly visible complete frames.
    ///
    /// `end == u64::MAX` maps through the current end of file. The mapped
    /// window always starts at offset zero; bytes appended since the last
    /// remap are served from the tail buffer.
    pub(crate) fn map(&mut self, start: u64, end: u64) -> Result<()> {
        if self.is_in_memory() {
            let avail = self.end_offset();
            let end = if end == u64::MAX { avail } else { end };
            if start > end || end > avail {
                return Err(Error::corrupt(&self.filepath, "record range past end of file"));
            }
            self.advance_sync_offset();
            return Ok(());
        }

        let size = self.fstat_sig()?.size;
        self.sig.size = size;
        let end = if end == u64::MAX { size } else { end };
        if start > end {
            return Err(Error::corrupt(&self.filepath, "record range past end of file"));
        }

        if !self.range_accessible(start, end) {
            self.remap()?;
            if !self.range_accessible(start, end) {
                return Err(Error::corrupt(&self.filepath, "record range past end of file"));
            }
        }
        self.advance_sync_offset();
        Ok(())
    }

    fn range_accessible(&self, start: u64, end: u64) -> bool {
        if end <= self.mmap_len() {
            return true;
        }
        start >= self.buffer_offset && end <= self.end_offset()
    }

    fn mmap_len(&self) -> u64 {
        match &self.backing {
            Backing::Disk { mmap, .. } => mmap.as_ref().map_or(0, |m| m.len() as u64),
            Backing::Memory => 0,
        }
    }

    /// Replace the window with a fresh map of the whole file.
    fn remap(&mut self) -> Result<()> {
        let Backing::Disk { file, mmap } = &mut self.backing else {
            return Ok(());
        };
        *mmap = None;
        // Safety: the mapping is only unsound if the file shrinks while
        // mapped; segments are append-only until purged wholesale.
        let map = unsafe { Mmap::map(&*file) }.map_err(|e| Error::io(&self.filepath, "mmap", e))?;
        debug!("{}: mapped {} bytes", self.filepath.display(), map.len());
        self.buffer.clear();
        self.buffer_offset = map.len() as u64;
        *mmap = Some(map);
        Ok(())
    }

    /// Advance `sync_offset` over complete frames now visible. A zero length
    /// prefix (a preallocated tail) or a partial frame stops the scan.
    fn advance_sync_offset(&mut self) {
        let end = self.end_offset();
        loop {
            let off = self.sync_offset;
            if off + FRAME_PREFIX_LEN as u64 > end {
                break;
            }
            let mut len_bytes = [0u8; FRAME_PREFIX_LEN];
            len_bytes.copy_from_slice(self.bytes(off..off + FRAME_PREFIX_LEN as u64));
            let len = u32::from_le_bytes(len_bytes) as u64;
            if len == 0 || off + FRAME_PREFIX_LEN as u64 + len > end {
                break;
            }
            self.sync_offset = off + FRAME_PREFIX_LEN as u64 + len;
        }
    }

    /// Borrow `[range.start, range.end)`. The caller must have mapped the
    /// range in via [`LogFile::map`].
    pub fn bytes(&self, range: Range<u64>) -> &[u8] {
        assert!(range.start <= range.end, "inverted byte range");
        if range.start >= self.buffer_offset {
            let start = (range.start - self.buffer_offset) as usize;
            let end = (range.end - self.buffer_offset) as usize;
            &self.buffer[start..end]
        } else {
            match &self.backing {
                Backing::Disk { mmap: Some(map), .. } => &map[range.start as usize..range.end as usize],
                _ => panic!("byte range {}..{} is not mapped", range.start, range.end),
            }
        }
    }

    /// Read the whole file into memory and detach from disk storage.
    ///
    /// The segment keeps its identity and contents; the descriptor and the
    /// mapping are released.
    pub(crate) fn move_to_memory(&mut self) -> Result<()> {
        let contents = match &mut self.backing {
            Backing::Memory => return Ok(()),
            Backing::Disk { file, mmap } => {
                *mmap = None;
                let mut contents = Vec::new();
                file.seek(io::SeekFrom::Start(0))
                    .map_err(|e| Error::io(&self.filepath, "lseek", e))?;
                file.read_to_end(&mut contents)
                    .map_err(|e| Error::io(&self.filepath, "read", e))?;
                contents
            }
        };
        debug!(
            "{}: moved file_seq={} to memory ({} bytes)",
            self.filepath.display(),
            self.hdr.file_seq,
            contents.len()
        );
        self.buffer = contents;
        self.buffer_offset = 0;
        self.backing = Backing::Memory;
        Ok(())
    }

    /// Move the held lock from `from` onto `self`.
    ///
    /// Only meaningful for dotlocks, which guard the canonical path rather
    /// than a particular inode: after a rotation the same sidecar keeps
    /// excluding writers, now on behalf of the new head.
    pub(crate) fn steal_lock(&mut self, from: &mut LogFile) {
        debug_assert!(from.locked && !self.locked, "lock transfer without a held lock");
        self.lock = from.lock.take();
        self.locked = true;
        from.locked = false;
    }

    /// Current stat identity of the backing file. For an in-memory segment,
    /// the last identity it had on disk.
    pub(crate) fn fstat_sig(&self) -> Result<StatSig> {
        match &self.backing {
            Backing::Disk { file, .. } => {
                let meta = file.metadata().map_err(|e| Error::io(&self.filepath, "fstat", e))?;
                Ok(StatSig::from(&meta))
            }
            Backing::Memory => Ok(self.sig),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::enable_logging;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use tempfile::tempdir;

    fn header(file_seq: u32) -> FileHeader {
        FileHeader {
            file_seq,
            prev_file_seq: file_seq.saturating_sub(1),
            prev_file_offset: 0,
            create_stamp: 1_700_000_000,
        }
    }

    fn settings() -> DotlockSettings {
        DotlockSettings::default()
    }

    #[test]
    fn header_roundtrip() {
        let hdr = FileHeader {
            file_seq: 42,
            prev_file_seq: 41,
            prev_file_offset: 1100,
            create_stamp: 1_700_000_000,
        };
        let mut buf = [0u8; FileHeader::LEN];
        hdr.write(&mut buf[..]).unwrap();
        assert_eq!(hdr, FileHeader::decode(&buf[..]).unwrap());
    }

    #[test]
    fn header_rejects_bad_magic_version_and_seq() {
        let good = header(1).encode();

        let mut bad_magic = good;
        bad_magic[0] ^= 0xff;
        assert!(FileHeader::decode(&bad_magic[..]).is_err());

        let mut bad_version = good;
        bad_version[6] = LOG_VERSION + 1;
        assert!(FileHeader::decode(&bad_version[..]).is_err());

        let mut zero_seq = good;
        zero_seq[8..12].copy_from_slice(&0u32.to_le_bytes());
        assert!(FileHeader::decode(&zero_seq[..]).is_err());
    }

    #[test]
    fn open_missing_file_is_none() {
        let tmp = tempdir().unwrap();
        assert!(LogFile::open(&tmp.path().join("mailbox.log")).unwrap().is_none());
    }

    #[test]
    fn open_short_file_is_corrupt() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");
        fs::write(&path, b"mx").unwrap();
        let err = LogFile::open(&path).unwrap_err();
        assert!(matches!(err, Error::Corrupt { .. }), "{err}");
    }

    #[test]
    fn create_append_reopen_preserves_state() {
        enable_logging();
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let mut file = LogFile::create(&path, header(1), None, &settings(), true).unwrap();
        file.append(b"first record").unwrap();
        file.append(b"second").unwrap();
        let written = file.sync_offset();
        assert_eq!(
            written,
            (FileHeader::LEN + 2 * FRAME_PREFIX_LEN + b"first record".len() + b"second".len()) as u64
        );
        file.unlock();
        drop(file);

        let mut reopened = LogFile::open(&path).unwrap().unwrap();
        assert_eq!(reopened.hdr, header(1));
        reopened.map(0, u64::MAX).unwrap();
        assert_eq!(reopened.sync_offset(), written);

        let off = FileHeader::LEN as u64 + FRAME_PREFIX_LEN as u64;
        assert_eq!(reopened.bytes(off..off + 12), b"first record");
    }

    #[test]
    fn partial_frame_is_invisible() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let mut file = LogFile::create(&path, header(1), None, &settings(), true).unwrap();
        file.append(b"complete").unwrap();
        let boundary = file.sync_offset();
        file.unlock();
        drop(file);

        // A torn write: length prefix promises more bytes than were written.
        let mut raw = fs::OpenOptions::new().append(true).open(&path).unwrap();
        io::Write::write_all(&mut raw, &100u32.to_le_bytes()).unwrap();
        io::Write::write_all(&mut raw, b"torn").unwrap();
        drop(raw);

        let mut reopened = LogFile::open(&path).unwrap().unwrap();
        reopened.map(0, u64::MAX).unwrap();
        assert_eq!(reopened.sync_offset(), boundary);
    }

    #[test]
    fn zeroed_tail_stops_the_scan() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let mut file = LogFile::create(&path, header(1), None, &settings(), true).unwrap();
        file.append(b"record").unwrap();
        let boundary = file.sync_offset();
        file.unlock();
        drop(file);

        let mut raw = fs::OpenOptions::new().append(true).open(&path).unwrap();
        io::Write::write_all(&mut raw, &[0u8; 64]).unwrap();
        drop(raw);

        let mut reopened = LogFile::open(&path).unwrap().unwrap();
        reopened.map(0, u64::MAX).unwrap();
        assert_eq!(reopened.sync_offset(), boundary);
    }

    #[test]
    fn create_adopts_concurrently_created_file() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let winner = LogFile::create(&path, header(7), None, &settings(), false).unwrap();
        let winner_sig = winner.sig;
        drop(winner);

        // `expected: None` models a creator whose preceding open saw ENOENT.
        let adopted = LogFile::create(&path, header(1), None, &settings(), false).unwrap();
        assert_eq!(adopted.hdr.file_seq, 7);
        assert!(adopted.sig.same_file(&winner_sig));
    }

    #[test]
    fn create_over_own_file_archives_it() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let old = LogFile::create(&path, header(1), None, &settings(), false).unwrap();
        let old_sig = old.fstat_sig().unwrap();
        drop(old);

        let new = LogFile::create(&path, header(2), Some(old_sig), &settings(), false).unwrap();
        assert_eq!(new.hdr.file_seq, 2);

        let archived = LogFile::open(&store::rotated_path(&path)).unwrap().unwrap();
        assert_eq!(archived.hdr.file_seq, 1);
        assert!(archived.sig.same_file(&old_sig));
    }

    #[test]
    fn in_memory_segment_roundtrip() {
        let mut file = LogFile::create_in_memory(header(1));
        assert!(file.is_in_memory());
        file.lock(&settings()).unwrap();
        file.append(b"in memory").unwrap();

        let off = FileHeader::LEN as u64 + FRAME_PREFIX_LEN as u64;
        assert_eq!(file.bytes(off..off + 9), b"in memory");
        assert_eq!(file.bytes(0..MAGIC.len() as u64), &MAGIC);
        file.unlock();
    }

    #[test]
    fn move_to_memory_preserves_bytes() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("mailbox.log");

        let mut file = LogFile::create(&path, header(1), None, &settings(), true).unwrap();
        file.append(b"kept across the move").unwrap();
        file.unlock();
        let end = file.sync_offset();
        file.map(0, u64::MAX).unwrap();
        let before = file.bytes(0..end).to_vec();

        file.move_to_memory().unwrap();
        assert!(file.is_in_memory());
        assert_eq!(file.hdr.file_seq, 1);
        assert_eq!(file.bytes(0..end), &before[..]);
        assert_eq!(&before[..], &fs::read(&path).unwrap()[..]);
    }

    proptest! {
        #[test]
        fn scan_recovers_every_append(lens in proptest::collection::vec(1usize..512, 0..16)) {
            let tmp = tempdir().unwrap();
            let path = tmp.path().join("mailbox.log");

            let mut file = LogFile::create(&path, header(1), None, &settings(), true).unwrap();
            let mut expected = FileHeader::LEN as u64;
            for len in &lens {
                file.append(&vec![0xab; *len]).unwrap();
                expected += (FRAME_PREFIX_LEN + len) as u64;
            }
            prop_assert_eq!(file.sync_offset(), expected);
            file.unlock();
            drop(file);

            let mut reopened = LogFile::open(&path).unwrap().unwrap();
            reopened.map(0, u64::MAX).unwrap();
            prop_assert_eq!(reopened.sync_offset(), expected);
        }
    }
}
