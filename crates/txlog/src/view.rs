//! Live reader registry.
//!
//! A view pins one segment by reference count, keeping it materialized while
//! the head advances past it. Reads are clamped to the pinned segment's
//! `sync_offset`: bytes past it may be partially written and are never
//! exposed. Closing a view releases the pin and, for non-head segments,
//! sweeps unpinned files.

use log::debug;

use crate::error::Result;
use crate::txlog::TxLog;

/// Handle of an open reader, returned by [`TxLog::open_view`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ViewId(usize);

#[derive(Debug)]
struct ViewSlot {
    file_seq: u32,
    offset: u64,
}

/// The set of open readers. Slots are reused after close.
#[derive(Debug, Default)]
pub(crate) struct Views {
    slots: Vec<Option<ViewSlot>>,
}

impl Views {
    fn insert(&mut self, slot: ViewSlot) -> ViewId {
        match self.slots.iter_mut().enumerate().find(|(_, s)| s.is_none()) {
            Some((i, free)) => {
                *free = Some(slot);
                ViewId(i)
            }
            None => {
                self.slots.push(Some(slot));
                ViewId(self.slots.len() - 1)
            }
        }
    }

    fn get(&self, id: ViewId) -> &ViewSlot {
        self.slots
            .get(id.0)
            .and_then(Option::as_ref)
            .expect("closed or unknown view")
    }

    fn remove(&mut self, id: ViewId) -> Option<ViewSlot> {
        self.slots.get_mut(id.0).and_then(Option::take)
    }

    fn drain(&mut self) -> Vec<ViewSlot> {
        self.slots.drain(..).flatten().collect()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl TxLog {
    /// Open a reader over the segment `file_seq`, cursor at `offset`.
    ///
    /// The segment is pinned until [`TxLog::close_view`]; `Ok(None)` when no
    /// such segment can be found.
    pub fn open_view(&mut self, file_seq: u32, offset: u64) -> Result<Option<ViewId>> {
        let Some(seq) = self.find_file_seq(file_seq)? else {
            return Ok(None);
        };
        self.pin(seq);
        let id = self.views.insert(ViewSlot { file_seq: seq, offset });
        debug!("view {} opened at ({seq}, {offset})", id.0);
        Ok(Some(id))
    }

    /// Read up to `max` bytes at the view's cursor and advance it.
    ///
    /// Returns an empty slice once the cursor reaches the segment's
    /// `sync_offset`; for a retired segment that is its final size, and
    /// [`TxLog::is_head_prev`] tells the reader where to continue.
    pub fn view_read(&mut self, id: ViewId, max: usize) -> Result<&[u8]> {
        let slot = self.views.get(id);
        let (seq, offset) = (slot.file_seq, slot.offset);

        let end = {
            let file = &mut self.entry_mut(seq).file;
            // Extend the window through EOF so the published frame boundary
            // is current, then clamp the read to it.
            file.map(offset, u64::MAX)?;
            let end = file.sync_offset().min(offset.saturating_add(max as u64));
            if offset >= end {
                return Ok(&[]);
            }
            end
        };

        if let Some(slot) = self.views.slots[id.0].as_mut() {
            slot.offset = end;
        }
        Ok(self.entry(seq).file.bytes(offset..end))
    }

    /// Current position of the view.
    pub fn view_pos(&self, id: ViewId) -> (u32, u64) {
        let slot = self.views.get(id);
        (slot.file_seq, slot.offset)
    }

    /// Close the view, unpinning its segment. Non-head segments left
    /// unreferenced are dropped.
    pub fn close_view(&mut self, id: ViewId) {
        let Some(slot) = self.views.remove(id) else {
            return;
        };
        debug!("view {} closed at ({}, {})", id.0, slot.file_seq, slot.offset);
        self.unpin(slot.file_seq);
        if self.head_seq != Some(slot.file_seq) {
            self.purge();
        }
    }

    /// Forcibly close every view; used when the log itself closes.
    pub(crate) fn close_views(&mut self) {
        for slot in self.views.drain() {
            self.unpin(slot.file_seq);
        }
    }
}
