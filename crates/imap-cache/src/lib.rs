//! Per-session cache of parsed message state for IMAP fetches.
//!
//! Most messages are fetched once, so the cache is small: its main job is to
//! avoid re-parsing the message a client is currently fetching piece by
//! piece. Entries are kept most recently used first, each memoizing the part
//! tree, header/body sizes, and the BODY / BODYSTRUCTURE / ENVELOPE texts.
//!
//! MIME parsing itself is external: the cache reaches it through
//! [`MailSource`], which also supplies the raw message bytes as a seekable
//! stream. What the crate owns is the memoization, the eviction order, and
//! the virtual-size arithmetic needed for partial fetches (IMAP transmits
//! CRLF line endings, so a message stored with bare LFs has a *virtual* size
//! larger than its physical one).

mod cache;
mod size;

pub use crate::{
    cache::{CacheFields, MailSource, MessageCache, MessagePart, MAX_CACHED_MESSAGES},
    size::MessageSize,
};
