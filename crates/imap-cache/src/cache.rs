use std::io::{self, Read, Seek, SeekFrom};

use log::debug;

use crate::size::{self, MessageSize};

/// It is not very useful to cache many messages, as they are mostly fetched
/// just once. The biggest reason for the cache to exist is to hold on to the
/// message currently being fetched piece by piece.
pub const MAX_CACHED_MESSAGES: usize = 16;

bitflags::bitflags! {
    /// Message state a caller may ask the cache to fill ahead of time.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CacheFields: u8 {
        /// The BODY response text.
        const BODY          = 1 << 0;
        /// The BODYSTRUCTURE response text.
        const BODYSTRUCTURE = 1 << 1;
        /// The ENVELOPE response text.
        const ENVELOPE      = 1 << 2;
        /// The parsed MIME part tree.
        const MESSAGE_PART  = 1 << 3;
        /// Header sizes.
        const HDR_SIZE      = 1 << 4;
        /// Body sizes.
        const BODY_SIZE     = 1 << 5;
    }
}

/// Parsed MIME part tree, as produced by the external message parser.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessagePart {
    pub header_size: MessageSize,
    pub body_size: MessageSize,
    pub children: Vec<MessagePart>,
}

/// Supplier of raw message bytes and externally parsed state.
///
/// The cache never parses MIME itself: part trees and response texts come
/// from here, either out of a persistent cache (`cached_*`) or by parsing
/// the stream on demand (`parse_*`).
pub trait MailSource {
    type Stream: Read + Seek;

    /// Open the raw bytes of message `uid`, positioned at the start.
    fn open_mail(&mut self, uid: u32) -> io::Result<Self::Stream>;

    /// A previously stored value of a text `field`, if any.
    fn cached_field(&mut self, uid: u32, field: CacheFields) -> Option<String>;

    /// A previously stored part tree, if any.
    fn cached_parts(&mut self, uid: u32) -> Option<MessagePart>;

    /// Parse the part tree out of `stream`.
    fn parse_parts(&mut self, uid: u32, stream: &mut Self::Stream) -> io::Result<MessagePart>;

    /// Compute the text of `field` from `stream`. `Ok(None)` when the
    /// message legitimately has no value for it.
    fn parse_field(
        &mut self,
        uid: u32,
        field: CacheFields,
        stream: &mut Self::Stream,
    ) -> io::Result<Option<String>>;
}

/// Memoized position of the last partial-fetch scan, counted from the start
/// of the body.
#[derive(Clone, Copy, Debug, Default)]
struct PartialPos {
    size: MessageSize,
    /// The scan stopped between the virtual CR and LF of a bare linefeed.
    lf_pending: bool,
}

#[derive(Debug)]
struct CachedMessage {
    uid: u32,
    parts: Option<MessagePart>,
    hdr_size: Option<MessageSize>,
    body_size: Option<MessageSize>,
    partial: Option<PartialPos>,
    cached_body: Option<String>,
    cached_bodystructure: Option<String>,
    cached_envelope: Option<String>,
}

impl CachedMessage {
    fn new(uid: u32) -> Self {
        Self {
            uid,
            parts: None,
            hdr_size: None,
            body_size: None,
            partial: None,
            cached_body: None,
            cached_bodystructure: None,
            cached_envelope: None,
        }
    }
}

/// Per-session message cache, most recently used first.
///
/// At most one message is *open* at a time; all getters operate on it. A
/// single stream to the open message is kept and repositioned as needed.
pub struct MessageCache<S: MailSource> {
    source: S,
    messages: Vec<CachedMessage>,
    open_uid: Option<u32>,
    stream: Option<S::Stream>,
}

/// Position the cached stream, opening it on first use.
fn stream_at<'a, S: MailSource>(
    source: &mut S,
    slot: &'a mut Option<S::Stream>,
    uid: u32,
    offset: u64,
) -> io::Result<&'a mut S::Stream> {
    if slot.is_none() {
        *slot = Some(source.open_mail(uid)?);
    }
    let stream = slot.as_mut().expect("stream opened above");
    stream.seek(SeekFrom::Start(offset))?;
    Ok(stream)
}

impl<S: MailSource> MessageCache<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            messages: Vec::new(),
            open_uid: None,
            stream: None,
        }
    }

    /// Open message `uid` and fill `fields` ahead of time.
    ///
    /// Callers which already know the virtual header/body sizes (a message
    /// stored with CRLF line endings) pass them as nonzero to spare a scan.
    pub fn open(
        &mut self,
        uid: u32,
        fields: CacheFields,
        virtual_header_size: u64,
        virtual_body_size: u64,
    ) -> io::Result<()> {
        if self.open_uid != Some(uid) {
            self.close();
        }
        self.promote(uid);
        self.open_uid = Some(uid);

        let msg = self.messages.first_mut().expect("message promoted above");
        if virtual_header_size != 0 && msg.hdr_size.is_none() {
            msg.hdr_size = Some(MessageSize::with_equal_sizes(virtual_header_size));
        }
        if virtual_body_size != 0 && msg.body_size.is_none() {
            msg.body_size = Some(MessageSize::with_equal_sizes(virtual_body_size));
        }
        self.fill(fields)
    }

    /// Drop the open stream and deactivate the current message. Cached
    /// state is retained for the next open.
    pub fn close(&mut self) {
        self.stream = None;
        self.open_uid = None;
    }

    /// Close and forget every cached message.
    pub fn clear(&mut self) {
        self.close();
        self.messages.clear();
    }

    /// Text of `field` for the open message, filling it if needed.
    ///
    /// `field` must be one of [`CacheFields::BODY`],
    /// [`CacheFields::BODYSTRUCTURE`] or [`CacheFields::ENVELOPE`].
    pub fn get(&mut self, field: CacheFields) -> io::Result<Option<&str>> {
        assert!(
            field == CacheFields::BODY
                || field == CacheFields::BODYSTRUCTURE
                || field == CacheFields::ENVELOPE,
            "not a text field: {field:?}"
        );
        self.fill(field)?;
        let msg = self.open_message();
        Ok(if field == CacheFields::BODY {
            msg.cached_body.as_deref()
        } else if field == CacheFields::BODYSTRUCTURE {
            msg.cached_bodystructure.as_deref()
        } else {
            msg.cached_envelope.as_deref()
        })
    }

    /// Part tree of the open message, filling it if needed.
    pub fn parts(&mut self) -> io::Result<Option<&MessagePart>> {
        self.fill(CacheFields::MESSAGE_PART)?;
        Ok(self.open_message().parts.as_ref())
    }

    /// Header and body sizes of the open message, and its stream positioned
    /// at the start (or at the body when `with_header` is false).
    pub fn rfc822(&mut self, with_header: bool) -> io::Result<(MessageSize, MessageSize, &mut S::Stream)> {
        self.fill(CacheFields::HDR_SIZE | CacheFields::BODY_SIZE)?;
        let uid = self.open_uid.expect("no open message");
        let (hdr, body) = {
            let msg = self.open_message();
            (
                msg.hdr_size.expect("filled above"),
                msg.body_size.expect("filled above"),
            )
        };

        let offset = if with_header { 0 } else { hdr.physical_size };
        let Self { source, stream, .. } = self;
        let stream = stream_at(source, stream, uid, offset)?;
        Ok((hdr, body, stream))
    }

    /// A partial-fetch window over the open message's body: its size and
    /// the stream positioned at its first physical byte.
    ///
    /// `virtual_skip` and `max_virtual` are virtual (CRLF) offsets. The
    /// position of the previous scan is memoized, so a client walking the
    /// body in consecutive windows never rescans from the start. With
    /// `with_header` the header span is prepended to the window.
    pub fn rfc822_partial(
        &mut self,
        virtual_skip: u64,
        max_virtual: u64,
        with_header: bool,
    ) -> io::Result<(MessageSize, &mut S::Stream)> {
        self.fill(CacheFields::HDR_SIZE)?;
        let uid = self.open_uid.expect("no open message");
        let hdr = self.open_message().hdr_size.expect("filled above");

        // The whole body fits: serve the memoized size.
        let mut size = MessageSize::default();
        let mut size_known = false;
        if virtual_skip == 0 {
            self.fill(CacheFields::BODY_SIZE)?;
            if let Some(body) = self.open_message().body_size {
                if max_virtual >= body.virtual_size {
                    size = body;
                    size_known = true;
                }
            }
        }

        let mut physical_skip = if with_header { 0 } else { hdr.physical_size };
        if !size_known {
            let Self {
                source,
                stream,
                messages,
                ..
            } = self;
            let msg = messages.first_mut().expect("no open message");

            // Reuse the previous scan unless it went past the requested
            // start.
            let mut partial = msg.partial.take().unwrap_or_default();
            let mut remaining = virtual_skip;
            if partial.size.virtual_size > virtual_skip {
                partial = PartialPos::default();
            } else {
                remaining -= partial.size.virtual_size;
            }

            let s = stream_at(
                source,
                stream,
                uid,
                hdr.physical_size + partial.size.physical_size,
            )?;
            partial.lf_pending = size::skip_virtual(s, remaining, &mut partial.size, partial.lf_pending)?;
            size = size::body_size(s, Some(max_virtual), partial.lf_pending)?;

            physical_skip += partial.size.physical_size;
            msg.partial = Some(partial);
        }

        if with_header {
            size.add(&hdr);
        }
        let Self { source, stream, .. } = self;
        let stream = stream_at(source, stream, uid, physical_skip)?;
        Ok((size, stream))
    }

    /// The raw bytes of the open message, from the start.
    pub fn data(&mut self) -> io::Result<&mut S::Stream> {
        let uid = self.open_uid.expect("no open message");
        let Self { source, stream, .. } = self;
        stream_at(source, stream, uid, 0)
    }

    fn open_message(&self) -> &CachedMessage {
        assert!(self.open_uid.is_some(), "no open message");
        self.messages.first().expect("no open message")
    }

    /// Move `uid` to the front, creating it and evicting the least recently
    /// used entry if the cache is full.
    fn promote(&mut self, uid: u32) {
        if let Some(pos) = self.messages.iter().position(|m| m.uid == uid) {
            if pos != 0 {
                let msg = self.messages.remove(pos);
                self.messages.insert(0, msg);
            }
            return;
        }
        if self.messages.len() >= MAX_CACHED_MESSAGES {
            let evicted = self.messages.pop().expect("cache is full");
            debug!("evicting cached message uid={}", evicted.uid);
        }
        self.messages.insert(0, CachedMessage::new(uid));
    }

    /// Fill the requested fields of the open message, preferring values the
    /// source already has over parsing.
    fn fill(&mut self, mut fields: CacheFields) -> io::Result<()> {
        let uid = self.open_uid.expect("no open message");

        // Computing the body size scans the whole message anyway, so build
        // the part tree while at it.
        if fields.contains(CacheFields::BODY_SIZE) && self.open_message().body_size.is_none() {
            fields |= CacheFields::MESSAGE_PART;
        }

        let Self {
            source,
            stream,
            messages,
            ..
        } = self;
        let msg = messages.first_mut().expect("no open message");
        debug_assert_eq!(msg.uid, uid);

        if fields.contains(CacheFields::BODY) && msg.cached_body.is_none() {
            msg.cached_body = match source.cached_field(uid, CacheFields::BODY) {
                Some(value) => Some(value),
                None => {
                    let s = stream_at(source, stream, uid, 0)?;
                    source.parse_field(uid, CacheFields::BODY, s)?
                }
            };
        }

        if fields.contains(CacheFields::BODYSTRUCTURE) && msg.cached_bodystructure.is_none() {
            msg.cached_bodystructure = match source.cached_field(uid, CacheFields::BODYSTRUCTURE) {
                Some(value) => Some(value),
                None => {
                    let s = stream_at(source, stream, uid, 0)?;
                    source.parse_field(uid, CacheFields::BODYSTRUCTURE, s)?
                }
            };
        }

        if fields.contains(CacheFields::ENVELOPE) && msg.cached_envelope.is_none() {
            msg.cached_envelope = match source.cached_field(uid, CacheFields::ENVELOPE) {
                Some(value) => Some(value),
                None => {
                    let s = stream_at(source, stream, uid, 0)?;
                    source.parse_field(uid, CacheFields::ENVELOPE, s)?
                }
            };
        }

        if fields.contains(CacheFields::MESSAGE_PART) && msg.parts.is_none() {
            msg.parts = match source.cached_parts(uid) {
                Some(parts) => Some(parts),
                None => {
                    let s = stream_at(source, stream, uid, 0)?;
                    Some(source.parse_parts(uid, s)?)
                }
            };
        }

        if fields.contains(CacheFields::BODY_SIZE) && msg.body_size.is_none() {
            let parts = msg.parts.as_ref().expect("part tree built above");
            msg.hdr_size = Some(parts.header_size);
            msg.body_size = Some(parts.body_size);
        }

        if fields.contains(CacheFields::HDR_SIZE) && msg.hdr_size.is_none() {
            msg.hdr_size = match &msg.parts {
                Some(parts) => Some(parts.header_size),
                None => {
                    let s = stream_at(source, stream, uid, 0)?;
                    Some(size::header_size(s)?)
                }
            };
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    /// A source over fixed message bytes, counting how often it parses.
    struct TestSource {
        mails: Vec<(u32, Vec<u8>)>,
        parse_calls: usize,
        open_calls: usize,
    }

    impl TestSource {
        fn new(mails: Vec<(u32, &[u8])>) -> Self {
            Self {
                mails: mails.into_iter().map(|(uid, m)| (uid, m.to_vec())).collect(),
                parse_calls: 0,
                open_calls: 0,
            }
        }

        fn mail(&self, uid: u32) -> &[u8] {
            &self.mails.iter().find(|(u, _)| *u == uid).expect("unknown uid").1
        }
    }

    impl MailSource for TestSource {
        type Stream = Cursor<Vec<u8>>;

        fn open_mail(&mut self, uid: u32) -> io::Result<Self::Stream> {
            self.open_calls += 1;
            Ok(Cursor::new(self.mail(uid).to_vec()))
        }

        fn cached_field(&mut self, _uid: u32, _field: CacheFields) -> Option<String> {
            None
        }

        fn cached_parts(&mut self, _uid: u32) -> Option<MessagePart> {
            None
        }

        fn parse_parts(&mut self, _uid: u32, stream: &mut Self::Stream) -> io::Result<MessagePart> {
            self.parse_calls += 1;
            stream.seek(SeekFrom::Start(0))?;
            let header_size = crate::size::header_size(stream)?;
            let body_size = crate::size::body_size(stream, None, false)?;
            Ok(MessagePart {
                header_size,
                body_size,
                children: Vec::new(),
            })
        }

        fn parse_field(
            &mut self,
            uid: u32,
            field: CacheFields,
            _stream: &mut Self::Stream,
        ) -> io::Result<Option<String>> {
            self.parse_calls += 1;
            Ok(Some(format!("{field:?}-of-{uid}")))
        }
    }

    const MAIL: &[u8] = b"From: a@example.com\nSubject: test\n\nfirst line\nsecond\n";

    fn cache_of(mails: Vec<(u32, &[u8])>) -> MessageCache<TestSource> {
        MessageCache::new(TestSource::new(mails))
    }

    #[test]
    fn text_fields_parse_once() {
        let mut cache = cache_of(vec![(1, MAIL)]);
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();

        assert_eq!(cache.get(CacheFields::BODY).unwrap(), Some("BODY-of-1"));
        assert_eq!(cache.get(CacheFields::BODY).unwrap(), Some("BODY-of-1"));
        assert_eq!(cache.source.parse_calls, 1);

        assert_eq!(
            cache.get(CacheFields::ENVELOPE).unwrap(),
            Some("ENVELOPE-of-1")
        );
        assert_eq!(cache.source.parse_calls, 2);
    }

    #[test]
    fn memoized_state_survives_reopen() {
        let mut cache = cache_of(vec![(1, MAIL), (2, MAIL)]);
        cache.open(1, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        assert_eq!(cache.source.parse_calls, 1);

        cache.open(2, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        assert_eq!(cache.source.parse_calls, 2);

        // Back to 1: the part tree is still cached.
        cache.open(1, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        assert_eq!(cache.source.parse_calls, 2);
        assert!(cache.parts().unwrap().is_some());
        assert_eq!(cache.source.parse_calls, 2);
    }

    #[test]
    fn overflow_evicts_least_recently_used() {
        let mails: Vec<(u32, &[u8])> = (1..=(MAX_CACHED_MESSAGES as u32 + 1)).map(|u| (u, MAIL)).collect();
        let mut cache = cache_of(mails);

        for uid in 1..=(MAX_CACHED_MESSAGES as u32) {
            cache.open(uid, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        }
        assert_eq!(cache.source.parse_calls, MAX_CACHED_MESSAGES);

        // Touch 1 so 2 becomes the oldest, then overflow.
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();
        cache
            .open(MAX_CACHED_MESSAGES as u32 + 1, CacheFields::MESSAGE_PART, 0, 0)
            .unwrap();
        assert_eq!(cache.messages.len(), MAX_CACHED_MESSAGES);

        cache.open(1, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        assert_eq!(cache.source.parse_calls, MAX_CACHED_MESSAGES + 1);

        // 2 was evicted and must be reparsed.
        cache.open(2, CacheFields::MESSAGE_PART, 0, 0).unwrap();
        assert_eq!(cache.source.parse_calls, MAX_CACHED_MESSAGES + 2);
    }

    #[test]
    fn known_virtual_sizes_spare_the_scan() {
        let mut cache = cache_of(vec![(1, b"A: 1\r\n\r\nbody\r\n")]);
        cache.open(1, CacheFields::empty(), 8, 6).unwrap();

        let (hdr, body, _) = cache.rfc822(true).unwrap();
        assert_eq!(hdr, MessageSize::with_equal_sizes(8));
        assert_eq!(body, MessageSize::with_equal_sizes(6));
        assert_eq!(cache.source.parse_calls, 0);
    }

    #[test]
    fn rfc822_positions_the_stream() {
        let mut cache = cache_of(vec![(1, MAIL)]);
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();

        let (hdr, _, stream) = cache.rfc822(false).unwrap();
        let mut rest = String::new();
        stream.read_to_string(&mut rest).unwrap();
        assert_eq!(rest.as_bytes(), &MAIL[hdr.physical_size as usize..]);
        assert_eq!(rest, "first line\nsecond\n");
    }

    #[test]
    fn partial_windows_walk_the_body() {
        let mut cache = cache_of(vec![(1, MAIL)]);
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();

        // The body is "first line\nsecond\n": 18 physical, 20 virtual.
        let (full, _) = cache.rfc822_partial(0, u64::MAX, false).unwrap();
        assert_eq!(full.physical_size, 18);
        assert_eq!(full.virtual_size, 20);

        // Consecutive windows partition the virtual stream.
        let (first, stream) = cache.rfc822_partial(0, 12, false).unwrap();
        assert_eq!(first.virtual_size, 12);
        let mut got = vec![0u8; first.physical_size as usize];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"first line\n");

        let (second, stream) = cache.rfc822_partial(12, u64::MAX, false).unwrap();
        assert_eq!(second.virtual_size, 20 - 12);
        let mut got = vec![0u8; second.physical_size as usize];
        stream.read_exact(&mut got).unwrap();
        assert_eq!(&got, b"second\n");
    }

    #[test]
    fn partial_with_header_includes_it() {
        let mut cache = cache_of(vec![(1, MAIL)]);
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();

        let (full_body, _) = cache.rfc822_partial(0, u64::MAX, false).unwrap();
        let (with_hdr, stream) = cache.rfc822_partial(0, u64::MAX, true).unwrap();
        assert!(with_hdr.physical_size > full_body.physical_size);
        assert_eq!(stream.stream_position().unwrap(), 0);
    }

    #[test]
    fn data_rewinds_to_the_start() {
        let mut cache = cache_of(vec![(1, MAIL)]);
        cache.open(1, CacheFields::empty(), 0, 0).unwrap();
        let _ = cache.rfc822_partial(5, 5, false).unwrap();

        let stream = cache.data().unwrap();
        let mut all = Vec::new();
        stream.read_to_end(&mut all).unwrap();
        assert_eq!(&all, MAIL);
        // One message, one underlying stream.
        assert_eq!(cache.source.open_calls, 1);
    }
}
