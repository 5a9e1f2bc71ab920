//! Virtual-size arithmetic for message streams.
//!
//! IMAP transmits CRLF line endings. A message stored with bare LFs
//! therefore has a *virtual* size larger than its physical one: every LF
//! not preceded by CR counts as two bytes on the wire. Partial fetches are
//! expressed in virtual offsets, so seeking to one means scanning.
//!
//! All scanners consume exactly the bytes they account for, seeking back
//! whatever they read ahead.

use std::io::{self, Read, Seek, SeekFrom};

const CHUNK: usize = 8192;

/// Physical vs. virtual (CRLF-normalised) length of a span of message data.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MessageSize {
    /// Bytes as stored.
    pub physical_size: u64,
    /// Bytes as transmitted, with a bare LF counted as CRLF.
    pub virtual_size: u64,
}

impl MessageSize {
    /// A span whose stored form already uses CRLF line endings.
    pub fn with_equal_sizes(size: u64) -> Self {
        Self {
            physical_size: size,
            virtual_size: size,
        }
    }

    pub fn add(&mut self, other: &MessageSize) {
        self.physical_size += other.physical_size;
        self.virtual_size += other.virtual_size;
    }
}

enum LineState {
    Empty,
    CrSeen,
    Content,
}

/// Measure the header: everything up to and including the blank line that
/// separates it from the body, or the whole input if there is none.
pub(crate) fn header_size<R: Read + Seek>(input: &mut R) -> io::Result<MessageSize> {
    let mut size = MessageSize::default();
    let mut buf = [0u8; CHUNK];
    let mut prev_cr = false;
    let mut state = LineState::Empty;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(size);
        }
        for (i, &b) in buf[..n].iter().enumerate() {
            size.physical_size += 1;
            if b == b'\n' {
                size.virtual_size += if prev_cr { 1 } else { 2 };
                if !matches!(state, LineState::Content) {
                    // Blank line: the header ends here.
                    input.seek(SeekFrom::Current(-((n - i - 1) as i64)))?;
                    return Ok(size);
                }
                state = LineState::Empty;
            } else {
                size.virtual_size += 1;
                state = match (state, b) {
                    (LineState::Empty, b'\r') => LineState::CrSeen,
                    _ => LineState::Content,
                };
            }
            prev_cr = b == b'\r';
        }
    }
}

/// Measure from the current position to EOF, or until the virtual size
/// would exceed `max_virtual`.
///
/// `lf_pending` marks that the stream sits on an LF whose virtual CR half
/// was already consumed by a preceding [`skip_virtual`]; that LF then counts
/// a single virtual byte.
pub(crate) fn body_size<R: Read + Seek>(
    input: &mut R,
    max_virtual: Option<u64>,
    lf_pending: bool,
) -> io::Result<MessageSize> {
    let mut size = MessageSize::default();
    let mut buf = [0u8; CHUNK];
    let mut prev_cr = lf_pending;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(size);
        }
        for (i, &b) in buf[..n].iter().enumerate() {
            let add = if b == b'\n' && !prev_cr { 2 } else { 1 };
            if let Some(max) = max_virtual {
                if size.virtual_size + add > max {
                    // A bare LF may still contribute its virtual CR half.
                    if add == 2 && size.virtual_size < max {
                        size.virtual_size += 1;
                    }
                    input.seek(SeekFrom::Current(-((n - i) as i64)))?;
                    return Ok(size);
                }
            }
            size.physical_size += 1;
            size.virtual_size += add;
            prev_cr = b == b'\r';
        }
    }
}

/// Skip `virtual_skip` virtual bytes from the current position, adding the
/// skipped span to `skipped`.
///
/// Returns `true` when the skip ended between the virtual CR and the LF of
/// a bare linefeed; the stream then sits on that LF. `lf_pending` carries
/// the same condition in from a previous skip.
pub(crate) fn skip_virtual<R: Read + Seek>(
    input: &mut R,
    mut virtual_skip: u64,
    skipped: &mut MessageSize,
    lf_pending: bool,
) -> io::Result<bool> {
    if virtual_skip == 0 {
        return Ok(lf_pending);
    }
    let mut buf = [0u8; CHUNK];
    let mut prev_cr = lf_pending;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            return Ok(false);
        }
        for (i, &b) in buf[..n].iter().enumerate() {
            let add = if b == b'\n' && !prev_cr { 2 } else { 1 };
            if add > virtual_skip {
                // Only the virtual CR half fits into the budget.
                skipped.virtual_size += 1;
                input.seek(SeekFrom::Current(-((n - i) as i64)))?;
                return Ok(true);
            }
            skipped.physical_size += 1;
            skipped.virtual_size += add;
            virtual_skip -= add;
            prev_cr = b == b'\r';
            if virtual_skip == 0 {
                input.seek(SeekFrom::Current(-((n - i - 1) as i64)))?;
                return Ok(false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Cursor;

    fn sizes(physical: u64, virt: u64) -> MessageSize {
        MessageSize {
            physical_size: physical,
            virtual_size: virt,
        }
    }

    #[test]
    fn header_ends_at_blank_line() {
        let msg = b"From: a@example.com\r\nSubject: hi\r\n\r\nbody text";
        let mut input = Cursor::new(&msg[..]);
        let hdr = header_size(&mut input).unwrap();
        assert_eq!(hdr, sizes(36, 36));
        // The cursor sits on the first body byte.
        assert_eq!(input.position(), 36);
    }

    #[test]
    fn bare_lf_counts_twice() {
        let msg = b"A: 1\nB: 2\n\nbody\n";
        let mut input = Cursor::new(&msg[..]);
        let hdr = header_size(&mut input).unwrap();
        assert_eq!(hdr, sizes(11, 14));

        let body = body_size(&mut input, None, false).unwrap();
        assert_eq!(body, sizes(5, 6));
    }

    #[test]
    fn header_without_body_runs_to_eof() {
        let msg = b"A: 1\r\nB: 2\r\n";
        let mut input = Cursor::new(&msg[..]);
        let hdr = header_size(&mut input).unwrap();
        assert_eq!(hdr, sizes(12, 12));
    }

    #[test]
    fn body_size_respects_virtual_limit() {
        let mut input = Cursor::new(&b"abc\ndef"[..]);
        // "abc" plus the virtual CR of the linefeed fill the limit of 4.
        let body = body_size(&mut input, Some(4), false).unwrap();
        assert_eq!(body, sizes(3, 4));
        assert_eq!(input.position(), 3);

        // Resuming on the LF with the CR half consumed yields the rest.
        let rest = body_size(&mut input, None, true).unwrap();
        assert_eq!(rest, sizes(4, 4));
    }

    #[test]
    fn skip_and_remainder_partition_the_stream() {
        let data = b"one\ntwo\r\nthree\nfour";
        let total = body_size(&mut Cursor::new(&data[..]), None, false).unwrap();

        for skip in 0..=total.virtual_size {
            let mut input = Cursor::new(&data[..]);
            let mut skipped = MessageSize::default();
            let lf = skip_virtual(&mut input, skip, &mut skipped, false).unwrap();
            let rest = body_size(&mut input, None, lf).unwrap();

            assert_eq!(skipped.virtual_size, skip, "skip={skip}");
            assert_eq!(
                skipped.virtual_size + rest.virtual_size,
                total.virtual_size,
                "skip={skip}"
            );
            assert_eq!(
                skipped.physical_size + rest.physical_size,
                total.physical_size,
                "skip={skip}"
            );
        }
    }

    #[test]
    fn skip_past_eof_stops_at_eof() {
        let mut input = Cursor::new(&b"tiny"[..]);
        let mut skipped = MessageSize::default();
        let lf = skip_virtual(&mut input, 100, &mut skipped, false).unwrap();
        assert!(!lf);
        assert_eq!(skipped, sizes(4, 4));
    }
}
