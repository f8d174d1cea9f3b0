//! Resynchronizing JSON framer for the worker's reply pipe.
//!
//! Replies carry no length prefix, so the JSON grammar itself is the framing.
//! Stray bytes in front of a reply (worker log lines, the tail of a torn
//! reply) are dropped by discarding up to the offset where parsing failed and
//! scanning again from there.

use serde::de::IgnoredAny;
use tokio_util::bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use super::channel::ChannelError;

/// Where the scanner stands after looking at the buffered reply bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scan {
    /// Only whitespace so far; the first `skip` bytes can be dropped.
    Seeking { skip: usize },
    /// A value begins at `start` but has not been fully received.
    Partial { start: usize },
    /// A complete value occupies `start..end`.
    Complete { start: usize, end: usize },
    /// Parsing failed; the first `skip` bytes can never belong to a value.
    Malformed { skip: usize },
}

/// Classify the buffered bytes without consuming them.
///
/// `at_eof` tells the scanner no more bytes will arrive. Without it a bare
/// number that runs to the end of the buffer stays `Partial`, since the next
/// read could extend it.
///
/// Returns an error only for failures that are not syntax or end-of-input
/// problems; those cannot be fixed by skipping bytes.
pub fn scan(buf: &[u8], at_eof: bool) -> Result<Scan, serde_json::Error> {
    let Some(start) = buf.iter().position(|&b| !is_json_whitespace(b)) else {
        return Ok(Scan::Seeking { skip: buf.len() });
    };
    let rest = &buf[start..];

    let mut values = serde_json::Deserializer::from_slice(rest).into_iter::<IgnoredAny>();
    match values.next() {
        Some(Ok(_)) => {
            let end = start + values.byte_offset();
            if !at_eof && end == buf.len() && is_number_start(rest[0]) {
                return Ok(Scan::Partial { start });
            }
            Ok(Scan::Complete { start, end })
        }
        Some(Err(e)) if e.is_eof() => Ok(Scan::Partial { start }),
        Some(Err(e)) if e.is_syntax() => {
            // Keep the offending byte: it may be the first byte of the next
            // value. Always drop at least one byte so the scan makes progress.
            let offending = error_index(rest, e.line(), e.column());
            Ok(Scan::Malformed {
                skip: start + offending.max(1),
            })
        }
        Some(Err(e)) => Err(e),
        None => Ok(Scan::Seeking { skip: buf.len() }),
    }
}

/// Index of the byte serde_json stopped at, from its 1-based line and
/// byte-based column.
fn error_index(buf: &[u8], line: usize, column: usize) -> usize {
    let line_start = match line {
        0 | 1 => 0,
        n => buf
            .iter()
            .enumerate()
            .filter(|&(_, &b)| b == b'\n')
            .nth(n - 2)
            .map_or(buf.len(), |(i, _)| i + 1),
    };
    (line_start + column).saturating_sub(1).min(buf.len())
}

fn is_json_whitespace(b: u8) -> bool {
    matches!(b, b' ' | b'\t' | b'\n' | b'\r')
}

fn is_number_start(b: u8) -> bool {
    b == b'-' || b.is_ascii_digit()
}

/// Decoder yielding the raw bytes of one JSON value per reply.
///
/// Leading whitespace and the delimiter after a value are not part of the
/// yielded bytes. Bytes after the value stay in the buffer for the next call.
#[derive(Debug, Clone)]
pub struct ResyncCodec {
    max_reply_bytes: usize,
    skipped: u64,
}

impl ResyncCodec {
    pub fn new(max_reply_bytes: usize) -> Self {
        Self {
            max_reply_bytes,
            skipped: 0,
        }
    }

    /// Total bytes discarded while resynchronizing.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    fn decode_value(
        &mut self,
        src: &mut BytesMut,
        at_eof: bool,
    ) -> Result<Option<Bytes>, ChannelError> {
        loop {
            match scan(src, at_eof).map_err(ChannelError::Backend)? {
                Scan::Complete { start, end } => {
                    let mut value = src.split_to(end);
                    value.advance(start);
                    tracing::trace!(reply_bytes = value.len(), "Decoded reply");
                    return Ok(Some(value.freeze()));
                }
                Scan::Seeking { skip } => {
                    src.advance(skip);
                    return Ok(None);
                }
                Scan::Partial { start } => {
                    src.advance(start);
                    if src.len() > self.max_reply_bytes {
                        src.clear();
                        return Err(ChannelError::ReplyTooLarge {
                            limit: self.max_reply_bytes,
                        });
                    }
                    return Ok(None);
                }
                Scan::Malformed { skip } => {
                    tracing::debug!(skipped = skip, "Discarding malformed reply bytes");
                    self.skipped += skip as u64;
                    src.advance(skip);
                }
            }
        }
    }
}

impl Decoder for ResyncCodec {
    type Item = Bytes;
    type Error = ChannelError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decode_value(src, false)
    }

    /// At end of stream anything short of a complete value is an error.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(value) = self.decode_value(src, true)? {
            return Ok(Some(value));
        }
        if !src.is_empty() {
            tracing::debug!(
                discarded = src.len(),
                "Dropping incomplete reply at end of stream"
            );
            src.clear();
        }
        Err(ChannelError::UnexpectedEof)
    }
}
