//! Newline-delimited framing for agent stdout and stderr.
//!
//! Records are split on `\n`. A line that does not parse on its own is held
//! as the start of a partial record and the following lines are appended to
//! it until the accumulated text parses, so a record written across several
//! lines is still delivered whole. Framing is driven by bytes, not by read
//! chunks: the decoded sequence is the same however the stream is split.
//!
//! Stderr lines are framed with [`AnyDelimiterCodec`] and decoded lossily,
//! so invalid UTF-8 never ends the drain.

use bytes::BytesMut;
use serde_json::Value;
use tokio_util::codec::{AnyDelimiterCodec, Decoder};

use super::error::SessionError;

/// Upper bound for a partial record before it is discarded: 16 MiB.
pub const MAX_PENDING_BYTES: usize = 16 * 1024 * 1024;

/// Longest stderr line kept; longer lines are skipped.
pub const MAX_DIAGNOSTIC_LINE_BYTES: usize = 1_048_576;

/// Read errors tolerated in a row before a reader gives up.
pub const MAX_CONSECUTIVE_READ_ERRORS: usize = 8;

/// Stderr framing: raw byte lines, bounded, never parsed.
pub fn diagnostic_codec() -> AnyDelimiterCodec {
    AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), Vec::new(), MAX_DIAGNOSTIC_LINE_BYTES)
}

#[derive(Debug)]
pub struct RecordCodec {
    pending: String,
    max_pending: usize,
    /// Bytes of `src` already searched for a newline.
    scanned: usize,
    /// Dropping the rest of an overlong line.
    discarding: bool,
}

impl RecordCodec {
    pub fn new() -> Self {
        Self::with_max_pending(MAX_PENDING_BYTES)
    }

    pub fn with_max_pending(max_pending: usize) -> Self {
        Self {
            pending: String::new(),
            max_pending,
            scanned: 0,
            discarding: false,
        }
    }

    /// Bytes currently held as an incomplete record.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn push_line(&mut self, raw: &[u8]) -> Option<Value> {
        if raw.len() > self.max_pending {
            self.discard("Line");
            return None;
        }
        let text = String::from_utf8_lossy(raw);
        let line = text.trim_end_matches('\r');
        if line.trim().is_empty() {
            return None;
        }

        if self.pending.is_empty() {
            return match serde_json::from_str(line) {
                Ok(record) => Some(record),
                Err(_) => {
                    self.pending.push_str(line);
                    None
                }
            };
        }

        self.pending.push('\n');
        self.pending.push_str(line);
        if let Ok(record) = serde_json::from_str(&self.pending) {
            self.pending.clear();
            return Some(record);
        }

        // Only a complete typed record restarts framing; any other line is continuation.
        if let Some(record) = parse_record_header(line) {
            log::warn!(
                "[codec] Dropping {} bytes of unparseable output",
                self.pending.len() - line.len() - 1
            );
            self.pending.clear();
            return Some(record);
        }

        if self.pending.len() > self.max_pending {
            self.discard("Partial record");
        }
        None
    }

    fn discard(&mut self, what: &str) {
        log::warn!(
            "[codec] {} exceeded {} bytes, discarding",
            what,
            self.max_pending
        );
        self.pending.clear();
    }
}

/// A line that is a JSON object with a string `type` on its own.
fn parse_record_header(line: &str) -> Option<Value> {
    let value: Value = serde_json::from_str(line).ok()?;
    value.get("type")?.as_str()?;
    Some(value)
}

impl Default for RecordCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for RecordCodec {
    type Item = Value;
    type Error = SessionError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, SessionError> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_pending {
                    if !self.discarding {
                        self.discard("Line");
                        self.discarding = true;
                    }
                    src.clear();
                }
                self.scanned = src.len();
                return Ok(None);
            };

            let pos = self.scanned + offset;
            self.scanned = 0;
            let line = src.split_to(pos + 1);
            if self.discarding {
                self.discarding = false;
                continue;
            }
            if let Some(record) = self.push_line(&line[..pos]) {
                return Ok(Some(record));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, SessionError> {
        if let Some(record) = self.decode(src)? {
            return Ok(Some(record));
        }

        let record = if src.is_empty() || self.discarding {
            src.clear();
            None
        } else {
            let rest = src.split_to(src.len());
            self.push_line(&rest)
        };
        self.scanned = 0;
        self.discarding = false;

        if record.is_none() && !self.pending.is_empty() {
            log::warn!(
                "[codec] Stream ended inside a partial record ({} bytes)",
                self.pending.len()
            );
            self.pending.clear();
        }
        Ok(record)
    }
}
