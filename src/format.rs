// src/format.rs
//
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Row text format shared by both transports
//!
//! One row is `<decimal index>\t<escaped payload>\n`. Inside the payload the
//! bytes `\\`, `\t` and `\n` are each preceded by a backslash, which is what
//! `LOAD DATA` expects with its default field and line options.

use rand::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use std::io::Write;

use crate::constants::{MAX_INDEX_DIGITS, ROW_OVERHEAD};

pub const FIELD_SEPARATOR: u8 = b'\t';
pub const LINE_TERMINATOR: u8 = b'\n';
pub const ESCAPE: u8 = b'\\';

#[inline]
fn is_reserved(b: u8) -> bool {
    b == ESCAPE || b == FIELD_SEPARATOR || b == LINE_TERMINATOR
}

/// Upper bound of one formatted row, used to size batches
///
/// Every payload byte may need an escape, so the payload is counted twice.
/// A batch sized from this bound never grows its buffer past the planned
/// capacity.
pub fn estimated_row_size(payload_size: usize) -> usize {
    2 * MAX_INDEX_DIGITS + 2 * payload_size + ROW_OVERHEAD
}

/// Payload bytes carried by `rows` rows, saturating at `u64::MAX`
pub fn payload_bytes(rows: u64, payload_size: usize) -> u64 {
    rows.saturating_mul(payload_size as u64)
}

/// Append one formatted row to `out`
pub fn write_row(out: &mut Vec<u8>, row_index: i64, payload: &[u8]) {
    // Writing into a Vec cannot fail
    let _ = write!(out, "{}", row_index);
    out.push(FIELD_SEPARATOR);
    for &b in payload {
        if is_reserved(b) {
            out.push(ESCAPE);
        }
        out.push(b);
    }
    out.push(LINE_TERMINATOR);
}

/// Per-worker row source: owns the RNG and a reusable payload scratch buffer
pub struct RowFormatter {
    rng: Xoshiro256PlusPlus,
    payload: Vec<u8>,
}

impl RowFormatter {
    pub fn new(payload_size: usize, seed: u64) -> Self {
        Self {
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            payload: vec![0u8; payload_size],
        }
    }

    /// Format rows `[from, from + count)` into `out`, refreshing the payload per row
    pub fn fill(&mut self, out: &mut Vec<u8>, from: i64, count: i64) {
        for row_index in from..from + count {
            self.rng.fill_bytes(&mut self.payload);
            write_row(out, row_index, &self.payload);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("row at byte {offset} has no field separator")]
    MissingSeparator { offset: usize },
    #[error("row at byte {offset} has a non-numeric index")]
    BadIndex { offset: usize },
    #[error("row at byte {offset} is not terminated")]
    Unterminated { offset: usize },
    #[error("row at byte {offset} ends inside an escape sequence")]
    DanglingEscape { offset: usize },
}

/// A row read back from formatted text
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRow {
    pub index: i64,
    pub payload: Vec<u8>,
}

/// Iterator over the rows of a formatted buffer
pub struct Rows<'a> {
    buf: &'a [u8],
    pos: usize,
}

/// Split a formatted buffer back into rows, undoing payload escapes
pub fn decode_rows(buf: &[u8]) -> Rows<'_> {
    Rows { buf, pos: 0 }
}

impl Iterator for Rows<'_> {
    type Item = Result<DecodedRow, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        let rest = &self.buf[start..];

        let Some(sep) = rest.iter().position(|&b| b == FIELD_SEPARATOR) else {
            self.pos = self.buf.len();
            return Some(Err(DecodeError::MissingSeparator { offset: start }));
        };
        let index = match std::str::from_utf8(&rest[..sep])
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
        {
            Some(index) => index,
            None => {
                self.pos = self.buf.len();
                return Some(Err(DecodeError::BadIndex { offset: start }));
            }
        };

        let mut payload = Vec::new();
        let mut i = sep + 1;
        loop {
            match rest.get(i) {
                None => {
                    self.pos = self.buf.len();
                    return Some(Err(DecodeError::Unterminated { offset: start }));
                }
                Some(&ESCAPE) => match rest.get(i + 1) {
                    Some(&b) => {
                        payload.push(b);
                        i += 2;
                    }
                    None => {
                        self.pos = self.buf.len();
                        return Some(Err(DecodeError::DanglingEscape { offset: start }));
                    }
                },
                Some(&LINE_TERMINATOR) => {
                    self.pos = start + i + 1;
                    return Some(Ok(DecodedRow { index, payload }));
                }
                Some(&b) => {
                    payload.push(b);
                    i += 1;
                }
            }
        }
    }
}

/// Count rows in a formatted buffer without decoding payloads
pub fn count_rows(buf: &[u8]) -> u64 {
    let mut rows = 0;
    let mut in_payload = false;
    let mut escaped = false;
    for &b in buf {
        if escaped {
            escaped = false;
        } else if !in_payload {
            in_payload = b == FIELD_SEPARATOR;
        } else if b == ESCAPE {
            escaped = true;
        } else if b == LINE_TERMINATOR {
            rows += 1;
            in_payload = false;
        }
    }
    rows
}
