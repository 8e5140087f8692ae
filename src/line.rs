use crate::types::MAX_LINE_LENGTH;
use bytes::{Bytes, BytesMut};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("line exceeds {MAX_LINE_LENGTH} bytes without CRLF")]
pub struct LineOverflow;

/// Split the next CRLF-terminated line (terminator included) off the
/// front of `buf`. `Ok(None)` means more bytes are needed; leftover
/// bytes stay in the buffer for the next call. The textual states map
/// an overflow to 414 (request line) or 431 (header line).
pub fn next_line(buf: &mut BytesMut) -> Result<Option<Bytes>, LineOverflow> {
    match find_crlf(buf) {
        Some(end) if end <= MAX_LINE_LENGTH => Ok(Some(buf.split_to(end).freeze())),
        Some(_) => Err(LineOverflow),
        // No terminator within the cap means no acceptable line can
        // ever complete.
        None if buf.len() >= MAX_LINE_LENGTH => Err(LineOverflow),
        None => Ok(None),
    }
}

pub fn strip_crlf(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r\n").unwrap_or(line)
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|i| i + 2)
}
