//! A byte-offset based string table, as used by `.strtab` and `.shstrtab`.
//!
//! Reads are nul-delimited lookups at arbitrary offsets; appends always push
//! the text plus a trailing nul and return the offset the text landed at.
//! Duplicate strings are not coalesced.

use scroll::Pread;
use scroll::ctx;

use crate::error;

/// Read the nul-terminated string starting at `offset`.
pub fn get(bytes: &[u8], offset: usize) -> error::Result<&str> {
    if offset > bytes.len() {
        return Err(error::Error::Malformed(format!(
            "string offset 0x{:x} is past the end of a 0x{:x} byte string table",
            offset,
            bytes.len()
        )));
    }
    let s: &str = bytes.pread_with(offset, ctx::StrCtx::Delimiter(0))?;
    Ok(s)
}

/// Append `text` plus its nul terminator, returning the offset of the new
/// string, which is always the pre-append size of the table.
pub fn append(buf: &mut Vec<u8>, text: &str) -> u64 {
    let offset = buf.len() as u64;
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
    offset
}

/// A fresh string table: a single nul byte, so that offset 0 is always the
/// empty string.
pub fn new_table() -> Vec<u8> {
    vec![0]
}
