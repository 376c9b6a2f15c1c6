//! Line-oriented `key<TAB>value` wire format.
//!
//! One record per line. Only the first tab separates key from value; any
//! further tabs belong to the value, so values may themselves be
//! tab-structured.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RecordFormatError;
use crate::KeyValue;

pub const FIELD_SEPARATOR: u8 = b'\t';
pub const RECORD_SEPARATOR: u8 = b'\n';

/// Encode a record as a single line, without the trailing newline.
pub fn encode(key: &[u8], value: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(key.len() + value.len() + 1);
    buf.put_slice(key);
    buf.put_u8(FIELD_SEPARATOR);
    buf.put_slice(value);
    buf.freeze()
}

/// Decode one line into a record, splitting at the first tab.
///
/// The returned key and value share the line's buffer.
pub fn decode(line: &Bytes) -> Result<KeyValue, RecordFormatError> {
    let line = trim_line_end(line);
    let sep = line
        .iter()
        .position(|&b| b == FIELD_SEPARATOR)
        .ok_or(RecordFormatError::MissingSeparator)?;
    Ok(KeyValue::new(line.slice(..sep), line.slice(sep + 1..)))
}

/// Split a buffer into lines, dropping line terminators and blank lines.
pub fn lines(buf: &Bytes) -> impl Iterator<Item = Bytes> + '_ {
    buf.split(|&b| b == RECORD_SEPARATOR)
        .map(|line| trim_line_end(&buf.slice_ref(line)))
        .filter(|line| !line.is_empty())
}

/// Encode a whole stream, one record per line, newline terminated.
pub fn encode_stream<'a, I>(records: I) -> Bytes
where
    I: IntoIterator<Item = &'a KeyValue>,
{
    let mut buf = BytesMut::new();
    for kv in records {
        buf.put_slice(&kv.key);
        buf.put_u8(FIELD_SEPARATOR);
        buf.put_slice(&kv.value);
        buf.put_u8(RECORD_SEPARATOR);
    }
    buf.freeze()
}

/// Split a value into its tab-separated fields.
pub fn fields(value: &str) -> Vec<&str> {
    value.split(FIELD_SEPARATOR as char).collect()
}

fn trim_line_end(line: &Bytes) -> Bytes {
    let mut end = line.len();
    while end > 0 && matches!(line[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    line.slice(..end)
}
