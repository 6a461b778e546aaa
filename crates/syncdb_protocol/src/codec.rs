//! Bounds-checked primitives shared by the command and NSF codecs.
//!
//! All integers are little-endian. `bytes::Buf` getters panic on short
//! input, so every read goes through [`need`] first.

use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BufMut};
use syncdb_core::{TableName, TABLE_NAME_LEN};

pub(crate) fn need(buf: &impl Buf, field: &'static str, needed: usize) -> ProtocolResult<()> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            field,
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub(crate) fn get_u8(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<u8> {
    need(buf, field, 1)?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<u16> {
    need(buf, field, 2)?;
    Ok(buf.get_u16_le())
}

pub(crate) fn get_u32(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<u32> {
    need(buf, field, 4)?;
    Ok(buf.get_u32_le())
}

pub(crate) fn get_u64(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<u64> {
    need(buf, field, 8)?;
    Ok(buf.get_u64_le())
}

pub(crate) fn get_len(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<usize> {
    get_u32(buf, field).map(|v| v as usize)
}

pub(crate) fn get_bool(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<bool> {
    match get_u8(buf, field)? {
        0 => Ok(false),
        1 => Ok(true),
        tag => Err(ProtocolError::unknown_tag(field, tag)),
    }
}

pub(crate) fn get_vec(buf: &mut impl Buf, field: &'static str, len: usize) -> ProtocolResult<Vec<u8>> {
    need(buf, field, len)?;
    let mut out = vec![0; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn get_array<const N: usize>(
    buf: &mut impl Buf,
    field: &'static str,
) -> ProtocolResult<[u8; N]> {
    need(buf, field, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

pub(crate) fn get_name(buf: &mut impl Buf) -> ProtocolResult<TableName> {
    let padded = get_array::<TABLE_NAME_LEN>(buf, "table name")?;
    TableName::from_padded(padded).map_err(|e| ProtocolError::invalid("table name", e.to_string()))
}

pub(crate) fn put_name(buf: &mut impl BufMut, name: &TableName) {
    buf.put_slice(name.as_padded());
}

/// Record with a u32 length prefix.
pub(crate) fn get_record(buf: &mut impl Buf) -> ProtocolResult<Vec<u8>> {
    let len = get_len(buf, "record length")?;
    get_vec(buf, "record", len)
}

pub(crate) fn put_record(buf: &mut impl BufMut, record: &[u8]) -> ProtocolResult<()> {
    let len = u32::try_from(record.len()).map_err(|_| ProtocolError::TooLarge {
        field: "record",
        len: record.len(),
        limit: u32::MAX as usize,
    })?;
    buf.put_u32_le(len);
    buf.put_slice(record);
    Ok(())
}

/// String with a u16 length prefix.
pub(crate) fn get_string(buf: &mut impl Buf, field: &'static str) -> ProtocolResult<String> {
    let len = get_u16(buf, field)? as usize;
    let bytes = get_vec(buf, field, len)?;
    String::from_utf8(bytes).map_err(|_| ProtocolError::invalid(field, "not UTF-8"))
}

pub(crate) fn put_string(buf: &mut impl BufMut, field: &'static str, s: &str) -> ProtocolResult<()> {
    let len = u16::try_from(s.len()).map_err(|_| ProtocolError::TooLarge {
        field,
        len: s.len(),
        limit: u16::MAX as usize,
    })?;
    buf.put_u16_le(len);
    buf.put_slice(s.as_bytes());
    Ok(())
}

/// Fixed-width, zero-padded text field. Longer input is truncated.
pub(crate) fn put_fixed_text<const N: usize>(buf: &mut impl BufMut, s: &str) {
    let mut field = [0u8; N];
    let mut len = s.len().min(N);
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    field[..len].copy_from_slice(&s.as_bytes()[..len]);
    buf.put_slice(&field);
}

pub(crate) fn get_fixed_text<const N: usize>(
    buf: &mut impl Buf,
    field: &'static str,
) -> ProtocolResult<String> {
    let bytes = get_array::<N>(buf, field)?;
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(N);
    String::from_utf8(bytes[..len].to_vec()).map_err(|_| ProtocolError::invalid(field, "not UTF-8"))
}

pub(crate) fn finish(buf: &impl Buf) -> ProtocolResult<()> {
    match buf.remaining() {
        0 => Ok(()),
        n => Err(ProtocolError::Trailing(n)),
    }
}
