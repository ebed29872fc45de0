//! Map records
//!
//! The payload of every chunk written by a map is one record, tagged by its
//! first byte:
//!
//! ```text
//! Put         [0x01][key_len u32][key][value]
//! Remove      [0x02][key_len u32][key]
//! ValuesHead  [0x03][key_len u32][key]{[len u32][value]}*
//! ValuesTail  [0x04]{[len u32][value]}*
//! ```

use crate::error::{DurableError, Result};
use crate::file_io::{get_u32, put_u32};

pub(crate) const RECORD_PUT: u8 = 0x01;
pub(crate) const RECORD_REMOVE: u8 = 0x02;
pub(crate) const RECORD_VALUES_HEAD: u8 = 0x03;
pub(crate) const RECORD_VALUES_TAIL: u8 = 0x04;

/// Log data version of a `DurableMap`
pub(crate) const PLAIN_MAP_FORMAT: u32 = 1;

/// Log data version of an `AppendableValuesMap`
pub(crate) const VALUES_MAP_FORMAT: u32 = 2;

const LEN_SIZE: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Record<'a> {
    Put { key: &'a [u8], value: &'a [u8] },
    Remove { key: &'a [u8] },
    /// `values` holds the length-prefixed entries; see `value_entries`
    ValuesHead { key: &'a [u8], values: &'a [u8] },
    ValuesTail { values: &'a [u8] },
}

impl<'a> Record<'a> {
    /// Decode a chunk payload; an empty payload holds no record yet
    pub fn decode(payload: &'a [u8]) -> Result<Option<Self>> {
        let Some((&tag, body)) = payload.split_first() else {
            return Ok(None);
        };

        let record = match tag {
            RECORD_PUT => {
                let (key, value) = split_key(body)?;
                Record::Put { key, value }
            }
            RECORD_REMOVE => {
                let (key, rest) = split_key(body)?;
                if !rest.is_empty() {
                    return Err(malformed("remove record has trailing bytes"));
                }
                Record::Remove { key }
            }
            RECORD_VALUES_HEAD => {
                let (key, values) = split_key(body)?;
                Record::ValuesHead { key, values }
            }
            RECORD_VALUES_TAIL => Record::ValuesTail { values: body },
            other => return Err(malformed(&format!("unknown record type 0x{:02x}", other))),
        };
        Ok(Some(record))
    }

    /// Key stored in the record, if it carries one
    pub fn key(&self) -> Option<&'a [u8]> {
        match *self {
            Record::Put { key, .. } | Record::Remove { key } | Record::ValuesHead { key, .. } => {
                Some(key)
            }
            Record::ValuesTail { .. } => None,
        }
    }
}

fn split_key(body: &[u8]) -> Result<(&[u8], &[u8])> {
    if body.len() < LEN_SIZE {
        return Err(malformed("record is shorter than its key length"));
    }
    let key_len = get_u32(body, 0) as usize;
    let rest = &body[LEN_SIZE..];
    if key_len > rest.len() {
        return Err(malformed("key length exceeds the record"));
    }
    Ok(rest.split_at(key_len))
}

fn malformed(reason: &str) -> DurableError {
    DurableError::LogCorruption(format!("malformed record: {}", reason))
}

// -----------------------------------------------------------------------------
// Encoding
// -----------------------------------------------------------------------------

fn encode_keyed(tag: u8, key: &[u8], extra: usize) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + LEN_SIZE + key.len() + extra);
    out.push(tag);
    out.extend_from_slice(&(key.len() as u32).to_le_bytes());
    out.extend_from_slice(key);
    out
}

pub(crate) fn encode_put(key: &[u8], value: &[u8]) -> Vec<u8> {
    let mut out = encode_keyed(RECORD_PUT, key, value.len());
    out.extend_from_slice(value);
    out
}

pub(crate) fn encode_remove(key: &[u8]) -> Vec<u8> {
    encode_keyed(RECORD_REMOVE, key, 0)
}

/// Bytes of a values-head record before its first entry
pub(crate) fn values_head_size(key_len: usize) -> usize {
    1 + LEN_SIZE + key_len
}

/// Bytes of the tail tag
pub(crate) const VALUES_TAIL_SIZE: usize = 1;

pub(crate) fn value_entry_size(value_len: usize) -> usize {
    LEN_SIZE + value_len
}

/// Write `[0x03][key_len][key]` into the start of `buf`; returns bytes used
pub(crate) fn write_values_head(buf: &mut [u8], key: &[u8]) -> usize {
    buf[0] = RECORD_VALUES_HEAD;
    put_u32(buf, 1, key.len() as u32);
    buf[1 + LEN_SIZE..1 + LEN_SIZE + key.len()].copy_from_slice(key);
    values_head_size(key.len())
}

pub(crate) fn write_values_tail(buf: &mut [u8]) -> usize {
    buf[0] = RECORD_VALUES_TAIL;
    VALUES_TAIL_SIZE
}

/// Write `[len][value]` into the start of `buf`; returns bytes used
pub(crate) fn write_value_entry(buf: &mut [u8], value: &[u8]) -> usize {
    put_u32(buf, 0, value.len() as u32);
    buf[LEN_SIZE..LEN_SIZE + value.len()].copy_from_slice(value);
    value_entry_size(value.len())
}

/// Iterate the length-prefixed values of a head or tail record
pub(crate) fn value_entries(values: &[u8]) -> ValueEntries<'_> {
    ValueEntries { rest: values }
}

pub(crate) struct ValueEntries<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for ValueEntries<'a> {
    type Item = Result<&'a [u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.is_empty() {
            return None;
        }
        if self.rest.len() < LEN_SIZE {
            self.rest = &[];
            return Some(Err(malformed("truncated value length")));
        }
        let len = get_u32(self.rest, 0) as usize;
        let body = &self.rest[LEN_SIZE..];
        if len > body.len() {
            self.rest = &[];
            return Some(Err(malformed("value length exceeds the record")));
        }
        let (value, rest) = body.split_at(len);
        self.rest = rest;
        Some(Ok(value))
    }
}
