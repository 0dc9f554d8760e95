//! Shared machinery of the transpose codec: callback codes, tag data, and
//! the protobuf wire parser that decides whether a record can be transposed.

use anyhow::{bail, Result};
use bytes::Bytes;
use rcf_core::varint;

/// Submessages nested deeper than this are not transposed; the record is
/// stored verbatim instead.
pub const MAX_RECURSION_DEPTH: usize = 64;

/// Proto wire-format constraint on a single message.
pub const MAX_PROTO_RECORD_LEN: usize = i32::MAX as usize;

pub const WIRE_VARINT: u32 = 0;
pub const WIRE_FIXED64: u32 = 1;
pub const WIRE_LENGTH_DELIMITED: u32 = 2;
pub const WIRE_FIXED32: u32 = 5;

// ── Callback codes ─────────────────────────────────────────────────────────

/// State-machine callback codes. The byte values are part of the transpose
/// header layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum CallbackCode {
    /// Prepend the tag data (which may carry an inline one-byte value).
    CopyTag = 0,
    /// Prepend one varint read from the buffer, then the tag.
    CopyTagAndVarint = 1,
    /// Prepend a fixed number of bytes from the buffer, then the tag.
    CopyTagAndBytes = 2,
    /// Prepend a varint-length-prefixed payload from the buffer, then the
    /// length, then the tag.
    CopyTagAndLengthDelimited = 3,
    /// Mark the end position of a submessage body.
    StartSubmessage = 4,
    /// Prepend `tag | varint(body_len)` for the matching StartSubmessage.
    EndSubmessage = 5,
    /// Prepend a varint-length-prefixed record verbatim.
    NonProtoRecord = 6,
    /// Commit the current record.
    EndOfRecord = 7,
}

impl CallbackCode {
    /// Whether this callback reads bytes from a buffer. Cycles through
    /// non-consuming callbacks are what the implicit-loop check rejects.
    pub fn consumes_input(self) -> bool {
        matches!(
            self,
            CallbackCode::CopyTagAndVarint
                | CallbackCode::CopyTagAndBytes
                | CallbackCode::CopyTagAndLengthDelimited
                | CallbackCode::NonProtoRecord
        )
    }
}

impl TryFrom<u8> for CallbackCode {
    type Error = anyhow::Error;

    fn try_from(value: u8) -> Result<Self> {
        Ok(match value {
            0 => CallbackCode::CopyTag,
            1 => CallbackCode::CopyTagAndVarint,
            2 => CallbackCode::CopyTagAndBytes,
            3 => CallbackCode::CopyTagAndLengthDelimited,
            4 => CallbackCode::StartSubmessage,
            5 => CallbackCode::EndSubmessage,
            6 => CallbackCode::NonProtoRecord,
            7 => CallbackCode::EndOfRecord,
            _ => bail!("unknown state machine callback {}", value),
        })
    }
}

// ── Tag data ───────────────────────────────────────────────────────────────

/// The varint-encoded field tag (1 to 5 bytes), optionally followed by one
/// inline value byte for single-byte varint fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TagData {
    bytes: [u8; 6],
    len: u8,
}

impl TagData {
    pub fn new(tag: u32, inline_value: Option<u8>) -> Self {
        let mut bytes = [0u8; 6];
        let mut cursor = &mut bytes[..];
        varint::put_uvarint32(&mut cursor, tag);
        let mut len = varint::encoded_len_u64(u64::from(tag)) as u8;
        if let Some(value) = inline_value {
            bytes[len as usize] = value;
            len += 1;
        }
        TagData { bytes, len }
    }

    pub fn empty() -> Self {
        TagData {
            bytes: [0; 6],
            len: 0,
        }
    }

    /// Reconstructs tag data parsed from a transpose header.
    pub fn from_slice(data: &[u8]) -> Result<Self> {
        if data.len() > 6 {
            bail!("tag data longer than 6 bytes");
        }
        let mut bytes = [0u8; 6];
        bytes[..data.len()].copy_from_slice(data);
        Ok(TagData {
            bytes,
            len: data.len() as u8,
        })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The field number encoded in the leading tag varint.
    pub fn field(&self) -> Result<u32> {
        let mut cursor = self.as_slice();
        let tag = varint::get_uvarint32(&mut cursor)?;
        Ok(tag >> 3)
    }
}

// ── Wire parsing ───────────────────────────────────────────────────────────

/// One field occurrence, in record order. Length-delimited payloads that
/// parse as messages become Start/End pairs around their contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Varint { field: u32, value: Bytes },
    Fixed32 { field: u32, value: Bytes },
    Fixed64 { field: u32, value: Bytes },
    LengthDelimited { field: u32, payload: Bytes },
    SubmessageStart { field: u32 },
    SubmessageEnd { field: u32 },
}

/// Parses a record's wire bytes into events, or fails if the record cannot
/// round-trip through transposition byte-for-byte.
///
/// Tags and length prefixes must be minimally encoded because the encoder
/// re-synthesizes them; varint *values* are kept verbatim, so non-minimal
/// value encodings are fine. Group wire types and over-deep nesting are
/// rejected here and divert the record to the non-proto buffer.
pub fn parse_record(record: &Bytes) -> Result<Vec<Event>> {
    if record.len() > MAX_PROTO_RECORD_LEN {
        bail!("record exceeds maximum protobuf size");
    }
    let mut events = Vec::new();
    parse_message(record, MAX_RECURSION_DEPTH, &mut events)?;
    Ok(events)
}

fn parse_message(data: &Bytes, depth: usize, events: &mut Vec<Event>) -> Result<()> {
    let mut at = 0usize;
    while at < data.len() {
        let (tag, tag_len) = read_minimal_varint32(&data[at..])?;
        at += tag_len;
        let field = tag >> 3;
        if field == 0 {
            bail!("field number 0 is invalid");
        }
        match tag & 7 {
            WIRE_VARINT => {
                let value_len = varint_len(&data[at..])?;
                events.push(Event::Varint {
                    field,
                    value: data.slice(at..at + value_len),
                });
                at += value_len;
            }
            WIRE_FIXED64 => {
                if data.len() - at < 8 {
                    bail!("truncated fixed64 field");
                }
                events.push(Event::Fixed64 {
                    field,
                    value: data.slice(at..at + 8),
                });
                at += 8;
            }
            WIRE_FIXED32 => {
                if data.len() - at < 4 {
                    bail!("truncated fixed32 field");
                }
                events.push(Event::Fixed32 {
                    field,
                    value: data.slice(at..at + 4),
                });
                at += 4;
            }
            WIRE_LENGTH_DELIMITED => {
                let (len, len_len) = read_minimal_varint32(&data[at..])?;
                at += len_len;
                let len = len as usize;
                if data.len() - at < len {
                    bail!("length-delimited field overruns record");
                }
                let payload = data.slice(at..at + len);
                at += len;

                // A payload that parses as a message is transposed
                // recursively; reassembly is byte-exact either way.
                let mut sub_events = Vec::new();
                if depth > 0 && parse_message(&payload, depth - 1, &mut sub_events).is_ok() {
                    events.push(Event::SubmessageStart { field });
                    events.append(&mut sub_events);
                    events.push(Event::SubmessageEnd { field });
                } else {
                    events.push(Event::LengthDelimited { field, payload });
                }
            }
            wire_type => bail!("unsupported wire type {}", wire_type),
        }
    }
    Ok(())
}

/// Decodes a varint32 and requires the minimal encoding.
fn read_minimal_varint32(data: &[u8]) -> Result<(u32, usize)> {
    let mut cursor = data;
    let value = varint::get_uvarint32(&mut cursor)?;
    let len = data.len() - cursor.len();
    if len != varint::encoded_len_u64(u64::from(value)) {
        bail!("non-minimal varint encoding");
    }
    Ok((value, len))
}

/// Length of the varint at the head of `data`, without minimality checks.
fn varint_len(data: &[u8]) -> Result<usize> {
    let mut cursor = data;
    varint::get_uvarint64(&mut cursor)?;
    Ok(data.len() - cursor.len())
}
