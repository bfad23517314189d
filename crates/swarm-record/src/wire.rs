//! The revision wire codec.
//!
//! Revisions serialize identically on the wire and in snapshot files:
//! a fixed header followed by one tagged slot per positional field.
//!
//! ```text
//! +-------------------+--------------------+------------+------------+
//! | id (2 x u64)      | chunk_id (2 x u64) | insert u64 | update u64 |
//! +---------+---------+--------------------+------------+------------+
//! | removed | count u32 | fields...                                  |
//! +---------+-----------+--------------------------------------------+
//!
//! field := present u8 (0|1) [ tag u8, payload ]
//! payload := fixed-width scalar | u32 length + bytes
//! ```
//!
//! All integers are big-endian. Strings, bytes, and embedded messages
//! are length-prefixed. The layout is versioned by the tag bytes only:
//! schema evolution is append-only, so decoding against a newer
//! descriptor accepts a shorter field list.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::Arc;

use swarm_common::{ChunkId, Id, LogicalTime, RecordId, SwarmError, SwarmResult};

use crate::descriptor::{FieldType, TableDescriptor};
use crate::revision::Revision;
use crate::value::Value;

/// Maximum accepted length for a single string/bytes/message payload.
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

const TAG_BOOL: u8 = 0;
const TAG_INT32: u8 = 1;
const TAG_INT64: u8 = 2;
const TAG_DOUBLE: u8 = 3;
const TAG_STRING: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_HASH: u8 = 6;
const TAG_TIME: u8 = 7;
const TAG_MESSAGE: u8 = 8;

fn type_tag(field_type: FieldType) -> u8 {
    match field_type {
        FieldType::Bool => TAG_BOOL,
        FieldType::Int32 => TAG_INT32,
        FieldType::Int64 => TAG_INT64,
        FieldType::Double => TAG_DOUBLE,
        FieldType::String => TAG_STRING,
        FieldType::Bytes => TAG_BYTES,
        FieldType::Hash => TAG_HASH,
        FieldType::LogicalTime => TAG_TIME,
        FieldType::Message => TAG_MESSAGE,
    }
}

/// Encodes a revision into its wire form.
#[must_use]
pub fn encode(revision: &Revision) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);

    let (id_high, id_low) = revision.id().as_id().words();
    let (chunk_high, chunk_low) = revision.chunk_id().as_id().words();
    buf.put_u64(id_high);
    buf.put_u64(id_low);
    buf.put_u64(chunk_high);
    buf.put_u64(chunk_low);
    buf.put_u64(revision.insert_time().as_u64());
    buf.put_u64(revision.update_time().as_u64());
    buf.put_u8(u8::from(revision.is_removed()));
    buf.put_u32(revision.num_fields() as u32);

    for index in 0..revision.num_fields() {
        match revision.field(index) {
            None => buf.put_u8(0),
            Some(value) => {
                buf.put_u8(1);
                put_value(&mut buf, value);
            }
        }
    }

    buf.freeze()
}

fn put_value(buf: &mut BytesMut, value: &Value) {
    buf.put_u8(type_tag(value.field_type()));
    match value {
        Value::Bool(v) => buf.put_u8(u8::from(*v)),
        Value::Int32(v) => buf.put_i32(*v),
        Value::Int64(v) => buf.put_i64(*v),
        Value::Double(v) => buf.put_f64(*v),
        Value::String(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v.as_bytes());
        }
        Value::Bytes(v) | Value::Message(v) => {
            buf.put_u32(v.len() as u32);
            buf.put_slice(v);
        }
        Value::Hash(v) => {
            let (high, low) = v.words();
            buf.put_u64(high);
            buf.put_u64(low);
        }
        Value::Time(v) => buf.put_u64(v.as_u64()),
    }
}

/// Decodes a revision from its wire form, checking field types against
/// the descriptor.
pub fn decode(bytes: &[u8], descriptor: &Arc<TableDescriptor>) -> SwarmResult<Revision> {
    let mut buf = bytes;

    let header_len = 2 * 8 + 2 * 8 + 8 + 8 + 1 + 4;
    if buf.remaining() < header_len {
        return Err(SwarmError::corruption(format!(
            "revision header truncated: {} bytes",
            buf.remaining()
        )));
    }

    let id = RecordId::new(Id::from_words(buf.get_u64(), buf.get_u64()));
    let chunk_id = ChunkId::new(Id::from_words(buf.get_u64(), buf.get_u64()));
    let insert_time = LogicalTime::new(buf.get_u64());
    let update_time = LogicalTime::new(buf.get_u64());
    let removed = match buf.get_u8() {
        0 => false,
        1 => true,
        other => {
            return Err(SwarmError::corruption(format!(
                "bad removed flag {}",
                other
            )))
        }
    };
    let count = buf.get_u32() as usize;

    // Append-only evolution: the wire may carry fewer fields than the
    // local descriptor knows, never more.
    if count > descriptor.num_fields() {
        return Err(SwarmError::schema_mismatch(format!(
            "wire revision has {} fields, table {} has {}",
            count,
            descriptor.name(),
            descriptor.num_fields()
        )));
    }

    let mut fields = vec![None; descriptor.num_fields()];
    for (index, slot) in fields.iter_mut().enumerate().take(count) {
        if buf.remaining() < 1 {
            return Err(SwarmError::corruption("field list truncated".to_string()));
        }
        if buf.get_u8() == 0 {
            continue;
        }
        let value = get_value(&mut buf)?;
        let expected = descriptor
            .field_type(index)
            .expect("index bounded by descriptor arity");
        if value.field_type() != expected {
            return Err(SwarmError::schema_mismatch(format!(
                "wire field {} of table {} is {}, descriptor says {}",
                index,
                descriptor.name(),
                value.field_type(),
                expected
            )));
        }
        *slot = Some(value);
    }

    if buf.has_remaining() {
        return Err(SwarmError::corruption(format!(
            "{} trailing bytes after revision",
            buf.remaining()
        )));
    }

    Ok(Revision::from_parts(
        Arc::clone(descriptor),
        id,
        chunk_id,
        insert_time,
        update_time,
        removed,
        fields,
    ))
}

fn get_value(buf: &mut &[u8]) -> SwarmResult<Value> {
    if buf.remaining() < 1 {
        return Err(SwarmError::corruption("field tag truncated".to_string()));
    }
    let tag = buf.get_u8();
    let need = |buf: &&[u8], n: usize, what: &str| -> SwarmResult<()> {
        if buf.remaining() < n {
            Err(SwarmError::corruption(format!("{} truncated", what)))
        } else {
            Ok(())
        }
    };
    match tag {
        TAG_BOOL => {
            need(buf, 1, "bool")?;
            Ok(Value::Bool(buf.get_u8() != 0))
        }
        TAG_INT32 => {
            need(buf, 4, "int32")?;
            Ok(Value::Int32(buf.get_i32()))
        }
        TAG_INT64 => {
            need(buf, 8, "int64")?;
            Ok(Value::Int64(buf.get_i64()))
        }
        TAG_DOUBLE => {
            need(buf, 8, "double")?;
            Ok(Value::Double(buf.get_f64()))
        }
        TAG_STRING | TAG_BYTES | TAG_MESSAGE => {
            need(buf, 4, "length prefix")?;
            let len = buf.get_u32() as usize;
            if len > MAX_FIELD_LEN {
                return Err(SwarmError::corruption(format!(
                    "field payload of {} bytes exceeds limit",
                    len
                )));
            }
            need(buf, len, "field payload")?;
            let payload = buf.copy_to_bytes(len);
            match tag {
                TAG_STRING => {
                    let text = String::from_utf8(payload.to_vec()).map_err(|_| {
                        SwarmError::corruption("string field is not UTF-8".to_string())
                    })?;
                    Ok(Value::String(text))
                }
                TAG_BYTES => Ok(Value::Bytes(payload)),
                _ => Ok(Value::Message(payload)),
            }
        }
        TAG_HASH => {
            need(buf, 16, "hash")?;
            Ok(Value::Hash(Id::from_words(buf.get_u64(), buf.get_u64())))
        }
        TAG_TIME => {
            need(buf, 8, "time")?;
            Ok(Value::Time(LogicalTime::new(buf.get_u64())))
        }
        other => Err(SwarmError::corruption(format!(
            "unknown field tag {}",
            other
        ))),
    }
}
