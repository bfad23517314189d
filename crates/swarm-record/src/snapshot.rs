//! Snapshot file IO.
//!
//! A snapshot is a gzip-compressed stream of
//! `{u32 count, [u32 size, revision bytes]*}` with little-endian
//! prefixes. Snapshots are table-scoped: revisions from every chunk of
//! a table share one file, and the owning chunk is recovered from each
//! revision's `chunk_id` on restore.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use swarm_common::{ChunkId, SwarmError, SwarmResult};

use crate::descriptor::TableDescriptor;
use crate::revision::Revision;

/// Writes a table snapshot to `sink`.
pub fn write_snapshot<W: Write>(sink: W, revisions: &[Arc<Revision>]) -> SwarmResult<()> {
    let mut encoder = GzEncoder::new(sink, Compression::default());
    encoder.write_all(&(revisions.len() as u32).to_le_bytes())?;
    for revision in revisions {
        let bytes = revision.serialize();
        encoder.write_all(&(bytes.len() as u32).to_le_bytes())?;
        encoder.write_all(&bytes)?;
    }
    encoder.finish()?;
    Ok(())
}

/// Reads a table snapshot from `source`.
///
/// An initially empty file is accepted and yields no revisions.
pub fn read_snapshot<R: Read>(
    source: R,
    descriptor: &Arc<TableDescriptor>,
) -> SwarmResult<Vec<Revision>> {
    let mut data = Vec::new();
    GzDecoder::new(source).read_to_end(&mut data).or_else(|e| {
        // A zero-length file has no gzip header; treat it as empty.
        if data.is_empty() {
            Ok(0)
        } else {
            Err(e)
        }
    })?;
    if data.is_empty() {
        return Ok(Vec::new());
    }

    let mut cursor = data.as_slice();
    let count = read_u32(&mut cursor, "revision count")?;
    let mut revisions = Vec::with_capacity(count as usize);
    for i in 0..count {
        let size = read_u32(&mut cursor, "revision size")? as usize;
        if size == 0 || cursor.len() < size {
            return Err(SwarmError::corruption(format!(
                "snapshot revision {} of {}: bad size {}",
                i + 1,
                count,
                size
            )));
        }
        let (bytes, rest) = cursor.split_at(size);
        cursor = rest;
        revisions.push(Revision::parse(bytes, descriptor)?);
    }
    Ok(revisions)
}

/// Reads a snapshot and groups its revisions by owning chunk.
pub fn read_snapshot_grouped<R: Read>(
    source: R,
    descriptor: &Arc<TableDescriptor>,
) -> SwarmResult<HashMap<ChunkId, Vec<Revision>>> {
    let mut grouped: HashMap<ChunkId, Vec<Revision>> = HashMap::new();
    for revision in read_snapshot(source, descriptor)? {
        grouped.entry(revision.chunk_id()).or_default().push(revision);
    }
    Ok(grouped)
}

fn read_u32(cursor: &mut &[u8], what: &str) -> SwarmResult<u32> {
    if cursor.len() < 4 {
        return Err(SwarmError::corruption(format!("snapshot {} truncated", what)));
    }
    let (bytes, rest) = cursor.split_at(4);
    *cursor = rest;
    Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
}
