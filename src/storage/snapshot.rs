//! Snapshot manifest: the small `meta` file that seals a snapshot directory.
//!
//! Extent dumps carry no cross-file consistency information of their own;
//! the manifest records the timestamp the snapshot was taken at and the
//! per-label vertex counts, checksummed, and is written last so a torn dump
//! is detected at load.

use std::path::Path;

use crc32fast::Hasher;

use crate::error::{GraphError, Result};
use crate::types::Timestamp;

const META_MAGIC: [u8; 4] = *b"VSPM";
const META_FORMAT_VERSION: u16 = 1;
const META_FILE: &str = "meta";

/// Decoded snapshot manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotMeta {
    /// `latest_published_ts` at dump time.
    pub latest_ts: Timestamp,
    /// Vertex count per label, in label-id order.
    pub vertex_counts: Vec<u32>,
}

/// Whether `dir` contains a sealed snapshot.
pub fn meta_exists(dir: &Path) -> bool {
    dir.join(META_FILE).exists()
}

/// Writes the manifest. Call after every extent dump has completed.
pub fn write_meta(dir: &Path, latest_ts: Timestamp, vertex_counts: &[u32]) -> Result<()> {
    let mut buf = Vec::with_capacity(4 + 2 + 8 + 4 + vertex_counts.len() * 4 + 4);
    buf.extend_from_slice(&META_MAGIC);
    buf.extend_from_slice(&META_FORMAT_VERSION.to_le_bytes());
    buf.extend_from_slice(&latest_ts.0.to_le_bytes());
    buf.extend_from_slice(&(vertex_counts.len() as u32).to_le_bytes());
    for &count in vertex_counts {
        buf.extend_from_slice(&count.to_le_bytes());
    }
    let mut hasher = Hasher::new();
    hasher.update(&buf);
    let crc = hasher.finalize();
    buf.extend_from_slice(&crc.to_le_bytes());
    let tmp = dir.join(format!("{META_FILE}.tmp"));
    std::fs::write(&tmp, &buf)?;
    std::fs::rename(&tmp, dir.join(META_FILE))?;
    Ok(())
}

/// Reads and validates the manifest.
pub fn read_meta(dir: &Path) -> Result<SnapshotMeta> {
    let bytes = std::fs::read(dir.join(META_FILE))?;
    if bytes.len() < 4 + 2 + 8 + 4 + 4 {
        return Err(GraphError::Corruption("snapshot meta truncated"));
    }
    let (body, crc_bytes) = bytes.split_at(bytes.len() - 4);
    let stored = u32::from_le_bytes(crc_bytes.try_into().unwrap());
    let mut hasher = Hasher::new();
    hasher.update(body);
    if hasher.finalize() != stored {
        return Err(GraphError::Corruption("snapshot meta crc mismatch"));
    }
    if body[0..4] != META_MAGIC {
        return Err(GraphError::Corruption("snapshot meta bad magic"));
    }
    let version = u16::from_le_bytes(body[4..6].try_into().unwrap());
    if version != META_FORMAT_VERSION {
        return Err(GraphError::Corruption("snapshot meta version unsupported"));
    }
    let latest_ts = Timestamp(u64::from_le_bytes(body[6..14].try_into().unwrap()));
    let n = u32::from_le_bytes(body[14..18].try_into().unwrap()) as usize;
    if body.len() != 18 + n * 4 {
        return Err(GraphError::Corruption("snapshot meta length mismatch"));
    }
    let vertex_counts = body[18..]
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
        .collect();
    Ok(SnapshotMeta {
        latest_ts,
        vertex_counts,
    })
}
