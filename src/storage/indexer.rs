#![allow(unsafe_code)]

use std::fs::File;
use std::hash::Hasher;
use std::io::Write;
use std::path::Path;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use rustc_hash::FxHasher;

use crate::error::{GraphError, Result};
use crate::storage::extent::Extent;
use crate::types::VertexId;

/// Keys are stored with the sign bit flipped so that a zeroed slot extent
/// reads as all-empty; `i64::MIN` is therefore reserved and rejected.
const EMPTY_SLOT: i64 = 0;

const SLOT_WIDTH: usize = 16;

#[repr(C)]
struct Slot {
    /// Encoded key (`key ^ i64::MIN`), or `EMPTY_SLOT`.
    key: AtomicI64,
    vid: AtomicU32,
    _pad: u32,
}

/// Lock-free open-addressed map from external 64-bit key to dense vid.
///
/// Lookups never block and tolerate in-flight insertions: the vid is written
/// before the key slot is release-published, so any observed key carries a
/// valid vid. Insertion is writer-only. The table is sized once at open to
/// `(2 * max_vertex_num).next_power_of_two()` slots (load factor at most 0.5
/// when the label is full) and never resizes; exhausting `max_vertex_num`
/// fails with `CapacityExceeded`.
pub struct Indexer {
    slots: Extent,
    mask: usize,
    max_vertex_num: u32,
    next_vid: AtomicU32,
}

impl Indexer {
    /// Creates an empty indexer for a label holding up to `max_vertex_num`
    /// vertices.
    pub fn new(max_vertex_num: u32) -> Result<Self> {
        let capacity = Self::capacity_for(max_vertex_num);
        let slots = Extent::anon(capacity * SLOT_WIDTH)?;
        Ok(Self {
            slots,
            mask: capacity - 1,
            max_vertex_num,
            next_vid: AtomicU32::new(0),
        })
    }

    fn capacity_for(max_vertex_num: u32) -> usize {
        ((max_vertex_num as usize).saturating_mul(2))
            .next_power_of_two()
            .max(2)
    }

    /// Number of slots in the probe table.
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of assigned vids; also the next vid to be assigned.
    pub fn size(&self) -> u32 {
        self.next_vid.load(Ordering::Acquire)
    }

    /// Looks up the vid mapped to `key`. Never blocks.
    pub fn lookup(&self, key: i64) -> Option<VertexId> {
        if key == i64::MIN {
            return None;
        }
        let enc = key ^ i64::MIN;
        let mut idx = self.bucket(key);
        for _ in 0..=self.mask {
            let slot = self.slot(idx);
            let stored = slot.key.load(Ordering::Acquire);
            if stored == EMPTY_SLOT {
                return None;
            }
            if stored == enc {
                return Some(VertexId(slot.vid.load(Ordering::Acquire)));
            }
            idx = (idx + 1) & self.mask;
        }
        None
    }

    /// Assigns the next vid to `key` and publishes the mapping.
    ///
    /// Writer-only. Fails with `DuplicateKey` if the key is present and with
    /// `CapacityExceeded` once `max_vertex_num` vids are assigned.
    pub fn insert(&self, key: i64) -> Result<VertexId> {
        if key == i64::MIN {
            return Err(GraphError::InvalidArgument(
                "key i64::MIN is reserved".into(),
            ));
        }
        let enc = key ^ i64::MIN;
        let mut idx = self.bucket(key);
        for _ in 0..=self.mask {
            let slot = self.slot(idx);
            let stored = slot.key.load(Ordering::Acquire);
            if stored == enc {
                return Err(GraphError::DuplicateKey(key));
            }
            if stored == EMPTY_SLOT {
                if self.next_vid.load(Ordering::Relaxed) >= self.max_vertex_num {
                    return Err(GraphError::CapacityExceeded("indexer label full"));
                }
                let vid = self.next_vid.fetch_add(1, Ordering::AcqRel);
                slot.vid.store(vid, Ordering::Release);
                match slot.key.compare_exchange(
                    EMPTY_SLOT,
                    enc,
                    Ordering::Release,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Ok(VertexId(vid)),
                    // Slot raced away; the probe advances. Single-writer
                    // stores make this unreachable, but the publication
                    // protocol does not rely on that.
                    Err(other) if other == enc => return Err(GraphError::DuplicateKey(key)),
                    Err(_) => {}
                }
            }
            idx = (idx + 1) & self.mask;
        }
        Err(GraphError::CapacityExceeded("indexer probe table full"))
    }

    /// Iterates all published `(key, vid)` entries in slot order.
    pub fn snapshot_iter(&self) -> impl Iterator<Item = (i64, VertexId)> + '_ {
        (0..=self.mask).filter_map(move |idx| {
            let slot = self.slot(idx);
            let stored = slot.key.load(Ordering::Acquire);
            if stored == EMPTY_SLOT {
                None
            } else {
                Some((
                    stored ^ i64::MIN,
                    VertexId(slot.vid.load(Ordering::Acquire)),
                ))
            }
        })
    }

    /// Dumps entries as a dense `(key, vid)` pair array followed by the size
    /// counter.
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut file = File::create(path)?;
        let mut buf = Vec::with_capacity(self.size() as usize * 12 + 4);
        for (key, vid) in self.snapshot_iter() {
            buf.extend_from_slice(&key.to_le_bytes());
            buf.extend_from_slice(&vid.0.to_le_bytes());
        }
        buf.extend_from_slice(&self.size().to_le_bytes());
        file.write_all(&buf)?;
        file.sync_all()?;
        Ok(())
    }

    /// Loads an indexer dumped by [`dump`](Self::dump).
    pub fn load(path: impl AsRef<Path>, max_vertex_num: u32) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        if bytes.len() < 4 || (bytes.len() - 4) % 12 != 0 {
            return Err(GraphError::Corruption("indexer snapshot malformed"));
        }
        let n_entries = (bytes.len() - 4) / 12;
        let size = u32::from_le_bytes(bytes[bytes.len() - 4..].try_into().unwrap());
        if size as usize != n_entries {
            return Err(GraphError::Corruption("indexer snapshot size mismatch"));
        }
        let indexer = Self::new(max_vertex_num)?;
        for chunk in bytes[..n_entries * 12].chunks_exact(12) {
            let key = i64::from_le_bytes(chunk[..8].try_into().unwrap());
            let vid = u32::from_le_bytes(chunk[8..].try_into().unwrap());
            if vid >= size {
                return Err(GraphError::Corruption("indexer snapshot vid out of range"));
            }
            indexer.place(key, VertexId(vid))?;
        }
        indexer.next_vid.store(size, Ordering::Release);
        Ok(indexer)
    }

    /// Places a recovered mapping at its probe position without assigning a
    /// new vid. Load-time only.
    fn place(&self, key: i64, vid: VertexId) -> Result<()> {
        if key == i64::MIN {
            return Err(GraphError::Corruption("indexer snapshot reserved key"));
        }
        let enc = key ^ i64::MIN;
        let mut idx = self.bucket(key);
        for _ in 0..=self.mask {
            let slot = self.slot(idx);
            let stored = slot.key.load(Ordering::Relaxed);
            if stored == enc {
                return Err(GraphError::Corruption("indexer snapshot duplicate key"));
            }
            if stored == EMPTY_SLOT {
                slot.vid.store(vid.0, Ordering::Relaxed);
                slot.key.store(enc, Ordering::Relaxed);
                return Ok(());
            }
            idx = (idx + 1) & self.mask;
        }
        Err(GraphError::Corruption("indexer snapshot overflow"))
    }

    fn bucket(&self, key: i64) -> usize {
        let mut hasher = FxHasher::default();
        hasher.write_i64(key);
        hasher.finish() as usize & self.mask
    }

    fn slot(&self, idx: usize) -> &Slot {
        // Safety: idx <= mask, slots are SLOT_WIDTH apart, and a zeroed Slot
        // is a valid empty slot.
        unsafe { &*self.slots.ptr_at::<Slot>(idx * SLOT_WIDTH) }
    }
}
