#![allow(unsafe_code)]

use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;

use crate::error::{GraphError, Result};
use crate::model::{PropType, Value};
use crate::schema::EdgeStrategy;
use crate::storage::arena::{EpochArena, EpochGuard};
use crate::storage::extent::Extent;
use crate::types::{Timestamp, VertexId};

/// Record layout: neighbor vid (u32 LE) | timestamp (u64 LE) | [edge prop].
const RECORD_FIXED: usize = 12;

const HEADER_WIDTH: usize = std::mem::size_of::<ListHeader>();

/// Per-source adjacency list header. Lives in a zeroed extent: null buffer,
/// zero length, zero capacity, unlocked is the valid empty state.
#[repr(C)]
struct ListHeader {
    buf: AtomicPtr<u8>,
    len: AtomicU32,
    cap: AtomicU32,
    lock: AtomicBool,
    _pad: [u8; 7],
}

impl ListHeader {
    fn acquire(&self) {
        while self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            std::hint::spin_loop();
        }
    }

    fn release(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

/// One decoded adjacency record.
#[derive(Clone, Debug, PartialEq)]
pub struct EdgeRecord {
    pub nbr: VertexId,
    pub ts: Timestamp,
    pub prop: Option<Value>,
}

/// Growable per-source adjacency storage for one (triplet, direction).
///
/// Appends are serialized per source by a spin lock; scans are lock-free.
/// A scan loads the list length (acquire) before the buffer pointer
/// (acquire): observing a grown length therefore implies observing the grown
/// buffer, while an older length is valid against either buffer because
/// growth copies the record prefix verbatim. Replaced buffers are retired
/// through the epoch arena and stay mapped while any reader that could hold
/// them is active.
///
/// Under [`EdgeStrategy::Single`] the list holds one record that a later
/// insert overwrites in place, timestamp included; prior history is lost and
/// a concurrent reader observes the slot's current content.
pub struct MutableCsr {
    headers: Extent,
    n_lists: u32,
    strategy: EdgeStrategy,
    prop: Option<PropType>,
    record_width: usize,
    arena: Arc<EpochArena>,
}

impl MutableCsr {
    /// Creates adjacency storage for `n_lists` sources.
    ///
    /// `strategy` must be `Single` or `Multiple`; a `None` direction stores
    /// nothing and has no CSR.
    pub fn new(
        strategy: EdgeStrategy,
        prop: Option<PropType>,
        n_lists: u32,
        arena: Arc<EpochArena>,
    ) -> Result<Self> {
        debug_assert_ne!(strategy, EdgeStrategy::None);
        let record_width = RECORD_FIXED + prop.map_or(0, |ty| ty.width());
        let headers = Extent::anon((n_lists as usize).max(1) * HEADER_WIDTH)?;
        Ok(Self {
            headers,
            n_lists,
            strategy,
            prop,
            record_width,
            arena,
        })
    }

    /// Edge property type carried by each record, if any.
    pub fn prop_type(&self) -> Option<PropType> {
        self.prop
    }

    /// Published length of the adjacency list of `src`.
    pub fn degree(&self, src: VertexId) -> u32 {
        if src.0 >= self.n_lists {
            return 0;
        }
        self.header(src).len.load(Ordering::Acquire)
    }

    /// Appends an edge record for `src`. Writer-only.
    pub fn insert(
        &self,
        src: VertexId,
        dst: VertexId,
        ts: Timestamp,
        prop: Option<&Value>,
    ) -> Result<()> {
        if src.0 >= self.n_lists {
            return Err(GraphError::CapacityExceeded(
                "adjacency source beyond max_vertex_num",
            ));
        }
        let mut record = [0u8; RECORD_FIXED + 8];
        self.encode_record(dst, ts, prop, &mut record)?;
        let record = &record[..self.record_width];

        let header = self.header(src);
        header.acquire();
        let result = self.insert_locked(header, record);
        header.release();
        result
    }

    fn insert_locked(&self, header: &ListHeader, record: &[u8]) -> Result<()> {
        let len = header.len.load(Ordering::Relaxed);
        match self.strategy {
            EdgeStrategy::Single => {
                if header.buf.load(Ordering::Relaxed).is_null() {
                    let buf = self.arena.allocate(self.record_width)?;
                    header.buf.store(buf, Ordering::Release);
                    header.cap.store(1, Ordering::Relaxed);
                }
                let buf = header.buf.load(Ordering::Relaxed);
                // Safety: buf holds capacity for one record.
                unsafe { std::ptr::copy_nonoverlapping(record.as_ptr(), buf, record.len()) };
                if len == 0 {
                    header.len.store(1, Ordering::Release);
                }
                Ok(())
            }
            EdgeStrategy::Multiple => {
                let cap = header.cap.load(Ordering::Relaxed);
                let mut buf = header.buf.load(Ordering::Relaxed);
                if len == cap {
                    let new_cap = (cap * 2).max(1);
                    let new_buf = self.arena.allocate(new_cap as usize * self.record_width)?;
                    if !buf.is_null() {
                        // Safety: both buffers hold at least `len` records;
                        // the prefix is copied verbatim so records already
                        // observed keep their offset and value.
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                buf,
                                new_buf,
                                len as usize * self.record_width,
                            )
                        };
                    }
                    header.buf.store(new_buf, Ordering::Release);
                    header.cap.store(new_cap, Ordering::Relaxed);
                    if !buf.is_null() {
                        self.arena.retire(buf, cap as usize * self.record_width);
                    }
                    buf = new_buf;
                }
                // Safety: slot `len` is within capacity and below any
                // published length, so no reader addresses it yet.
                unsafe {
                    std::ptr::copy_nonoverlapping(
                        record.as_ptr(),
                        buf.add(len as usize * self.record_width),
                        record.len(),
                    )
                };
                header.len.store(len + 1, Ordering::Release);
                Ok(())
            }
            EdgeStrategy::None => unreachable!("None strategy stores no CSR"),
        }
    }

    /// Scans the adjacency list of `src`, yielding records with
    /// `ts <= snapshot` in insertion order. Lock-free; the caller's epoch
    /// guard keeps a concurrently replaced buffer mapped.
    pub fn edges_of<'g>(
        &self,
        src: VertexId,
        snapshot: Timestamp,
        _guard: &'g EpochGuard<'_>,
    ) -> EdgeIter<'g> {
        if src.0 >= self.n_lists {
            return EdgeIter::empty(snapshot);
        }
        let header = self.header(src);
        // len before buf: see the type-level ordering argument.
        let len = header.len.load(Ordering::Acquire);
        let buf = header.buf.load(Ordering::Acquire);
        EdgeIter {
            buf,
            len,
            idx: 0,
            width: self.record_width,
            prop: self.prop,
            snapshot,
            _guard: PhantomData,
        }
    }

    /// Dumps degrees, prefix-sum offsets and concatenated records for the
    /// first `n` sources.
    pub fn dump(&self, dir: &Path, name: &str, n: u32) -> Result<()> {
        let mut degrees = Vec::with_capacity(n as usize * 4);
        let mut offsets = Vec::with_capacity((n as usize + 1) * 8);
        let mut nbrs: Vec<u8> = Vec::new();
        let mut total: u64 = 0;
        offsets.extend_from_slice(&0u64.to_le_bytes());
        for src in 0..n {
            let header = self.header(VertexId(src));
            let len = header.len.load(Ordering::Acquire);
            let buf = header.buf.load(Ordering::Acquire);
            degrees.extend_from_slice(&len.to_le_bytes());
            total += len as u64;
            offsets.extend_from_slice(&total.to_le_bytes());
            if len > 0 {
                // Safety: the prefix below the published length is stable.
                let records = unsafe {
                    std::slice::from_raw_parts(buf, len as usize * self.record_width)
                };
                nbrs.extend_from_slice(records);
            }
        }
        std::fs::write(dir.join(format!("{name}.degree")), &degrees)?;
        std::fs::write(dir.join(format!("{name}.offsets")), &offsets)?;
        std::fs::write(dir.join(format!("{name}.nbrs")), &nbrs)?;
        Ok(())
    }

    /// Loads adjacency storage dumped by [`dump`](Self::dump).
    pub fn load(
        dir: &Path,
        name: &str,
        strategy: EdgeStrategy,
        prop: Option<PropType>,
        n_lists: u32,
        arena: Arc<EpochArena>,
    ) -> Result<Self> {
        let csr = Self::new(strategy, prop, n_lists, arena)?;
        let degrees = std::fs::read(dir.join(format!("{name}.degree")))?;
        let offsets = std::fs::read(dir.join(format!("{name}.offsets")))?;
        let nbrs = std::fs::read(dir.join(format!("{name}.nbrs")))?;
        if degrees.len() % 4 != 0 {
            return Err(GraphError::Corruption("degree array malformed"));
        }
        let n = degrees.len() / 4;
        if n > n_lists as usize {
            return Err(GraphError::Corruption("degree array exceeds label capacity"));
        }
        if offsets.len() != (n + 1) * 8 {
            return Err(GraphError::Corruption("offset array malformed"));
        }
        let mut expected: u64 = 0;
        for (src, chunk) in degrees.chunks_exact(4).enumerate() {
            let len = u32::from_le_bytes(chunk.try_into().unwrap());
            let offset = u64::from_le_bytes(offsets[src * 8..src * 8 + 8].try_into().unwrap());
            if offset != expected {
                return Err(GraphError::Corruption("offset array inconsistent"));
            }
            expected += len as u64;
            if len == 0 {
                continue;
            }
            if strategy == EdgeStrategy::Single && len != 1 {
                return Err(GraphError::Corruption("single-strategy list overflow"));
            }
            let start = offset as usize * csr.record_width;
            let end = start + len as usize * csr.record_width;
            if end > nbrs.len() {
                return Err(GraphError::Corruption("neighbor records truncated"));
            }
            let header = csr.header(VertexId(src as u32));
            let buf = csr.arena.allocate(len as usize * csr.record_width)?;
            // Safety: freshly allocated, exclusively ours during load.
            unsafe {
                std::ptr::copy_nonoverlapping(nbrs[start..end].as_ptr(), buf, end - start)
            };
            header.buf.store(buf, Ordering::Release);
            header.cap.store(len, Ordering::Relaxed);
            header.len.store(len, Ordering::Release);
        }
        if expected as usize * csr.record_width != nbrs.len() {
            return Err(GraphError::Corruption("neighbor records length mismatch"));
        }
        Ok(csr)
    }

    fn encode_record(
        &self,
        dst: VertexId,
        ts: Timestamp,
        prop: Option<&Value>,
        out: &mut [u8],
    ) -> Result<()> {
        out[..4].copy_from_slice(&dst.0.to_le_bytes());
        out[4..12].copy_from_slice(&ts.0.to_le_bytes());
        match (self.prop, prop) {
            (Some(ty), Some(value)) => {
                value.encode_fixed(ty, &mut out[RECORD_FIXED..RECORD_FIXED + ty.width()])?
            }
            (Some(ty), None) => out[RECORD_FIXED..RECORD_FIXED + ty.width()].fill(0),
            (None, Some(_)) => {
                return Err(GraphError::InvalidArgument(
                    "edge label carries no property".into(),
                ))
            }
            (None, None) => {}
        }
        Ok(())
    }

    fn header(&self, src: VertexId) -> &ListHeader {
        // Safety: src < n_lists and a zeroed header is a valid empty list.
        unsafe { &*self.headers.ptr_at::<ListHeader>(src.0 as usize * HEADER_WIDTH) }
    }
}

impl Drop for MutableCsr {
    fn drop(&mut self) {
        for src in 0..self.n_lists {
            let header = self.header(VertexId(src));
            let buf = header.buf.load(Ordering::Relaxed);
            let cap = header.cap.load(Ordering::Relaxed);
            if !buf.is_null() {
                self.arena.retire(buf, cap as usize * self.record_width);
            }
        }
    }
}

/// Lock-free scan over one adjacency list, filtered by snapshot timestamp.
pub struct EdgeIter<'g> {
    buf: *const u8,
    len: u32,
    idx: u32,
    width: usize,
    prop: Option<PropType>,
    snapshot: Timestamp,
    _guard: PhantomData<&'g ()>,
}

impl EdgeIter<'_> {
    /// An iterator over no records, for directions with no storage.
    pub(crate) fn empty(snapshot: Timestamp) -> Self {
        Self {
            buf: std::ptr::null(),
            len: 0,
            idx: 0,
            width: RECORD_FIXED,
            prop: None,
            snapshot,
            _guard: PhantomData,
        }
    }
}

impl Iterator for EdgeIter<'_> {
    type Item = EdgeRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.idx < self.len {
            let pos = self.idx as usize * self.width;
            self.idx += 1;
            // Safety: idx below the published length; the record prefix is
            // stable and the epoch guard keeps the buffer mapped.
            let record = unsafe { std::slice::from_raw_parts(self.buf.add(pos), self.width) };
            let ts = Timestamp(u64::from_le_bytes(record[4..12].try_into().unwrap()));
            if ts > self.snapshot {
                continue;
            }
            let nbr = VertexId(u32::from_le_bytes(record[..4].try_into().unwrap()));
            let prop = self.prop.map(|ty| {
                Value::decode_fixed(ty, &record[RECORD_FIXED..RECORD_FIXED + ty.width()])
                    .expect("record carries a full-width property cell")
            });
            return Some(EdgeRecord { nbr, ts, prop });
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena() -> Arc<EpochArena> {
        Arc::new(EpochArena::new(8))
    }

    fn collect(csr: &MutableCsr, src: u32, ts: u64) -> Vec<EdgeRecord> {
        let arena = Arc::clone(&csr.arena);
        let guard = arena.enter();
        csr.edges_of(VertexId(src), Timestamp(ts), &guard).collect()
    }

    #[test]
    fn multiple_appends_in_insertion_order() {
        let csr = MutableCsr::new(EdgeStrategy::Multiple, Some(PropType::Double), 4, arena())
            .unwrap();
        for i in 0..5u32 {
            csr.insert(
                VertexId(0),
                VertexId(i),
                Timestamp(i as u64 + 1),
                Some(&Value::Double(i as f64 / 2.0)),
            )
            .unwrap();
        }
        let records = collect(&csr, 0, u64::MAX);
        assert_eq!(records.len(), 5);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.nbr, VertexId(i as u32));
            assert_eq!(record.ts, Timestamp(i as u64 + 1));
            assert_eq!(record.prop, Some(Value::Double(i as f64 / 2.0)));
        }
    }

    #[test]
    fn snapshot_filters_later_timestamps() {
        let csr = MutableCsr::new(EdgeStrategy::Multiple, None, 4, arena()).unwrap();
        csr.insert(VertexId(1), VertexId(2), Timestamp(1), None).unwrap();
        csr.insert(VertexId(1), VertexId(3), Timestamp(2), None).unwrap();
        csr.insert(VertexId(1), VertexId(4), Timestamp(3), None).unwrap();
        assert_eq!(collect(&csr, 1, 2).len(), 2);
        assert_eq!(collect(&csr, 1, 0).len(), 0);
        assert_eq!(collect(&csr, 1, 3).len(), 3);
    }

    #[test]
    fn single_strategy_overwrites_in_place() {
        let csr = MutableCsr::new(EdgeStrategy::Single, None, 4, arena()).unwrap();
        csr.insert(VertexId(0), VertexId(1), Timestamp(1), None).unwrap();
        csr.insert(VertexId(0), VertexId(2), Timestamp(2), None).unwrap();
        let records = collect(&csr, 0, u64::MAX);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].nbr, VertexId(2));
        assert_eq!(records[0].ts, Timestamp(2));
        // History is lost: the old timestamp no longer matches any snapshot.
        let at_one = collect(&csr, 0, 1);
        assert!(at_one.is_empty());
    }

    #[test]
    fn growth_preserves_observed_prefix() {
        let a = arena();
        let csr = MutableCsr::new(EdgeStrategy::Multiple, None, 2, Arc::clone(&a)).unwrap();
        csr.insert(VertexId(0), VertexId(10), Timestamp(1), None).unwrap();
        let guard = a.enter();
        let before: Vec<_> = csr
            .edges_of(VertexId(0), Timestamp(u64::MAX), &guard)
            .collect();
        // Force several growths while the reader's epoch stays pinned.
        for i in 0..16u32 {
            csr.insert(VertexId(0), VertexId(100 + i), Timestamp(2), None).unwrap();
        }
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].nbr, VertexId(10));
        let after: Vec<_> = csr
            .edges_of(VertexId(0), Timestamp(u64::MAX), &guard)
            .collect();
        assert_eq!(after.len(), 17);
        assert_eq!(after[0].nbr, VertexId(10), "prefix copied verbatim");
        drop(guard);
        a.reclaim();
    }

    #[test]
    fn source_beyond_capacity_rejected() {
        let csr = MutableCsr::new(EdgeStrategy::Multiple, None, 2, arena()).unwrap();
        assert!(matches!(
            csr.insert(VertexId(2), VertexId(0), Timestamp(1), None),
            Err(GraphError::CapacityExceeded(_))
        ));
    }

    #[test]
    fn dump_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let a = arena();
        let csr =
            MutableCsr::new(EdgeStrategy::Multiple, Some(PropType::Double), 4, Arc::clone(&a))
                .unwrap();
        csr.insert(VertexId(0), VertexId(1), Timestamp(1), Some(&Value::Double(0.5)))
            .unwrap();
        csr.insert(VertexId(0), VertexId(2), Timestamp(2), Some(&Value::Double(1.5)))
            .unwrap();
        csr.insert(VertexId(2), VertexId(0), Timestamp(2), Some(&Value::Double(2.5)))
            .unwrap();
        csr.dump(dir.path(), "knows_oe", 3).unwrap();

        let loaded = MutableCsr::load(
            dir.path(),
            "knows_oe",
            EdgeStrategy::Multiple,
            Some(PropType::Double),
            4,
            arena(),
        )
        .unwrap();
        let records = collect(&loaded, 0, u64::MAX);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].nbr, VertexId(2));
        assert_eq!(records[1].prop, Some(Value::Double(1.5)));
        assert_eq!(collect(&loaded, 2, u64::MAX).len(), 1);
        assert_eq!(collect(&loaded, 1, u64::MAX).len(), 0);
    }
}
