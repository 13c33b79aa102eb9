#![allow(unsafe_code)]

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use memmap2::MmapMut;

use crate::error::{GraphError, Result};

/// Fixed-size virtual-memory reservation backing a column or a list-header
/// array.
///
/// The mapping is anonymous and zero-filled; pages are materialized only when
/// touched, so a reservation sized from `max_vertex_num` stays virtual until
/// rows exist. The extent never moves or grows for the lifetime of the store.
///
/// Writes go through `&self`: the single writer mutates cells while readers
/// concurrently read rows below the published row count. Publication of that
/// count (indexer vid counter, adjacency `len`) is what makes a row's bytes
/// visible, so the extent itself carries no synchronization.
pub struct Extent {
    map: MmapMut,
    base: *mut u8,
    len: usize,
}

unsafe impl Send for Extent {}
unsafe impl Sync for Extent {}

impl Extent {
    /// Reserves `len` bytes of zeroed, lazily-backed memory.
    pub fn anon(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(GraphError::InvalidArgument(
                "extent length must be positive".into(),
            ));
        }
        let mut map = MmapMut::map_anon(len)?;
        let base = map.as_mut_ptr();
        Ok(Self { map, base, len })
    }

    /// Reserves `capacity` bytes and fills the prefix from a snapshot file.
    ///
    /// Fails if the file is larger than the reservation.
    pub fn load(path: impl AsRef<Path>, capacity: usize) -> Result<Self> {
        let extent = Self::anon(capacity)?;
        let mut file = File::open(path)?;
        let file_len = file.metadata()?.len() as usize;
        if file_len > capacity {
            return Err(GraphError::Corruption("snapshot extent exceeds reservation"));
        }
        // Safety: the prefix is exclusively ours until the extent is shared.
        let prefix = unsafe { std::slice::from_raw_parts_mut(extent.base, file_len) };
        file.read_exact(prefix)?;
        Ok(extent)
    }

    /// Total reserved length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the reservation is empty. Always false for a live extent.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Raw pointer to position `pos`, typed.
    ///
    /// # Safety
    /// `pos + size_of::<T>() <= len` and `pos` aligned for `T`.
    pub unsafe fn ptr_at<T>(&self, pos: usize) -> *mut T {
        debug_assert!(pos + std::mem::size_of::<T>() <= self.len);
        self.base.add(pos) as *mut T
    }

    /// Typed view of `count` items starting at byte position `pos`.
    ///
    /// The caller must only read items below the published row count of the
    /// structure this extent backs.
    pub fn slice<T>(&self, pos: usize, count: usize) -> &[T] {
        let bytes = count * std::mem::size_of::<T>();
        assert!(pos + bytes <= self.len, "extent slice out of bounds");
        debug_assert_eq!(pos % std::mem::align_of::<T>(), 0);
        unsafe { std::slice::from_raw_parts(self.base.add(pos) as *const T, count) }
    }

    /// Reads `dst.len()` bytes starting at `pos`.
    pub fn read_bytes(&self, pos: usize, dst: &mut [u8]) {
        assert!(pos + dst.len() <= self.len, "extent read out of bounds");
        unsafe { std::ptr::copy_nonoverlapping(self.base.add(pos), dst.as_mut_ptr(), dst.len()) }
    }

    /// Writes `src` at byte position `pos`. Writer-only.
    pub fn write_bytes(&self, pos: usize, src: &[u8]) {
        assert!(pos + src.len() <= self.len, "extent write out of bounds");
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(pos), src.len()) }
    }

    /// Dumps the first `used` bytes to a snapshot file.
    pub fn dump(&self, path: impl AsRef<Path>, used: usize) -> Result<()> {
        assert!(used <= self.len);
        let mut file = File::create(path)?;
        file.write_all(&self.map[..used])?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn anon_extent_zeroed() {
        let extent = Extent::anon(4096).unwrap();
        assert_eq!(extent.len(), 4096);
        assert!(extent.slice::<u8>(0, 4096).iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read() {
        let extent = Extent::anon(64).unwrap();
        extent.write_bytes(8, &42u64.to_le_bytes());
        assert_eq!(extent.slice::<u64>(0, 2), &[0, 42]);
        let mut buf = [0u8; 8];
        extent.read_bytes(8, &mut buf);
        assert_eq!(u64::from_le_bytes(buf), 42);
    }

    #[test]
    fn dump_and_load_prefix() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("col0");
        let extent = Extent::anon(256).unwrap();
        extent.write_bytes(0, b"hello extent");
        extent.dump(&path, 12).unwrap();

        let loaded = Extent::load(&path, 256).unwrap();
        assert_eq!(loaded.slice::<u8>(0, 12), &b"hello extent"[..]);
        assert!(loaded.slice::<u8>(12, 244).iter().all(|&b| b == 0));
    }

    #[test]
    fn load_rejects_oversized_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big");
        std::fs::write(&path, vec![7u8; 128]).unwrap();
        assert!(Extent::load(&path, 64).is_err());
    }
}
