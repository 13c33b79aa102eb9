#![allow(unsafe_code)]

use std::alloc::{alloc, dealloc, Layout};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::error::{GraphError, Result};

/// Buffer alignment for all arena allocations.
const ARENA_ALIGN: usize = 16;
/// Largest size class served from the slab free lists.
const MAX_SLAB_BYTES: usize = 4096;
/// Size classes: 16, 32, ..., 4096.
const N_CLASSES: usize = 9;

/// Epoch-based buffer arena.
///
/// Buffers handed to concurrent readers are never freed directly: the owner
/// `retire`s them once a replacement is published, and a reclaim pass frees
/// only buffers whose retire epoch precedes every active reader epoch.
/// Small power-of-two sizes are recycled through per-class free lists.
pub struct EpochArena {
    epoch: AtomicU64,
    slots: Box<[AtomicU64]>,
    overflow: Mutex<Vec<u64>>,
    garbage: Mutex<Vec<Retired>>,
    free_lists: Mutex<[Vec<RawBuf>; N_CLASSES]>,
}

struct Retired {
    epoch: u64,
    buf: RawBuf,
    nbytes: usize,
}

/// Pointer wrapper so retired buffers can sit in sync containers.
#[derive(Copy, Clone)]
struct RawBuf(*mut u8);

unsafe impl Send for RawBuf {}

/// Active reader window. Buffers retired while the guard is held stay
/// allocated until the guard is dropped.
pub struct EpochGuard<'a> {
    arena: &'a EpochArena,
    slot: Option<usize>,
    pinned: u64,
}

impl EpochArena {
    /// Creates an arena with capacity for `reader_slots` lock-free reader
    /// registrations; additional concurrent readers take a mutex slow path.
    pub fn new(reader_slots: usize) -> Self {
        let slots = (0..reader_slots.max(1))
            .map(|_| AtomicU64::new(0))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            epoch: AtomicU64::new(1),
            slots,
            overflow: Mutex::new(Vec::new()),
            garbage: Mutex::new(Vec::new()),
            free_lists: Mutex::new(std::array::from_fn(|_| Vec::new())),
        }
    }

    /// Allocates an aligned buffer of at least `nbytes` bytes. Contents are
    /// uninitialized; callers publish a length only after initializing the
    /// prefix below it.
    pub fn allocate(&self, nbytes: usize) -> Result<*mut u8> {
        let size = Self::alloc_size(nbytes);
        if let Some(class) = Self::class_of(size) {
            if let Some(buf) = self.free_lists.lock()[class].pop() {
                return Ok(buf.0);
            }
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN)
            .map_err(|_| GraphError::CapacityExceeded("arena allocation too large"))?;
        // Safety: size is non-zero after rounding.
        let ptr = unsafe { alloc(layout) };
        if ptr.is_null() {
            return Err(GraphError::CapacityExceeded("arena out of memory"));
        }
        Ok(ptr)
    }

    /// Retires a buffer previously returned by [`allocate`](Self::allocate)
    /// with the same `nbytes`. Readers that entered before this call may
    /// still dereference it; the memory is freed by a later reclaim pass.
    pub fn retire(&self, ptr: *mut u8, nbytes: usize) {
        // Tag with the pre-bump epoch: readers pinned at it may predate the
        // replacement pointer, readers pinned later cannot.
        let retire_epoch = self.epoch.fetch_add(1, Ordering::SeqCst);
        self.garbage.lock().push(Retired {
            epoch: retire_epoch,
            buf: RawBuf(ptr),
            nbytes,
        });
    }

    /// Enters a reader epoch. The returned guard must outlive every raw
    /// buffer pointer the reader dereferences.
    pub fn enter(&self) -> EpochGuard<'_> {
        let pinned = self.epoch.load(Ordering::SeqCst);
        for (idx, slot) in self.slots.iter().enumerate() {
            if slot
                .compare_exchange(0, pinned, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                return EpochGuard {
                    arena: self,
                    slot: Some(idx),
                    pinned,
                };
            }
        }
        self.overflow.lock().push(pinned);
        EpochGuard {
            arena: self,
            slot: None,
            pinned,
        }
    }

    /// Frees every retired buffer whose retire epoch precedes all active
    /// reader epochs. Invoked by the writer after commits and on drop.
    pub fn reclaim(&self) {
        let min_active = self.min_active_epoch();
        let mut garbage = self.garbage.lock();
        let mut kept = Vec::with_capacity(garbage.len());
        for entry in garbage.drain(..) {
            let reclaimable = match min_active {
                Some(min) => entry.epoch < min,
                None => true,
            };
            if reclaimable {
                self.release(entry.buf, entry.nbytes);
            } else {
                kept.push(entry);
            }
        }
        *garbage = kept;
    }

    /// Number of buffers awaiting reclamation.
    pub fn pending(&self) -> usize {
        self.garbage.lock().len()
    }

    fn min_active_epoch(&self) -> Option<u64> {
        let mut min: Option<u64> = None;
        for slot in self.slots.iter() {
            let pinned = slot.load(Ordering::SeqCst);
            if pinned != 0 {
                min = Some(min.map_or(pinned, |m| m.min(pinned)));
            }
        }
        for &pinned in self.overflow.lock().iter() {
            min = Some(min.map_or(pinned, |m| m.min(pinned)));
        }
        min
    }

    fn release(&self, buf: RawBuf, nbytes: usize) {
        let size = Self::alloc_size(nbytes);
        if let Some(class) = Self::class_of(size) {
            self.free_lists.lock()[class].push(buf);
            return;
        }
        let layout = Layout::from_size_align(size, ARENA_ALIGN).expect("layout was allocatable");
        // Safety: buf came from `allocate` with the same rounded size.
        unsafe { dealloc(buf.0, layout) };
    }

    fn alloc_size(nbytes: usize) -> usize {
        nbytes.max(ARENA_ALIGN).next_power_of_two()
    }

    fn class_of(size: usize) -> Option<usize> {
        if size <= MAX_SLAB_BYTES {
            Some(size.trailing_zeros() as usize - 4)
        } else {
            None
        }
    }

    fn leave(&self, guard_slot: Option<usize>, pinned: u64) {
        match guard_slot {
            Some(idx) => self.slots[idx].store(0, Ordering::SeqCst),
            None => {
                let mut overflow = self.overflow.lock();
                if let Some(pos) = overflow.iter().position(|&e| e == pinned) {
                    overflow.swap_remove(pos);
                }
            }
        }
    }
}

impl Drop for EpochArena {
    fn drop(&mut self) {
        // No readers can be alive here; free everything outstanding.
        let mut garbage = self.garbage.lock();
        for entry in garbage.drain(..) {
            let size = Self::alloc_size(entry.nbytes);
            let layout =
                Layout::from_size_align(size, ARENA_ALIGN).expect("layout was allocatable");
            unsafe { dealloc(entry.buf.0, layout) };
        }
        drop(garbage);
        let mut lists = self.free_lists.lock();
        for (class, list) in lists.iter_mut().enumerate() {
            let size = 1usize << (class + 4);
            let layout =
                Layout::from_size_align(size, ARENA_ALIGN).expect("layout was allocatable");
            for buf in list.drain(..) {
                unsafe { dealloc(buf.0, layout) };
            }
        }
    }
}

impl Drop for EpochGuard<'_> {
    fn drop(&mut self) {
        self.arena.leave(self.slot, self.pinned);
    }
}
