//! The DMA region table: a set of (iova, length, local-ptr, prot)
//! quadruples with overlap-checked insert/remove and
//! `(iova, len) -> local-ptr` translation.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use vmux_transport::Prot;

/// A single mapped range. `local_ptr` is only ever read back through
/// `translate`; nothing in this module dereferences it.
#[derive(Clone, Copy, Debug)]
struct DmaEntry {
    len: usize,
    local_ptr: *mut u8,
    prot: Prot,
}

// SAFETY: DmaEntry is never dereferenced by this module; it is an opaque
// handle handed back to callers who are responsible for any access.
unsafe impl Send for DmaEntry {}
unsafe impl Sync for DmaEntry {}

/// Keyed by iova for O(log n) lookup of the entry starting at an address,
/// plus a linear neighbor scan for overlap checks; acceptable since the
/// expected entry count is in the tens.
#[derive(Default)]
pub struct DmaTable {
    entries: BTreeMap<u64, DmaEntry>,
    generation: AtomicU64,
}

impl DmaTable {
    pub fn new() -> Self {
        DmaTable::default()
    }

    /// Monotonically increasing counter bumped by every successful insert
    /// or remove; lets callers (the vDPDK DMA fence, tests) assert "no
    /// mutation happened between these two reads" without re-deriving it
    /// from entry contents.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Fails if `[iova, iova+len)` overlaps any existing entry.
    pub fn insert(&mut self, iova: u64, len: usize, local_ptr: *mut u8, prot: Prot) -> Result<(), DmaTableError> {
        if len == 0 {
            return Err(DmaTableError::EmptyRange);
        }
        let end = iova.checked_add(len as u64).ok_or(DmaTableError::Overflow)?;

        if let Some((&before_start, before)) = self.entries.range(..iova).next_back() {
            let before_end = before_start + before.len as u64;
            if before_end > iova {
                return Err(DmaTableError::Overlap);
            }
        }
        if let Some((&next_start, _)) = self.entries.range(iova..).next() {
            if next_start < end {
                return Err(DmaTableError::Overlap);
            }
        }

        self.entries.insert(iova, DmaEntry { len, local_ptr, prot });
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(target: "vmux::dma", iova, len, "inserted dma region");
        Ok(())
    }

    /// Fails if no region starts exactly at `iova`.
    pub fn remove(&mut self, iova: u64) -> Result<(), DmaTableError> {
        if self.entries.remove(&iova).is_none() {
            return Err(DmaTableError::NotFound);
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
        tracing::trace!(target: "vmux::dma", iova, "removed dma region");
        Ok(())
    }

    /// Succeeds iff `[iova, iova+len)` lies entirely within a single
    /// mapped region; returns the local pointer corresponding to `iova`.
    pub fn translate(&self, iova: u64, len: usize) -> Option<*mut u8> {
        if len == 0 {
            return None;
        }
        let end = iova.checked_add(len as u64)?;
        let (&start, entry) = self.entries.range(..=iova).next_back()?;
        let entry_end = start.checked_add(entry.len as u64)?;
        if start <= iova && end <= entry_end {
            // SAFETY: offset stays within the entry's declared length.
            Some(unsafe { entry.local_ptr.add((iova - start) as usize) })
        } else {
            None
        }
    }

    pub fn prot_of(&self, iova: u64) -> Option<Prot> {
        self.entries.get(&iova).map(|e| e.prot)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// A `DmaTable` shared between the endpoint thread (writer, on
/// register/unregister) and a device's own poller threads (readers, on
/// every packet). Grounded in `original_source/src/devices/vdpdk.cpp`'s
/// `dma_mutex`/`dma_flag` pair: a `std::shared_mutex` plus a
/// `std::atomic_flag` the writer raises before taking the exclusive lock,
/// so a reader mid-burst can voluntarily drop its read guard instead of
/// blocking an unregister behind a long read-side critical section.
#[derive(Default)]
pub struct GuardedDmaTable {
    table: RwLock<DmaTable>,
    yield_requested: AtomicBool,
}

impl GuardedDmaTable {
    pub fn new() -> Arc<Self> {
        Arc::new(GuardedDmaTable::default())
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DmaTable> {
        self.table.read().unwrap()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DmaTable> {
        self.table.write().unwrap()
    }

    /// Called by the endpoint just before it takes the write lock to
    /// remove a range, so readers mid-burst notice and yield.
    pub fn request_yield(&self) {
        self.yield_requested.store(true, Ordering::Release);
    }

    pub fn clear_yield(&self) {
        self.yield_requested.store(false, Ordering::Release);
    }

    /// Polled by a reader between packets of a burst: true means "drop
    /// your read guard now and re-translate before continuing".
    pub fn should_yield(&self) -> bool {
        self.yield_requested.load(Ordering::Acquire)
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DmaTableError {
    #[error("dma range is empty")]
    EmptyRange,
    #[error("iova + len overflows u64")]
    Overflow,
    #[error("dma range overlaps an existing mapping")]
    Overlap,
    #[error("no dma region starts at the given iova")]
    NotFound,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(addr: usize) -> *mut u8 {
        addr as *mut u8
    }

    #[test]
    fn s1_dma_mapping_scenario() {
        let mut table = DmaTable::new();
        table
            .insert(0x1000, 0x2000, ptr(0xAA000000), Prot::READ | Prot::WRITE)
            .unwrap();

        assert_eq!(table.translate(0x1800, 0x400), Some(ptr(0xAA000800)));
        assert_eq!(table.translate(0x2500, 0x2000), None);

        table.remove(0x1000).unwrap();
        assert_eq!(table.translate(0x1800, 1), None);
    }

    #[test]
    fn insert_then_remove_is_round_trip_to_empty() {
        let mut table = DmaTable::new();
        assert!(table.is_empty());
        table.insert(0x4000, 0x1000, ptr(0x1000), Prot::READ).unwrap();
        assert!(!table.is_empty());
        table.remove(0x4000).unwrap();
        assert!(table.is_empty());
    }

    #[test]
    fn overlapping_insert_is_rejected() {
        let mut table = DmaTable::new();
        table.insert(0x1000, 0x1000, ptr(1), Prot::READ).unwrap();
        assert_eq!(
            table.insert(0x1800, 0x1000, ptr(2), Prot::READ),
            Err(DmaTableError::Overlap)
        );
        assert_eq!(
            table.insert(0x800, 0x1000, ptr(2), Prot::READ),
            Err(DmaTableError::Overlap)
        );
        // Adjacent, non-overlapping ranges are fine.
        table.insert(0x2000, 0x1000, ptr(3), Prot::READ).unwrap();
    }

    #[test]
    fn remove_missing_iova_fails() {
        let mut table = DmaTable::new();
        assert_eq!(table.remove(0x1234), Err(DmaTableError::NotFound));
    }

    #[test]
    fn generation_bumps_on_mutation() {
        let mut table = DmaTable::new();
        let g0 = table.generation();
        table.insert(0x1000, 0x10, ptr(1), Prot::READ).unwrap();
        let g1 = table.generation();
        assert!(g1 > g0);
        table.remove(0x1000).unwrap();
        assert!(table.generation() > g1);
    }
}
