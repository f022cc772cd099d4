//! Packet buffer pool (C5): a free-list allocator over one DMA region
//! producing fixed-layout buffer descriptors whose bus addresses are
//! known at allocation time.
//!
//! The arena-plus-index encoding is the safe counterpart of "pointer to
//! buffer, buffer points back to pool": [`PacketBuffer`] holds an `Rc`
//! to its owning [`Pool`] plus its slot index rather than a raw pointer,
//! so there is no cycle and no unchecked back-reference to walk.

use std::cell::RefCell;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::rc::Rc;
use std::{ptr, slice};

use crate::error::{DriverError, Result};
use crate::iommu::IommuContainer;
use crate::memory::{self, AddressSpace, DmaMemory, HUGE_PAGE_SIZE};
use crate::platform::virt_to_phys;

pub const DEFAULT_ENTRY_SIZE: usize = 2048;

/// Fixed-size buffer pool, single-owner: only the thread that created it
/// may call any operation on it (enforced syntactically: `Pool` holds an
/// `Rc`/`RefCell` and is therefore `!Send`/`!Sync`).
pub struct Pool {
    base: *mut u8,
    entry_size: usize,
    num_entries: usize,
    bus_addresses: Vec<usize>,
    free_stack: RefCell<Vec<usize>>,
    // kept alive for the pool's lifetime; never read after construction.
    _dma: DmaMemory,
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("entry_size", &self.entry_size)
            .field("num_entries", &self.num_entries)
            .field("free_top", &self.free_stack.borrow().len())
            .finish()
    }
}

impl Pool {
    /// Allocates a new pool of `num_entries` slots of `entry_size` bytes
    /// (0 selects [`DEFAULT_ENTRY_SIZE`]) from one freshly allocated huge
    /// page region.
    pub fn new(
        num_entries: usize,
        entry_size: usize,
        policy: AddressSpace,
        iommu: Option<&IommuContainer>,
    ) -> Result<Rc<Pool>> {
        let entry_size = if entry_size == 0 {
            DEFAULT_ENTRY_SIZE
        } else {
            entry_size
        };

        if !HUGE_PAGE_SIZE.is_multiple_of(entry_size) {
            return Err(DriverError::BadEntrySize {
                entry_size,
                huge_page_size: HUGE_PAGE_SIZE,
            });
        }

        let dma = memory::allocate(num_entries * entry_size, false, policy, iommu)?;
        let base = dma.virt;
        unsafe { memset(base, num_entries * entry_size, 0) };

        let mut bus_addresses = Vec::with_capacity(num_entries);
        for i in 0..num_entries {
            let slot_virt = unsafe { base.add(i * entry_size) };
            let bus_address = match policy {
                AddressSpace::Physical => virt_to_phys(slot_virt as usize)?,
                AddressSpace::IoVirtual => slot_virt as usize,
            };
            bus_addresses.push(bus_address);
        }

        // every slot starts free; initialized so popping yields ascending
        // slot indices on a fresh pool (ties the LIFO free list to the
        // order a caller naturally expects the first allocations in).
        let free_stack = (0..num_entries).rev().collect();

        Ok(Rc::new(Pool {
            base,
            entry_size,
            num_entries,
            bus_addresses,
            free_stack: RefCell::new(free_stack),
            _dma: dma,
        }))
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn entry_size(&self) -> usize {
        self.entry_size
    }

    /// Count of currently-free slots.
    pub fn free_top(&self) -> usize {
        self.free_stack.borrow().len()
    }

    fn slot_ptr(&self, index: usize) -> *mut u8 {
        unsafe { self.base.add(index * self.entry_size) }
    }

    /// Allocates up to `n` buffers into `out`, returning how many were
    /// granted. Never fails: when fewer than `n` slots are free, a
    /// warning is logged and the partial count is returned.
    pub fn alloc_batch(self: &Rc<Self>, out: &mut Vec<PacketBuffer>, n: usize) -> usize {
        let mut stack = self.free_stack.borrow_mut();
        let granted = n.min(stack.len());
        if granted < n {
            log::warn!(
                "pool exhausted: requested {n}, only {granted} free (of {})",
                self.num_entries
            );
        }
        for _ in 0..granted {
            let index = stack.pop().expect("granted <= free_top");
            out.push(PacketBuffer {
                pool: self.clone(),
                index,
                size: 0,
            });
        }
        granted
    }

    /// Convenience over [`alloc_batch`](Self::alloc_batch) for a single buffer.
    pub fn alloc_one(self: &Rc<Self>) -> Option<PacketBuffer> {
        let mut out = Vec::with_capacity(1);
        self.alloc_batch(&mut out, 1);
        out.pop()
    }

    /// Returns a slot to the free list. The caller must guarantee
    /// ownership; double-free is a correctness bug this pool does not
    /// detect (matching spec.md's stated non-invariant).
    fn free(&self, index: usize) {
        self.free_stack.borrow_mut().push(index);
    }
}

/// A buffer carved from a [`Pool`]: bus address, owning pool, slot
/// index, current payload size, and the payload bytes themselves.
///
/// Essential invariants: `bus_address` is stable for the buffer's
/// lifetime; the buffer is either in the pool's free list or in flight
/// (held by application code, the RX ring, or the TX ring), never both;
/// `size <= entry_size`.
pub struct PacketBuffer {
    pool: Rc<Pool>,
    index: usize,
    size: usize,
}

impl PacketBuffer {
    pub fn bus_address(&self) -> usize {
        self.pool.bus_addresses[self.index]
    }

    pub fn pool_index(&self) -> usize {
        self.index
    }

    pub fn pool(&self) -> &Rc<Pool> {
        &self.pool
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.pool.entry_size
    }

    /// Sets the current payload size. Panics if it would exceed the
    /// slot's capacity (`size <= entry_size`).
    pub fn set_len(&mut self, size: usize) {
        assert!(
            size <= self.capacity(),
            "packet size {size} exceeds slot capacity {}",
            self.capacity()
        );
        self.size = size;
    }

    fn as_ptr(&self) -> *const u8 {
        self.pool.slot_ptr(self.index)
    }

    fn as_mut_ptr(&mut self) -> *mut u8 {
        self.pool.slot_ptr(self.index)
    }
}

impl Deref for PacketBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        unsafe { slice::from_raw_parts(self.as_ptr(), self.size) }
    }
}

impl DerefMut for PacketBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        unsafe { slice::from_raw_parts_mut(self.as_mut_ptr(), self.size) }
    }
}

impl Drop for PacketBuffer {
    fn drop(&mut self) {
        self.pool.free(self.index);
    }
}

/// Zeroes `len` bytes at `addr` using volatile writes (device memory may
/// be observed by a concurrent DMA engine, so an ordinary write that the
/// optimizer could elide or reorder is not sufficient).
pub(crate) unsafe fn memset(addr: *mut u8, len: usize, value: u8) {
    for i in 0..len {
        ptr::write_volatile(addr.add(i), value);
    }
}

/// Builds a pool over a plain heap allocation instead of a real
/// hugetlbfs mapping, so pool and forwarding-loop logic is testable
/// without root or a mounted hugetlbfs.
#[cfg(test)]
pub(crate) fn test_pool(num_entries: usize, entry_size: usize) -> Rc<Pool> {
    let total = num_entries * entry_size;
    let mut backing = vec![0u8; total].into_boxed_slice();
    let base = backing.as_mut_ptr();
    std::mem::forget(backing);

    let bus_addresses = (0..num_entries)
        .map(|i| base as usize + i * entry_size)
        .collect();
    let dma = DmaMemory {
        virt: base,
        bus: base as usize,
        size: total,
    };
    let free_stack = (0..num_entries).rev().collect();

    Rc::new(Pool {
        base,
        entry_size,
        num_entries,
        bus_addresses,
        free_stack: RefCell::new(free_stack),
        _dma: dma,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// spec.md §8 scenario 1 ("Pool basic"), transcribed literally.
    #[test]
    fn pool_basic_lifo_scenario() {
        let pool = test_pool(4, 2048);
        assert_eq!(pool.free_top(), 4);

        let mut bufs = Vec::new();
        pool.alloc_batch(&mut bufs, 3);
        assert_eq!(pool.free_top(), 1);
        assert_eq!(
            bufs.iter().map(|b| b.pool_index()).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );

        // free them in the order received
        let b2 = bufs.pop().unwrap();
        let b1 = bufs.pop().unwrap();
        let b0 = bufs.pop().unwrap();
        drop(b0);
        assert_eq!(pool.free_top(), 2);
        drop(b1);
        assert_eq!(pool.free_top(), 3);
        drop(b2);
        assert_eq!(pool.free_top(), 4);

        let next = pool.alloc_one().unwrap();
        assert_eq!(next.pool_index(), 2, "LIFO: last freed is allocated first");
        assert_eq!(pool.free_top(), 3);
    }

    /// spec.md §8 scenario 2 ("Pool exhaustion").
    #[test]
    fn pool_exhaustion_scenario() {
        let pool = test_pool(2, 2048);
        let mut bufs = Vec::new();
        let granted = pool.alloc_batch(&mut bufs, 5);
        assert_eq!(granted, 2);
        assert_eq!(pool.free_top(), 0);

        let mut more = Vec::new();
        let granted2 = pool.alloc_batch(&mut more, 1);
        assert_eq!(granted2, 0);
    }

    /// LIFO round-trip law: pop, push, pop returns the same index.
    #[test]
    fn pop_push_pop_round_trips() {
        let pool = test_pool(4, 2048);
        let first = pool.alloc_one().unwrap();
        let first_index = first.pool_index();
        drop(first);
        let second = pool.alloc_one().unwrap();
        assert_eq!(second.pool_index(), first_index);
    }

    /// Pool conservation: free_top + |held by caller| == num_entries at
    /// every point, across an arbitrary alloc/free sequence.
    #[test]
    fn pool_conservation_invariant() {
        let pool = test_pool(8, 64);
        let mut held = Vec::new();
        for step in 0..50 {
            if step % 3 == 0 && !held.is_empty() {
                held.remove(step % held.len());
            } else {
                pool.alloc_batch(&mut held, 1);
            }
            assert_eq!(pool.free_top() + held.len(), pool.num_entries());
        }
    }

    /// Unique indices: no index appears twice among free slots, and no
    /// two outstanding buffers share an index.
    #[test]
    fn unique_indices_invariant() {
        let pool = test_pool(16, 64);
        let mut held = Vec::new();
        pool.alloc_batch(&mut held, 10);

        let held_indices: std::collections::HashSet<_> =
            held.iter().map(|b| b.pool_index()).collect();
        assert_eq!(held_indices.len(), held.len(), "duplicate held index");

        let free_indices: std::collections::HashSet<_> =
            pool.free_stack.borrow().iter().copied().collect();
        assert_eq!(
            free_indices.len(),
            pool.free_stack.borrow().len(),
            "duplicate free index"
        );
        assert!(held_indices.is_disjoint(&free_indices));
    }

    /// Slot alignment: no slot straddles a huge-page-sized boundary when
    /// entry_size divides it, and every slot_base is base + i*entry_size.
    #[test]
    fn slot_alignment_invariant() {
        let pool = test_pool(4, 512);
        for i in 0..pool.num_entries() {
            let slot = pool.slot_ptr(i) as usize;
            assert_eq!((slot - pool.base as usize) % pool.entry_size(), 0);
        }
    }

    /// Bus address stability: recorded bus address never changes between
    /// allocation and drop.
    #[test]
    fn bus_address_stability() {
        let pool = test_pool(4, 64);
        let buf = pool.alloc_one().unwrap();
        let addr1 = buf.bus_address();
        let addr2 = buf.bus_address();
        assert_eq!(addr1, addr2);
    }
}
