//! Huge-page DMA allocator (C2): pinned, 2 MiB-aligned memory suitable
//! for device DMA.
//!
//! hugetlbfs is used rather than anonymous huge pages because the kernel
//! only guarantees physical contiguity within a single huge page for
//! file-backed mappings, and the NIC's ring-descriptor hardware can only
//! express one bus address per descriptor.

use std::fs;
use std::os::unix::io::AsRawFd;
use std::process;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::{DriverError, Result};
use crate::iommu::IommuContainer;
use crate::platform::virt_to_phys;

pub const HUGE_PAGE_BITS: u32 = 21;
pub const HUGE_PAGE_SIZE: usize = 1 << HUGE_PAGE_BITS;

static HUGEPAGE_ID: AtomicUsize = AtomicUsize::new(0);

/// Selects how [`DmaMemory::bus`] is filled for a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressSpace {
    /// Bus address equals the machine physical address of the backing
    /// page (direct-PCI mode; obtained via the pagemap).
    Physical,
    /// Bus address equals the virtual address, identity-mapped into the
    /// IOMMU at allocation time.
    IoVirtual,
}

/// A pinned region with a process-addressable pointer and a
/// device-visible address for its first byte.
///
/// Invariant: for any offset `k` within `size`, `virt + k` is
/// readable/writable by the CPU and `bus + k` is readable/writable by the
/// device.
#[derive(Debug)]
pub struct DmaMemory {
    pub virt: *mut u8,
    pub bus: usize,
    pub size: usize,
}

// The region outlives every consumer that borrows it (it is never freed
// before process exit); sharing the raw pointer across threads is the
// caller's responsibility, matching the single-owner pool model.
unsafe impl Send for DmaMemory {}

/// Rounds `size` up to a multiple of [`HUGE_PAGE_SIZE`].
fn round_up_to_huge_page(size: usize) -> usize {
    if !size.is_multiple_of(HUGE_PAGE_SIZE) {
        ((size >> HUGE_PAGE_BITS) + 1) << HUGE_PAGE_BITS
    } else {
        size
    }
}

fn check_contiguous(rounded_size: usize, require_contiguous: bool) -> Result<()> {
    if require_contiguous && rounded_size > HUGE_PAGE_SIZE {
        return Err(DriverError::ContiguityUnavailable {
            requested: rounded_size,
            huge_page_size: HUGE_PAGE_SIZE,
        });
    }
    Ok(())
}

/// Allocates `size` bytes (rounded up to a whole number of huge pages) of
/// pinned, huge-page-backed memory.
///
/// When `policy` is [`AddressSpace::IoVirtual`], every huge page in the
/// region is identity-mapped into `iommu` (`iova == virt`) before
/// returning.
pub fn allocate(
    size: usize,
    require_contiguous: bool,
    policy: AddressSpace,
    iommu: Option<&IommuContainer>,
) -> Result<DmaMemory> {
    let size = round_up_to_huge_page(size);
    check_contiguous(size, require_contiguous)?;

    let id = HUGEPAGE_ID.fetch_add(1, Ordering::SeqCst);
    let path = format!("/mnt/huge/corenic-{}-{}", process::id(), id);

    let file = fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)
        .map_err(|e| {
            DriverError::HugePageAllocFailed(format!(
                "open {path} (is /mnt/huge mounted as hugetlbfs?): {e}"
            ))
        })?;

    file.set_len(size as u64).map_err(|e| {
        DriverError::HugePageAllocFailed(format!("truncate {path} to {size}: {e}"))
    })?;

    let virt = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED | libc::MAP_HUGETLB,
            file.as_raw_fd(),
            0,
        )
    };
    if virt == libc::MAP_FAILED {
        return Err(DriverError::HugePageAllocFailed(format!(
            "mmap {path}: {} (enough free huge pages?)",
            std::io::Error::last_os_error()
        )));
    }
    let virt = virt as *mut u8;

    if unsafe { libc::mlock(virt as *mut libc::c_void, size) } != 0 {
        return Err(DriverError::PinFailed(format!(
            "{}",
            std::io::Error::last_os_error()
        )));
    }

    // the mapping outlives the directory entry; unlink immediately so
    // the hugetlbfs page is reclaimed automatically when it dies.
    drop(file);
    let _ = fs::remove_file(&path);

    if policy == AddressSpace::IoVirtual {
        let iommu = iommu.expect("IoVirtual policy requires an IOMMU container");
        for offset in (0..size).step_by(HUGE_PAGE_SIZE) {
            let page_virt = unsafe { virt.add(offset) } as usize;
            iommu.map_dma(page_virt, page_virt, HUGE_PAGE_SIZE)?;
        }
    }

    let bus = match policy {
        AddressSpace::Physical => virt_to_phys(virt as usize)?,
        AddressSpace::IoVirtual => virt as usize,
    };

    Ok(DmaMemory { virt, bus, size })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_is_idempotent_on_exact_multiples() {
        assert_eq!(round_up_to_huge_page(HUGE_PAGE_SIZE), HUGE_PAGE_SIZE);
        assert_eq!(round_up_to_huge_page(2 * HUGE_PAGE_SIZE), 2 * HUGE_PAGE_SIZE);
    }

    #[test]
    fn rounding_rounds_up_partial_pages() {
        assert_eq!(round_up_to_huge_page(1), HUGE_PAGE_SIZE);
        assert_eq!(
            round_up_to_huge_page(HUGE_PAGE_SIZE + 1),
            2 * HUGE_PAGE_SIZE
        );
    }

    #[test]
    fn contiguity_guard_rejects_more_than_one_huge_page() {
        let rounded = round_up_to_huge_page(HUGE_PAGE_SIZE + 1);
        match check_contiguous(rounded, true) {
            Err(DriverError::ContiguityUnavailable { .. }) => {}
            other => panic!("expected ContiguityUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn contiguity_guard_accepts_single_huge_page() {
        assert!(check_contiguous(HUGE_PAGE_SIZE, true).is_ok());
    }
}
