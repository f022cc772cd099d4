//! IOMMU container (C3): process-wide singleton managing a VFIO
//! container and its Type-1 IOMMU programming.
//!
//! State machine (spec.md §4.4):
//! ```text
//! UNINITIALIZED --open--> OPEN_NO_GROUP --attach--> OPEN_WITH_GROUP --set_iommu--> CONFIGURED
//!                                                          |
//!                                                          +--attach (additional groups)--> CONFIGURED
//! ```

use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};

use crate::error::{DriverError, Result};

/* grabbed from linux/vfio.h */
const VFIO_GET_API_VERSION: libc::c_ulong = 15204;
const VFIO_CHECK_EXTENSION: libc::c_ulong = 15205;
const VFIO_SET_IOMMU: libc::c_ulong = 15206;
const VFIO_GROUP_SET_CONTAINER: libc::c_ulong = 15208;
const VFIO_IOMMU_MAP_DMA: libc::c_ulong = 15217;
const VFIO_IOMMU_UNMAP_DMA: libc::c_ulong = 15218;

const VFIO_API_VERSION: i32 = 0;
const VFIO_TYPE1_IOMMU: libc::c_ulong = 1;
pub(crate) const VFIO_GROUP_FLAGS_VIABLE: u32 = 1;
pub(crate) const VFIO_PCI_CONFIG_REGION_INDEX: u32 = 7;
pub(crate) const VFIO_PCI_BAR0_REGION_INDEX: u32 = 0;
const VFIO_DMA_MAP_FLAG_READ: u32 = 1;
const VFIO_DMA_MAP_FLAG_WRITE: u32 = 2;

#[repr(C)]
pub(crate) struct VfioGroupStatus {
    pub argsz: u32,
    pub flags: u32,
}

#[repr(C)]
pub(crate) struct VfioRegionInfo {
    pub argsz: u32,
    pub flags: u32,
    pub index: u32,
    pub cap_offset: u32,
    pub size: u64,
    pub offset: u64,
}

#[repr(C)]
struct VfioIommuType1DmaMap {
    argsz: u32,
    flags: u32,
    vaddr: u64,
    iova: u64,
    size: u64,
}

#[repr(C)]
struct VfioIommuType1DmaUnmap {
    argsz: u32,
    flags: u32,
    iova: u64,
    size: u64,
}

/// Generic "first caller creates, later callers reuse" cell, used both by
/// the real container singleton and by unit tests for the bare pattern.
struct Registry<T> {
    cell: Mutex<Option<T>>,
}

impl<T: Clone> Registry<T> {
    const fn new() -> Self {
        Registry {
            cell: Mutex::new(None),
        }
    }

    /// Returns the existing value and `false`, or calls `create`, stores
    /// its result, and returns it with `true`.
    fn get_or_create<E>(&self, create: impl FnOnce() -> std::result::Result<T, E>) -> std::result::Result<(T, bool), E> {
        let mut guard = self.cell.lock().unwrap();
        if let Some(v) = &*guard {
            return Ok((v.clone(), false));
        }
        let v = create()?;
        *guard = Some(v.clone());
        Ok((v, true))
    }
}

/// Process-wide IOMMU container. At most one exists per process; reused
/// across every vfio device bind.
pub struct IommuContainer {
    container_fd: RawFd,
    configured: Mutex<bool>,
}

static REGISTRY: Registry<RawFd> = Registry::new();
static CONTAINER: OnceLock<Mutex<Option<std::sync::Arc<IommuContainer>>>> = OnceLock::new();

impl IommuContainer {
    /// Returns the process-wide container, opening `/dev/vfio/vfio` and
    /// verifying the API on first call. The bool is `true` iff this call
    /// created the container (the caller must then, and only then,
    /// program Type-1 IOMMU after attaching its first group).
    pub fn global() -> Result<(std::sync::Arc<IommuContainer>, bool)> {
        let lock = CONTAINER.get_or_init(|| Mutex::new(None));
        let mut guard = lock.lock().unwrap();
        if let Some(existing) = &*guard {
            return Ok((existing.clone(), false));
        }

        let (fd, _) = REGISTRY.get_or_create(open_container)?;
        let container = std::sync::Arc::new(IommuContainer {
            container_fd: fd,
            configured: Mutex::new(false),
        });
        *guard = Some(container.clone());
        Ok((container, true))
    }

    pub fn fd(&self) -> RawFd {
        self.container_fd
    }

    /// Attaches a group descriptor to this container (`VFIO_GROUP_SET_CONTAINER`).
    /// Legal from `OPEN_NO_GROUP`; additional groups may attach silently
    /// once the container is `CONFIGURED`.
    pub fn attach_group(&self, group_fd: RawFd) -> Result<()> {
        let ret = unsafe {
            libc::ioctl(
                group_fd,
                VFIO_GROUP_SET_CONTAINER,
                &self.container_fd as *const RawFd,
            )
        };
        if ret != 0 {
            return Err(DriverError::ContainerOpenFailed(format!(
                "VFIO_GROUP_SET_CONTAINER: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Programs Type-1 IOMMU. Legal only once per container (from
    /// `OPEN_WITH_GROUP`); re-programming is a logic error, not an
    /// environmental failure, so it panics rather than returning `Err`.
    pub fn set_iommu_type1(&self) -> Result<()> {
        let mut configured = self.configured.lock().unwrap();
        assert!(!*configured, "IOMMU type already programmed for this container");

        let ret = unsafe { libc::ioctl(self.container_fd, VFIO_SET_IOMMU, VFIO_TYPE1_IOMMU) };
        if ret != 0 {
            return Err(DriverError::ContainerTypeUnsupported);
        }
        *configured = true;
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        *self.configured.lock().unwrap()
    }

    /// `VFIO_IOMMU_MAP_DMA` with R/W flags. Effective size is
    /// `max(size, PAGE_SIZE)`.
    pub fn map_dma(&self, virt: usize, iova: usize, size: usize) -> Result<()> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let effective_size = size.max(page_size);

        let mut dma_map = VfioIommuType1DmaMap {
            argsz: std::mem::size_of::<VfioIommuType1DmaMap>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            vaddr: virt as u64,
            iova: iova as u64,
            size: effective_size as u64,
        };
        let ret = unsafe { libc::ioctl(self.container_fd, VFIO_IOMMU_MAP_DMA, &mut dma_map) };
        if ret != 0 {
            return Err(DriverError::MapFailed(format!(
                "{}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// `VFIO_IOMMU_UNMAP_DMA`, the symmetric counterpart of [`map_dma`].
    pub fn unmap_dma(&self, iova: usize, size: usize) -> Result<()> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let effective_size = size.max(page_size);

        let mut dma_unmap = VfioIommuType1DmaUnmap {
            argsz: std::mem::size_of::<VfioIommuType1DmaUnmap>() as u32,
            flags: VFIO_DMA_MAP_FLAG_READ | VFIO_DMA_MAP_FLAG_WRITE,
            iova: iova as u64,
            size: effective_size as u64,
        };
        let ret = unsafe { libc::ioctl(self.container_fd, VFIO_IOMMU_UNMAP_DMA, &mut dma_unmap) };
        if ret != 0 {
            return Err(DriverError::UnmapFailed(format!(
                "{}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }
}

fn open_container() -> Result<RawFd> {
    let fd = unsafe { libc::open(c"/dev/vfio/vfio".as_ptr(), libc::O_RDWR) };
    if fd < 0 {
        return Err(DriverError::ContainerOpenFailed(format!(
            "open /dev/vfio/vfio: {}",
            std::io::Error::last_os_error()
        )));
    }

    let version = unsafe { libc::ioctl(fd, VFIO_GET_API_VERSION) };
    if version != VFIO_API_VERSION {
        return Err(DriverError::ContainerApiMismatch {
            expected: VFIO_API_VERSION,
            got: version,
        });
    }

    let supports_type1 = unsafe { libc::ioctl(fd, VFIO_CHECK_EXTENSION, VFIO_TYPE1_IOMMU) };
    if supports_type1 != 1 {
        return Err(DriverError::ContainerTypeUnsupported);
    }

    Ok(fd)
}

/// Group viability per `VFIO_GROUP_GET_STATUS`: every device in the
/// group must be bound to the vfio driver.
///
/// The original C and an early Rust port both test this with
/// `!flags & VFIO_GROUP_FLAGS_VIABLE`, which due to operator precedence
/// always evaluates to 0 (`!flags` binds before `&`) and so never
/// actually rejects a non-viable group. The correct test is
/// `(flags & VFIO_GROUP_FLAGS_VIABLE) == 0`.
pub(crate) fn group_is_viable(flags: u32) -> bool {
    (flags & VFIO_GROUP_FLAGS_VIABLE) != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn viability_check_uses_correct_precedence() {
        assert!(!group_is_viable(0));
        assert!(group_is_viable(VFIO_GROUP_FLAGS_VIABLE));
        assert!(group_is_viable(VFIO_GROUP_FLAGS_VIABLE | 0b10));
    }

    #[test]
    fn registry_reuses_value_and_reports_creation_once() {
        let registry: Registry<u32> = Registry::new();
        let calls = std::sync::atomic::AtomicU32::new(0);

        let (v1, created1) = registry
            .get_or_create(|| -> std::result::Result<u32, ()> {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(42)
            })
            .unwrap();
        assert_eq!(v1, 42);
        assert!(created1);

        let (v2, created2) = registry
            .get_or_create(|| -> std::result::Result<u32, ()> {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                Ok(99)
            })
            .unwrap();
        assert_eq!(v2, 42, "second call must observe the first value");
        assert!(!created2);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
