use std::fmt;
use std::io;

/// Closed error taxonomy for the driver core.
///
/// Every variant here is either an init-path error (fatal: the process
/// cannot proceed with partial hardware init, so callers are expected to
/// abort) or the single hot-path error (`PoolExhausted`, which is not
/// fatal and is surfaced as a reduced count rather than a `Result`
/// anywhere on the packet path).
#[derive(Debug)]
pub enum DriverError {
    /// PCI address does not exist under sysfs.
    NoDevice(String),
    /// `iommu_group` symlink missing or unparseable (vfio mode only).
    NoIommuGroup(String),
    ContainerOpenFailed(String),
    ContainerApiMismatch { expected: i32, got: i32 },
    ContainerTypeUnsupported,
    /// Some sibling device in the group is still bound to a kernel driver.
    GroupNotViable,
    BarMapFailed(String),
    HugePageAllocFailed(String),
    PinFailed(String),
    /// Caller asked for more than one huge page contiguous.
    ContiguityUnavailable { requested: usize, huge_page_size: usize },
    /// Entry size does not divide the huge page size.
    BadEntrySize { entry_size: usize, huge_page_size: usize },
    /// pagemap gave a zero PFN: the page was never faulted.
    NoMapping,
    MapFailed(String),
    UnmapFailed(String),
    Io(io::Error),
}

impl fmt::Display for DriverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverError::NoDevice(addr) => write!(f, "no such PCI device: {addr}"),
            DriverError::NoIommuGroup(addr) => {
                write!(f, "no iommu_group for device {addr}")
            }
            DriverError::ContainerOpenFailed(msg) => {
                write!(f, "failed to open vfio container: {msg}")
            }
            DriverError::ContainerApiMismatch { expected, got } => write!(
                f,
                "vfio API version mismatch: expected {expected}, got {got}"
            ),
            DriverError::ContainerTypeUnsupported => {
                write!(f, "vfio container does not support Type-1 IOMMU")
            }
            DriverError::GroupNotViable => write!(
                f,
                "vfio group not viable: a sibling device is not bound to vfio"
            ),
            DriverError::BarMapFailed(msg) => write!(f, "failed to map BAR0: {msg}"),
            DriverError::HugePageAllocFailed(msg) => {
                write!(f, "huge page allocation failed: {msg}")
            }
            DriverError::PinFailed(msg) => write!(f, "failed to pin DMA memory: {msg}"),
            DriverError::ContiguityUnavailable {
                requested,
                huge_page_size,
            } => write!(
                f,
                "cannot satisfy contiguous allocation of {requested} bytes (> one huge page of {huge_page_size} bytes)"
            ),
            DriverError::BadEntrySize {
                entry_size,
                huge_page_size,
            } => write!(
                f,
                "entry size {entry_size} does not divide huge page size {huge_page_size}"
            ),
            DriverError::NoMapping => write!(f, "pagemap reported no mapping for address"),
            DriverError::MapFailed(msg) => write!(f, "VFIO_IOMMU_MAP_DMA failed: {msg}"),
            DriverError::UnmapFailed(msg) => write!(f, "VFIO_IOMMU_UNMAP_DMA failed: {msg}"),
            DriverError::Io(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for DriverError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            DriverError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for DriverError {
    fn from(e: io::Error) -> Self {
        DriverError::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, DriverError>;
