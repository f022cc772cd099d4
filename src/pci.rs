//! sysfs helpers shared by the direct-PCI bind path (C4.1): unbinding
//! the kernel driver, enabling bus mastering, and mapping a PCI
//! resource file.

use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;

use crate::error::{DriverError, Result};

const COMMAND_REGISTER_OFFSET: u64 = 4;
const BUS_MASTER_ENABLE_BIT: u16 = 1 << 2;

fn sysfs_device_dir(pci_addr: &str) -> String {
    format!("/sys/bus/pci/devices/{pci_addr}")
}

/// Fails with `NoDevice` unless `/sys/bus/pci/devices/<addr>/` exists.
pub fn require_device_exists(pci_addr: &str) -> Result<()> {
    if fs::metadata(sysfs_device_dir(pci_addr)).is_err() {
        return Err(DriverError::NoDevice(pci_addr.to_string()));
    }
    Ok(())
}

/// Writes `pci_addr` into `.../driver/unbind`. Best-effort: a missing
/// file means the device was never bound to a kernel driver, which is
/// not an error.
pub fn unbind_driver(pci_addr: &str) -> Result<()> {
    require_device_exists(pci_addr)?;
    let path = format!("{}/driver/unbind", sysfs_device_dir(pci_addr));
    match fs::OpenOptions::new().write(true).open(&path) {
        Ok(mut f) => {
            f.write_all(pci_addr.as_bytes())?;
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Sets bit 2 (bus master enable) of the 16-bit PCIe command register at
/// offset 4 of `.../config`.
pub fn enable_bus_master(pci_addr: &str) -> Result<()> {
    let path = format!("{}/config", sysfs_device_dir(pci_addr));
    let mut config = fs::OpenOptions::new().read(true).write(true).open(&path)?;

    config.seek(SeekFrom::Start(COMMAND_REGISTER_OFFSET))?;
    let mut buf = [0u8; 2];
    config.read_exact(&mut buf)?;
    let mut command = u16::from_ne_bytes(buf);

    command |= BUS_MASTER_ENABLE_BIT;

    config.seek(SeekFrom::Start(COMMAND_REGISTER_OFFSET))?;
    config.write_all(&command.to_ne_bytes())?;
    Ok(())
}

/// A memory-mapped PCI resource file (typically BAR0). Never unmapped;
/// its lifetime is the process's.
pub struct MmapRegion {
    pub addr: *mut u8,
    pub len: usize,
}

unsafe impl Send for MmapRegion {}
unsafe impl Sync for MmapRegion {}

/// Opens and fully memory-maps `.../<resource_name>` (e.g. `resource0`)
/// read/write, shared.
pub fn pci_open_resource(pci_addr: &str, resource_name: &str) -> Result<MmapRegion> {
    let path = format!("{}/{resource_name}", sysfs_device_dir(pci_addr));
    let file = fs::OpenOptions::new().read(true).write(true).open(&path)?;
    let len = file.metadata()?.len() as usize;

    let addr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            file.as_raw_fd(),
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(DriverError::BarMapFailed(format!(
            "mmap {path}: {}",
            std::io::Error::last_os_error()
        )));
    }

    Ok(MmapRegion {
        addr: addr as *mut u8,
        len,
    })
}

/// Parses the trailing decimal component of the `iommu_group` symlink
/// target (e.g. `../../../kernel/iommu_groups/12` -> `12`).
pub fn read_iommu_group(pci_addr: &str) -> Result<u32> {
    let path = format!("{}/iommu_group", sysfs_device_dir(pci_addr));
    let link = fs::read_link(&path).map_err(|_| DriverError::NoIommuGroup(pci_addr.to_string()))?;
    let leaf = link
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| DriverError::NoIommuGroup(pci_addr.to_string()))?;
    leaf.parse::<u32>()
        .map_err(|_| DriverError::NoIommuGroup(pci_addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_reports_no_device() {
        match require_device_exists("0000:ff:1f.7") {
            Err(DriverError::NoDevice(addr)) => assert_eq!(addr, "0000:ff:1f.7"),
            other => panic!("expected NoDevice, got {other:?}"),
        }
    }

    #[test]
    fn unknown_device_reports_no_iommu_group() {
        match read_iommu_group("0000:ff:1f.7") {
            Err(DriverError::NoIommuGroup(_)) => {}
            other => panic!("expected NoIommuGroup, got {other:?}"),
        }
    }
}
