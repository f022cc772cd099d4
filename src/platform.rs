//! Platform primitives (C1): virtual-to-physical translation, the
//! monotonic clock, and errno-checked syscall wrappers.

use std::fs;
use std::io::{self, Read, Seek, SeekFrom};
use std::mem;

use crate::error::{DriverError, Result};

/// Translates a virtual address to its physical counterpart via
/// `/proc/self/pagemap`.
///
/// Opens the pagemap, seeks to `addr / page_size * 8`, reads 8 bytes,
/// keeps the low 55 bits as the page frame number, multiplies by the page
/// size and adds the in-page offset. Fails with `NoMapping` if the PFN
/// reads as zero (the page was never faulted in).
pub fn virt_to_phys(addr: usize) -> Result<usize> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;

    let mut file = fs::OpenOptions::new()
        .read(true)
        .open("/proc/self/pagemap")?;

    file.seek(SeekFrom::Start(
        (addr / page_size * mem::size_of::<u64>()) as u64,
    ))?;

    let mut buf = [0u8; mem::size_of::<u64>()];
    file.read_exact(&mut buf)?;
    let entry = u64::from_ne_bytes(buf);

    let pfn = entry & 0x007f_ffff_ffff_ffff;
    if pfn == 0 {
        return Err(DriverError::NoMapping);
    }

    Ok(pfn as usize * page_size + addr % page_size)
}

/// Current time in nanoseconds, from `CLOCK_MONOTONIC`.
pub fn monotonic_now() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let ret = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if ret < 0 {
        fatal_errno("clock_gettime(CLOCK_MONOTONIC)");
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}

/// Aborts the process with a descriptive message naming the failed call.
///
/// All syscalls in the init path are wrapped so a negative return
/// triggers this rather than propagating a bare errno.
pub fn fatal_errno(call_site: &str) -> ! {
    let err = io::Error::last_os_error();
    panic!("{call_site} failed: {err}");
}

/// Runs `f`, treating a negative `libc::c_int` return as a fatal error
/// carrying `call_site` in the message.
pub fn check_errno(call_site: &str, ret: libc::c_int) -> libc::c_int {
    if ret < 0 {
        fatal_errno(call_site);
    }
    ret
}

/// Like [`check_errno`] but for syscalls that return `isize` (e.g. `read`).
pub fn check_errno_isize(call_site: &str, ret: isize) -> isize {
    if ret < 0 {
        fatal_errno(call_site);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn virt_to_phys_unfaulted_page_reports_no_mapping() {
        // A page far out in the address space that was never touched has
        // a zero pagemap entry, which must surface as NoMapping rather
        // than a bogus physical address.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let addr = page_size * 1_000_000_000;
        match virt_to_phys(addr) {
            Err(DriverError::NoMapping) => {}
            other => panic!("expected NoMapping, got {other:?}"),
        }
    }

    #[test]
    fn monotonic_now_is_nondecreasing() {
        let a = monotonic_now();
        let b = monotonic_now();
        assert!(b >= a);
    }
}
