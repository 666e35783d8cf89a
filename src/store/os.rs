//! Narrow OS capability layer: page locking, access advice, disk and memory
//! sizing. Unix goes through `libc`; other targets get no-op fallbacks.

use std::path::Path;

#[cfg(unix)]
use std::ffi::CString;
#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

/// Pin `len` bytes at `ptr` in physical memory.
pub(crate) fn mlock(ptr: *const u8, len: usize) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: mlock only inspects the address range; callers pass a live mapping.
        let rc = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        Ok(())
    }
}

pub(crate) fn munlock(ptr: *const u8, len: usize) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: see `mlock`.
        let rc = unsafe { libc::munlock(ptr as *const libc::c_void, len) };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        Ok(())
    }
}

/// Hint that the range will be read soon.
pub(crate) fn advise_will_need(ptr: *const u8, len: usize) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        // SAFETY: madvise does not dereference; the range lies inside a live mapping.
        let rc = unsafe {
            libc::madvise(ptr as *mut libc::c_void, len, libc::MADV_WILLNEED)
        };
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
        Ok(())
    }
    #[cfg(not(unix))]
    {
        let _ = (ptr, len);
        Ok(())
    }
}

/// Fraction of the filesystem holding `path` that is in use, in `[0, 1]`.
/// Returns `None` when the path does not exist or the call is unsupported.
pub(crate) fn disk_usage_ratio(path: &Path) -> Option<f64> {
    #[cfg(unix)]
    {
        let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is NUL terminated and stat is a valid out pointer.
        let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stat) };
        if rc != 0 {
            return None;
        }
        let total = stat.f_blocks as f64 * stat.f_frsize as f64;
        if total <= 0.0 {
            return None;
        }
        let free = stat.f_bfree as f64 * stat.f_frsize as f64;
        Some(((total - free) / total).clamp(0.0, 1.0))
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        None
    }
}

/// Installed physical memory in bytes, or a conservative 8GB guess.
pub(crate) fn total_physical_memory() -> u64 {
    const FALLBACK: u64 = 8 * 1024 * 1024 * 1024;
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions.
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if pages > 0 && page_size > 0 {
            return pages as u64 * page_size as u64;
        }
        FALLBACK
    }
    #[cfg(not(unix))]
    {
        FALLBACK
    }
}
