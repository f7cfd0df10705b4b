// Copyright (c) Task isolation developers.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Shared byte regions backing the ring channels.
//!
//! The manager creates one POSIX shared-memory object per isolation CPU,
//! holding the two per-direction areas back to back, so foreign-process
//! workers can map the same bytes by name. Tests use process-private
//! regions instead.

use anyhow::bail;
use anyhow::Context;
use anyhow::Result;
use std::ffi::CString;
use std::sync::atomic::AtomicU8;
use std::sync::Arc;

/// Size of one ring area, a multiple of the block size.
pub const AREA_SIZE: usize = 4096;

/// Name of the shared-memory object holding both areas for a CPU.
pub fn area_name(cpu: usize) -> String {
    format!("/isol_server_CPU{cpu}")
}

struct Backing {
    base: *mut u8,
    len: usize,
    mapped: bool,
}

unsafe impl Send for Backing {}
unsafe impl Sync for Backing {}

impl Drop for Backing {
    fn drop(&mut self) {
        unsafe {
            if self.mapped {
                libc::munmap(self.base as *mut libc::c_void, self.len);
            } else {
                drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(
                    self.base, self.len,
                )));
            }
        }
    }
}

/// One contiguous shared byte area. Clones share the same bytes; each
/// clone carries only the view, the backing mapping lives as long as any
/// clone does.
#[derive(Clone)]
pub struct SharedRegion {
    backing: Arc<Backing>,
    offset: usize,
    len: usize,
}

impl SharedRegion {
    /// The region bytes as atomics. Both sides of a channel access the
    /// shared area exclusively through this view.
    pub fn bytes(&self) -> &[AtomicU8] {
        unsafe {
            std::slice::from_raw_parts(
                self.backing.base.add(self.offset) as *const AtomicU8,
                self.len,
            )
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn split(backing: Backing, areas: usize, area_size: usize) -> Vec<SharedRegion> {
        let backing = Arc::new(backing);
        (0..areas)
            .map(|i| SharedRegion {
                backing: backing.clone(),
                offset: i * area_size,
                len: area_size,
            })
            .collect()
    }

    /// Create a fresh shared-memory object of `areas` areas and map it.
    /// An existing object with the same name is replaced.
    pub fn create_shm(name: &str, areas: usize, area_size: usize) -> Result<Vec<SharedRegion>> {
        let cname = CString::new(name).context("shm name contains NUL")?;
        unsafe { libc::shm_unlink(cname.as_ptr()) };
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT | libc::O_TRUNC,
                0o600,
            )
        };
        if fd < 0 {
            bail!(
                "shm_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        let len = areas * area_size;
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } < 0 {
            let err = std::io::Error::last_os_error();
            unsafe { libc::close(fd) };
            bail!("ftruncate({}) failed: {}", name, err);
        }
        Self::map_fd(fd, name, areas, area_size)
    }

    /// Map an existing shared-memory object created by a manager in
    /// another process.
    pub fn open_shm(name: &str, areas: usize, area_size: usize) -> Result<Vec<SharedRegion>> {
        let cname = CString::new(name).context("shm name contains NUL")?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o600) };
        if fd < 0 {
            bail!(
                "shm_open({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        Self::map_fd(fd, name, areas, area_size)
    }

    fn map_fd(fd: libc::c_int, name: &str, areas: usize, area_size: usize) -> Result<Vec<SharedRegion>> {
        let len = areas * area_size;
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        unsafe { libc::close(fd) };
        if base == libc::MAP_FAILED {
            bail!(
                "mmap({}) failed: {}",
                name,
                std::io::Error::last_os_error()
            );
        }
        Ok(Self::split(
            Backing {
                base: base as *mut u8,
                len,
                mapped: true,
            },
            areas,
            area_size,
        ))
    }

    /// Remove a shared-memory object by name.
    pub fn unlink_shm(name: &str) {
        if let Ok(cname) = CString::new(name) {
            unsafe { libc::shm_unlink(cname.as_ptr()) };
        }
    }

    /// Process-private zeroed region, for channels between threads of one
    /// process and for tests.
    pub fn private(len: usize) -> SharedRegion {
        let buf = vec![0u8; len].into_boxed_slice();
        let base = Box::into_raw(buf) as *mut u8;
        Self::split(
            Backing {
                base,
                len,
                mapped: false,
            },
            1,
            len,
        )
        .remove(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_private_region_shared_views() {
        let a = SharedRegion::private(64);
        let b = a.clone();
        a.bytes()[5].store(0x7f, Ordering::SeqCst);
        assert_eq!(b.bytes()[5].load(Ordering::SeqCst), 0x7f);
        assert_eq!(b.bytes()[6].load(Ordering::SeqCst), 0);
    }
}
