// src/channel/shm.rs

//! POSIX shared-memory segments over raw `libc` FFI.
//!
//! The daemon creates and sizes the segment; clients open it read-write
//! and learn its size from `fstat`. The mapping lives for the life of the
//! handle; `Drop` unmaps and closes but never unlinks. Removing the name
//! is the daemon's teardown decision.

use log::trace;
use std::ffi::CString;
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

/// A mapped POSIX shared-memory object.
#[derive(Debug)]
pub struct SharedMemory {
    fd: RawFd,
    ptr: *mut libc::c_void,
    len: usize,
    name: String,
}

// The mapping is plain memory; concurrent access is governed by the
// channel's mutex semaphore, not by this handle.
unsafe impl Send for SharedMemory {}

fn shm_name(name: &str) -> io::Result<CString> {
    CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))
}

impl SharedMemory {
    /// Creates (or reuses) the object `name` and sizes it to exactly
    /// `len` bytes.
    pub fn create(name: &str, len: usize) -> io::Result<Self> {
        let cname = shm_name(name)?;
        let fd = unsafe {
            libc::shm_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o666 as libc::mode_t,
            )
        };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        if unsafe { libc::ftruncate(fd, len as libc::off_t) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        trace!("created shm object {} ({} bytes)", name, len);
        Self::map(fd, len, name)
    }

    /// Opens the existing object `name`; the mapping spans whatever size
    /// its creator gave it. `ENOENT` means no daemon is running.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = shm_name(name)?;
        let fd = unsafe { libc::shm_open(cname.as_ptr(), libc::O_RDWR, 0o666 as libc::mode_t) };
        if fd == -1 {
            return Err(io::Error::last_os_error());
        }
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(fd, &mut stat) } == -1 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        let len = stat.st_size as usize;
        trace!("opened shm object {} ({} bytes)", name, len);
        Self::map(fd, len, name)
    }

    fn map(fd: RawFd, len: usize, name: &str) -> io::Result<Self> {
        if len == 0 {
            unsafe { libc::close(fd) };
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "shared memory object has zero size",
            ));
        }
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                fd,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(err);
        }
        Ok(SharedMemory {
            fd,
            ptr,
            len,
            name: name.to_string(),
        })
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Removes `name` from the system namespace. Missing names are fine.
    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = shm_name(name)?;
        if unsafe { libc::shm_unlink(cname.as_ptr()) } == -1 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ENOENT) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        unsafe {
            if libc::munmap(self.ptr, self.len) == -1 {
                trace!(
                    "munmap({}) failed: {}",
                    self.name,
                    io::Error::last_os_error()
                );
            }
            libc::close(self.fd);
        }
    }
}
