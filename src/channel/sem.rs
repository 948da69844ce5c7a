// src/channel/sem.rs

//! POSIX named semaphores over raw `libc` FFI.
//!
//! The channel uses two of these: a binary mutex guarding the Work Entry
//! and a counting doorbell. Every wait variant retries `EINTR` and the
//! bounded waits report expiry as a distinct `Ok` outcome rather than an
//! error, because "nobody posted in time" is an expected protocol state.

use log::trace;
use std::ffi::CString;
use std::io;

/// Converts a `-1` libc return into the thread's errno as `io::Error`.
fn check(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Reads `CLOCK_REALTIME` (the clock `sem_timedwait` is specified
/// against).
pub fn now_realtime() -> io::Result<libc::timespec> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    check(unsafe { libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts) })?;
    Ok(ts)
}

/// Absolute deadline `ms` milliseconds past `now` (read internally when
/// `None`).
pub fn deadline_after_ms(now: Option<&libc::timespec>, ms: u32) -> io::Result<libc::timespec> {
    let base = match now {
        Some(ts) => *ts,
        None => now_realtime()?,
    };
    let mut deadline = libc::timespec {
        tv_sec: base.tv_sec + (ms / 1000) as libc::time_t,
        tv_nsec: base.tv_nsec + (ms % 1000) as libc::c_long * 1_000_000,
    };
    if deadline.tv_nsec >= 1_000_000_000 {
        deadline.tv_sec += 1;
        deadline.tv_nsec -= 1_000_000_000;
    }
    Ok(deadline)
}

/// One named semaphore handle. Dropping closes the handle; the name stays
/// in the system namespace until [`NamedSemaphore::unlink`].
#[derive(Debug)]
pub struct NamedSemaphore {
    sem: *mut libc::sem_t,
    name: String,
}

// sem_t operations are process- and thread-safe; the raw pointer is just a
// handle into the kernel object.
unsafe impl Send for NamedSemaphore {}
unsafe impl Sync for NamedSemaphore {}

impl NamedSemaphore {
    /// Creates (or opens, if it already exists) the semaphore `name` with
    /// `initial` as the count for the created case.
    pub fn create(name: &str, initial: u32) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let sem = unsafe {
            libc::sem_open(
                cname.as_ptr(),
                libc::O_RDWR | libc::O_CREAT,
                0o666 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        trace!("created semaphore {} (initial {})", name, initial);
        Ok(NamedSemaphore {
            sem,
            name: name.to_string(),
        })
    }

    /// Opens an existing semaphore; `ENOENT` means no daemon has created
    /// the channel.
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let sem = unsafe { libc::sem_open(cname.as_ptr(), libc::O_RDWR) };
        if sem == libc::SEM_FAILED {
            return Err(io::Error::last_os_error());
        }
        trace!("opened semaphore {}", name);
        Ok(NamedSemaphore {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw handle, for async-signal-safe posting from a signal
    /// handler.
    pub fn raw(&self) -> *mut libc::sem_t {
        self.sem
    }

    pub fn post(&self) -> io::Result<()> {
        check(unsafe { libc::sem_post(self.sem) })
    }

    /// Blocks until the count can be decremented. Retries `EINTR`.
    pub fn wait(&self) -> io::Result<()> {
        loop {
            if unsafe { libc::sem_wait(self.sem) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                return Err(err);
            }
        }
    }

    /// Non-blocking decrement; `Ok(false)` when the count is zero.
    pub fn try_wait(&self) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_trywait(self.sem) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Waits until the absolute `deadline`; `Ok(false)` on expiry.
    pub fn wait_deadline(&self, deadline: &libc::timespec) -> io::Result<bool> {
        loop {
            if unsafe { libc::sem_timedwait(self.sem, deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(err),
            }
        }
    }

    /// Waits at most `ms` milliseconds from now; `Ok(false)` on expiry.
    pub fn wait_timeout_ms(&self, ms: u32) -> io::Result<bool> {
        let deadline = deadline_after_ms(None, ms)?;
        self.wait_deadline(&deadline)
    }

    /// Counts the semaphore down to zero, discarding pending posts. Used
    /// to flush stale signals left by crashed peers.
    pub fn drain(&self) -> io::Result<()> {
        while self.try_wait()? {}
        Ok(())
    }

    /// Removes `name` from the system namespace. Missing names are fine
    /// (an earlier teardown may have won the race).
    pub fn unlink(name: &str) -> io::Result<()> {
        let cname = CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        match check(unsafe { libc::sem_unlink(cname.as_ptr()) }) {
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }
}

impl Drop for NamedSemaphore {
    fn drop(&mut self) {
        if unsafe { libc::sem_close(self.sem) } == -1 {
            trace!(
                "sem_close({}) failed: {}",
                self.name,
                io::Error::last_os_error()
            );
        }
    }
}
