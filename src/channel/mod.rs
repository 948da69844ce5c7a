// src/channel/mod.rs

//! The shared communication channel: one POSIX shared-memory segment plus
//! two named semaphores forming a single-slot mailbox.
//!
//! The daemon side creates and owns the global names; any number of
//! clients attach to them. A binary mutex guards the [`WorkEntry`] at the
//! start of the segment, and a counting doorbell tells the daemon a new
//! request is ready. Both sides drain their semaphores to a known state
//! on startup so stale posts from crashed peers cannot wedge the
//! protocol.
//!
//! The segment view (entry pointer, pixel offset and length) is computed
//! and bounds-checked exactly once, at creation/attach; everything after
//! that goes through guard types that hold the mutex.

pub mod entry;
pub mod sem;
pub mod shm;

#[cfg(test)]
mod tests;

use crate::config::ChannelConfig;
use crate::error::ChannelError;
use entry::WorkEntry;
use log::{debug, info, warn};
use sem::NamedSemaphore;
use shm::SharedMemory;
use std::io;

fn mutex_name(prefix: &str) -> String {
    format!("{}-mutex", prefix)
}

fn doorbell_name(prefix: &str) -> String {
    format!("{}-doorbell", prefix)
}

fn segment_name(prefix: &str) -> String {
    format!("{}-shm", prefix)
}

/// Maps attach-time I/O failures: a missing name means no daemon created
/// the channel, which callers must be able to distinguish.
fn attach_error(e: io::Error) -> ChannelError {
    if e.raw_os_error() == Some(libc::ENOENT) {
        ChannelError::NotConnected
    } else {
        ChannelError::Communication(e)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Daemon,
    Client,
}

/// One side of the shared channel.
///
/// Dropping a daemon-side channel unlinks the global names (no process
/// can re-attach to a stale channel); dropping a client side only closes
/// local handles.
#[derive(Debug)]
pub struct Channel {
    role: Role,
    prefix: String,
    mutex: NamedSemaphore,
    doorbell: NamedSemaphore,
    shm: SharedMemory,
    entry: *mut WorkEntry,
    pixels: *mut u8,
    pixel_len: usize,
    width: u32,
    height: u32,
    client_timeout_ms: u32,
}

// Access to the shared segment is serialized by the mutex semaphore; the
// handle itself can move between threads.
unsafe impl Send for Channel {}

impl Channel {
    /// Creates the daemon side: allocates the segment, resets both
    /// semaphores to a known state and writes the initial header.
    ///
    /// A leftover mutex from an improperly terminated daemon is taken
    /// over after `recreate_timeout_ms`; creation never deadlocks on a
    /// dead peer.
    pub fn create_daemon(
        config: &ChannelConfig,
        width: u32,
        height: u32,
    ) -> Result<Channel, ChannelError> {
        if width == 0 || height == 0 {
            return Err(ChannelError::Configuration(format!(
                "display dimensions {}x{} are degenerate",
                width, height
            )));
        }

        let mutex = NamedSemaphore::create(&mutex_name(&config.name_prefix), 1)?;
        let doorbell = NamedSemaphore::create(&doorbell_name(&config.name_prefix), 0)?;

        if !mutex.wait_timeout_ms(config.recreate_timeout_ms)? {
            warn!(
                "channel mutex still held after {} ms; treating the previous holder as dead",
                config.recreate_timeout_ms
            );
        }
        // Down to zero no matter how many stale posts piled up.
        mutex.drain()?;

        let segment_len = WorkEntry::segment_len(width, height);
        let shm = SharedMemory::create(&segment_name(&config.name_prefix), segment_len)?;

        let entry = shm.as_ptr() as *mut WorkEntry;
        let pixels = unsafe { shm.as_ptr().add(std::mem::size_of::<WorkEntry>()) };
        let pixel_len = width as usize * height as usize;

        doorbell.drain()?;

        unsafe {
            (*entry).init(width, height);
            std::ptr::write_bytes(pixels, 0, pixel_len);
        }

        mutex.post()?;
        info!(
            "created channel {} ({}x{}, {} byte segment)",
            config.name_prefix, width, height, segment_len
        );

        Ok(Channel {
            role: Role::Daemon,
            prefix: config.name_prefix.clone(),
            mutex,
            doorbell,
            shm,
            entry,
            pixels,
            pixel_len,
            width,
            height,
            client_timeout_ms: config.client_timeout_ms,
        })
    }

    /// Attaches the client side to an existing channel.
    ///
    /// Missing names report [`ChannelError::NotConnected`]; a header
    /// whose size or version disagrees with this build reports
    /// [`ChannelError::VersionMismatch`] and the segment is not touched
    /// further.
    pub fn attach_client(config: &ChannelConfig) -> Result<Channel, ChannelError> {
        let mutex =
            NamedSemaphore::open(&mutex_name(&config.name_prefix)).map_err(attach_error)?;
        let doorbell =
            NamedSemaphore::open(&doorbell_name(&config.name_prefix)).map_err(attach_error)?;
        let shm = SharedMemory::open(&segment_name(&config.name_prefix)).map_err(attach_error)?;

        if shm.len() < std::mem::size_of::<WorkEntry>() {
            return Err(ChannelError::Communication(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("segment is only {} bytes, smaller than the header", shm.len()),
            )));
        }

        if !mutex.wait_timeout_ms(config.client_timeout_ms)? {
            return Err(ChannelError::Timeout);
        }

        let entry = shm.as_ptr() as *mut WorkEntry;
        let header = unsafe { &*entry };

        if !header.header_matches() {
            let err = ChannelError::VersionMismatch {
                expected_size: std::mem::size_of::<WorkEntry>() as u32,
                expected_version: entry::HEADER_VERSION,
                found_size: header.header_size,
                found_version: header.header_version,
            };
            if let Err(e) = mutex.post() {
                warn!("failed to release mutex after version check: {}", e);
            }
            return Err(err);
        }

        let width = header.width;
        let height = header.height;
        let pixel_len = width as usize * height as usize;
        if WorkEntry::segment_len(width, height) > shm.len() {
            if let Err(e) = mutex.post() {
                warn!("failed to release mutex after size check: {}", e);
            }
            return Err(ChannelError::Communication(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "segment of {} bytes cannot hold a {}x{} pixel buffer",
                    shm.len(),
                    width,
                    height
                ),
            )));
        }
        let pixels = unsafe { shm.as_ptr().add(std::mem::size_of::<WorkEntry>()) };

        mutex.post()?;
        debug!(
            "attached to channel {} ({}x{})",
            config.name_prefix, width, height
        );

        Ok(Channel {
            role: Role::Client,
            prefix: config.name_prefix.clone(),
            mutex,
            doorbell,
            shm,
            entry,
            pixels,
            pixel_len,
            width,
            height,
            client_timeout_ms: config.client_timeout_ms,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_daemon(&self) -> bool {
        self.role == Role::Daemon
    }

    /// Raw doorbell handle for async-signal-safe posting from a signal
    /// handler. `sem_post` is the only operation allowed on it there.
    pub fn doorbell_raw(&self) -> *mut libc::sem_t {
        self.doorbell.raw()
    }

    /// The Work Entry in the segment.
    ///
    /// # Safety
    /// The caller must hold the channel mutex; the reference must not
    /// outlive that critical section.
    pub(crate) unsafe fn entry_unchecked(&self) -> &mut WorkEntry {
        &mut *self.entry
    }

    /// The trailing pixel buffer.
    ///
    /// # Safety
    /// Same contract as [`Channel::entry_unchecked`].
    pub(crate) unsafe fn pixels_unchecked(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.pixels, self.pixel_len)
    }

    /// Client-side bounded mutex acquire.
    pub(crate) fn acquire_mutex_client(&self) -> Result<(), ChannelError> {
        match self.mutex.wait_timeout_ms(self.client_timeout_ms) {
            Ok(true) => Ok(()),
            Ok(false) => Err(ChannelError::Timeout),
            Err(e) => Err(ChannelError::Communication(e)),
        }
    }

    /// Client-side unlock: release the mutex, then ring the doorbell.
    /// Both posts are attempted even if the first fails; the first
    /// failure is reported.
    pub(crate) fn release_and_ring(&self) -> Result<(), ChannelError> {
        let mutex_result = self.mutex.post();
        let doorbell_result = self.doorbell.post();
        mutex_result?;
        doorbell_result?;
        Ok(())
    }

    /// Client-side release without ringing (abandoned request).
    pub(crate) fn release_mutex(&self) -> Result<(), ChannelError> {
        self.mutex.post()?;
        Ok(())
    }

    /// Daemon side: waits up to `timeout_ms` (forever when `None`) for a
    /// client request.
    ///
    /// `Ok(Some(_))` hands back a guard holding the mutex with the entry
    /// ready to consume. `Ok(None)` means the wait timed out, or the
    /// doorbell rang but the mutex never arrived within the client
    /// timeout. In that case the ringing client is presumed dead and the mutex is
    /// re-posted for the next one.
    pub fn wait_command(
        &self,
        timeout_ms: Option<u32>,
    ) -> Result<Option<DaemonGuard<'_>>, ChannelError> {
        let signaled = match timeout_ms {
            None => {
                self.doorbell.wait()?;
                true
            }
            Some(ms) => self.doorbell.wait_timeout_ms(ms)?,
        };
        if !signaled {
            return Ok(None);
        }

        // Collapse a burst of rings into this one service cycle; the
        // flags in the entry already accumulate.
        self.doorbell.drain()?;

        match self.mutex.wait_timeout_ms(self.client_timeout_ms) {
            Ok(true) => Ok(Some(DaemonGuard { channel: self })),
            Ok(false) => {
                warn!(
                    "doorbell rang but the mutex never arrived within {} ms; \
                     assuming that client died and re-arming the channel",
                    self.client_timeout_ms
                );
                self.mutex.post()?;
                Ok(None)
            }
            Err(e) => Err(ChannelError::Communication(e)),
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if self.role == Role::Daemon {
            for name in [
                mutex_name(&self.prefix),
                doorbell_name(&self.prefix),
            ] {
                if let Err(e) = NamedSemaphore::unlink(&name) {
                    warn!("failed to unlink {}: {}", name, e);
                }
            }
            let name = segment_name(&self.prefix);
            if let Err(e) = SharedMemory::unlink(&name) {
                warn!("failed to unlink {}: {}", name, e);
            }
            debug!("tore down channel {}", self.prefix);
        }
    }
}

/// Daemon-side critical section over one consumed request.
///
/// Dropping forces the mutex back to exactly one available slot (drain
/// then post), mirroring the creation-time reset, so a confused client
/// that double-posted cannot widen the mutex.
#[derive(Debug)]
pub struct DaemonGuard<'a> {
    channel: &'a Channel,
}

impl DaemonGuard<'_> {
    pub fn entry(&self) -> &WorkEntry {
        unsafe { self.channel.entry_unchecked() }
    }

    pub fn entry_mut(&mut self) -> &mut WorkEntry {
        unsafe { self.channel.entry_unchecked() }
    }

    pub fn pixels(&self) -> &[u8] {
        unsafe { self.channel.pixels_unchecked() }
    }
}

impl Drop for DaemonGuard<'_> {
    fn drop(&mut self) {
        let result = self
            .channel
            .mutex
            .drain()
            .and_then(|_| self.channel.mutex.post());
        if let Err(e) = result {
            warn!("failed to re-arm channel mutex after command: {}", e);
        }
    }
}
