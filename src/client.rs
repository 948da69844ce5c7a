// src/client.rs

//! The producer side of the channel: attach, lock, write a request,
//! ring the doorbell.
//!
//! Every composite operation is built strictly as lock → mutate → send so
//! the mutex is never left held across an early return. Delivery is
//! at-most-once with no transactional guarantee: a caller whose
//! [`ClientGuard::send`] fails must not assume the command was dropped.

use crate::channel::entry::{CommandFlags, WorkEntry};
use crate::channel::Channel;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use crate::image::Image;
use log::{debug, warn};

/// A connection to the daemon's mailbox.
#[derive(Debug)]
pub struct ClientHandle {
    channel: Channel,
}

impl ClientHandle {
    /// Attaches to the daemon's channel. A missing channel reports
    /// [`ChannelError::NotConnected`] within the client timeout.
    pub fn connect(config: &ChannelConfig) -> Result<ClientHandle, ChannelError> {
        let channel = Channel::attach_client(config)?;
        Ok(ClientHandle { channel })
    }

    /// Display dimensions, as published by the daemon.
    pub fn dims(&self) -> (u32, u32) {
        (self.channel.width(), self.channel.height())
    }

    /// Acquires exclusive access to the Work Entry, bounded by the
    /// client timeout. [`ChannelError::Timeout`] means the daemon or
    /// another client is busy, try again later; other errors mean the
    /// channel is broken.
    pub fn lock(&mut self) -> Result<ClientGuard<'_>, ChannelError> {
        self.channel.acquire_mutex_client()?;
        Ok(ClientGuard {
            channel: &self.channel,
            sent: false,
        })
    }

    /// Shows `text` starting at column `pos_x`, with `extra` flags (for
    /// example [`CommandFlags::CLEAR_SCREEN`]) applied in the same
    /// cycle. `timeout_ms` of 0 clears any pending display deadline.
    pub fn show_text(
        &mut self,
        text: &str,
        pos_x: i32,
        extra: CommandFlags,
        timeout_ms: u32,
    ) -> Result<(), ChannelError> {
        let mut guard = self.lock()?;
        let entry = guard.entry_mut();
        entry.set_text(text.as_bytes());
        entry.text_pos_x = pos_x;
        entry.timeout_ms = timeout_ms;
        entry.add_command_flags(CommandFlags::SHOW_TEXT | CommandFlags::SET_TIMEOUT | extra);
        guard.send()
    }

    /// Shows `img`, scrolled so that image column `pos_x` / row `pos_y`
    /// lands at the display origin (the source tiles, so offsets wrap).
    /// The image is sampled at the channel's dimensions; pixels it does
    /// not cover transfer as black.
    pub fn show_image(
        &mut self,
        img: &Image,
        pos_x: i32,
        pos_y: i32,
        extra: CommandFlags,
        timeout_ms: u32,
    ) -> Result<(), ChannelError> {
        let (width, height) = self.dims();
        let mut guard = self.lock()?;
        {
            let pixels = guard.pixels_mut();
            for y in 0..height as usize {
                for x in 0..width as usize {
                    pixels[y * width as usize + x] = img.pixel(x, y);
                }
            }
        }
        let entry = guard.entry_mut();
        entry.pos_x = pos_x;
        entry.pos_y = pos_y;
        entry.timeout_ms = timeout_ms;
        entry.add_command_flags(CommandFlags::SHOW_IMAGE | CommandFlags::SET_TIMEOUT | extra);
        guard.send()
    }

    /// Blanks the display and stops any active refresh.
    pub fn blank(&mut self) -> Result<(), ChannelError> {
        let mut guard = self.lock()?;
        let entry = guard.entry_mut();
        entry.timeout_ms = 0;
        entry.add_command_flags(
            CommandFlags::CLEAR_SCREEN | CommandFlags::STOP_REFRESH | CommandFlags::SET_TIMEOUT,
        );
        guard.send()
    }

    /// Stops periodic refresh without touching the surface.
    pub fn stop_refresh(&mut self) -> Result<(), ChannelError> {
        self.send_flags_only(CommandFlags::STOP_REFRESH)
    }

    /// Starts periodic refresh of the current surface.
    pub fn start_refresh(&mut self) -> Result<(), ChannelError> {
        self.send_flags_only(CommandFlags::START_REFRESH)
    }

    /// Requests a brightness change; the daemon clamps out-of-range
    /// levels.
    pub fn set_brightness(&mut self, level: i32) -> Result<(), ChannelError> {
        let mut guard = self.lock()?;
        let entry = guard.entry_mut();
        entry.brightness = level;
        entry.add_command_flags(CommandFlags::SET_BRIGHTNESS);
        guard.send()
    }

    /// Sets (or with 0, clears) the display deadline.
    pub fn set_timeout(&mut self, timeout_ms: u32) -> Result<(), ChannelError> {
        let mut guard = self.lock()?;
        let entry = guard.entry_mut();
        entry.timeout_ms = timeout_ms;
        entry.add_command_flags(CommandFlags::SET_TIMEOUT);
        guard.send()
    }

    /// Asks the daemon to exit.
    pub fn exit(&mut self) -> Result<(), ChannelError> {
        self.send_flags_only(CommandFlags::EXIT)
    }

    fn send_flags_only(&mut self, flags: CommandFlags) -> Result<(), ChannelError> {
        let mut guard = self.lock()?;
        guard.entry_mut().add_command_flags(flags);
        guard.send()
    }
}

/// Exclusive access to the Work Entry, held between a successful
/// [`ClientHandle::lock`] and [`ClientGuard::send`].
///
/// Dropping the guard without sending releases the mutex but does not
/// ring the doorbell: whatever was written stays in the entry for the
/// next completed request to carry.
#[derive(Debug)]
pub struct ClientGuard<'a> {
    channel: &'a Channel,
    sent: bool,
}

impl ClientGuard<'_> {
    pub fn entry(&self) -> &WorkEntry {
        unsafe { self.channel.entry_unchecked() }
    }

    pub fn entry_mut(&mut self) -> &mut WorkEntry {
        unsafe { self.channel.entry_unchecked() }
    }

    /// The shared pixel buffer (`width * height` bytes, row-major).
    pub fn pixels_mut(&mut self) -> &mut [u8] {
        unsafe { self.channel.pixels_unchecked() }
    }

    /// Releases the mutex and rings the doorbell. Both posts are
    /// attempted even when the first fails; the daemon-visible effect of
    /// a failed send is undefined (the command may still be applied).
    pub fn send(mut self) -> Result<(), ChannelError> {
        self.sent = true;
        let result = self.channel.release_and_ring();
        if result.is_ok() {
            debug!("request sent");
        }
        result
    }
}

impl Drop for ClientGuard<'_> {
    fn drop(&mut self) {
        if !self.sent {
            if let Err(e) = self.channel.release_mutex() {
                warn!("failed to release abandoned request lock: {}", e);
            }
        }
    }
}
