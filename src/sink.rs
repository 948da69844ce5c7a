// src/sink.rs

//! The seam between the daemon and the physical display transport.
//!
//! A [`DisplaySink`] accepts fully packed frames; the USB/HID transport
//! that ships them to real hardware lives outside this crate and only
//! needs to implement this trait. Sink failures are reported to the
//! caller, logged, and never disturb protocol state.

use crate::screen::{Screen, COLS, ROWS};
use log::trace;
use std::io::{self, Write};

/// Accepts packed frames for presentation. Opening a transport maps onto
/// the implementor's constructor, closing onto `Drop`.
pub trait DisplaySink {
    /// Presents one frame. Errors are non-fatal to the daemon loop.
    fn send_frame(&mut self, screen: &Screen) -> io::Result<()>;
}

impl<T: DisplaySink + ?Sized> DisplaySink for Box<T> {
    fn send_frame(&mut self, screen: &Screen) -> io::Result<()> {
        (**self).send_frame(screen)
    }
}

/// Frame counter for development and tests; stands in for the USB
/// transport when no hardware is attached.
#[derive(Debug, Default)]
pub struct HeadlessSink {
    frames: u64,
}

impl HeadlessSink {
    pub fn new() -> Self {
        HeadlessSink::default()
    }

    pub fn frames_sent(&self) -> u64 {
        self.frames
    }
}

impl DisplaySink for HeadlessSink {
    fn send_frame(&mut self, _screen: &Screen) -> io::Result<()> {
        self.frames += 1;
        trace!("headless sink swallowed frame {}", self.frames);
        Ok(())
    }
}

/// Renders frames as text for running the daemon without hardware.
pub struct ConsoleSink<W: Write> {
    out: W,
}

impl ConsoleSink<io::Stdout> {
    pub fn stdout() -> Self {
        ConsoleSink { out: io::stdout() }
    }
}

impl<W: Write> ConsoleSink<W> {
    pub fn new(out: W) -> Self {
        ConsoleSink { out }
    }
}

impl<W: Write> DisplaySink for ConsoleSink<W> {
    fn send_frame(&mut self, screen: &Screen) -> io::Result<()> {
        let mut text = String::with_capacity((COLS + 1) * ROWS + COLS + 4);
        text.push_str(&"-".repeat(COLS));
        text.push('\n');
        for y in 0..ROWS {
            for x in 0..COLS {
                text.push(if screen.pixel(x, y) { '#' } else { ' ' });
            }
            text.push('\n');
        }
        self.out.write_all(text.as_bytes())?;
        self.out.flush()
    }
}
