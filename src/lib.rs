// src/lib.rs

//! `ledgrid` drives a small fixed-resolution USB LED matrix through a
//! shared-memory mailbox served by a background daemon.
//!
//! The crate splits into three layers:
//! - the pixel codec ([`screen`], [`image`], [`font`]): pure transforms
//!   between byte bitmaps and the device's packed, bit-inverted,
//!   row-interleaved frame format;
//! - the shared channel ([`channel`], [`client`]): one POSIX shared-memory
//!   segment plus two named semaphores forming a single-slot mailbox between
//!   any number of client processes and one daemon;
//! - the daemon loop ([`daemon`], [`sink`]): the refresh/command state
//!   machine that applies mailbox entries to the screen and pushes frames
//!   through a [`sink::DisplaySink`].
//!
//! The USB/HID transport itself is out of scope; anything implementing
//! [`sink::DisplaySink`] can present frames.

pub mod channel;
pub mod client;
pub mod config;
pub mod daemon;
pub mod error;
pub mod font;
pub mod image;
pub mod screen;
pub mod sink;

pub use channel::entry::{CommandFlags, WorkEntry};
pub use channel::Channel;
pub use client::ClientHandle;
pub use config::Config;
pub use daemon::Daemon;
pub use error::ChannelError;
pub use image::Image;
pub use screen::Screen;
pub use sink::DisplaySink;
