// src/channel/entry.rs

//! The Work Entry: the single mailbox record exchanged through shared
//! memory.
//!
//! The entry is a fixed `#[repr(C)]` header followed (in the segment, not
//! in this struct) by a pixel buffer of exactly `width * height` bytes.
//! `header_size` and `header_version` are written once by the daemon and
//! validated by every client on attach; a peer that disagrees on either
//! must not touch the rest of the segment.

use bitflags::bitflags;

/// Protocol version. Bump on any semantic change to the entry.
pub const HEADER_VERSION: u32 = 2;

/// Capacity of the text field, including room for a terminator.
pub const TEXT_CAPACITY: usize = 256;

bitflags! {
    /// Pending commands, accumulated by clients and consumed by the
    /// daemon one entry per cycle. Several flags may arrive together; the
    /// daemon applies them in a fixed order (brightness, clear, image,
    /// text, stop-refresh, start-refresh, timeout, exit).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u32 {
        const CLEAR_SCREEN   = 1 << 0;
        const SHOW_IMAGE     = 1 << 1;
        const SHOW_TEXT      = 1 << 2;
        const START_REFRESH  = 1 << 3;
        const STOP_REFRESH   = 1 << 4;
        const SET_BRIGHTNESS = 1 << 5;
        const SET_TIMEOUT    = 1 << 6;
        const EXIT           = 1 << 7;
    }
}

/// The shared mailbox record. Lives at offset 0 of the segment; all
/// access happens while holding the channel mutex.
#[repr(C)]
#[derive(Debug)]
pub struct WorkEntry {
    /// `size_of::<WorkEntry>()` as written by the creating daemon;
    /// validates struct-layout compatibility across differently compiled
    /// peers.
    pub header_size: u32,
    /// Must equal [`HEADER_VERSION`] exactly.
    pub header_version: u32,
    /// Display width; set once at creation, read-only to clients.
    pub width: u32,
    /// Display height; set once at creation, read-only to clients.
    pub height: u32,
    /// Pending [`CommandFlags`] bits.
    pub flags: u32,
    /// Text payload for SHOW_TEXT. Not required to be NUL-terminated on
    /// the wire; the daemon terminates defensively before use.
    pub text: [u8; TEXT_CAPACITY],
    /// Left edge for SHOW_TEXT.
    pub text_pos_x: i32,
    /// Destination position for SHOW_IMAGE.
    pub pos_x: i32,
    pub pos_y: i32,
    /// Level for SET_BRIGHTNESS; the daemon clamps.
    pub brightness: i32,
    /// Duration for SET_TIMEOUT; 0 clears any deadline.
    pub timeout_ms: u32,
}

impl WorkEntry {
    /// Bytes the entire segment needs for a `width` x `height` display.
    pub fn segment_len(width: u32, height: u32) -> usize {
        std::mem::size_of::<WorkEntry>() + width as usize * height as usize
    }

    /// (Re)initializes the entry as the daemon does at channel creation:
    /// header stamped, no pending command, empty payload fields.
    pub fn init(&mut self, width: u32, height: u32) {
        self.header_size = std::mem::size_of::<WorkEntry>() as u32;
        self.header_version = HEADER_VERSION;
        self.width = width;
        self.height = height;
        self.flags = CommandFlags::empty().bits();
        self.text = [0; TEXT_CAPACITY];
        self.text_pos_x = 0;
        self.pos_x = 0;
        self.pos_y = 0;
        self.brightness = 0;
        self.timeout_ms = 0;
    }

    /// True when the header matches this build's layout and protocol
    /// version.
    pub fn header_matches(&self) -> bool {
        self.header_size == std::mem::size_of::<WorkEntry>() as u32
            && self.header_version == HEADER_VERSION
    }

    /// The pending flags; unknown bits are preserved in `flags` and
    /// reported by [`WorkEntry::unknown_flag_bits`].
    pub fn command_flags(&self) -> CommandFlags {
        CommandFlags::from_bits_truncate(self.flags)
    }

    /// Bits set in the raw word that this build does not understand.
    pub fn unknown_flag_bits(&self) -> u32 {
        self.flags & !CommandFlags::all().bits()
    }

    pub fn set_command_flags(&mut self, flags: CommandFlags) {
        self.flags = flags.bits();
    }

    /// Ors `flags` into the pending set, preserving commands an earlier
    /// writer queued in the same entry.
    pub fn add_command_flags(&mut self, flags: CommandFlags) {
        self.flags |= flags.bits();
    }

    /// Copies `text` into the entry, truncating to the field capacity
    /// minus a terminator and zero-filling the rest.
    pub fn set_text(&mut self, text: &[u8]) {
        let n = text.len().min(TEXT_CAPACITY - 1);
        self.text[..n].copy_from_slice(&text[..n]);
        self.text[n..].fill(0);
    }

    /// The text payload up to the first NUL. The final byte is treated as
    /// a terminator regardless of its value, so a peer that filled the
    /// whole field cannot make the daemon read past it.
    pub fn text(&self) -> &[u8] {
        let limit = TEXT_CAPACITY - 1;
        let end = self.text[..limit]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(limit);
        &self.text[..end]
    }
}
