// src/screen.rs

//! The packed device frame buffer and the pixel codec over it.
//!
//! The matrix is 21x7. On the wire a frame is four 8-byte packet rows; each
//! packet row carries two display rows in separate 3-byte lanes plus a
//! brightness code and a row address. Wire bits are inverted: a CLEAR bit
//! means the LED is lit. The byte/bit address arithmetic is easy to get
//! subtly wrong, so it lives in exactly one place, [`packed_addr`], with an
//! exhaustive test over every coordinate.
//!
//! Layout of one packet row:
//!
//! ```text
//! byte 0: brightness code        byte 1: row address (2 * packet_row)
//! bytes 2..5: even display row   bytes 5..8: odd display row
//! ```
//!
//! Within a lane, columns 0..8 occupy the lane's LAST byte (bit = x % 8),
//! columns 8..16 the middle byte, columns 16..21 the first byte.

use crate::image::Image;
use log::trace;

/// Display width in LEDs.
pub const COLS: usize = 21;
/// Display height in LEDs.
pub const ROWS: usize = 7;
/// Packet rows per frame; each carries two display rows.
pub const PACKET_ROWS: usize = 4;
/// Bytes per packet row.
pub const PACKET_BYTES: usize = 8;
/// Largest abstract brightness level.
pub const MAX_BRIGHTNESS: i32 = 255;

const LANE_BYTES: usize = (PACKET_BYTES - 2) / 2;

/// Packed byte/bit slot for a display coordinate: (packet row, byte index
/// within the packet row, bit mask). Callers must pre-check bounds.
#[inline]
fn packed_addr(x: usize, y: usize) -> (usize, usize, u8) {
    let byte = 2 + LANE_BYTES * (y & 1) + (LANE_BYTES - 1) - x / 8;
    (y / 2, byte, 1 << (x & 7))
}

/// The device-native frame buffer for the whole display.
///
/// Owned exclusively by the daemon process; derived from command
/// application and pushed through a [`crate::sink::DisplaySink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Screen {
    data: [[u8; PACKET_BYTES]; PACKET_ROWS],
}

impl Default for Screen {
    fn default() -> Self {
        Self::new()
    }
}

impl Screen {
    /// A blank screen at minimum brightness: row addresses filled in, every
    /// LED off (all wire bits set).
    pub fn new() -> Self {
        let mut data = [[0u8; PACKET_BYTES]; PACKET_ROWS];
        for (i, row) in data.iter_mut().enumerate() {
            row[1] = (i * 2) as u8;
            for b in &mut row[2..] {
                *b = 0xff;
            }
        }
        let mut scr = Screen { data };
        scr.set_brightness(0);
        scr
    }

    /// The packed packet rows, ready for the transport.
    pub fn packet_rows(&self) -> &[[u8; PACKET_BYTES]; PACKET_ROWS] {
        &self.data
    }

    /// Sets one LED. Out-of-bounds coordinates are silently ignored so
    /// drawing code stays branch-free.
    pub fn set_pixel(&mut self, x: usize, y: usize, on: bool) {
        if x >= COLS || y >= ROWS {
            return;
        }
        let (row, byte, mask) = packed_addr(x, y);
        if on {
            self.data[row][byte] &= !mask;
        } else {
            self.data[row][byte] |= mask;
        }
    }

    /// Reads one LED; out-of-bounds coordinates read as off.
    pub fn pixel(&self, x: usize, y: usize) -> bool {
        if x >= COLS || y >= ROWS {
            return false;
        }
        let (row, byte, mask) = packed_addr(x, y);
        self.data[row][byte] & mask == 0
    }

    /// Turns every LED on (`lit = true`) or off.
    pub fn clear(&mut self, lit: bool) {
        let fill = if lit { 0x00 } else { 0xff };
        for row in &mut self.data {
            for b in &mut row[2..] {
                *b = fill;
            }
        }
    }

    /// Encodes a full frame from `img`, which must cover the display
    /// (`img.width() >= COLS`, `img.height() >= ROWS`; violating the
    /// precondition is the caller's bug and asserts).
    pub fn from_image(&mut self, img: &Image) {
        assert!(
            img.width() >= COLS && img.height() >= ROWS,
            "image {}x{} smaller than display {}x{}",
            img.width(),
            img.height(),
            COLS,
            ROWS
        );
        for y in 0..ROWS {
            for x in 0..COLS {
                self.set_pixel(x, y, img.pixel(x, y) != 0);
            }
        }
    }

    /// Decodes the committed frame back into `img` (0x00 off / 0xff lit);
    /// the exact inverse of [`Screen::from_image`].
    pub fn to_image(&self, img: &mut Image) {
        assert!(
            img.width() >= COLS && img.height() >= ROWS,
            "image {}x{} smaller than display {}x{}",
            img.width(),
            img.height(),
            COLS,
            ROWS
        );
        for y in 0..ROWS {
            for x in 0..COLS {
                img.set_pixel(x, y, if self.pixel(x, y) { 0xff } else { 0x00 });
            }
        }
    }

    /// Copies a `w`x`h` window of `img` starting at `(from_x, from_y)` to
    /// the display rectangle at `(to_x, to_y)`.
    ///
    /// The source tiles: reads wrap modulo the image's own width and
    /// height. The destination rectangle is clipped first: a negative
    /// `to_x`/`to_y` shrinks the window and advances the source origin by
    /// the clipped amount, overflow past the far edge is truncated, and a
    /// degenerate result is a no-op.
    pub fn blit(
        &mut self,
        img: &Image,
        from_x: usize,
        from_y: usize,
        to_x: i32,
        to_y: i32,
        w: i32,
        h: i32,
    ) {
        if img.width() == 0 || img.height() == 0 {
            return;
        }

        let mut to_x = to_x;
        let mut to_y = to_y;
        let mut w = w;
        let mut h = h;
        let mut src_x = from_x;
        let mut src_y = from_y;

        if to_x < 0 {
            w += to_x;
            src_x = src_x.wrapping_add(-to_x as usize);
            to_x = 0;
        }
        if to_y < 0 {
            h += to_y;
            src_y = src_y.wrapping_add(-to_y as usize);
            to_y = 0;
        }
        if to_x + w > COLS as i32 {
            w = COLS as i32 - to_x;
        }
        if to_y + h > ROWS as i32 {
            h = ROWS as i32 - to_y;
        }
        if w < 1 || h < 1 {
            trace!("blit clipped away entirely");
            return;
        }

        let src_x = src_x % img.width();
        let src_y = src_y % img.height();
        for row in 0..h as usize {
            let sy = (src_y + row) % img.height();
            for col in 0..w as usize {
                let sx = (src_x + col) % img.width();
                self.set_pixel(
                    to_x as usize + col,
                    to_y as usize + row,
                    img.pixel(sx, sy) != 0,
                );
            }
        }
    }

    /// Maps an abstract brightness level onto the hardware code and writes
    /// it into every packet row. Out-of-range levels clamp to the nearest
    /// extreme.
    pub fn set_brightness(&mut self, level: i32) {
        self.set_brightness_code(brightness_code(level));
    }

    /// Writes a raw hardware brightness code verbatim. This is the
    /// override path for the hardware revision that ignores computed
    /// levels.
    pub fn set_brightness_code(&mut self, code: u8) {
        for row in &mut self.data {
            row[0] = code;
        }
    }
}

/// The hardware encodes brightness inverted: code = MAX - level, clamped.
pub fn brightness_code(level: i32) -> u8 {
    if level >= MAX_BRIGHTNESS {
        0
    } else if level < 0 {
        MAX_BRIGHTNESS as u8
    } else {
        (MAX_BRIGHTNESS - level) as u8
    }
}
