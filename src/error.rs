// src/error.rs

//! Error taxonomy for the shared communication channel.
//!
//! Client-facing operations return one of these variants rather than
//! panicking or aborting; callers must be able to tell "daemon busy, try
//! later" ([`ChannelError::Timeout`]) from "channel broken"
//! ([`ChannelError::Communication`]).

use std::fmt;
use std::io;

/// Errors surfaced by channel creation, attach and request operations.
#[derive(Debug)]
pub enum ChannelError {
    /// The shared segment or its semaphores do not exist: no daemon is
    /// running. Distinct from generic I/O failure so clients can report
    /// "not connected" immediately.
    NotConnected,

    /// A semaphore or shared-memory operation failed for a reason other
    /// than a timeout.
    Communication(io::Error),

    /// A bounded wait expired before the resource became available.
    Timeout,

    /// The channel header disagrees with this build's layout or protocol
    /// version. Hard failure; no partial compatibility is attempted.
    VersionMismatch {
        expected_size: u32,
        expected_version: u32,
        found_size: u32,
        found_version: u32,
    },

    /// Degenerate configuration, e.g. zero display dimensions at channel
    /// creation.
    Configuration(String),
}

impl ChannelError {
    /// True for the "daemon busy, try later" outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::Timeout)
    }
}

impl fmt::Display for ChannelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelError::NotConnected => {
                write!(f, "channel not found (daemon not running?)")
            }
            ChannelError::Communication(e) => {
                write!(f, "channel communication failed: {}", e)
            }
            ChannelError::Timeout => write!(f, "channel operation timed out"),
            ChannelError::VersionMismatch {
                expected_size,
                expected_version,
                found_size,
                found_version,
            } => write!(
                f,
                "channel protocol mismatch: header {}B v{} here, {}B v{} in segment",
                expected_size, expected_version, found_size, found_version
            ),
            ChannelError::Configuration(msg) => {
                write!(f, "invalid channel configuration: {}", msg)
            }
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Communication(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ChannelError {
    fn from(e: io::Error) -> Self {
        ChannelError::Communication(e)
    }
}
