// src/config.rs

//! Configuration for the daemon and client binaries.
//!
//! Plain serde structs with defaults for every field, deserialized from a
//! JSON file. Library code takes `&Config` (or the relevant sub-struct)
//! explicitly; the binaries read the process-wide [`CONFIG`], which loads
//! the file named by `LEDGRID_CONFIG` when set and falls back to defaults
//! otherwise.

use log::{info, warn};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete configuration for both binaries.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Shared-channel naming and timeouts.
    pub channel: ChannelConfig,
    /// Daemon loop behavior.
    pub daemon: DaemonConfig,
    /// Display/brightness behavior.
    pub display: DisplayConfig,
}

/// Naming and timing of the shared-memory channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Prefix for the shared-memory object and both semaphore names.
    /// Must begin with '/'.
    pub name_prefix: String,
    /// Bound on client-side waits for the mailbox mutex, in
    /// milliseconds. Client operations never block longer than this.
    pub client_timeout_ms: u32,
    /// How long a (re)starting daemon waits for a leftover mutex before
    /// declaring its holder dead, in milliseconds.
    pub recreate_timeout_ms: u32,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            name_prefix: "/ledgrid".to_string(),
            client_timeout_ms: 200,
            recreate_timeout_ms: 1000,
        }
    }
}

/// Daemon loop behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Maximum time between frame pushes while a refresh is active, in
    /// milliseconds.
    pub refresh_ms: u64,
    /// Which sink the daemon binary drives.
    pub sink: SinkKind,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        DaemonConfig {
            refresh_ms: 300,
            sink: SinkKind::Headless,
        }
    }
}

/// Sink selection for the daemon binary. The USB transport lives outside
/// this crate; external sinks are wired up in code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// Count and log frames only.
    Headless,
    /// Render frames as text to stdout.
    Console,
}

/// Display/brightness behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Brightness level applied at startup.
    pub initial_brightness: i32,
    /// Raw hardware brightness code written instead of any computed one.
    ///
    /// One hardware revision ignores computed levels and only behaves
    /// with a fixed code; setting this reproduces that. Unset, computed
    /// levels are used as-is.
    pub brightness_override: Option<u8>,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        DisplayConfig {
            initial_brightness: 0,
            brightness_override: None,
        }
    }
}

impl Config {
    /// Loads configuration from a JSON file.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let text = std::fs::read_to_string(path)?;
        let config = serde_json::from_str(&text)?;
        Ok(config)
    }

    /// Loads from the file named by `LEDGRID_CONFIG`, falling back to
    /// defaults when the variable is unset or the file is unusable.
    pub fn load_default() -> Config {
        match std::env::var("LEDGRID_CONFIG") {
            Ok(path) => match Config::load(Path::new(&path)) {
                Ok(config) => {
                    info!("loaded configuration from {}", path);
                    config
                }
                Err(e) => {
                    warn!("failed to load {}: {}; using defaults", path, e);
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }
}

/// Process-wide configuration for the binaries.
pub static CONFIG: Lazy<Config> = Lazy::new(Config::load_default);
