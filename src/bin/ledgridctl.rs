// src/bin/ledgridctl.rs

//! One-shot client for the LED matrix daemon.
//!
//! Deliberately minimal argument handling: one verb plus positional
//! values, nothing more.

use ledgrid::channel::entry::CommandFlags;
use ledgrid::client::ClientHandle;
use ledgrid::config::CONFIG;
use ledgrid::error::ChannelError;
use log::{debug, error};
use std::process::ExitCode;

const USAGE: &str = "usage: ledgridctl <command>
commands:
  text <string> [pos_x] [timeout_ms]   show text (clears first)
  brightness <level>                   set brightness
  timeout <ms>                         set or clear (0) the display deadline
  start                                start periodic refresh
  stop                                 stop periodic refresh
  blank                                blank the display
  exit                                 ask the daemon to exit";

fn send(args: &[String]) -> Result<(), ChannelError> {
    debug!("connecting to daemon channel");
    let mut client = ClientHandle::connect(&CONFIG.channel)?;

    match args[0].as_str() {
        "text" if args.len() >= 2 => {
            let pos_x = args.get(2).and_then(|s| s.parse().ok()).unwrap_or(0);
            let timeout_ms = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(0);
            client.show_text(&args[1], pos_x, CommandFlags::CLEAR_SCREEN, timeout_ms)
        }
        "brightness" if args.len() >= 2 => {
            let level = args[1].parse().unwrap_or(0);
            client.set_brightness(level)
        }
        "timeout" if args.len() >= 2 => {
            let ms = args[1].parse().unwrap_or(0);
            client.set_timeout(ms)
        }
        "start" => client.start_refresh(),
        "stop" => client.stop_refresh(),
        "blank" => client.blank(),
        "exit" => client.exit(),
        _ => {
            eprintln!("{}", USAGE);
            std::process::exit(64);
        }
    }
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.is_empty() {
        eprintln!("{}", USAGE);
        return ExitCode::from(64);
    }

    match send(&args) {
        Ok(()) => {
            debug!("command sent");
            ExitCode::SUCCESS
        }
        Err(ChannelError::NotConnected) => {
            error!("no daemon is running (channel {})", CONFIG.channel.name_prefix);
            ExitCode::from(2)
        }
        Err(ChannelError::Timeout) => {
            error!("daemon busy; request timed out");
            ExitCode::from(3)
        }
        Err(e) => {
            error!("request failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
