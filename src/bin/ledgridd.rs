// src/bin/ledgridd.rs

//! The LED matrix daemon: owns the display, serves the shared channel.

use anyhow::Context;
use ledgrid::channel::Channel;
use ledgrid::config::{SinkKind, CONFIG};
use ledgrid::daemon::{self, Daemon};
use ledgrid::screen::{COLS, ROWS};
use ledgrid::sink::{ConsoleSink, DisplaySink, HeadlessSink};
use log::info;

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_micros()
        .init();

    info!("starting ledgridd...");
    let config = &*CONFIG;

    let sink: Box<dyn DisplaySink> = match config.daemon.sink {
        SinkKind::Headless => Box::new(HeadlessSink::new()),
        SinkKind::Console => Box::new(ConsoleSink::stdout()),
    };
    info!("display sink: {:?}", config.daemon.sink);

    let channel = Channel::create_daemon(&config.channel, COLS as u32, ROWS as u32)
        .context("failed to create the shared channel")?;
    info!(
        "serving {}x{} display on channel {}",
        COLS, ROWS, config.channel.name_prefix
    );

    daemon::install_signal_handlers(&channel)
        .context("failed to install termination handlers")?;

    let mut daemon = Daemon::new(sink, config);
    let result = daemon.run(&channel);

    // Detach the handler before the doorbell goes away, then unlink the
    // channel names by dropping the daemon side.
    daemon::disarm_signal_handlers();
    drop(channel);

    result.context("daemon loop ended fatally")?;
    info!("ledgridd exited cleanly");
    Ok(())
}
