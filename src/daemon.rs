// src/daemon.rs

//! The consumer side of the channel: the refresh/command state machine.
//!
//! Each cycle waits on the doorbell (bounded while any refresh state is
//! active, unbounded otherwise), consumes at most one Work Entry, applies
//! its command flags in a fixed order, and decides whether to push a
//! frame. A time-boxed display auto-blanks when its deadline passes with
//! no intervening command.
//!
//! Termination, whether a client's EXIT command or an external signal,
//! always travels through the same doorbell wake-up, so there is exactly
//! one exit path. The signal handler itself only touches an atomic flag
//! and `sem_post`, both async-signal-safe; all real state changes happen
//! back on the loop.

use crate::channel::entry::CommandFlags;
use crate::channel::{Channel, DaemonGuard};
use crate::config::Config;
use crate::font;
use crate::image::Image;
use crate::screen::Screen;
use crate::sink::DisplaySink;
use anyhow::Context;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::time::{Duration, Instant};

/// Process-wide termination state, shared with the signal handler. One
/// daemon per process is the supported shape.
static TERMINATE: AtomicBool = AtomicBool::new(false);
static SIGNAL_DOORBELL: AtomicPtr<libc::sem_t> = AtomicPtr::new(std::ptr::null_mut());

extern "C" fn handle_termination(_signal: libc::c_int) {
    TERMINATE.store(true, Ordering::SeqCst);
    let sem = SIGNAL_DOORBELL.load(Ordering::SeqCst);
    if !sem.is_null() {
        unsafe {
            libc::sem_post(sem);
        }
    }
}

/// Routes SIGTERM/SIGINT into the daemon loop via the channel doorbell.
pub fn install_signal_handlers(channel: &Channel) -> anyhow::Result<()> {
    use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

    TERMINATE.store(false, Ordering::SeqCst);
    SIGNAL_DOORBELL.store(channel.doorbell_raw(), Ordering::SeqCst);

    let action = SigAction::new(
        SigHandler::Handler(handle_termination),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
    }
    Ok(())
}

/// Detaches the handler from the channel. Call before tearing the
/// channel down; a signal arriving afterwards still sets the flag but no
/// longer touches the dead semaphore.
pub fn disarm_signal_handlers() {
    SIGNAL_DOORBELL.store(std::ptr::null_mut(), Ordering::SeqCst);
}

/// True once a termination signal has been delivered.
pub fn termination_requested() -> bool {
    TERMINATE.load(Ordering::SeqCst)
}

/// The three refresh flags. Reset at startup, mutated only while
/// applying commands, consulted only when scheduling the next wait.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct RefreshState {
    /// Periodic redraw until told otherwise.
    continuous: bool,
    /// Redraw on this cycle only.
    once: bool,
    /// Periodic redraw that self-cancels (and blanks) at this instant.
    until: Option<Instant>,
}

impl RefreshState {
    /// True while periodic wake-ups are needed.
    fn periodic(&self) -> bool {
        self.continuous || self.until.is_some()
    }

    fn clear(&mut self) {
        *self = RefreshState::default();
    }
}

/// The daemon's display state and scheduling loop.
///
/// The channel stays outside so command guards (which borrow it) and the
/// daemon's own mutable state never alias.
#[derive(Debug)]
pub struct Daemon<S: DisplaySink> {
    sink: S,
    screen: Screen,
    refresh: RefreshState,
    terminating: bool,
    refresh_interval: Duration,
    brightness_override: Option<u8>,
}

impl<S: DisplaySink> Daemon<S> {
    pub fn new(sink: S, config: &Config) -> Self {
        let mut daemon = Daemon {
            sink,
            screen: Screen::new(),
            refresh: RefreshState::default(),
            terminating: false,
            refresh_interval: Duration::from_millis(config.daemon.refresh_ms),
            brightness_override: config.display.brightness_override,
        };
        daemon.apply_brightness(config.display.initial_brightness);
        daemon
    }

    /// The committed display surface.
    pub fn screen(&self) -> &Screen {
        &self.screen
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Serves `channel` until an EXIT command, a termination signal, or a
    /// fatal wait error.
    pub fn run(&mut self, channel: &Channel) -> anyhow::Result<()> {
        info!("daemon loop starting");
        loop {
            if termination_requested() {
                info!("termination signal observed");
                break;
            }
            if self.terminating {
                break;
            }

            let now = Instant::now();
            if let Some(deadline) = self.refresh.until {
                if now >= deadline {
                    debug!("display deadline reached; blanking");
                    self.screen.clear(false);
                    self.refresh.clear();
                    self.push_frame();
                    continue;
                }
            }

            match channel.wait_command(self.wake_timeout(now)) {
                Ok(Some(mut guard)) => {
                    // A signal may have fired while we slept on the
                    // doorbell; honor it before servicing anything else.
                    if termination_requested() {
                        info!("termination signal observed");
                        break;
                    }
                    self.apply_entry(&mut guard);
                }
                Ok(None) => {
                    // Periodic tick, or a rung doorbell whose client died
                    // before handing over the mutex. Either way: no
                    // command arrived.
                }
                Err(e) => {
                    return Err(e).context("daemon wait failed fatally");
                }
            }

            if self.terminating {
                break;
            }
            if self.refresh.once || self.refresh.periodic() {
                self.push_frame();
                self.refresh.once = false;
            }
        }
        info!("daemon loop finished");
        Ok(())
    }

    /// Doorbell wait bound for this cycle: unbounded while idle, the
    /// refresh interval while redrawing, the deadline when it comes
    /// sooner.
    fn wake_timeout(&self, now: Instant) -> Option<u32> {
        if !self.refresh.periodic() {
            return None;
        }
        let mut wait = self.refresh_interval;
        if let Some(deadline) = self.refresh.until {
            let remaining = deadline.saturating_duration_since(now);
            if remaining < wait {
                wait = remaining;
            }
        }
        Some(wait.as_millis().min(u32::MAX as u128) as u32)
    }

    /// Applies one consumed Work Entry.
    ///
    /// Flags are applied in a fixed order (brightness, clear, image,
    /// text, stop-refresh, start-refresh, timeout, exit) so that later
    /// flags override the refresh implications of earlier ones within
    /// the same entry. The entry's flags word is cleared on the way out;
    /// the request is consumed exactly once.
    fn apply_entry(&mut self, guard: &mut DaemonGuard<'_>) {
        let entry = guard.entry();
        let flags = entry.command_flags();
        let unknown = entry.unknown_flag_bits();
        let width = entry.width as usize;
        let height = entry.height as usize;
        let text = entry.text().to_vec();
        let text_pos_x = entry.text_pos_x;
        let pos_x = entry.pos_x;
        let pos_y = entry.pos_y;
        let brightness = entry.brightness;
        let timeout_ms = entry.timeout_ms;
        let image = if flags.contains(CommandFlags::SHOW_IMAGE) {
            Some(Image::from_raw(width, height, guard.pixels()))
        } else {
            None
        };
        guard.entry_mut().set_command_flags(CommandFlags::empty());

        if unknown != 0 {
            warn!("ignoring unknown command bits {:#x}", unknown);
        }
        debug!("applying command flags {:?}", flags);

        if flags.contains(CommandFlags::SET_BRIGHTNESS) {
            self.apply_brightness(brightness);
            self.refresh.once = true;
        }
        if flags.contains(CommandFlags::CLEAR_SCREEN) {
            self.screen.clear(false);
            self.refresh.once = true;
        }
        if let Some(img) = image {
            // The position scrolls the (tiling) source; the destination
            // is always the whole surface.
            let fx = (pos_x as i64).rem_euclid(width.max(1) as i64) as usize;
            let fy = (pos_y as i64).rem_euclid(height.max(1) as i64) as usize;
            self.screen.blit(&img, fx, fy, 0, 0, width as i32, height as i32);
            self.refresh.once = true;
        }
        if flags.contains(CommandFlags::SHOW_TEXT) {
            if text.is_empty() {
                self.screen.clear(false);
            } else {
                font::draw_text(&mut self.screen, &text, text_pos_x);
            }
            self.refresh.once = true;
        }
        if flags.contains(CommandFlags::STOP_REFRESH) {
            self.refresh.continuous = false;
            self.refresh.until = None;
        }
        if flags.contains(CommandFlags::START_REFRESH) {
            self.refresh.continuous = true;
        }
        if flags.contains(CommandFlags::SET_TIMEOUT) {
            self.refresh.until = if timeout_ms > 0 {
                Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
            } else {
                None
            };
        }
        if flags.contains(CommandFlags::EXIT) {
            info!("exit command received");
            self.terminating = true;
        }
    }

    fn apply_brightness(&mut self, level: i32) {
        match self.brightness_override {
            Some(code) => {
                debug!(
                    "brightness override active: writing code {} instead of level {}",
                    code, level
                );
                self.screen.set_brightness_code(code);
            }
            None => self.screen.set_brightness(level),
        }
    }

    /// Pushes the current frame; sink failures are logged, never fatal.
    fn push_frame(&mut self) {
        if let Err(e) = self.sink.send_frame(&self.screen) {
            warn!("display sink rejected frame: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::entry::CommandFlags;
    use crate::client::ClientHandle;
    use crate::config::ChannelConfig;
    use crate::screen::{COLS, ROWS};
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    /// Daemon tests share the process-wide termination statics; keep
    /// them from overlapping.
    static SERIAL: Mutex<()> = Mutex::new(());

    fn test_channel_config(tag: &str) -> ChannelConfig {
        static COUNTER: AtomicUsize = AtomicUsize::new(0);
        ChannelConfig {
            name_prefix: format!(
                "/ledgrid-daemontest-{}-{}-{}",
                std::process::id(),
                COUNTER.fetch_add(1, Ordering::Relaxed),
                tag
            ),
            client_timeout_ms: 200,
            recreate_timeout_ms: 200,
        }
    }

    fn fast_config() -> Config {
        let mut config = Config::default();
        config.daemon.refresh_ms = 30;
        config
    }

    #[derive(Debug, Clone, Default)]
    struct RecordingSink {
        frames: Arc<Mutex<Vec<Screen>>>,
    }

    impl RecordingSink {
        fn frames(&self) -> Vec<Screen> {
            self.frames.lock().unwrap().clone()
        }
    }

    impl DisplaySink for RecordingSink {
        fn send_frame(&mut self, screen: &Screen) -> std::io::Result<()> {
            self.frames.lock().unwrap().push(screen.clone());
            Ok(())
        }
    }

    fn all_unlit(screen: &Screen) -> bool {
        (0..ROWS).all(|y| (0..COLS).all(|x| !screen.pixel(x, y)))
    }

    /// One client request applied directly, without spinning the loop.
    fn apply_one(
        daemon: &mut Daemon<RecordingSink>,
        channel: &Channel,
        write: impl FnOnce(&mut ClientHandle),
        config: &ChannelConfig,
    ) {
        let mut client = ClientHandle::connect(config).unwrap();
        write(&mut client);
        let mut guard = channel
            .wait_command(Some(1000))
            .unwrap()
            .expect("request should be pending");
        daemon.apply_entry(&mut guard);
    }

    #[test]
    fn multi_flag_entry_applies_in_fixed_order() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("ordering");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());

        // Pre-lit surface proves CLEAR runs before SHOW_TEXT.
        daemon.screen.clear(true);

        apply_one(
            &mut daemon,
            &channel,
            |client| {
                let mut guard = client.lock().unwrap();
                let entry = guard.entry_mut();
                entry.set_text(b"H");
                entry.text_pos_x = 0;
                entry.brightness = 100;
                entry.add_command_flags(
                    CommandFlags::SET_BRIGHTNESS
                        | CommandFlags::CLEAR_SCREEN
                        | CommandFlags::SHOW_TEXT,
                );
                guard.send().unwrap();
            },
            &config,
        );

        // Text survived the clear: the 'H' stems are lit, the background
        // cleared.
        assert!(daemon.screen.pixel(0, 0));
        assert!(!daemon.screen.pixel(2, 1));
        assert!(!daemon.screen.pixel(10, 5));
        assert_eq!(daemon.screen.packet_rows()[0][0], 155);
        assert!(daemon.refresh.once);
        assert!(!daemon.refresh.continuous);
    }

    #[test]
    fn start_refresh_wins_over_stop_in_the_same_entry() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("stopstart");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());
        daemon.refresh.until = Some(Instant::now() + Duration::from_secs(60));

        apply_one(
            &mut daemon,
            &channel,
            |client| {
                let mut guard = client.lock().unwrap();
                guard
                    .entry_mut()
                    .add_command_flags(CommandFlags::STOP_REFRESH | CommandFlags::START_REFRESH);
                guard.send().unwrap();
            },
            &config,
        );

        // STOP cleared the deadline, then START re-enabled refresh.
        assert!(daemon.refresh.continuous);
        assert_eq!(daemon.refresh.until, None);
    }

    #[test]
    fn exit_flag_marks_the_loop_terminating() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("exitflag");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());

        apply_one(
            &mut daemon,
            &channel,
            |client| {
                client.exit().unwrap();
            },
            &config,
        );
        assert!(daemon.terminating);
    }

    #[test]
    fn show_image_scrolls_the_tiled_source() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("imagescroll");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());

        // One lit column at x == 0; scrolling by 1 moves it to x == 20.
        let mut img = Image::new(21, 7);
        for y in 0..7 {
            img.set_pixel(0, y, 0xff);
        }
        apply_one(
            &mut daemon,
            &channel,
            |client| {
                client
                    .show_image(&img, 1, 0, CommandFlags::empty(), 0)
                    .unwrap();
            },
            &config,
        );

        assert!(daemon.screen.pixel(20, 0));
        assert!(!daemon.screen.pixel(0, 0));
        assert!(!daemon.screen.pixel(1, 0));
    }

    #[test]
    fn empty_text_degrades_to_blank() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("emptytext");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());
        daemon.screen.clear(true);

        apply_one(
            &mut daemon,
            &channel,
            |client| {
                client
                    .show_text("", 0, CommandFlags::empty(), 0)
                    .unwrap();
            },
            &config,
        );
        assert!(all_unlit(&daemon.screen));
    }

    #[test]
    fn brightness_override_replaces_computed_codes() {
        let _serial = SERIAL.lock().unwrap();
        let mut config = fast_config();
        config.display.brightness_override = Some(2);
        let mut daemon = Daemon::new(RecordingSink::default(), &config);
        // Startup already wrote the override.
        assert_eq!(daemon.screen.packet_rows()[0][0], 2);
        daemon.apply_brightness(100);
        assert_eq!(daemon.screen.packet_rows()[0][0], 2);
    }

    #[test]
    fn timed_text_refreshes_then_auto_blanks() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("autotimeout");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let sink = RecordingSink::default();
        let mut daemon = Daemon::new(sink.clone(), &fast_config());

        let mut client = ClientHandle::connect(&config).unwrap();
        let worker = std::thread::spawn(move || {
            daemon.run(&channel).unwrap();
            daemon
        });

        client
            .show_text("HI", 0, CommandFlags::CLEAR_SCREEN, 250)
            .unwrap();
        std::thread::sleep(Duration::from_millis(500));

        // The deadline passed: display blanked itself, no client action.
        let frames = sink.frames();
        assert!(
            frames.len() >= 3,
            "expected several refresh frames, got {}",
            frames.len()
        );
        assert!(frames[0].pixel(0, 0), "first frame should show the text");
        assert!(
            all_unlit(frames.last().unwrap()),
            "last frame should be the auto-blank"
        );

        let before_exit = sink.frames().len();
        client.exit().unwrap();
        let daemon = worker.join().unwrap();
        assert!(!daemon.refresh.periodic(), "refresh flags should be clear");
        // Idle after the blank: exiting pushed no further frames.
        assert_eq!(sink.frames().len(), before_exit);
    }

    #[test]
    fn blank_mid_refresh_stops_the_frame_stream() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("blankmid");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        let sink = RecordingSink::default();
        let mut daemon = Daemon::new(sink.clone(), &fast_config());

        let mut client = ClientHandle::connect(&config).unwrap();
        let worker = std::thread::spawn(move || {
            daemon.run(&channel).unwrap();
        });

        client
            .show_text(
                "HI",
                0,
                CommandFlags::CLEAR_SCREEN | CommandFlags::START_REFRESH,
                0,
            )
            .unwrap();
        std::thread::sleep(Duration::from_millis(150));
        assert!(sink.frames().len() >= 3, "refresh should be streaming");

        client.blank().unwrap();
        std::thread::sleep(Duration::from_millis(120));
        let settled = sink.frames().len();
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(
            sink.frames().len(),
            settled,
            "no frames may follow the blank"
        );
        assert!(all_unlit(sink.frames().last().unwrap()));

        client.exit().unwrap();
        worker.join().unwrap();
    }

    #[test]
    fn termination_handler_is_signal_safe_shaped() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("sighandler");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        install_signal_handlers(&channel).unwrap();

        // Invoke the handler body directly; it must only flip the flag
        // and ring the doorbell.
        handle_termination(libc::SIGTERM);
        assert!(termination_requested());
        let guard = channel.wait_command(Some(50)).unwrap();
        assert!(guard.is_some(), "the handler must ring the doorbell");
        assert_eq!(
            guard.unwrap().entry().command_flags(),
            CommandFlags::empty()
        );

        disarm_signal_handlers();
        TERMINATE.store(false, Ordering::SeqCst);
    }

    #[test]
    fn signal_mid_wait_exits_the_loop() {
        let _serial = SERIAL.lock().unwrap();
        let config = test_channel_config("sigexit");
        let channel = Channel::create_daemon(&config, 21, 7).unwrap();
        install_signal_handlers(&channel).unwrap();
        let mut daemon = Daemon::new(RecordingSink::default(), &fast_config());

        let worker = std::thread::spawn(move || {
            daemon.run(&channel).unwrap();
        });
        std::thread::sleep(Duration::from_millis(100));
        handle_termination(libc::SIGTERM);
        worker.join().unwrap();

        disarm_signal_handlers();
        TERMINATE.store(false, Ordering::SeqCst);
    }
}
