// src/channel/tests.rs

//! Protocol-level tests driving both ends of a real channel.
//!
//! POSIX named semaphores and shared memory are process-shared kernel
//! objects; exercising both roles from one test process goes through the
//! same primitives two processes would. Every test uses its own channel
//! names so parallel test threads cannot collide.

use crate::channel::entry::CommandFlags;
use crate::channel::Channel;
use crate::client::ClientHandle;
use crate::config::ChannelConfig;
use crate::error::ChannelError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn test_config(tag: &str) -> ChannelConfig {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    ChannelConfig {
        name_prefix: format!(
            "/ledgrid-test-{}-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed),
            tag
        ),
        client_timeout_ms: 200,
        recreate_timeout_ms: 200,
    }
}

#[test]
fn degenerate_dimensions_are_a_configuration_error() {
    let config = test_config("degenerate");
    match Channel::create_daemon(&config, 0, 7) {
        Err(ChannelError::Configuration(_)) => {}
        other => panic!("expected Configuration error, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn attach_without_daemon_reports_not_connected() {
    let config = test_config("absent");
    let start = Instant::now();
    match ClientHandle::connect(&config) {
        Err(ChannelError::NotConnected) => {}
        other => panic!("expected NotConnected, got {:?}", other.map(|_| ())),
    }
    // Must fail fast, not hang anywhere near the client timeout.
    assert!(start.elapsed() < Duration::from_millis(150));
}

#[test]
fn client_sees_daemon_dimensions() {
    let config = test_config("dims");
    let _daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let client = ClientHandle::connect(&config).unwrap();
    assert_eq!(client.dims(), (21, 7));
}

#[test_log::test]
fn request_round_trip_delivers_text_and_flags() {
    let config = test_config("roundtrip");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    client
        .show_text("HI", 3, CommandFlags::CLEAR_SCREEN, 1000)
        .unwrap();

    let mut guard = daemon
        .wait_command(Some(1000))
        .unwrap()
        .expect("doorbell should have been rung");
    assert_eq!(
        guard.entry().command_flags(),
        CommandFlags::SHOW_TEXT
            | CommandFlags::SET_TIMEOUT
            | CommandFlags::CLEAR_SCREEN
    );
    assert_eq!(guard.entry().text(), b"HI");
    assert_eq!(guard.entry().text_pos_x, 3);
    assert_eq!(guard.entry().timeout_ms, 1000);
    guard.entry_mut().set_command_flags(CommandFlags::empty());
}

#[test]
fn image_request_carries_the_pixel_buffer() {
    let config = test_config("image");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    let mut img = crate::image::Image::new(21, 7);
    img.set_pixel(0, 0, 0xff);
    img.set_pixel(20, 6, 0x01);
    client
        .show_image(&img, 2, -1, CommandFlags::empty(), 0)
        .unwrap();

    let guard = daemon.wait_command(Some(1000)).unwrap().unwrap();
    assert!(guard
        .entry()
        .command_flags()
        .contains(CommandFlags::SHOW_IMAGE));
    assert_eq!(guard.entry().pos_x, 2);
    assert_eq!(guard.entry().pos_y, -1);
    let pixels = guard.pixels();
    assert_eq!(pixels.len(), 21 * 7);
    assert_eq!(pixels[0], 0xff);
    assert_eq!(pixels[6 * 21 + 20], 0x01);
    assert_eq!(pixels[1], 0);
}

#[test]
fn second_lock_times_out_while_first_is_held() {
    let config = test_config("exclusive");
    let _daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut first = ClientHandle::connect(&config).unwrap();
    let mut second = ClientHandle::connect(&config).unwrap();

    let held = first.lock().unwrap();
    match second.lock() {
        Err(ChannelError::Timeout) => {}
        other => panic!("expected Timeout, got {:?}", other.map(|_| ())),
    }
    drop(held);
    // Released: the second client gets in without an error.
    drop(second.lock().unwrap());
}

#[test]
fn blocked_lock_proceeds_after_unlock() {
    let mut config = test_config("handoff");
    config.client_timeout_ms = 2000;
    let _daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut first = ClientHandle::connect(&config).unwrap();
    let mut second = ClientHandle::connect(&config).unwrap();

    let held = first.lock().unwrap();
    let worker = std::thread::spawn(move || {
        let start = Instant::now();
        let guard = second.lock().unwrap();
        drop(guard);
        start.elapsed()
    });

    std::thread::sleep(Duration::from_millis(120));
    drop(held);
    let waited = worker.join().unwrap();
    assert!(
        waited >= Duration::from_millis(80),
        "second lock returned in {:?} while the mutex was held",
        waited
    );
}

#[test_log::test]
fn recreate_recovers_from_a_dead_client_holding_the_mutex() {
    let config = test_config("deadclient");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    // Client dies mid-transaction: lock acquired, never released, and
    // the daemon process goes away without tearing the names down.
    let guard = client.lock().unwrap();
    std::mem::forget(guard);
    drop(client);
    std::mem::forget(daemon);

    let start = Instant::now();
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    assert!(
        start.elapsed() >= Duration::from_millis(150),
        "recreate should have waited out the recreate timeout"
    );

    // The fresh channel is fully usable.
    let mut client = ClientHandle::connect(&config).unwrap();
    client.blank().unwrap();
    let guard = daemon.wait_command(Some(1000)).unwrap();
    assert!(guard.is_some());
}

#[test]
fn stale_doorbell_is_drained_on_recreate() {
    let config = test_config("staledoorbell");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    // A request is queued but its daemon dies before servicing it.
    client.stop_refresh().unwrap();
    drop(client);
    std::mem::forget(daemon);

    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    // No phantom command cycle from the stale ring.
    assert!(daemon.wait_command(Some(50)).unwrap().is_none());
}

#[test]
fn doorbell_burst_collapses_into_one_cycle() {
    let config = test_config("burst");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    client.set_brightness(100).unwrap();
    client.start_refresh().unwrap();

    let mut guard = daemon.wait_command(Some(1000)).unwrap().unwrap();
    assert_eq!(
        guard.entry().command_flags(),
        CommandFlags::SET_BRIGHTNESS | CommandFlags::START_REFRESH
    );
    guard.entry_mut().set_command_flags(CommandFlags::empty());
    drop(guard);

    assert!(daemon.wait_command(Some(50)).unwrap().is_none());
}

#[test]
fn version_mismatch_refuses_the_segment() {
    let config = test_config("version");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    // Corrupt the advertised version the way a peer from another build
    // would have written it.
    {
        let mut guard = client.lock().unwrap();
        guard.entry_mut().header_version += 1;
        // Dropped without send: mutex released, no doorbell.
    }

    match ClientHandle::connect(&config) {
        Err(ChannelError::VersionMismatch {
            expected_version,
            found_version,
            ..
        }) => {
            assert_eq!(expected_version, crate::channel::entry::HEADER_VERSION);
            assert_eq!(found_version, crate::channel::entry::HEADER_VERSION + 1);
        }
        other => panic!("expected VersionMismatch, got {:?}", other.map(|_| ())),
    }

    // Restore so the daemon's own teardown assertions stay meaningful.
    let mut guard = client.lock().unwrap();
    guard.entry_mut().header_version -= 1;
    drop(guard);
    drop(daemon);
}

#[test]
fn abandoned_guard_releases_without_ringing() {
    let config = test_config("abandoned");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    let mut client = ClientHandle::connect(&config).unwrap();

    let mut guard = client.lock().unwrap();
    guard.entry_mut().brightness = 42;
    drop(guard);

    // No doorbell: the daemon sees nothing.
    assert!(daemon.wait_command(Some(50)).unwrap().is_none());
    // But the mutex is free again.
    drop(client.lock().unwrap());
}

#[test]
fn daemon_teardown_unlinks_the_names() {
    let config = test_config("teardown");
    let daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    drop(daemon);
    match ClientHandle::connect(&config) {
        Err(ChannelError::NotConnected) => {}
        other => panic!("expected NotConnected, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn client_teardown_keeps_the_channel_alive() {
    let config = test_config("clientdrop");
    let _daemon = Channel::create_daemon(&config, 21, 7).unwrap();
    drop(ClientHandle::connect(&config).unwrap());
    // A later client still finds the channel.
    let mut again = ClientHandle::connect(&config).unwrap();
    again.stop_refresh().unwrap();
}
