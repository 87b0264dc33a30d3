//! End-to-end pipeline tests over synthetic MP4 files: load, play
//! through, seek, and streamed delivery with the fast-start path.

mod common;

use std::time::Duration;

use common::{build_mp4, ChunkedSource, Harness, Mp4Config};
use vireo::PlaybackState;

#[test]
fn ready_within_one_append_for_fast_start_layout() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());

    // MemorySource delivers synchronously: the whole pipeline reaches
    // Ready before load returns.
    harness.player.load_bytes(file).unwrap();

    let state = harness.player.state();
    assert_eq!(state.state, PlaybackState::Ready);
    assert_eq!(state.duration, Duration::from_secs(10));
    assert!(state.error.is_none());

    let info = harness.player.media_info().unwrap();
    assert_eq!(info.tracks.len(), 2);
    assert_eq!(harness.events.durations.lock().as_slice(), &[
        Duration::from_secs(10)
    ]);
}

#[test]
fn plays_ten_second_file_to_the_end() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();
    harness.player.play();
    assert!(harness.player.state().playing);

    let reached_end = harness.pump_until(Duration::from_secs(60), |player| {
        player.state().state == PlaybackState::Ended
    });
    assert!(reached_end, "stuck at {:?}", harness.player.state());

    let state = harness.player.state();
    assert!(!state.playing);
    assert!(state.error.is_none());
    assert!(harness.events.ended.load(std::sync::atomic::Ordering::Acquire));
    assert!(harness.events.errors.lock().is_empty());

    // Position reports started near zero and never went backwards.
    let times = harness.events.times.lock().clone();
    assert!(!times.is_empty());
    assert!(times[0] < Duration::from_secs(2), "first update at {:?}", times[0]);
    assert!(times.windows(2).all(|w| w[0] <= w[1]), "clock went backwards");
    let last = *times.last().unwrap();
    assert!(last > Duration::from_secs(8), "last update at {last:?}");
}

#[test]
fn seek_rebases_clock_and_resumes_prior_state() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();

    harness.player.seek(Duration::from_secs(5));
    let state = harness.player.state();
    assert_eq!(state.state, PlaybackState::Paused);
    let offset = state
        .current_time
        .as_millis()
        .abs_diff(Duration::from_secs(5).as_millis());
    assert!(offset <= 150, "clock at {:?} after seek(5s)", state.current_time);

    harness.player.play();
    let reached_end = harness.pump_until(Duration::from_secs(60), |player| {
        player.state().state == PlaybackState::Ended
    });
    assert!(reached_end, "stuck at {:?}", harness.player.state());

    // Every position report after the seek is at or past the target's
    // preceding sync point.
    let times = harness.events.times.lock().clone();
    assert!(!times.is_empty());
    assert!(
        times.iter().all(|t| *t >= Duration::from_millis(4_800)),
        "stale position after seek: {:?}",
        times.first()
    );
    assert!(harness.events.errors.lock().is_empty());
}

#[test]
fn seek_is_clamped_to_duration() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();

    harness.player.seek(Duration::from_secs(100));
    let position = harness.player.state().current_time;
    assert!(position <= Duration::from_secs(10) + Duration::from_millis(100));
}

#[test]
fn chunked_stream_defers_play_until_fast_start() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    let fast_start_at = (file.len() / 2) as u64;

    harness
        .player
        .load(Box::new(ChunkedSource::new(file, 1024, fast_start_at)))
        .unwrap();
    // Requested before the fast-start window has arrived: playback is
    // deferred and re-entered automatically, never rejected.
    harness.player.play();

    let playing = harness.pump_until(Duration::from_secs(10), |player| {
        player.state().playing
    });
    assert!(playing, "deferred play never started: {:?}", harness.player.state());
    assert_eq!(harness.events.play_states.lock().first(), Some(&true));

    let reached_end = harness.pump_until(Duration::from_secs(60), |player| {
        player.state().state == PlaybackState::Ended
    });
    assert!(reached_end, "stuck at {:?}", harness.player.state());
    assert!(harness.events.errors.lock().is_empty());
}

#[test]
fn metadata_at_end_layout_still_becomes_ready() {
    let harness = Harness::stub_accel();
    let mut config = Mp4Config::ten_seconds();
    config.moov_at_end = true;
    let file = build_mp4(&config);

    // Chunked delivery: the demuxer must keep accepting data past the
    // whole mdat before the movie box finally shows up.
    harness
        .player
        .load(Box::new(ChunkedSource::new(file, 1024, 1)))
        .unwrap();

    let ready = harness.pump_until(Duration::from_secs(10), |player| {
        player.state().state == PlaybackState::Ready
    });
    assert!(ready, "never ready: {:?}", harness.player.state());
    assert_eq!(harness.player.state().duration, Duration::from_secs(10));
    assert!(harness.events.errors.lock().is_empty());
}

#[test]
fn pause_freezes_the_clock_for_resume() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();
    harness.player.play();

    let advanced = harness.pump_until(Duration::from_secs(10), |player| {
        player.state().current_time >= Duration::from_millis(500)
    });
    assert!(advanced);

    harness.player.pause();
    let frozen = harness.player.state().current_time;
    // Keep pumping: a paused engine must emit silence and hold position.
    harness.pump_until(Duration::from_millis(100), |_| false);
    assert_eq!(harness.player.state().current_time, frozen);

    harness.player.play();
    let resumed = harness.pump_until(Duration::from_secs(10), |player| {
        player.state().current_time > frozen + Duration::from_millis(100)
    });
    assert!(resumed);
}

#[test]
fn reset_after_playback_returns_to_idle_with_empty_queues() {
    let harness = Harness::stub_accel();
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();
    harness.player.play();
    harness.pump_until(Duration::from_secs(10), |player| {
        player.state().current_time >= Duration::from_millis(300)
    });

    harness.player.reset();
    let state = harness.player.state();
    assert_eq!(state.state, PlaybackState::Idle);
    assert_eq!(state.current_time, Duration::ZERO);
    assert_eq!(state.duration, Duration::ZERO);
    assert!(state.error.is_none());

    // A fresh load cycle works on the same player instance.
    let file = build_mp4(&Mp4Config::ten_seconds());
    harness.player.load_bytes(file).unwrap();
    assert_eq!(harness.player.state().state, PlaybackState::Ready);
}
