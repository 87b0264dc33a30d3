//! Headless playback demo for the vireo engine.
//!
//! Loads a local file or an HTTP(S) URL, plays it through to the end,
//! and prints progress plus final pipeline statistics. Rendering goes to
//! the CPU raster tier so the demo runs anywhere, display or not.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::EnvFilter;
use vireo::{PlaybackState, Player, PlayerError, PlayerEvents, RasterRenderer, Renderer};

struct Printer;

impl PlayerEvents for Printer {
    fn on_time_update(&self, position: Duration) {
        println!("  t = {:6.2}s", position.as_secs_f64());
    }

    fn on_duration_change(&self, duration: Duration) {
        println!("duration: {:.2}s", duration.as_secs_f64());
    }

    fn on_play_state_change(&self, playing: bool) {
        println!("{}", if playing { "playing" } else { "paused" });
    }

    fn on_buffering_start(&self) {
        println!("buffering...");
    }

    fn on_buffering_end(&self) {
        println!("buffering done");
    }

    fn on_ended(&self) {
        println!("ended");
    }

    fn on_error(&self, error: &PlayerError) {
        eprintln!("error [{}]: {error}", error.code());
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(target) = std::env::args().nth(1) else {
        eprintln!("usage: vireo-demo <file-or-url>");
        std::process::exit(2);
    };

    let player = Player::builder()
        .events(Arc::new(Printer))
        .renderer(Box::new(|| {
            RasterRenderer::new().map(|r| Box::new(r) as Box<dyn Renderer>)
        }))
        .build();

    let result = if target.starts_with("http://") || target.starts_with("https://") {
        player.load_url(target)
    } else {
        player.load_file(target)
    };
    if let Err(e) = result {
        eprintln!("load failed: {e}");
        std::process::exit(1);
    }

    let mut started = false;
    loop {
        let state = player.state();
        match state.state {
            PlaybackState::Ready if !started => {
                if let Some(info) = player.media_info() {
                    for track in &info.tracks {
                        println!(
                            "track {}: {:?} {}",
                            track.id, track.kind, track.codec_string
                        );
                    }
                }
                started = true;
                player.play();
            }
            PlaybackState::Ended | PlaybackState::Error => break,
            _ => {}
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let stats = player.stats();
    println!(
        "done: {} video frames dropped, {} audio frames dropped, {} keyframe skips, max drift {}ms",
        stats.video_frames_dropped,
        stats.audio_frames_dropped,
        stats.keyframe_skips,
        stats.sync.max_drift_ms()
    );

    if player.state().error.is_some() {
        std::process::exit(1);
    }
}
