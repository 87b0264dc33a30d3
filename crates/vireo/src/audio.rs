//! Audio output engine and the authoritative playback clock.
//!
//! The engine owns the producer half of the SPSC ring and a real-time
//! output backend (cpal by default). Decoded audio frames are downmixed to
//! stereo on the feeder side; the output callback pulls stereo frames
//! through the ring's fractional-rate cursor, applies the final gain, and
//! accounts consumed source frames into the [`ClockHandle`] — the single
//! authoritative playback position everything else reads.
//!
//! Playback-rate changes are plain linear interpolation of the source
//! signal with no pitch correction. That is the documented behavior of
//! this engine at 0.1×–4×, chosen for simplicity, not an oversight.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::audio_ring_buffer::{
    audio_ring, ReadFrame, RingConfig, RingConsumer, RingMetrics, RingProducer,
};
use crate::error::AudioError;
use crate::media::AudioFrame;

/// Queued audio older than this behind a seek target is discarded at
/// enqueue time.
pub const SEEK_DISCARD_SLACK: Duration = Duration::from_millis(100);

/// Samples accumulated in the callback before flushing to the clock
/// atomics. Batching keeps per-sample atomic traffic off the audio thread.
const CLOCK_FLUSH_FRAMES: u64 = 256;

/// Consecutive all-empty callbacks before the engine reports a stall.
const STALL_CALLBACK_THRESHOLD: u32 = 3;

/// Anything the presentation driver can read a position from.
pub trait ClockSource: Send + Sync {
    /// Current media time. Monotonically non-decreasing between seeks.
    fn position(&self) -> Duration;
}

// ============================================================================
// Playback clock
// ============================================================================

/// Cloneable handle over the playback clock and audio control state.
///
/// Written by the audio callback (consumed-frames accounting) and by the
/// controller (seek rebase, volume, rate); read everywhere. All state is
/// atomic — safe to touch from the real-time thread.
#[derive(Clone)]
pub struct ClockHandle {
    inner: Arc<ClockInner>,
}

struct ClockInner {
    /// Base PTS in microseconds, stored as value+1 so a zero PTS is
    /// distinguishable from "unset".
    base_pts_us_plus1: AtomicU64,
    /// Source frames consumed since the base was set.
    source_frames: AtomicU64,
    /// Source sample rate for frames→time conversion.
    source_rate: AtomicU32,
    /// Volume in thousandths (0..=1000).
    volume_milli: AtomicU32,
    muted: AtomicBool,
    /// Playback rate in thousandths (100..=4000).
    rate_milli: AtomicU32,
    /// True while the transport is playing (callback consumes).
    playing: AtomicBool,
    /// True when the callback saw sustained ring starvation.
    stalled: AtomicBool,
}

impl ClockHandle {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ClockInner {
                base_pts_us_plus1: AtomicU64::new(0),
                source_frames: AtomicU64::new(0),
                source_rate: AtomicU32::new(48_000),
                volume_milli: AtomicU32::new(1000),
                muted: AtomicBool::new(false),
                rate_milli: AtomicU32::new(1000),
                playing: AtomicBool::new(false),
                stalled: AtomicBool::new(false),
            }),
        }
    }

    /// Current media time: base PTS plus consumed source frames.
    pub fn position(&self) -> Duration {
        let base_plus1 = self.inner.base_pts_us_plus1.load(Ordering::Acquire);
        if base_plus1 == 0 {
            return Duration::ZERO;
        }
        let base = Duration::from_micros(base_plus1 - 1);
        let frames = self.inner.source_frames.load(Ordering::Relaxed);
        let rate = self.inner.source_rate.load(Ordering::Relaxed).max(1) as u64;
        base + Duration::from_micros(frames * 1_000_000 / rate)
    }

    /// Sets the base PTS (first frame after start/seek).
    pub fn set_base_pts(&self, pts: Duration) {
        self.inner
            .base_pts_us_plus1
            .store(pts.as_micros() as u64 + 1, Ordering::Release);
    }

    pub fn has_base_pts(&self) -> bool {
        self.inner.base_pts_us_plus1.load(Ordering::Acquire) != 0
    }

    /// Re-bases the clock at `target` and zeroes consumption. The next
    /// enqueued frame re-anchors the base exactly.
    pub fn rebase(&self, target: Duration) {
        self.inner.source_frames.store(0, Ordering::Relaxed);
        self.set_base_pts(target);
    }

    /// Clears the base entirely (new load).
    pub fn clear(&self) {
        self.inner.source_frames.store(0, Ordering::Relaxed);
        self.inner.base_pts_us_plus1.store(0, Ordering::Release);
        self.inner.stalled.store(false, Ordering::Relaxed);
    }

    pub fn set_source_rate(&self, rate: u32) {
        if rate > 0 {
            self.inner.source_rate.store(rate, Ordering::Relaxed);
        }
    }

    pub fn source_rate(&self) -> u32 {
        self.inner.source_rate.load(Ordering::Relaxed)
    }

    /// Adds consumed source frames (audio callback only).
    #[inline]
    pub fn add_source_frames(&self, frames: u64) {
        self.inner.source_frames.fetch_add(frames, Ordering::Relaxed);
    }

    pub fn set_volume(&self, volume: f32) {
        let milli = (volume.clamp(0.0, 1.0) * 1000.0).round() as u32;
        self.inner.volume_milli.store(milli, Ordering::Relaxed);
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_muted(&self, muted: bool) {
        self.inner.muted.store(muted, Ordering::Relaxed);
    }

    pub fn is_muted(&self) -> bool {
        self.inner.muted.load(Ordering::Relaxed)
    }

    /// Gain applied per output sample, after downmix and resample.
    pub fn effective_gain(&self) -> f32 {
        if self.is_muted() {
            0.0
        } else {
            self.volume()
        }
    }

    pub fn set_playback_rate(&self, rate: f32) {
        let milli = (rate.clamp(0.1, 4.0) * 1000.0).round() as u32;
        self.inner.rate_milli.store(milli, Ordering::Relaxed);
    }

    pub fn playback_rate(&self) -> f32 {
        self.inner.rate_milli.load(Ordering::Relaxed) as f32 / 1000.0
    }

    pub fn set_playing(&self, playing: bool) {
        self.inner.playing.store(playing, Ordering::Release);
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::Acquire)
    }

    pub fn set_stalled(&self, stalled: bool) {
        self.inner.stalled.store(stalled, Ordering::Release);
    }

    pub fn is_stalled(&self) -> bool {
        self.inner.stalled.load(Ordering::Acquire)
    }
}

impl Default for ClockHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for ClockHandle {
    fn position(&self) -> Duration {
        ClockHandle::position(self)
    }
}

/// Pause-aware wall clock for media without an audio track.
///
/// Keeps the single-writer rule intact: only the controller drives it, and
/// the presentation driver reads it through [`ClockSource`] exactly like
/// the audio clock.
pub struct WallClock {
    inner: Mutex<WallClockInner>,
    rate_milli: AtomicU32,
}

struct WallClockInner {
    base: Duration,
    started_at: Option<Instant>,
}

impl WallClock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WallClockInner {
                base: Duration::ZERO,
                started_at: None,
            }),
            rate_milli: AtomicU32::new(1000),
        }
    }

    pub fn start(&self) {
        let mut inner = self.inner.lock();
        if inner.started_at.is_none() {
            inner.started_at = Some(Instant::now());
        }
    }

    pub fn pause(&self) {
        let mut inner = self.inner.lock();
        if let Some(started) = inner.started_at.take() {
            let rate = self.rate_milli.load(Ordering::Relaxed) as f64 / 1000.0;
            inner.base += Duration::from_secs_f64(started.elapsed().as_secs_f64() * rate);
        }
    }

    pub fn rebase(&self, target: Duration) {
        let mut inner = self.inner.lock();
        inner.base = target;
        if inner.started_at.is_some() {
            inner.started_at = Some(Instant::now());
        }
    }

    pub fn set_playback_rate(&self, rate: f32) {
        // Fold elapsed time at the old rate into the base first.
        let playing = {
            let inner = self.inner.lock();
            inner.started_at.is_some()
        };
        if playing {
            self.pause();
        }
        self.rate_milli
            .store((rate.clamp(0.1, 4.0) * 1000.0).round() as u32, Ordering::Relaxed);
        if playing {
            self.start();
        }
    }
}

impl Default for WallClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockSource for WallClock {
    fn position(&self) -> Duration {
        let inner = self.inner.lock();
        let rate = self.rate_milli.load(Ordering::Relaxed) as f64 / 1000.0;
        match inner.started_at {
            Some(started) => {
                inner.base + Duration::from_secs_f64(started.elapsed().as_secs_f64() * rate)
            }
            None => inner.base,
        }
    }
}

// ============================================================================
// Downmix
// ============================================================================

/// Downmixes an interleaved frame buffer to interleaved stereo.
///
/// Policy (reproduced exactly for parity across decoder paths):
/// - mono: duplicated to both channels
/// - stereo: pass-through
/// - 6/8 channels, assumed L,R,C,LFE,SL,SR[,SBL,SBR]:
///   `left  = L + C·0.707 + LFE·0.5 + SL·0.866 [+ SBL·0.6]` and the
///   symmetric right, hard-clamped to [-1, 1]
/// - anything else: best-effort first two channels
pub fn downmix_to_stereo(data: &[f32], channels: u16) -> Vec<f32> {
    let ch = channels.max(1) as usize;
    let frames = data.len() / ch;
    let mut out = Vec::with_capacity(frames * 2);

    match ch {
        1 => {
            for &s in data.iter().take(frames) {
                out.push(s);
                out.push(s);
            }
        }
        2 => out.extend_from_slice(&data[..frames * 2]),
        6 | 8 => {
            for f in 0..frames {
                let s = &data[f * ch..(f + 1) * ch];
                let (l, r, c, lfe, sl, sr) = (s[0], s[1], s[2], s[3], s[4], s[5]);
                let mut left = l + c * 0.707 + lfe * 0.5 + sl * 0.866;
                let mut right = r + c * 0.707 + lfe * 0.5 + sr * 0.866;
                if ch == 8 {
                    left += s[6] * 0.6;
                    right += s[7] * 0.6;
                }
                out.push(left.clamp(-1.0, 1.0));
                out.push(right.clamp(-1.0, 1.0));
            }
        }
        _ => {
            for f in 0..frames {
                let s = &data[f * ch..(f + 1) * ch];
                out.push(s[0]);
                out.push(s[1]);
            }
        }
    }
    out
}

// ============================================================================
// Output backend seam
// ============================================================================

/// Fills `out` (interleaved, `channels` wide) for one processing block.
pub type OutputCallback = Box<dyn FnMut(&mut [f32], u16) + Send>;

/// Real-time audio output backend.
///
/// The callback handed to [`AudioOutputBackend::start`] runs on the
/// backend's audio thread at its own cadence — it must not block or
/// allocate unboundedly.
pub trait AudioOutputBackend: Send {
    /// Starts the output stream (initially paused) and returns the output
    /// sample rate the callback will be driven at.
    fn start(&mut self, callback: OutputCallback) -> Result<u32, AudioError>;
    fn resume(&mut self) -> Result<(), AudioError>;
    fn pause(&mut self) -> Result<(), AudioError>;
    /// Output channel count (1 or 2).
    fn channels(&self) -> u16;
}

// ============================================================================
// Engine
// ============================================================================

/// The audio half of the pipeline: feeder side + real-time consumer.
pub struct AudioEngine {
    clock: ClockHandle,
    producer: RingProducer,
    backend: Box<dyn AudioOutputBackend>,
    output_rate: u32,
    /// Enqueued frames older than this (minus slack) are dropped; value+1
    /// encoding, 0 = no discard threshold armed.
    discard_before_us_plus1: Arc<AtomicU64>,
    /// True until the first enqueue after start/flush anchors the base PTS.
    needs_base: bool,
}

impl AudioEngine {
    /// Builds the engine over the given backend. Fails when the backend
    /// cannot start its stream (no output device, platform gesture
    /// requirements) — recoverable by retrying later.
    pub fn new(mut backend: Box<dyn AudioOutputBackend>) -> Result<Self, AudioError> {
        let clock = ClockHandle::new();
        let (producer, consumer) = audio_ring(RingConfig::default());
        let discard = Arc::new(AtomicU64::new(0));

        // The callback needs the output rate, which the backend only
        // reports from start(); publish it through a shared atomic.
        let output_rate_shared = Arc::new(AtomicU32::new(0));
        let callback =
            Self::make_callback(consumer, clock.clone(), Arc::clone(&output_rate_shared));
        let output_rate = backend.start(callback)?;
        output_rate_shared.store(output_rate, Ordering::Release);

        tracing::info!(output_rate, channels = backend.channels(), "audio engine started");
        Ok(Self {
            clock,
            producer,
            backend,
            output_rate,
            discard_before_us_plus1: discard,
            needs_base: true,
        })
    }

    /// Builds the real-time fill closure run by the backend.
    fn make_callback(
        mut consumer: RingConsumer,
        clock: ClockHandle,
        output_rate: Arc<AtomicU32>,
    ) -> OutputCallback {
        let mut pending_frames: u64 = 0;
        let mut empty_callbacks: u32 = 0;

        Box::new(move |out: &mut [f32], out_channels: u16| {
            let channels = out_channels.clamp(1, 2) as usize;
            let out_rate = output_rate.load(Ordering::Acquire);
            if !clock.is_playing() || out_rate == 0 {
                out.fill(0.0);
                return;
            }

            let gain = clock.effective_gain();
            let source_rate = clock.source_rate() as f64;
            let step = clock.playback_rate() as f64 * source_rate / out_rate as f64;

            let mut any_data = false;
            for frame in out.chunks_mut(channels) {
                match consumer.next_frame(step) {
                    ReadFrame::Frame {
                        left,
                        right,
                        source_frames_advanced,
                    } => {
                        any_data = true;
                        pending_frames += source_frames_advanced as u64;
                        if channels == 1 {
                            frame[0] = (left + right) * 0.5 * gain;
                        } else {
                            frame[0] = left * gain;
                            frame[1] = right * gain;
                        }
                    }
                    ReadFrame::Flushed => {
                        // Discard stale accounting; the controller already
                        // re-based the clock.
                        pending_frames = 0;
                        frame.fill(0.0);
                    }
                    ReadFrame::Empty => frame.fill(0.0),
                }
                if pending_frames >= CLOCK_FLUSH_FRAMES {
                    clock.add_source_frames(pending_frames);
                    pending_frames = 0;
                }
            }
            if pending_frames > 0 {
                clock.add_source_frames(pending_frames);
                pending_frames = 0;
            }

            if any_data {
                if empty_callbacks >= STALL_CALLBACK_THRESHOLD {
                    clock.set_stalled(false);
                }
                empty_callbacks = 0;
            } else {
                empty_callbacks = empty_callbacks.saturating_add(1);
                if empty_callbacks >= STALL_CALLBACK_THRESHOLD {
                    clock.set_stalled(true);
                }
            }
        })
    }

    pub fn clock(&self) -> ClockHandle {
        self.clock.clone()
    }

    pub fn ring_metrics(&self) -> RingMetrics {
        self.producer.metrics()
    }

    /// Enqueues a decoded frame: seek-window filtering, base anchoring,
    /// downmix, ring write. Ownership transfers here.
    pub fn enqueue(&mut self, frame: AudioFrame) {
        let discard_plus1 = self.discard_before_us_plus1.load(Ordering::Acquire);
        if discard_plus1 != 0 {
            let target = Duration::from_micros(discard_plus1 - 1);
            if frame.pts + SEEK_DISCARD_SLACK < target {
                tracing::trace!(pts = ?frame.pts, ?target, "discarding stale audio after seek");
                return;
            }
            self.discard_before_us_plus1.store(0, Ordering::Release);
        }

        if self.needs_base {
            self.clock.set_source_rate(frame.sample_rate);
            self.clock.rebase(frame.pts);
            self.needs_base = false;
        }

        let stereo = downmix_to_stereo(&frame.data, frame.channels);
        self.producer.write(&stereo);
    }

    /// Freezes consumption; the clock holds its value for resume.
    pub fn pause(&mut self) {
        self.clock.set_playing(false);
        if let Err(e) = self.backend.pause() {
            tracing::warn!("audio backend pause: {e}");
        }
    }

    /// Resumes consumption.
    pub fn play(&mut self) {
        self.clock.set_playing(true);
        if let Err(e) = self.backend.resume() {
            tracing::warn!("audio backend resume: {e}");
        }
    }

    /// Drops queued audio around a seek and re-bases the clock at the
    /// target. Re-fetching data is the demuxer/controller's job.
    pub fn seek(&mut self, target: Duration) {
        self.producer.request_flush();
        self.discard_before_us_plus1
            .store(target.as_micros() as u64 + 1, Ordering::Release);
        self.clock.rebase(target);
        self.needs_base = true;
    }

    /// Full reset for a new load.
    pub fn reset(&mut self) {
        self.producer.request_flush();
        self.discard_before_us_plus1.store(0, Ordering::Release);
        self.clock.clear();
        self.clock.set_playing(false);
        self.needs_base = true;
    }

    /// Output device sample rate the callback runs at.
    pub fn output_rate(&self) -> u32 {
        self.output_rate
    }
}

// ============================================================================
// cpal backend
// ============================================================================

enum StreamCommand {
    Resume,
    Pause,
    Shutdown,
}

/// cpal-backed output.
///
/// cpal streams are bound to the thread that created them, so the stream
/// lives on a dedicated output thread and is driven through a command
/// channel. Dropping the backend shuts that thread down, which releases
/// the stream.
pub struct CpalOutput {
    command_tx: Option<crossbeam_channel::Sender<StreamCommand>>,
    handle: Option<std::thread::JoinHandle<()>>,
    device_rate: u32,
    device_channels: u16,
}

impl CpalOutput {
    /// Probes the default output device. Fails when no device is present
    /// or it refuses to report a configuration.
    pub fn new() -> Result<Self, AudioError> {
        use cpal::traits::{DeviceTrait, HostTrait};

        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Init("no audio output device available".into()))?;
        let config = device
            .default_output_config()
            .map_err(|e| AudioError::Init(format!("default output config: {e}")))?;

        Ok(Self {
            command_tx: None,
            handle: None,
            device_rate: config.sample_rate().0,
            device_channels: config.channels().clamp(1, 2),
        })
    }

    fn send(&self, command: StreamCommand, what: &str) -> Result<(), AudioError> {
        match &self.command_tx {
            Some(tx) => tx
                .send(command)
                .map_err(|_| AudioError::Stream(format!("output thread gone during {what}"))),
            None => Err(AudioError::Stream(format!("{what} before start"))),
        }
    }
}

impl AudioOutputBackend for CpalOutput {
    fn start(&mut self, callback: OutputCallback) -> Result<u32, AudioError> {
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let rate = self.device_rate;
        let channels = self.device_channels;

        let handle = std::thread::Builder::new()
            .name("vireo-audio-output".into())
            .spawn(move || run_output_thread(rate, channels, callback, ready_tx, command_rx))
            .map_err(|e| AudioError::Init(format!("spawn audio output thread: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(rate)) => {
                self.command_tx = Some(command_tx);
                self.handle = Some(handle);
                Ok(rate)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(AudioError::Init("audio output thread died during startup".into()))
            }
        }
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        self.send(StreamCommand::Resume, "resume")
    }

    fn pause(&mut self) -> Result<(), AudioError> {
        self.send(StreamCommand::Pause, "pause")
    }

    fn channels(&self) -> u16 {
        self.device_channels
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        if let Some(tx) = self.command_tx.take() {
            let _ = tx.send(StreamCommand::Shutdown);
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Output-thread body: builds the stream (held here for its whole life)
/// and services transport commands until shutdown.
fn run_output_thread(
    rate: u32,
    channels: u16,
    callback: OutputCallback,
    ready_tx: crossbeam_channel::Sender<Result<u32, AudioError>>,
    command_rx: crossbeam_channel::Receiver<StreamCommand>,
) {
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::SampleFormat;

    let built = (|| {
        let host = cpal::default_host();
        let device = host
            .default_output_device()
            .ok_or_else(|| AudioError::Init("no audio output device available".into()))?;
        let supported = device
            .default_output_config()
            .map_err(|e| AudioError::Init(format!("default output config: {e}")))?;
        let stream_config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(rate),
            buffer_size: cpal::BufferSize::Default,
        };

        // Dispatch over the device's native sample format; the engine
        // always fills f32 and the adapter converts per sample.
        match supported.sample_format() {
            SampleFormat::F32 => build_stream_typed::<f32>(&device, &stream_config, channels, callback),
            SampleFormat::I16 => build_stream_typed::<i16>(&device, &stream_config, channels, callback),
            SampleFormat::U16 => build_stream_typed::<u16>(&device, &stream_config, channels, callback),
            SampleFormat::I32 => build_stream_typed::<i32>(&device, &stream_config, channels, callback),
            other => Err(AudioError::Init(format!(
                "unsupported output sample format: {other:?}"
            ))),
        }
    })();

    let stream = match built {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    // Start paused; the controller resumes on play().
    let _ = stream.pause();
    let _ = ready_tx.send(Ok(rate));

    while let Ok(command) = command_rx.recv() {
        match command {
            StreamCommand::Resume => {
                if let Err(e) = stream.play() {
                    tracing::error!("cpal stream play: {e}");
                }
            }
            StreamCommand::Pause => {
                // pause() is not supported everywhere; the engine's playing
                // flag already silences the callback in that case.
                let _ = stream.pause();
            }
            StreamCommand::Shutdown => break,
        }
    }
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    channels: u16,
    mut fill: OutputCallback,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    use cpal::traits::DeviceTrait;

    let mut scratch: Vec<f32> = Vec::new();
    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                if scratch.len() != data.len() {
                    scratch.resize(data.len(), 0.0);
                }
                fill(&mut scratch, channels);
                for (dst, &src) in data.iter_mut().zip(scratch.iter()) {
                    *dst = T::from_sample(src);
                }
            },
            |err| tracing::error!("cpal audio error: {err}"),
            None,
        )
        .map_err(|e| AudioError::Init(format!("build output stream: {e}")))?;
    Ok(stream)
}

// ============================================================================
// Mock backend (tests and headless embedders)
// ============================================================================

/// Deterministic backend driven manually from tests: `drive` runs the fill
/// callback for a block of frames on the calling thread.
pub mod mock {
    use super::*;

    pub struct MockOutput {
        shared: Arc<Mutex<Option<OutputCallback>>>,
        sample_rate: u32,
        channels: u16,
        paused: Arc<AtomicBool>,
    }

    /// Handle for pumping the callback after the engine took ownership of
    /// the backend.
    #[derive(Clone)]
    pub struct MockDriver {
        shared: Arc<Mutex<Option<OutputCallback>>>,
        channels: u16,
        paused: Arc<AtomicBool>,
    }

    impl MockOutput {
        pub fn new(sample_rate: u32, channels: u16) -> (Self, MockDriver) {
            let shared = Arc::new(Mutex::new(None));
            let paused = Arc::new(AtomicBool::new(true));
            let driver = MockDriver {
                shared: Arc::clone(&shared),
                channels,
                paused: Arc::clone(&paused),
            };
            (
                Self {
                    shared,
                    sample_rate,
                    channels,
                    paused,
                },
                driver,
            )
        }
    }

    impl AudioOutputBackend for MockOutput {
        fn start(&mut self, callback: OutputCallback) -> Result<u32, AudioError> {
            *self.shared.lock() = Some(callback);
            Ok(self.sample_rate)
        }

        fn resume(&mut self) -> Result<(), AudioError> {
            self.paused.store(false, Ordering::Release);
            Ok(())
        }

        fn pause(&mut self) -> Result<(), AudioError> {
            self.paused.store(true, Ordering::Release);
            Ok(())
        }

        fn channels(&self) -> u16 {
            self.channels
        }
    }

    impl MockDriver {
        /// Runs one processing block of `frames` output frames and returns
        /// the produced samples.
        pub fn drive(&self, frames: usize) -> Vec<f32> {
            let mut out = vec![0.0f32; frames * self.channels as usize];
            let mut guard = self.shared.lock();
            if let Some(callback) = guard.as_mut() {
                callback(&mut out, self.channels);
            }
            out
        }

        pub fn is_paused(&self) -> bool {
            self.paused.load(Ordering::Acquire)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockOutput;
    use super::*;

    fn engine_with_driver(rate: u32) -> (AudioEngine, mock::MockDriver) {
        let (backend, driver) = MockOutput::new(rate, 2);
        let engine = AudioEngine::new(Box::new(backend)).unwrap();
        (engine, driver)
    }

    fn tone_frame(pts_ms: u64, rate: u32, channels: u16, frames: usize, value: f32) -> AudioFrame {
        AudioFrame {
            pts: Duration::from_millis(pts_ms),
            sample_rate: rate,
            channels,
            data: vec![value; frames * channels as usize],
        }
    }

    #[test]
    fn downmix_mono_duplicates() {
        let out = downmix_to_stereo(&[0.5, -0.25], 1);
        assert_eq!(out, vec![0.5, 0.5, -0.25, -0.25]);
    }

    #[test]
    fn downmix_stereo_passthrough() {
        let out = downmix_to_stereo(&[0.1, 0.2, 0.3, 0.4], 2);
        assert_eq!(out, vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn downmix_5_1_left_only() {
        // L=1, everything else silent: left=1.0, right=0.0
        let out = downmix_to_stereo(&[1.0, 0.0, 0.0, 0.0, 0.0, 0.0], 6);
        assert_eq!(out, vec![1.0, 0.0]);
    }

    #[test]
    fn downmix_5_1_center_splits() {
        // C=1: both channels at 0.707
        let out = downmix_to_stereo(&[0.0, 0.0, 1.0, 0.0, 0.0, 0.0], 6);
        assert!((out[0] - 0.707).abs() < 1e-6);
        assert!((out[1] - 0.707).abs() < 1e-6);
    }

    #[test]
    fn downmix_clamps_hot_mix() {
        let out = downmix_to_stereo(&[1.0, 1.0, 1.0, 1.0, 1.0, 1.0], 6);
        assert_eq!(out, vec![1.0, 1.0]);
    }

    #[test]
    fn downmix_7_1_uses_back_surrounds() {
        let mut frame = vec![0.0f32; 8];
        frame[6] = 1.0; // SBL
        let out = downmix_to_stereo(&frame, 8);
        assert!((out[0] - 0.6).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn downmix_odd_layout_passes_first_two() {
        let out = downmix_to_stereo(&[0.1, 0.2, 0.9, 0.1, 0.2, 0.9], 3);
        assert_eq!(out, vec![0.1, 0.2, 0.1, 0.2]);
    }

    #[test]
    fn clock_advances_with_consumption() {
        let (mut engine, driver) = engine_with_driver(48_000);
        let clock = engine.clock();

        engine.enqueue(tone_frame(0, 48_000, 2, 4800, 0.25));
        engine.play();
        assert_eq!(clock.position(), Duration::ZERO);

        let out = driver.drive(480);
        assert!(out.iter().any(|&s| s != 0.0));
        let pos = clock.position();
        assert!(pos > Duration::from_millis(5) && pos <= Duration::from_millis(11), "{pos:?}");
    }

    #[test]
    fn paused_engine_emits_silence_and_freezes_clock() {
        let (mut engine, driver) = engine_with_driver(48_000);
        let clock = engine.clock();

        engine.enqueue(tone_frame(0, 48_000, 2, 4800, 0.5));
        engine.play();
        driver.drive(480);
        let before = clock.position();

        engine.pause();
        let out = driver.drive(480);
        assert!(out.iter().all(|&s| s == 0.0));
        assert_eq!(clock.position(), before);
    }

    #[test]
    fn volume_is_final_gain() {
        let (mut engine, driver) = engine_with_driver(48_000);
        engine.clock().set_volume(0.5);
        engine.enqueue(tone_frame(0, 48_000, 2, 4800, 0.8));
        engine.play();
        let out = driver.drive(16);
        assert!((out[0] - 0.4).abs() < 1e-6);
    }

    #[test]
    fn mute_silences_output_but_clock_runs() {
        let (mut engine, driver) = engine_with_driver(48_000);
        let clock = engine.clock();
        clock.set_muted(true);
        engine.enqueue(tone_frame(0, 48_000, 2, 4800, 0.8));
        engine.play();
        let out = driver.drive(480);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(clock.position() > Duration::ZERO);
    }

    #[test]
    fn seek_rebases_clock_and_discards_stale_frames() {
        let (mut engine, driver) = engine_with_driver(48_000);
        let clock = engine.clock();

        engine.enqueue(tone_frame(0, 48_000, 2, 4800, 0.5));
        engine.play();
        driver.drive(480);

        engine.seek(Duration::from_secs(5));
        // Clock answers the target immediately.
        assert_eq!(clock.position(), Duration::from_secs(5));

        // A frame far behind the target is dropped...
        engine.enqueue(tone_frame(1000, 48_000, 2, 480, 0.9));
        // ...one at the target is accepted and re-anchors the base.
        engine.enqueue(tone_frame(5000, 48_000, 2, 4800, 0.25));

        // First drive consumes the flush signal, then data flows.
        driver.drive(480);
        let out = driver.drive(480);
        assert!(out.iter().any(|&s| (s - 0.25).abs() < 1e-6));
        let pos = clock.position();
        assert!(pos >= Duration::from_secs(5) && pos < Duration::from_millis(5200), "{pos:?}");
    }

    #[test]
    fn double_rate_consumes_source_twice_as_fast() {
        let (mut engine, driver) = engine_with_driver(48_000);
        let clock = engine.clock();
        clock.set_playback_rate(2.0);

        engine.enqueue(tone_frame(0, 48_000, 2, 9600, 0.5));
        engine.play();
        driver.drive(480); // 10ms of output
        let pos = clock.position();
        assert!(pos >= Duration::from_millis(18) && pos <= Duration::from_millis(21), "{pos:?}");
    }

    #[test]
    fn wall_clock_pause_resume() {
        let wall = WallClock::new();
        wall.start();
        std::thread::sleep(Duration::from_millis(20));
        wall.pause();
        let frozen = wall.position();
        assert!(frozen >= Duration::from_millis(15));
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(wall.position(), frozen);
        wall.rebase(Duration::from_secs(3));
        assert_eq!(wall.position(), Duration::from_secs(3));
    }
}
