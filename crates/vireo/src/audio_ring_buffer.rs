//! Lock-free SPSC ring buffer feeding the real-time audio callback.
//!
//! The producer (decoded-audio feeder) writes interleaved stereo frames;
//! the consumer (audio callback) reads them through a fractional cursor
//! that advances by the current resampling step, linearly interpolating
//! between adjacent source frames. That one read primitive is what
//! implements playback-rate changes: rates other than 1.0 simply advance
//! the cursor faster or slower, with no pitch correction (a documented
//! approximation of this engine, not an accident).
//!
//! True SPSC: only the producer moves `write_pos`, only the consumer moves
//! `read_pos`. On overflow the producer overwrites old data and the
//! consumer detects the lap and skips forward. A flush (seek) is a
//! generation bump; the consumer snaps to the write position on its next
//! read.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// Interleaved channel count stored in the ring. The engine downmixes
/// everything to stereo before writing.
pub const RING_CHANNELS: usize = 2;

/// Configuration for the ring.
#[derive(Debug, Clone)]
pub struct RingConfig {
    /// Capacity in stereo frames.
    pub capacity_frames: usize,
    /// Frames that must accumulate before playback starts.
    pub prefill_frames: usize,
}

impl RingConfig {
    /// Tuned for file/stream playback: half a second of buffer, fast
    /// refill after seeks.
    pub fn for_rate(sample_rate: u32) -> Self {
        Self {
            capacity_frames: sample_rate as usize / 2,
            prefill_frames: sample_rate as usize / 20,
        }
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self::for_rate(48_000)
    }
}

struct RingShared {
    /// Atomic f32 bit slots; avoids torn reads during overwrite laps.
    buffer: Box<[AtomicU32]>,
    /// Monotonic sample position of the next write (masked for indexing).
    write_pos: AtomicUsize,
    /// Monotonic sample position of the next read.
    read_pos: AtomicUsize,
    mask: usize,
    capacity: usize,
    prefilled: AtomicBool,
    prefill_samples: usize,
    overflow_count: AtomicU64,
    underrun_count: AtomicU64,
    alive: AtomicBool,
    flush_generation: AtomicU64,
}

/// Result of one interpolated read.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ReadFrame {
    /// One output frame plus how many source frames the cursor passed.
    Frame {
        left: f32,
        right: f32,
        source_frames_advanced: u32,
    },
    /// The producer flushed; the consumer snapped to live data.
    Flushed,
    /// Prefill not reached or buffer empty.
    Empty,
}

/// Producer half, owned by the audio feeder thread.
pub struct RingProducer {
    shared: Arc<RingShared>,
}

/// Consumer half, owned by the audio callback.
pub struct RingConsumer {
    shared: Arc<RingShared>,
    consumer_generation: u64,
    /// Fractional position between the current and next source frame.
    frac: f64,
}

/// Counters snapshot for stats surfaces.
#[derive(Debug, Clone, Default)]
pub struct RingMetrics {
    pub fill_frames: usize,
    pub capacity_frames: usize,
    pub overflow_count: u64,
    pub underrun_count: u64,
    pub producer_alive: bool,
}

/// Creates the ring and splits it into its two halves.
pub fn audio_ring(config: RingConfig) -> (RingProducer, RingConsumer) {
    let capacity_samples = (config.capacity_frames * RING_CHANNELS)
        .max(1024)
        .next_power_of_two();
    let mask = capacity_samples - 1;

    let shared = Arc::new(RingShared {
        buffer: (0..capacity_samples)
            .map(|_| AtomicU32::new(0.0f32.to_bits()))
            .collect::<Vec<_>>()
            .into_boxed_slice(),
        write_pos: AtomicUsize::new(0),
        read_pos: AtomicUsize::new(0),
        mask,
        capacity: capacity_samples,
        prefilled: AtomicBool::new(false),
        prefill_samples: (config.prefill_frames * RING_CHANNELS).min(capacity_samples / 2),
        overflow_count: AtomicU64::new(0),
        underrun_count: AtomicU64::new(0),
        alive: AtomicBool::new(true),
        flush_generation: AtomicU64::new(0),
    });

    (
        RingProducer {
            shared: Arc::clone(&shared),
        },
        RingConsumer {
            shared,
            consumer_generation: 0,
            frac: 0.0,
        },
    )
}

impl RingProducer {
    /// Writes interleaved stereo samples. Always succeeds; a full ring
    /// overwrites the oldest data and the consumer catches up.
    pub fn write(&self, samples: &[f32]) {
        if samples.is_empty() {
            return;
        }
        let s = &self.shared;
        let wp = s.write_pos.load(Ordering::Relaxed);
        let rp = s.read_pos.load(Ordering::Acquire);

        if wp.wrapping_add(samples.len()).wrapping_sub(rp) > s.capacity {
            s.overflow_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut idx = wp & s.mask;
        for &sample in samples {
            s.buffer[idx].store(sample.to_bits(), Ordering::Relaxed);
            idx = (idx + 1) & s.mask;
        }
        s.write_pos
            .store(wp.wrapping_add(samples.len()), Ordering::Release);

        if !s.prefilled.load(Ordering::Relaxed) {
            let fill = s
                .write_pos
                .load(Ordering::Relaxed)
                .wrapping_sub(s.read_pos.load(Ordering::Relaxed));
            if fill >= s.prefill_samples {
                s.prefilled.store(true, Ordering::Release);
                tracing::debug!(
                    "audio ring prefilled ({} samples, threshold {})",
                    fill,
                    s.prefill_samples
                );
            }
        }
    }

    /// Requests a flush (seek): the consumer discards everything buffered
    /// and prefill restarts.
    pub fn request_flush(&self) {
        let s = &self.shared;
        s.prefilled.store(false, Ordering::Relaxed);
        s.flush_generation.fetch_add(1, Ordering::Release);
    }

    pub fn metrics(&self) -> RingMetrics {
        self.shared.metrics()
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.shared.alive.store(false, Ordering::Release);
    }
}

impl RingConsumer {
    /// Produces one output frame by linear interpolation at the fractional
    /// cursor, then advances the cursor by `step` source frames.
    ///
    /// `step` is `playback_rate * source_rate / output_rate`; 1.0 is plain
    /// passthrough at matched rates.
    pub fn next_frame(&mut self, step: f64) -> ReadFrame {
        let s = &self.shared;

        // Flush wins over everything, including the prefill gate.
        let generation = s.flush_generation.load(Ordering::Acquire);
        if generation != self.consumer_generation {
            self.consumer_generation = generation;
            self.frac = 0.0;
            let wp = s.write_pos.load(Ordering::Acquire);
            s.read_pos.store(wp, Ordering::Release);
            return ReadFrame::Flushed;
        }

        if !s.prefilled.load(Ordering::Acquire) {
            return ReadFrame::Empty;
        }

        let mut rp = s.read_pos.load(Ordering::Relaxed);
        let wp = s.write_pos.load(Ordering::Acquire);

        let fill = wp.wrapping_sub(rp);
        if fill < RING_CHANNELS {
            s.underrun_count.fetch_add(1, Ordering::Relaxed);
            return ReadFrame::Empty;
        }
        // Producer lapped us: skip forward, keep half a buffer of headroom.
        if fill > s.capacity {
            rp = wp.wrapping_sub(s.capacity / 2);
            // Align to a frame boundary.
            rp &= !(RING_CHANNELS - 1);
            s.read_pos.store(rp, Ordering::Relaxed);
            self.frac = 0.0;
        }

        let read_sample = |pos: usize| -> f32 {
            f32::from_bits(s.buffer[pos & s.mask].load(Ordering::Relaxed))
        };

        let l0 = read_sample(rp);
        let r0 = read_sample(rp + 1);
        // Interpolation partner: the next frame, or a hold at the tail.
        let has_next = wp.wrapping_sub(rp) >= 2 * RING_CHANNELS;
        let (l1, r1) = if has_next {
            (read_sample(rp + 2), read_sample(rp + 3))
        } else {
            (l0, r0)
        };

        let t = self.frac.min(1.0) as f32;
        let left = l0 + (l1 - l0) * t;
        let right = r0 + (r1 - r0) * t;

        self.frac += step;
        let mut advanced = 0u32;
        while self.frac >= 1.0 {
            if wp.wrapping_sub(rp) < 2 * RING_CHANNELS {
                // Starved at the tail: hold the last frame and cap the
                // cursor so the clock slips instead of extrapolating.
                self.frac = 1.0;
                break;
            }
            rp = rp.wrapping_add(RING_CHANNELS);
            self.frac -= 1.0;
            advanced += 1;
        }
        if advanced > 0 {
            s.read_pos.store(rp, Ordering::Release);
        }

        ReadFrame::Frame {
            left,
            right,
            source_frames_advanced: advanced,
        }
    }

    pub fn is_producer_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> RingMetrics {
        self.shared.metrics()
    }
}

impl RingShared {
    fn metrics(&self) -> RingMetrics {
        let wp = self.write_pos.load(Ordering::Relaxed);
        let rp = self.read_pos.load(Ordering::Relaxed);
        RingMetrics {
            fill_frames: wp.wrapping_sub(rp).min(self.capacity) / RING_CHANNELS,
            capacity_frames: self.capacity / RING_CHANNELS,
            overflow_count: self.overflow_count.load(Ordering::Relaxed),
            underrun_count: self.underrun_count.load(Ordering::Relaxed),
            producer_alive: self.alive.load(Ordering::Relaxed),
        }
    }
}
