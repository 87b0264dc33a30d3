//! A/V synchronization instrumentation.
//!
//! Records the drift between each presented video frame and the playback
//! clock at presentation time. Lock-free; updated from the render thread,
//! snapshotted from anywhere.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Drift within this bound counts as in sync (streaming-practical bound;
/// ±40 ms would be imperceptible on ideal networks).
pub const SYNC_DRIFT_THRESHOLD_MS: i64 = 100;

/// Drift beyond this is logged as clearly out of sync.
pub const SYNC_DRIFT_SEVERE_MS: i64 = 200;

/// Thread-safe drift tracker.
#[derive(Clone)]
pub struct SyncMetrics {
    inner: Arc<SyncMetricsInner>,
}

struct SyncMetricsInner {
    /// Signed current drift in microseconds (video minus clock; positive =
    /// video ahead).
    current_drift_us: AtomicI64,
    max_drift_ahead_us: AtomicI64,
    max_drift_behind_us: AtomicI64,
    total_drift_us: AtomicU64,
    sample_count: AtomicU64,
    out_of_sync_count: AtomicU64,
    /// Presentation ticks that found the queue empty while playing.
    underrun_count: AtomicU64,
    /// Samples still exempt from max-drift tracking after a seek.
    grace_samples: AtomicU64,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SyncMetricsInner {
                current_drift_us: AtomicI64::new(0),
                max_drift_ahead_us: AtomicI64::new(0),
                max_drift_behind_us: AtomicI64::new(0),
                total_drift_us: AtomicU64::new(0),
                sample_count: AtomicU64::new(0),
                out_of_sync_count: AtomicU64::new(0),
                underrun_count: AtomicU64::new(0),
                grace_samples: AtomicU64::new(0),
            }),
        }
    }

    /// Records one presented frame against the clock position.
    pub fn record_frame(&self, video_pts: Duration, clock: Duration) {
        let drift_us = video_pts.as_micros() as i64 - clock.as_micros() as i64;

        let in_grace = self
            .inner
            .grace_samples
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1))
            .is_ok();

        self.inner.current_drift_us.store(drift_us, Ordering::Relaxed);
        if !in_grace {
            if drift_us > 0 {
                self.inner
                    .max_drift_ahead_us
                    .fetch_max(drift_us, Ordering::Relaxed);
            } else {
                self.inner
                    .max_drift_behind_us
                    .fetch_min(drift_us, Ordering::Relaxed);
            }
        }
        self.inner
            .total_drift_us
            .fetch_add(drift_us.unsigned_abs(), Ordering::Relaxed);
        self.inner.sample_count.fetch_add(1, Ordering::Relaxed);

        let drift_ms = drift_us.abs() / 1000;
        if drift_ms > SYNC_DRIFT_THRESHOLD_MS {
            self.inner.out_of_sync_count.fetch_add(1, Ordering::Relaxed);
            if drift_ms > SYNC_DRIFT_SEVERE_MS {
                let direction = if drift_us > 0 { "ahead of" } else { "behind" };
                tracing::warn!(
                    "video {}ms {} the playback clock (pts={:?}, clock={:?})",
                    drift_ms,
                    direction,
                    video_pts,
                    clock
                );
            }
        }
    }

    /// Records a presentation-time queue underrun.
    pub fn record_underrun(&self) {
        self.inner.underrun_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Exempts the next `samples` frames from max-drift tracking (seek
    /// warmup produces transient spikes that are not sync failures).
    pub fn set_grace_period(&self, samples: u64) {
        self.inner.grace_samples.store(samples, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.inner.current_drift_us.store(0, Ordering::Relaxed);
        self.inner.max_drift_ahead_us.store(0, Ordering::Relaxed);
        self.inner.max_drift_behind_us.store(0, Ordering::Relaxed);
        self.inner.total_drift_us.store(0, Ordering::Relaxed);
        self.inner.sample_count.store(0, Ordering::Relaxed);
        self.inner.out_of_sync_count.store(0, Ordering::Relaxed);
        self.inner.underrun_count.store(0, Ordering::Relaxed);
        self.inner.grace_samples.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SyncMetricsSnapshot {
        let samples = self.inner.sample_count.load(Ordering::Relaxed);
        let total = self.inner.total_drift_us.load(Ordering::Relaxed);
        SyncMetricsSnapshot {
            current_drift_us: self.inner.current_drift_us.load(Ordering::Relaxed),
            max_drift_ahead_us: self.inner.max_drift_ahead_us.load(Ordering::Relaxed),
            max_drift_behind_us: self.inner.max_drift_behind_us.load(Ordering::Relaxed),
            avg_drift_us: if samples > 0 { (total / samples) as i64 } else { 0 },
            sample_count: samples,
            out_of_sync_count: self.inner.out_of_sync_count.load(Ordering::Relaxed),
            underrun_count: self.inner.underrun_count.load(Ordering::Relaxed),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of the drift tracker.
#[derive(Debug, Clone, Default)]
pub struct SyncMetricsSnapshot {
    pub current_drift_us: i64,
    pub max_drift_ahead_us: i64,
    pub max_drift_behind_us: i64,
    pub avg_drift_us: i64,
    pub sample_count: u64,
    pub out_of_sync_count: u64,
    pub underrun_count: u64,
}

impl SyncMetricsSnapshot {
    pub fn current_drift_ms(&self) -> i64 {
        self.current_drift_us / 1000
    }

    pub fn max_drift_ms(&self) -> i64 {
        self.max_drift_ahead_us
            .abs()
            .max(self.max_drift_behind_us.abs())
            / 1000
    }

    pub fn out_of_sync_percentage(&self) -> f64 {
        if self.sample_count == 0 {
            0.0
        } else {
            (self.out_of_sync_count as f64 / self.sample_count as f64) * 100.0
        }
    }
}
