//! Bounded decoded-frame queues.
//!
//! One queue per media kind decouples decode throughput from presentation
//! throughput. The queues are deliberately lossy: a push onto a full queue
//! drops the oldest entry and bumps a counter instead of blocking the
//! decode callback — backpressure is absorbed here, never propagated into
//! the decoder.
//!
//! `peek_up_to` is the A/V-sync read primitive: it returns the newest frame
//! not after the given clock value and discards (and counts) everything
//! older in the same call.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::media::{AudioFrame, VideoFrame};

/// Default video queue capacity (~1 s at 30 fps).
pub const VIDEO_QUEUE_CAP: usize = 30;

/// Default audio queue capacity.
pub const AUDIO_QUEUE_CAP: usize = 50;

/// Anything with a presentation timestamp can be queued.
pub trait Timestamped {
    fn timestamp(&self) -> Duration;
}

impl Timestamped for VideoFrame {
    fn timestamp(&self) -> Duration {
        self.pts
    }
}

impl Timestamped for AudioFrame {
    fn timestamp(&self) -> Duration {
        self.pts
    }
}

/// Bounded, timestamp-ordered FIFO of decoded frames.
pub struct FrameQueue<T> {
    frames: Mutex<VecDeque<T>>,
    capacity: usize,
    /// Frames discarded by overflow or by `peek_up_to` staleness.
    dropped: AtomicU64,
}

/// Video-side queue alias.
pub type VideoFrameQueue = FrameQueue<VideoFrame>;
/// Audio-side queue alias.
pub type AudioFrameQueue = FrameQueue<AudioFrame>;

impl<T: Timestamped> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Pushes a frame, keeping the queue timestamp-ordered.
    ///
    /// Never blocks: a full queue drops its oldest entry first and counts
    /// it. Out-of-order arrivals (decode order vs presentation order) are
    /// inserted at their sorted position.
    pub fn push(&self, frame: T) {
        let mut frames = self.frames.lock();
        if frames.len() >= self.capacity {
            frames.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        // Common case: appended in order. Reordered frames walk back to
        // their slot to keep the timestamp invariant.
        let ts = frame.timestamp();
        let mut idx = frames.len();
        while idx > 0 && frames[idx - 1].timestamp() > ts {
            idx -= 1;
        }
        if idx == frames.len() {
            frames.push_back(frame);
        } else {
            frames.insert(idx, frame);
        }
    }

    /// Returns the newest frame whose timestamp is not after `clock`,
    /// discarding all older frames (counted as dropped). Frames newer than
    /// `clock` stay queued. Returns `None` when nothing is due yet.
    pub fn peek_up_to(&self, clock: Duration) -> Option<T> {
        let mut frames = self.frames.lock();
        let mut current: Option<T> = None;
        let mut discarded = 0u64;
        while let Some(front) = frames.front() {
            if front.timestamp() > clock {
                break;
            }
            if current.is_some() {
                discarded += 1;
            }
            current = frames.pop_front();
        }
        if discarded > 0 {
            self.dropped.fetch_add(discarded, Ordering::Relaxed);
        }
        current
    }

    /// Removes and returns the oldest frame regardless of clock. Used by
    /// the audio feeder, which consumes strictly in timestamp order.
    pub fn pop(&self) -> Option<T> {
        self.frames.lock().pop_front()
    }

    /// Timestamp of the oldest queued frame.
    pub fn front_timestamp(&self) -> Option<Duration> {
        self.frames.lock().front().map(|f| f.timestamp())
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity
    }

    /// Empties the queue (seek/reset). Cleared frames are not counted as
    /// dropped; the counters measure involuntary loss only.
    pub fn clear(&self) {
        self.frames.lock().clear();
    }

    /// Involuntarily discarded frames so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl VideoFrameQueue {
    /// Video queue at the default presentation-side capacity.
    pub fn with_video_capacity() -> Self {
        Self::new(VIDEO_QUEUE_CAP)
    }
}

impl AudioFrameQueue {
    /// Audio queue at the default presentation-side capacity.
    pub fn with_audio_capacity() -> Self {
        Self::new(AUDIO_QUEUE_CAP)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(pts_ms: u64) -> VideoFrame {
        VideoFrame {
            pts: Duration::from_millis(pts_ms),
            width: 1,
            height: 1,
            pixels: vec![0; 4],
        }
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let queue: VideoFrameQueue = FrameQueue::new(3);
        for i in 0..5 {
            queue.push(frame(i * 10));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.front_timestamp(), Some(Duration::from_millis(20)));
    }

    #[test]
    fn queue_bound_holds_after_every_push() {
        let queue: VideoFrameQueue = FrameQueue::new(VIDEO_QUEUE_CAP);
        for i in 0..100 {
            queue.push(frame(i));
            assert!(queue.len() <= VIDEO_QUEUE_CAP);
        }
        assert_eq!(queue.dropped(), 100 - VIDEO_QUEUE_CAP as u64);
    }

    #[test]
    fn peek_up_to_selects_newest_due_frame() {
        let queue: VideoFrameQueue = FrameQueue::new(10);
        for i in 0..5 {
            queue.push(frame(i * 100));
        }
        // Clock at 250 ms: frames 0/100/200 are due; 200 wins, 2 dropped.
        let picked = queue.peek_up_to(Duration::from_millis(250)).unwrap();
        assert_eq!(picked.pts, Duration::from_millis(200));
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.len(), 2);

        // Nothing due yet.
        assert!(queue.peek_up_to(Duration::from_millis(250)).is_none());
    }

    #[test]
    fn peek_up_to_exact_timestamp_is_due() {
        let queue: VideoFrameQueue = FrameQueue::new(10);
        queue.push(frame(100));
        let picked = queue.peek_up_to(Duration::from_millis(100)).unwrap();
        assert_eq!(picked.pts, Duration::from_millis(100));
        assert_eq!(queue.dropped(), 0);
    }

    #[test]
    fn out_of_order_push_restores_timestamp_order() {
        let queue: VideoFrameQueue = FrameQueue::new(10);
        queue.push(frame(0));
        queue.push(frame(66));
        queue.push(frame(33)); // decode order differs from display order
        let picked = queue.peek_up_to(Duration::from_millis(40)).unwrap();
        assert_eq!(picked.pts, Duration::from_millis(33));
        assert_eq!(queue.dropped(), 1); // the 0 ms frame was stale
        assert_eq!(queue.front_timestamp(), Some(Duration::from_millis(66)));
    }

    #[test]
    fn clear_does_not_count_as_dropped() {
        let queue: VideoFrameQueue = FrameQueue::new(10);
        queue.push(frame(0));
        queue.push(frame(10));
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.dropped(), 0);
    }
}
