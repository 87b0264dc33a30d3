//! Observer interfaces for player and source notifications.
//!
//! Observers are registered once at construction and survive every
//! lifecycle transition short of `destroy()`. Components never require
//! re-registration after a reset or a new load.

use std::time::Duration;

use crate::error::{PlayerError, SourceError};

/// Playback lifecycle notifications.
///
/// All methods have no-op defaults so embedders implement only what they
/// need. Callbacks may arrive from internal worker threads; implementations
/// must be cheap and must not call back into the player re-entrantly.
pub trait PlayerEvents: Send + Sync {
    /// Current playback position advanced (coalesced to ~4 Hz).
    fn on_time_update(&self, _position: Duration) {}

    /// Media duration became known or changed.
    fn on_duration_change(&self, _duration: Duration) {}

    /// Playing/paused flipped.
    fn on_play_state_change(&self, _playing: bool) {}

    /// Presentation stalled waiting for data.
    fn on_buffering_start(&self) {}

    /// Presentation resumed after a stall.
    fn on_buffering_end(&self) {}

    /// Playback reached the end of the media.
    fn on_ended(&self) {}

    /// A fatal, classified error occurred. Emitted exactly once per
    /// failure episode.
    fn on_error(&self, _error: &PlayerError) {}
}

/// No-op observer for embedders that poll state instead.
pub struct NullEvents;

impl PlayerEvents for NullEvents {}

/// Byte source notifications, delivered to the controller.
pub trait MediaSourceEvents: Send + Sync {
    /// An ordered chunk of container bytes arrived.
    fn on_chunk(&self, data: bytes::Bytes, file_offset: u64);

    /// Download progress (loaded bytes, total if known).
    fn on_progress(&self, _loaded: u64, _total: Option<u64>) {}

    /// The fast-start byte window has been received.
    fn on_fast_start(&self) {}

    /// The source delivered all bytes.
    fn on_complete(&self) {}

    /// The source failed.
    fn on_error(&self, _error: SourceError) {}
}
