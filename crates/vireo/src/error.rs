//! Error types for the playback pipeline.
//!
//! Each subsystem has its own error enum; the controller folds fatal
//! conditions into [`PlayerError`], the single classified surface shown to
//! embedders. Recoverable conditions (dropped frames, pre-keyframe skips)
//! are counted in statistics instead of propagating.

use std::io;

use thiserror::Error;

use crate::media::TrackKind;

/// Errors from the container demuxer.
#[derive(Debug, Error)]
pub enum DemuxError {
    #[error("non-contiguous append: expected offset {expected}, got {got}")]
    NonContiguous { expected: u64, got: u64 },

    #[error("malformed container: {0}")]
    Malformed(String),

    #[error("structural metadata references data outside the file: {0}")]
    BadReference(String),
}

/// Errors from decoder configuration and submission.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("codec {codec} not supported by the {path} path: {reason}")]
    Unsupported {
        codec: String,
        path: &'static str,
        reason: String,
    },

    #[error("no decoder available for {kind:?} ({codec}): accelerated path: {accel_reason}; software path: {software_reason}")]
    NoDecoder {
        kind: TrackKind,
        codec: String,
        accel_reason: String,
        software_reason: String,
    },

    #[error("decoder not configured for track {0}")]
    NotConfigured(u32),

    #[error("non-keyframe sample delivered before any keyframe on track {track_id}")]
    KeyframeRequired { track_id: u32 },

    #[error("decoder backend error: {0}")]
    Backend(String),

    #[error("decoder is closed")]
    Closed,
}

/// Errors from the audio output engine.
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio output initialization failed: {0}")]
    Init(String),

    #[error("audio output stream error: {0}")]
    Stream(String),
}

/// Errors from the renderer tiers.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("renderer tier unavailable: {0}")]
    TierUnavailable(String),

    #[error("no renderer available: {0}")]
    NoRenderer(String),

    #[error("render failed: {0}")]
    RenderFailed(String),
}

/// Errors from the byte sources.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("invalid URL: {0}")]
    Url(String),

    #[error("HTTP error status {0}")]
    HttpStatus(u16),

    #[error("too many redirect responses")]
    TooManyRedirects,

    #[error("redirect response missing or invalid Location header")]
    BadRedirect,

    #[error("TLS configuration error: {0}")]
    Tls(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl SourceError {
    /// True when the failure carried an HTTP status (server responded),
    /// as opposed to a connectivity failure. Used for user messaging.
    pub fn is_http_status(&self) -> bool {
        matches!(self, SourceError::HttpStatus(_))
    }
}

/// The classified, user-facing error surface of the player.
///
/// Exactly one of these is emitted per failure episode; the controller
/// transitions to the `Error` state when it fires.
#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("malformed container: {0}")]
    MalformedContainer(#[from] DemuxError),

    #[error("{0}")]
    NoDecoderAvailable(DecodeError),

    #[error("no renderer available: {0}")]
    NoRendererAvailable(String),

    #[error("audio initialization failed: {0} (retry after user interaction)")]
    AudioInit(String),

    #[error("network error: {0}")]
    Network(SourceError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("player was destroyed")]
    Destroyed,
}

impl PlayerError {
    /// Short stable code for each error class, for embedder dispatch.
    pub fn code(&self) -> &'static str {
        match self {
            PlayerError::MalformedContainer(_) => "malformed-container",
            PlayerError::NoDecoderAvailable(_) => "no-decoder",
            PlayerError::NoRendererAvailable(_) => "no-renderer",
            PlayerError::AudioInit(_) => "audio-init",
            PlayerError::Network(_) => "network",
            PlayerError::Io(_) => "io",
            PlayerError::Destroyed => "destroyed",
        }
    }

    /// True when a new load can recover from this error.
    pub fn recoverable_by_reload(&self) -> bool {
        !matches!(
            self,
            PlayerError::NoRendererAvailable(_) | PlayerError::Destroyed
        )
    }
}
