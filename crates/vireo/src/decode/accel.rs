//! The platform-accelerated decoder seam.
//!
//! Platform codec services are contracted black boxes: the selector only
//! sees the [`AcceleratorProbe`] capability query and the adapter traits in
//! [`super`]. Integrations (VideoToolbox, Media Foundation, MediaCodec)
//! implement the probe and hand back adapters; this crate ships only the
//! portable default, which reports no accelerated support and routes every
//! load down the software path.
//!
//! The probe is injected at selector construction. There is no ambient
//! capability registry to patch — tests and embedders pass their own probe.

use crate::decode::{AudioDecoderAdapter, VideoDecoderAdapter};
use crate::error::DecodeError;
use crate::media::{TrackInfo, TrackKind};

/// Capability query + adapter factory for the accelerated path.
pub trait AcceleratorProbe: Send + Sync {
    /// Declared support for a codec string, before any configuration is
    /// attempted. A `true` here may still fail at `create_*` time (probe
    /// races, driver limits); the selector treats that as a fallback
    /// trigger, not a contract violation.
    fn supports(&self, kind: TrackKind, codec_string: &str) -> bool;

    /// Creates and configures an accelerated video adapter for the track.
    fn create_video(&self, track: &TrackInfo) -> Result<Box<dyn VideoDecoderAdapter>, DecodeError>;

    /// Creates and configures an accelerated audio adapter for the track.
    fn create_audio(&self, track: &TrackInfo) -> Result<Box<dyn AudioDecoderAdapter>, DecodeError>;
}

/// Portable default probe: no platform integration, no declared support.
///
/// On targets with a platform decoder integration the embedder passes that
/// integration's probe instead; this default keeps the selector total on
/// every target.
pub struct SystemProbe;

impl AcceleratorProbe for SystemProbe {
    fn supports(&self, _kind: TrackKind, _codec_string: &str) -> bool {
        false
    }

    fn create_video(
        &self,
        track: &TrackInfo,
    ) -> Result<Box<dyn VideoDecoderAdapter>, DecodeError> {
        Err(DecodeError::Unsupported {
            codec: track.codec_string.clone(),
            path: "accelerated",
            reason: "no platform decoder integration on this target".into(),
        })
    }

    fn create_audio(
        &self,
        track: &TrackInfo,
    ) -> Result<Box<dyn AudioDecoderAdapter>, DecodeError> {
        Err(DecodeError::Unsupported {
            codec: track.codec_string.clone(),
            path: "accelerated",
            reason: "no platform decoder integration on this target".into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_probe_declares_nothing() {
        let probe = SystemProbe;
        assert!(!probe.supports(TrackKind::Video, "avc1.64001f"));
        assert!(!probe.supports(TrackKind::Audio, "mp4a.40.2"));
    }
}
