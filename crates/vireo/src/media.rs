//! Core media data model: tracks, coded samples, decoded frames.
//!
//! These types flow between the demuxer, the decoder selector, the frame
//! queues, and the presentation layer. They are deliberately plain data —
//! all behavior lives in the components that produce and consume them.

use std::time::Duration;

use bytes::Bytes;

/// The kind of an elementary stream inside the container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    /// Video track (coded pictures)
    Video,
    /// Audio track (coded audio frames)
    Audio,
}

/// Codec identifier for a track, resolved from the sample description box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecId {
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
    /// AAC (LC or HE profiles, per the AudioSpecificConfig)
    Aac,
    /// A sample entry fourcc this engine does not decode
    Unknown(u32),
}

impl CodecId {
    /// Returns the RFC 6381 style codec string used for capability probing.
    ///
    /// Profile/level digits come from the codec init data when present; the
    /// generic form is used otherwise. Capability tables match on the codec
    /// family prefix, so the generic form is sufficient for selection.
    pub fn codec_string(&self, init_data: Option<&[u8]>) -> String {
        match self {
            CodecId::H264 => {
                // avcC: [version, profile, compat, level, ...]
                if let Some(avcc) = init_data {
                    if avcc.len() >= 4 {
                        return format!("avc1.{:02x}{:02x}{:02x}", avcc[1], avcc[2], avcc[3]);
                    }
                }
                "avc1".to_string()
            }
            CodecId::H265 => "hvc1".to_string(),
            CodecId::Aac => "mp4a.40.2".to_string(),
            CodecId::Unknown(fourcc) => {
                let b = fourcc.to_be_bytes();
                String::from_utf8_lossy(&b).into_owned()
            }
        }
    }
}

/// Metadata for one track, produced by the demuxer when the structural
/// metadata box has been fully parsed.
#[derive(Debug, Clone)]
pub struct TrackInfo {
    /// Track id from the track header box
    pub id: u32,
    /// Video or audio
    pub kind: TrackKind,
    /// Resolved codec
    pub codec: CodecId,
    /// RFC 6381 style codec string for capability probing
    pub codec_string: String,
    /// Coded width in pixels (video only)
    pub width: u32,
    /// Coded height in pixels (video only)
    pub height: u32,
    /// Sample rate in Hz (audio only)
    pub sample_rate: u32,
    /// Channel count (audio only)
    pub channels: u16,
    /// Media timescale (ticks per second) for this track
    pub timescale: u32,
    /// Codec initialization payload: avcC for H.264, AudioSpecificConfig
    /// for AAC. `None` when the sample description carried none — decoders
    /// must then extract parameters from the first keyframe.
    pub init_data: Option<Vec<u8>>,
}

/// Immutable description of a loaded media resource.
///
/// Produced exactly once per load cycle when the demuxer has parsed the
/// structural metadata; never mutated afterwards. A re-parse after `reset`
/// produces a new instance rather than updating this one.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// Total presentation duration
    pub duration: Duration,
    /// All playable tracks, in container order
    pub tracks: Vec<TrackInfo>,
    /// True when the bytes arrive progressively from a network source
    pub streamed: bool,
    /// True when random access (seek) is possible
    pub seekable: bool,
}

impl MediaInfo {
    /// Returns the first track of the given kind, if any.
    pub fn track(&self, kind: TrackKind) -> Option<&TrackInfo> {
        self.tracks.iter().find(|t| t.kind == kind)
    }
}

/// One compressed sample extracted from the container.
///
/// Samples are produced in decode order per track and consumed exactly once
/// by the decoder selector; they are not retained after submission.
#[derive(Debug, Clone)]
pub struct CodedSample {
    /// Owning track id
    pub track_id: u32,
    /// Opaque codec payload (AVCC-framed for video, raw AAC for audio)
    pub data: Bytes,
    /// Presentation timestamp
    pub pts: Duration,
    /// Sample duration
    pub duration: Duration,
    /// True for sync samples (decodable without prior samples)
    pub keyframe: bool,
}

/// A decoded video frame: tightly packed RGBA pixels plus its presentation
/// timestamp. Owned by the video frame queue until claimed by the
/// presentation driver, then released after rendering.
#[derive(Clone)]
pub struct VideoFrame {
    /// Presentation timestamp
    pub pts: Duration,
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// RGBA pixel data, `width * height * 4` bytes
    pub pixels: Vec<u8>,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("pts", &self.pts)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels_len", &self.pixels.len())
            .finish()
    }
}

/// A decoded audio frame: interleaved f32 samples plus format and timing.
/// Ownership transfers to the audio engine on enqueue.
#[derive(Clone)]
pub struct AudioFrame {
    /// Presentation timestamp of the first sample
    pub pts: Duration,
    /// Source sample rate in Hz
    pub sample_rate: u32,
    /// Interleaved channel count
    pub channels: u16,
    /// Interleaved samples in [-1, 1]
    pub data: Vec<f32>,
}

impl AudioFrame {
    /// Number of per-channel sample frames in this buffer.
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            return 0;
        }
        self.data.len() / self.channels as usize
    }

    /// Duration covered by this buffer at the source rate.
    pub fn span(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frame_count() as f64 / self.sample_rate as f64)
    }
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("pts", &self.pts)
            .field("sample_rate", &self.sample_rate)
            .field("channels", &self.channels)
            .field("frames", &self.frame_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_string_from_avcc() {
        let avcc = [1u8, 0x64, 0x00, 0x1f, 0xff];
        assert_eq!(
            CodecId::H264.codec_string(Some(&avcc)),
            "avc1.64001f".to_string()
        );
        assert_eq!(CodecId::H264.codec_string(None), "avc1".to_string());
        assert_eq!(CodecId::Aac.codec_string(None), "mp4a.40.2".to_string());
    }

    #[test]
    fn audio_frame_span() {
        let frame = AudioFrame {
            pts: Duration::ZERO,
            sample_rate: 48000,
            channels: 2,
            data: vec![0.0; 9600],
        };
        assert_eq!(frame.frame_count(), 4800);
        assert_eq!(frame.span(), Duration::from_millis(100));
    }

    #[test]
    fn media_info_track_lookup() {
        let info = MediaInfo {
            duration: Duration::from_secs(10),
            tracks: vec![TrackInfo {
                id: 1,
                kind: TrackKind::Audio,
                codec: CodecId::Aac,
                codec_string: "mp4a.40.2".into(),
                width: 0,
                height: 0,
                sample_rate: 44100,
                channels: 2,
                timescale: 44100,
                init_data: None,
            }],
            streamed: false,
            seekable: true,
        };
        assert!(info.track(TrackKind::Video).is_none());
        assert_eq!(info.track(TrackKind::Audio).map(|t| t.id), Some(1));
    }
}
