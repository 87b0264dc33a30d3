//! Software decoder adapters: openh264 for H.264 video, symphonia for AAC
//! audio.
//!
//! Both adapters are synchronous; the selector runs them on worker threads.
//! The video adapter converts AVCC length-prefixed samples to Annex B and
//! replays the avcC parameter sets ahead of sync samples, which is what the
//! underlying decoder expects from a cold start or a seek.

use std::time::Duration;

use openh264::decoder::Decoder as H264Decoder;
use openh264::formats::YUVSource;
use symphonia::core::audio::{Layout, SampleBuffer};
use symphonia::core::codecs::{CodecParameters, Decoder as _, DecoderOptions, CODEC_TYPE_AAC};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::Packet;

use crate::decode::{AudioDecoderAdapter, VideoDecoderAdapter};
use crate::error::DecodeError;
use crate::media::{AudioFrame, CodecId, CodedSample, TrackInfo, VideoFrame};

const ANNEX_B_START: [u8; 4] = [0, 0, 0, 1];

/// Parameter sets and framing info parsed from an avcC record.
struct AvcConfig {
    /// Bytes of the NAL length prefix in AVCC samples (1, 2 or 4).
    nal_length_size: usize,
    /// SPS + PPS, already Annex-B framed, replayed before sync samples.
    parameter_sets: Vec<u8>,
}

impl AvcConfig {
    /// Parses an avcC record: configuration version, profile/level, length
    /// size, then length-prefixed SPS and PPS arrays.
    fn parse(avcc: &[u8]) -> Result<Self, DecodeError> {
        let malformed = || DecodeError::Backend("truncated avcC record".into());
        if avcc.len() < 7 {
            return Err(malformed());
        }
        let nal_length_size = (avcc[4] & 0x03) as usize + 1;
        let mut parameter_sets = Vec::new();
        let mut pos = 5usize;

        let sps_count = (avcc[pos] & 0x1f) as usize;
        pos += 1;
        for _ in 0..sps_count {
            let len = u16::from_be_bytes([
                *avcc.get(pos).ok_or_else(malformed)?,
                *avcc.get(pos + 1).ok_or_else(malformed)?,
            ]) as usize;
            pos += 2;
            let nal = avcc.get(pos..pos + len).ok_or_else(malformed)?;
            parameter_sets.extend_from_slice(&ANNEX_B_START);
            parameter_sets.extend_from_slice(nal);
            pos += len;
        }

        let pps_count = *avcc.get(pos).ok_or_else(malformed)? as usize;
        pos += 1;
        for _ in 0..pps_count {
            let len = u16::from_be_bytes([
                *avcc.get(pos).ok_or_else(malformed)?,
                *avcc.get(pos + 1).ok_or_else(malformed)?,
            ]) as usize;
            pos += 2;
            let nal = avcc.get(pos..pos + len).ok_or_else(malformed)?;
            parameter_sets.extend_from_slice(&ANNEX_B_START);
            parameter_sets.extend_from_slice(nal);
            pos += len;
        }

        Ok(Self {
            nal_length_size,
            parameter_sets,
        })
    }
}

/// Rewrites an AVCC length-prefixed access unit as Annex B.
fn avcc_to_annex_b(data: &[u8], nal_length_size: usize) -> Result<Vec<u8>, DecodeError> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut pos = 0usize;
    while pos + nal_length_size <= data.len() {
        let mut len = 0usize;
        for i in 0..nal_length_size {
            len = (len << 8) | data[pos + i] as usize;
        }
        pos += nal_length_size;
        let nal = data
            .get(pos..pos + len)
            .ok_or_else(|| DecodeError::Backend("NAL length exceeds sample".into()))?;
        out.extend_from_slice(&ANNEX_B_START);
        out.extend_from_slice(nal);
        pos += len;
    }
    if pos != data.len() {
        return Err(DecodeError::Backend(
            "trailing bytes after last NAL unit".into(),
        ));
    }
    Ok(out)
}

/// H.264 software decoder over openh264.
pub struct SoftwareVideoDecoder {
    decoder: Option<H264Decoder>,
    config: Option<AvcConfig>,
    closed: bool,
}

impl SoftwareVideoDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            config: None,
            closed: false,
        }
    }

    fn decoder_mut(&mut self) -> Result<&mut H264Decoder, DecodeError> {
        if self.decoder.is_none() {
            // One-time software runtime initialization, deferred to first
            // use so configure stays cheap on the fallback-probe path.
            let decoder = H264Decoder::new()
                .map_err(|e| DecodeError::Backend(format!("openh264 init: {e}")))?;
            self.decoder = Some(decoder);
        }
        Ok(self.decoder.as_mut().expect("decoder just initialized"))
    }

    fn yuv_to_frame(yuv: &openh264::decoder::DecodedYUV<'_>, pts: Duration) -> VideoFrame {
        let (width, height) = yuv.dimensions();
        let mut pixels = vec![0u8; width * height * 4];
        yuv.write_rgba8(&mut pixels);
        VideoFrame {
            pts,
            width: width as u32,
            height: height as u32,
            pixels,
        }
    }
}

impl Default for SoftwareVideoDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl VideoDecoderAdapter for SoftwareVideoDecoder {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        match track.codec {
            CodecId::H264 => {}
            other => {
                return Err(DecodeError::Unsupported {
                    codec: track.codec_string.clone(),
                    path: "software",
                    reason: format!("no software decoder for {other:?}"),
                })
            }
        }
        self.config = match &track.init_data {
            Some(avcc) => Some(AvcConfig::parse(avcc)?),
            // Without avcC the first delivered sample must be a keyframe
            // carrying in-band parameter sets; assume 4-byte NAL lengths.
            None => Some(AvcConfig {
                nal_length_size: 4,
                parameter_sets: Vec::new(),
            }),
        };
        // Fail configuration early if the runtime cannot come up at all.
        self.decoder_mut()?;
        Ok(())
    }

    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<VideoFrame>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        let config = self
            .config
            .as_ref()
            .ok_or(DecodeError::NotConfigured(sample.track_id))?;

        let mut bitstream = Vec::new();
        if sample.keyframe && !config.parameter_sets.is_empty() {
            bitstream.extend_from_slice(&config.parameter_sets);
        }
        bitstream.extend(avcc_to_annex_b(&sample.data, config.nal_length_size)?);

        let pts = sample.pts;
        let decoder = self.decoder_mut()?;
        match decoder.decode(&bitstream) {
            Ok(Some(yuv)) => Ok(vec![Self::yuv_to_frame(&yuv, pts)]),
            // The decoder buffered the access unit; output follows later.
            Ok(None) => Ok(Vec::new()),
            Err(e) => Err(DecodeError::Backend(format!("openh264 decode: {e}"))),
        }
    }

    fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError> {
        // openh264 emits in decode order without reorder delay for the
        // profiles it accepts; there is nothing buffered to drain.
        Ok(Vec::new())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.config = None;
        self.closed = true;
    }
}

/// AAC software decoder over symphonia.
pub struct SoftwareAudioDecoder {
    decoder: Option<Box<dyn symphonia::core::codecs::Decoder>>,
    track_id: u32,
    closed: bool,
}

impl SoftwareAudioDecoder {
    pub fn new() -> Self {
        Self {
            decoder: None,
            track_id: 0,
            closed: false,
        }
    }
}

impl Default for SoftwareAudioDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioDecoderAdapter for SoftwareAudioDecoder {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        match track.codec {
            CodecId::Aac => {}
            other => {
                return Err(DecodeError::Unsupported {
                    codec: track.codec_string.clone(),
                    path: "software",
                    reason: format!("no software decoder for {other:?}"),
                })
            }
        }

        let mut params = CodecParameters::new();
        params.for_codec(CODEC_TYPE_AAC);
        if track.sample_rate > 0 {
            params.with_sample_rate(track.sample_rate);
        }
        match track.channels {
            1 => {
                params.with_channel_layout(Layout::Mono);
            }
            2 => {
                params.with_channel_layout(Layout::Stereo);
            }
            6 => {
                params.with_channel_layout(Layout::FivePointOne);
            }
            // The AudioSpecificConfig carries the channel configuration;
            // other layouts are resolved by the decoder itself.
            _ => {}
        }
        if let Some(asc) = &track.init_data {
            params.with_extra_data(asc.clone().into_boxed_slice());
        }

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| DecodeError::Unsupported {
                codec: track.codec_string.clone(),
                path: "software",
                reason: format!("symphonia: {e}"),
            })?;
        self.decoder = Some(decoder);
        self.track_id = track.id;
        Ok(())
    }

    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<AudioFrame>, DecodeError> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        let decoder = self
            .decoder
            .as_mut()
            .ok_or(DecodeError::NotConfigured(sample.track_id))?;

        let packet = Packet::new_from_slice(
            self.track_id,
            sample.pts.as_micros() as u64,
            sample.duration.as_micros() as u64,
            &sample.data,
        );

        let decoded = match decoder.decode(&packet) {
            Ok(buf) => buf,
            // A single bad frame is a recoverable skip, not a dead decoder.
            Err(SymphoniaError::DecodeError(e)) => {
                return Err(DecodeError::Backend(format!("bad AAC frame: {e}")))
            }
            Err(e) => return Err(DecodeError::Backend(format!("symphonia: {e}"))),
        };

        let spec = *decoded.spec();
        let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buf.copy_interleaved_ref(decoded);

        Ok(vec![AudioFrame {
            pts: sample.pts,
            sample_rate: spec.rate,
            channels: spec.channels.count() as u16,
            data: buf.samples().to_vec(),
        }])
    }

    fn flush(&mut self) -> Result<Vec<AudioFrame>, DecodeError> {
        if let Some(decoder) = self.decoder.as_mut() {
            decoder.reset();
        }
        Ok(Vec::new())
    }

    fn close(&mut self) {
        self.decoder = None;
        self.closed = true;
    }
}
