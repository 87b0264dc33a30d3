//! Shared fixtures for the integration tests: a synthetic MP4 builder,
//! stub accelerated decoders, a chunk-delivering stream source, and a
//! player harness wired to the mock audio backend.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use vireo::audio::mock::{MockDriver, MockOutput};
use vireo::audio::AudioOutputBackend;
use vireo::decode::{AcceleratorProbe, AudioDecoderAdapter, VideoDecoderAdapter};
use vireo::error::{DecodeError, PlayerError, SourceError};
use vireo::events::MediaSourceEvents;
use vireo::media::{AudioFrame, CodedSample, TrackInfo, TrackKind, VideoFrame};
use vireo::scheduler::{IntervalTicker, TickSource};
use vireo::source::MediaSource;
use vireo::{Player, PlayerEvents, RasterRenderer, Renderer};

// ============================================================================
// Synthetic MP4 builder
// ============================================================================

pub const VIDEO_TIMESCALE: u32 = 3_000;
pub const AUDIO_TIMESCALE: u32 = 44_100;
pub const AAC_FRAME_SAMPLES: u32 = 1_024;
const SAMPLE_SIZE: u32 = 8;

pub struct VideoSpec {
    pub fourcc: [u8; 4],
    pub fps: u32,
    pub count: u32,
    pub keyframe_interval: u32,
    /// avcC / hvcC payload placed in the sample description.
    pub codec_config: Vec<u8>,
}

pub struct AudioSpec {
    /// Number of 1024-sample AAC frames at 44.1 kHz stereo.
    pub count: u32,
}

pub struct Mp4Config {
    pub duration_ms: u32,
    pub video: Option<VideoSpec>,
    pub audio: Option<AudioSpec>,
    /// Place the movie box after the media data (no fast-start layout).
    pub moov_at_end: bool,
}

impl Mp4Config {
    /// 10 seconds, 30 fps H.264 video + stereo AAC, metadata first.
    pub fn ten_seconds() -> Self {
        Self {
            duration_ms: 10_000,
            video: Some(VideoSpec {
                fourcc: *b"avc1",
                fps: 30,
                count: 300,
                keyframe_interval: 30,
                codec_config: sample_avcc(),
            }),
            audio: Some(AudioSpec { count: 431 }),
            moov_at_end: false,
        }
    }
}

/// A minimal valid avcC record: one SPS, one PPS, 4-byte NAL lengths.
pub fn sample_avcc() -> Vec<u8> {
    vec![
        1, 0x42, 0x00, 0x1f, 0xff, 0xe1, 0x00, 0x02, 0x67, 0x42, 0x01, 0x00, 0x02, 0x68, 0xce,
    ]
}

/// esds descriptor chain carrying an AAC-LC 44.1 kHz stereo
/// AudioSpecificConfig.
fn esds_descriptors() -> Vec<u8> {
    vec![
        0x03, 0x19, // ES_Descriptor
        0x00, 0x01, // ES_ID
        0x00, // flags
        0x04, 0x11, // DecoderConfigDescriptor
        0x40, // objectTypeIndication: AAC
        0x15, // streamType
        0x00, 0x00, 0x00, // bufferSizeDB
        0x00, 0x00, 0x00, 0x00, // maxBitrate
        0x00, 0x00, 0x00, 0x00, // avgBitrate
        0x05, 0x02, // DecoderSpecificInfo
        0x12, 0x10, // AudioSpecificConfig
    ]
}

struct BoxWriter {
    buf: Vec<u8>,
    stack: Vec<usize>,
}

impl BoxWriter {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            stack: Vec::new(),
        }
    }

    fn begin(&mut self, fourcc: &[u8; 4]) {
        self.stack.push(self.buf.len());
        self.buf.extend_from_slice(&[0; 4]);
        self.buf.extend_from_slice(fourcc);
    }

    fn end(&mut self) {
        let start = self.stack.pop().expect("unbalanced box writer");
        let size = (self.buf.len() - start) as u32;
        self.buf[start..start + 4].copy_from_slice(&size.to_be_bytes());
    }

    fn u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    fn zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    fn pos(&self) -> usize {
        self.buf.len()
    }
}

/// Builds a playable single-file MP4 from the config. One sample per
/// chunk, uniform sample sizes, samples interleaved by decode time.
pub fn build_mp4(config: &Mp4Config) -> Vec<u8> {
    let mut w = BoxWriter::new();

    w.begin(b"ftyp");
    w.bytes(b"isom");
    w.u32(0x200);
    w.bytes(b"isomavc1");
    w.end();

    // stco entry positions per track, patched once mdat offsets exist.
    let mut stco = [Vec::new(), Vec::new()];
    let mut offsets: [Vec<u64>; 2] = [Vec::new(), Vec::new()];

    if config.moov_at_end {
        write_mdat(&mut w, config, &mut offsets);
        write_moov(&mut w, config, &mut stco);
    } else {
        write_moov(&mut w, config, &mut stco);
        write_mdat(&mut w, config, &mut offsets);
    }

    for track in 0..2 {
        for (&pos, &offset) in stco[track].iter().zip(offsets[track].iter()) {
            w.buf[pos..pos + 4].copy_from_slice(&(offset as u32).to_be_bytes());
        }
    }
    w.buf
}

fn write_moov(w: &mut BoxWriter, config: &Mp4Config, stco: &mut [Vec<usize>; 2]) {
    w.begin(b"moov");

    w.begin(b"mvhd");
    w.u32(0); // version/flags
    w.zeros(8); // creation/modification
    w.u32(1_000); // movie timescale
    w.u32(config.duration_ms);
    w.u32(0x0001_0000); // rate 1.0
    w.u16(0x0100); // volume 1.0
    w.zeros(10);
    for v in [
        0x0001_0000u32,
        0,
        0,
        0,
        0x0001_0000,
        0,
        0,
        0,
        0x4000_0000,
    ] {
        w.u32(v);
    }
    w.zeros(24); // pre_defined
    w.u32(3); // next track id
    w.end();

    if let Some(video) = &config.video {
        write_video_trak(w, config, video, &mut stco[0]);
    }
    if let Some(audio) = &config.audio {
        write_audio_trak(w, config, audio, &mut stco[1]);
    }
    w.end();
}

fn write_tkhd(w: &mut BoxWriter, track_id: u32, duration_ms: u32) {
    w.begin(b"tkhd");
    w.u32(0x0000_0007); // version 0, enabled flags
    w.zeros(8);
    w.u32(track_id);
    w.zeros(4);
    w.u32(duration_ms);
    w.zeros(8);
    w.u16(0); // layer
    w.u16(0); // alternate group
    w.u16(0); // volume
    w.u16(0);
    for v in [
        0x0001_0000u32,
        0,
        0,
        0,
        0x0001_0000,
        0,
        0,
        0,
        0x4000_0000,
    ] {
        w.u32(v);
    }
    w.u32(64 << 16); // width
    w.u32(64 << 16); // height
    w.end();
}

fn write_mdhd(w: &mut BoxWriter, timescale: u32, duration_ticks: u32) {
    w.begin(b"mdhd");
    w.u32(0);
    w.zeros(8);
    w.u32(timescale);
    w.u32(duration_ticks);
    w.u16(0x55c4); // language: und
    w.u16(0);
    w.end();
}

fn write_hdlr(w: &mut BoxWriter, handler: &[u8; 4]) {
    w.begin(b"hdlr");
    w.u32(0);
    w.u32(0); // pre_defined
    w.bytes(handler);
    w.zeros(12);
    w.zeros(1); // empty name
    w.end();
}

fn write_video_trak(
    w: &mut BoxWriter,
    config: &Mp4Config,
    video: &VideoSpec,
    stco: &mut Vec<usize>,
) {
    let delta = VIDEO_TIMESCALE / video.fps;
    w.begin(b"trak");
    write_tkhd(w, 1, config.duration_ms);
    w.begin(b"mdia");
    write_mdhd(w, VIDEO_TIMESCALE, video.count * delta);
    write_hdlr(w, b"vide");
    w.begin(b"minf");
    w.begin(b"stbl");

    w.begin(b"stsd");
    w.u32(0);
    w.u32(1);
    w.begin(&video.fourcc);
    w.zeros(6);
    w.u16(1); // data reference index
    w.zeros(16);
    w.u16(64); // width
    w.u16(64); // height
    w.u32(0x0048_0000); // horizontal dpi
    w.u32(0x0048_0000); // vertical dpi
    w.u32(0);
    w.u16(1); // frame count
    w.zeros(32); // compressor name
    w.u16(24); // depth
    w.u16(0xFFFF);
    let config_fourcc = if &video.fourcc == b"hvc1" || &video.fourcc == b"hev1" {
        b"hvcC"
    } else {
        b"avcC"
    };
    w.begin(config_fourcc);
    w.bytes(&video.codec_config);
    w.end();
    w.end();
    w.end();

    w.begin(b"stts");
    w.u32(0);
    w.u32(1);
    w.u32(video.count);
    w.u32(delta);
    w.end();

    w.begin(b"stsc");
    w.u32(0);
    w.u32(1);
    w.u32(1);
    w.u32(1);
    w.u32(1);
    w.end();

    w.begin(b"stsz");
    w.u32(0);
    w.u32(SAMPLE_SIZE);
    w.u32(video.count);
    w.end();

    w.begin(b"stco");
    w.u32(0);
    w.u32(video.count);
    for _ in 0..video.count {
        stco.push(w.pos());
        w.u32(0);
    }
    w.end();

    w.begin(b"stss");
    w.u32(0);
    let syncs: Vec<u32> = (0..video.count)
        .step_by(video.keyframe_interval as usize)
        .map(|i| i + 1)
        .collect();
    w.u32(syncs.len() as u32);
    for s in syncs {
        w.u32(s);
    }
    w.end();

    w.end(); // stbl
    w.end(); // minf
    w.end(); // mdia
    w.end(); // trak
}

fn write_audio_trak(
    w: &mut BoxWriter,
    config: &Mp4Config,
    audio: &AudioSpec,
    stco: &mut Vec<usize>,
) {
    w.begin(b"trak");
    write_tkhd(w, 2, config.duration_ms);
    w.begin(b"mdia");
    write_mdhd(w, AUDIO_TIMESCALE, audio.count * AAC_FRAME_SAMPLES);
    write_hdlr(w, b"soun");
    w.begin(b"minf");
    w.begin(b"stbl");

    w.begin(b"stsd");
    w.u32(0);
    w.u32(1);
    w.begin(b"mp4a");
    w.zeros(6);
    w.u16(1); // data reference index
    w.zeros(8);
    w.u16(2); // channels
    w.u16(16); // sample size
    w.zeros(4);
    w.u32(AUDIO_TIMESCALE << 16); // 16.16 sample rate
    w.begin(b"esds");
    w.u32(0);
    let descriptors = esds_descriptors();
    w.bytes(&descriptors);
    w.end();
    w.end();
    w.end();

    w.begin(b"stts");
    w.u32(0);
    w.u32(1);
    w.u32(audio.count);
    w.u32(AAC_FRAME_SAMPLES);
    w.end();

    w.begin(b"stsc");
    w.u32(0);
    w.u32(1);
    w.u32(1);
    w.u32(1);
    w.u32(1);
    w.end();

    w.begin(b"stsz");
    w.u32(0);
    w.u32(SAMPLE_SIZE);
    w.u32(audio.count);
    w.end();

    w.begin(b"stco");
    w.u32(0);
    w.u32(audio.count);
    for _ in 0..audio.count {
        stco.push(w.pos());
        w.u32(0);
    }
    w.end();

    w.end(); // stbl
    w.end(); // minf
    w.end(); // mdia
    w.end(); // trak
}

fn write_mdat(w: &mut BoxWriter, config: &Mp4Config, offsets: &mut [Vec<u64>; 2]) {
    // Interleave by decode time, the layout a muxer would produce.
    let mut order: Vec<(usize, f64)> = Vec::new();
    if let Some(video) = &config.video {
        let delta = (VIDEO_TIMESCALE / video.fps) as f64 / VIDEO_TIMESCALE as f64;
        for i in 0..video.count {
            order.push((0, i as f64 * delta));
        }
    }
    if let Some(audio) = &config.audio {
        let delta = AAC_FRAME_SAMPLES as f64 / AUDIO_TIMESCALE as f64;
        for i in 0..audio.count {
            order.push((1, i as f64 * delta));
        }
    }
    order.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));

    w.begin(b"mdat");
    for (track, _) in order {
        offsets[track].push(w.pos() as u64);
        let marker = if track == 0 { 0xA0 } else { 0xB0 };
        w.bytes(&[marker; SAMPLE_SIZE as usize]);
    }
    w.end();
}

// ============================================================================
// Stub accelerated decoders
// ============================================================================

/// Probe declaring H.264 + AAC support, with configurable create-time
/// failure to force the software fallback.
pub struct StubAccel {
    pub fail_create: bool,
}

impl AcceleratorProbe for StubAccel {
    fn supports(&self, _kind: TrackKind, codec_string: &str) -> bool {
        codec_string.starts_with("avc1") || codec_string.starts_with("mp4a")
    }

    fn create_video(&self, track: &TrackInfo) -> Result<Box<dyn VideoDecoderAdapter>, DecodeError> {
        if self.fail_create {
            return Err(DecodeError::Unsupported {
                codec: track.codec_string.clone(),
                path: "accelerated",
                reason: "stub configured to fail".into(),
            });
        }
        Ok(Box::new(StubVideoDecoder))
    }

    fn create_audio(&self, track: &TrackInfo) -> Result<Box<dyn AudioDecoderAdapter>, DecodeError> {
        if self.fail_create {
            return Err(DecodeError::Unsupported {
                codec: track.codec_string.clone(),
                path: "accelerated",
                reason: "stub configured to fail".into(),
            });
        }
        Ok(Box::new(StubAudioDecoder))
    }
}

/// Emits one 2x2 gray frame per sample at the sample's timestamp.
pub struct StubVideoDecoder;

impl VideoDecoderAdapter for StubVideoDecoder {
    fn configure(&mut self, _track: &TrackInfo) -> Result<(), DecodeError> {
        Ok(())
    }

    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<VideoFrame>, DecodeError> {
        Ok(vec![VideoFrame {
            pts: sample.pts,
            width: 2,
            height: 2,
            pixels: vec![0x7f; 16],
        }])
    }

    fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError> {
        Ok(Vec::new())
    }

    fn close(&mut self) {}
}

/// Emits one 1024-frame stereo tone buffer per sample.
pub struct StubAudioDecoder;

impl AudioDecoderAdapter for StubAudioDecoder {
    fn configure(&mut self, _track: &TrackInfo) -> Result<(), DecodeError> {
        Ok(())
    }

    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<AudioFrame>, DecodeError> {
        Ok(vec![AudioFrame {
            pts: sample.pts,
            sample_rate: AUDIO_TIMESCALE,
            channels: 2,
            data: vec![0.05; AAC_FRAME_SAMPLES as usize * 2],
        }])
    }

    fn flush(&mut self) -> Result<Vec<AudioFrame>, DecodeError> {
        Ok(Vec::new())
    }

    fn close(&mut self) {}
}

// ============================================================================
// Chunked stream source
// ============================================================================

/// Delivers an in-memory file as ordered chunks on a feeder thread, the
/// way a progressive network source would, with a configurable
/// fast-start threshold.
pub struct ChunkedSource {
    data: Bytes,
    chunk_size: usize,
    fast_start_at: u64,
    aborted: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ChunkedSource {
    pub fn new(data: impl Into<Bytes>, chunk_size: usize, fast_start_at: u64) -> Self {
        Self {
            data: data.into(),
            chunk_size,
            fast_start_at,
            aborted: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }
}

impl MediaSource for ChunkedSource {
    fn is_streamed(&self) -> bool {
        true
    }

    fn start(&mut self, events: Arc<dyn MediaSourceEvents>) -> Result<(), SourceError> {
        let data = self.data.clone();
        let chunk_size = self.chunk_size;
        let fast_start_at = self.fast_start_at;
        let aborted = Arc::clone(&self.aborted);
        let handle = std::thread::spawn(move || {
            let total = data.len() as u64;
            let mut offset = 0usize;
            let mut fast_start_fired = false;
            while offset < data.len() {
                if aborted.load(Ordering::Acquire) {
                    return;
                }
                let end = (offset + chunk_size).min(data.len());
                events.on_chunk(data.slice(offset..end), offset as u64);
                offset = end;
                events.on_progress(offset as u64, Some(total));
                if !fast_start_fired && offset as u64 >= fast_start_at {
                    fast_start_fired = true;
                    events.on_fast_start();
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            if !fast_start_fired {
                events.on_fast_start();
            }
            events.on_complete();
        });
        self.handle = Some(handle);
        Ok(())
    }

    fn abort(&mut self) {
        self.aborted.store(true, Ordering::Release);
    }
}

// ============================================================================
// Player harness
// ============================================================================

#[derive(Default)]
pub struct RecordingEvents {
    pub times: Mutex<Vec<Duration>>,
    pub durations: Mutex<Vec<Duration>>,
    pub play_states: Mutex<Vec<bool>>,
    pub errors: Mutex<Vec<(String, String)>>,
    pub ended: AtomicBool,
}

impl PlayerEvents for RecordingEvents {
    fn on_time_update(&self, position: Duration) {
        self.times.lock().push(position);
    }

    fn on_duration_change(&self, duration: Duration) {
        self.durations.lock().push(duration);
    }

    fn on_play_state_change(&self, playing: bool) {
        self.play_states.lock().push(playing);
    }

    fn on_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }

    fn on_error(&self, error: &PlayerError) {
        self.errors.lock().push((error.code().into(), error.to_string()));
    }
}

pub struct Harness {
    pub player: Player,
    pub events: Arc<RecordingEvents>,
    drivers: Arc<Mutex<Vec<MockDriver>>>,
}

impl Harness {
    pub fn with_probe(probe: Arc<dyn AcceleratorProbe>) -> Self {
        let events = Arc::new(RecordingEvents::default());
        let drivers: Arc<Mutex<Vec<MockDriver>>> = Arc::new(Mutex::new(Vec::new()));
        let drivers_for_factory = Arc::clone(&drivers);
        let player = Player::builder()
            .events(Arc::clone(&events) as Arc<dyn PlayerEvents>)
            .accelerator_probe(probe)
            .audio_backend(Box::new(move || {
                let (backend, driver) = MockOutput::new(AUDIO_TIMESCALE, 2);
                drivers_for_factory.lock().push(driver);
                Ok(Box::new(backend) as Box<dyn AudioOutputBackend>)
            }))
            .renderer(Box::new(|| {
                RasterRenderer::new().map(|r| Box::new(r) as Box<dyn Renderer>)
            }))
            .tick_source(Box::new(|| {
                Box::new(IntervalTicker::new(Duration::from_millis(1))) as Box<dyn TickSource>
            }))
            .build();
        Self {
            player,
            events,
            drivers,
        }
    }

    pub fn stub_accel() -> Self {
        Self::with_probe(Arc::new(StubAccel { fail_create: false }))
    }

    /// Pumps the mock audio callback (10 ms blocks) until the predicate
    /// holds or the timeout elapses. Returns the predicate's final value.
    pub fn pump_until(&self, timeout: Duration, pred: impl Fn(&Player) -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if pred(&self.player) {
                return true;
            }
            if let Some(driver) = self.drivers.lock().last() {
                driver.drive(441);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        pred(&self.player)
    }
}
