//! Decoder selection, fallback, and asynchronous submission.
//!
//! Per media kind the selector walks a two-level fallback: the
//! platform-accelerated path (via the injected [`AcceleratorProbe`]) first,
//! the software path second. Both ends up behind the same adapter traits,
//! so everything downstream of configuration is path-agnostic. Decoding
//! runs on a per-kind worker thread; submission never waits for output, and
//! decoded frames arrive through the single sink registered at
//! construction.

mod accel;
mod software;

pub use accel::{AcceleratorProbe, SystemProbe};
pub use software::{SoftwareAudioDecoder, SoftwareVideoDecoder};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::error::DecodeError;
use crate::media::{AudioFrame, CodedSample, TrackInfo, TrackKind, VideoFrame};

/// Synchronous video decode contract implemented by both fallback arms.
pub trait VideoDecoderAdapter: Send {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError>;
    /// Decodes one sample. May return zero frames (decoder buffering) or
    /// several (drained reordering).
    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<VideoFrame>, DecodeError>;
    /// Drains everything still buffered.
    fn flush(&mut self) -> Result<Vec<VideoFrame>, DecodeError>;
    fn close(&mut self);
}

/// Synchronous audio decode contract implemented by both fallback arms.
pub trait AudioDecoderAdapter: Send {
    fn configure(&mut self, track: &TrackInfo) -> Result<(), DecodeError>;
    fn decode(&mut self, sample: &CodedSample) -> Result<Vec<AudioFrame>, DecodeError>;
    fn flush(&mut self) -> Result<Vec<AudioFrame>, DecodeError>;
    fn close(&mut self);
}

/// A decoded frame emitted through the sink, tagged by kind.
pub enum DecodedFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

/// Frame delivery callback. Registered once at selector construction;
/// invoked from the decode worker threads.
pub type FrameSink = Arc<dyn Fn(DecodedFrame) + Send + Sync>;

/// Which fallback arm a kind ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecoderPath {
    Accelerated,
    Software,
}

/// Selector lifecycle per media kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindState {
    Unconfigured,
    Configured(DecoderPath),
    Closed,
}

/// Running counters for recoverable decode conditions.
#[derive(Debug, Default)]
pub struct DecodeCounters {
    /// Samples dropped before the first keyframe (no init data).
    pub keyframe_skips: AtomicU64,
    /// Samples the decoder rejected transiently.
    pub decode_skips: AtomicU64,
}

enum VideoCommand {
    Decode(CodedSample),
    Flush(crossbeam_channel::Sender<()>),
    Close,
}

enum AudioCommand {
    Decode(CodedSample),
    Flush(crossbeam_channel::Sender<()>),
    Close,
}

/// Worker thread wrapping one configured adapter.
struct Worker<C> {
    tx: crossbeam_channel::Sender<C>,
    handle: Option<JoinHandle<()>>,
}

impl<C> Worker<C> {
    fn join(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_video_worker(
    mut adapter: Box<dyn VideoDecoderAdapter>,
    sink: FrameSink,
    counters: Arc<DecodeCounters>,
) -> Worker<VideoCommand> {
    let (tx, rx) = crossbeam_channel::unbounded::<VideoCommand>();
    let handle = std::thread::Builder::new()
        .name("vireo-video-decode".into())
        .spawn(move || {
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    VideoCommand::Decode(sample) => match adapter.decode(&sample) {
                        Ok(frames) => {
                            for frame in frames {
                                sink(DecodedFrame::Video(frame));
                            }
                        }
                        Err(e) => {
                            counters.decode_skips.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("video decode skip at {:?}: {e}", sample.pts);
                        }
                    },
                    VideoCommand::Flush(ack) => {
                        match adapter.flush() {
                            Ok(frames) => {
                                for frame in frames {
                                    sink(DecodedFrame::Video(frame));
                                }
                            }
                            Err(e) => tracing::warn!("video flush: {e}"),
                        }
                        let _ = ack.send(());
                    }
                    VideoCommand::Close => break,
                }
            }
            adapter.close();
        })
        .expect("spawn video decode worker");
    Worker {
        tx,
        handle: Some(handle),
    }
}

fn spawn_audio_worker(
    mut adapter: Box<dyn AudioDecoderAdapter>,
    sink: FrameSink,
    counters: Arc<DecodeCounters>,
) -> Worker<AudioCommand> {
    let (tx, rx) = crossbeam_channel::unbounded::<AudioCommand>();
    let handle = std::thread::Builder::new()
        .name("vireo-audio-decode".into())
        .spawn(move || {
            while let Ok(cmd) = rx.recv() {
                match cmd {
                    AudioCommand::Decode(sample) => match adapter.decode(&sample) {
                        Ok(frames) => {
                            for frame in frames {
                                sink(DecodedFrame::Audio(frame));
                            }
                        }
                        Err(e) => {
                            counters.decode_skips.fetch_add(1, Ordering::Relaxed);
                            tracing::warn!("audio decode skip at {:?}: {e}", sample.pts);
                        }
                    },
                    AudioCommand::Flush(ack) => {
                        match adapter.flush() {
                            Ok(frames) => {
                                for frame in frames {
                                    sink(DecodedFrame::Audio(frame));
                                }
                            }
                            Err(e) => tracing::warn!("audio flush: {e}"),
                        }
                        let _ = ack.send(());
                    }
                    AudioCommand::Close => break,
                }
            }
            adapter.close();
        })
        .expect("spawn audio decode worker");
    Worker {
        tx,
        handle: Some(handle),
    }
}

struct KindSlot<C> {
    state: KindState,
    worker: Option<Worker<C>>,
    /// Track the slot was configured for.
    track_id: u32,
    /// Whether init data was supplied at configure time. Without it the
    /// first delivered sample must be a keyframe.
    has_init_data: bool,
    /// Whether a keyframe has been submitted since configure/seek.
    seen_keyframe: bool,
}

impl<C> KindSlot<C> {
    fn new() -> Self {
        Self {
            state: KindState::Unconfigured,
            worker: None,
            track_id: 0,
            has_init_data: false,
            seen_keyframe: false,
        }
    }
}

/// Capability-negotiated decoder front end for both media kinds.
pub struct DecoderSelector {
    probe: Arc<dyn AcceleratorProbe>,
    sink: FrameSink,
    counters: Arc<DecodeCounters>,
    video: KindSlot<VideoCommand>,
    audio: KindSlot<AudioCommand>,
}

impl DecoderSelector {
    /// Creates a selector. `sink` is the single frame-delivery callback;
    /// it is never re-registered and survives reconfiguration.
    pub fn new(probe: Arc<dyn AcceleratorProbe>, sink: FrameSink) -> Self {
        Self {
            probe,
            sink,
            counters: Arc::new(DecodeCounters::default()),
            video: KindSlot::new(),
            audio: KindSlot::new(),
        }
    }

    pub fn counters(&self) -> Arc<DecodeCounters> {
        Arc::clone(&self.counters)
    }

    /// Which path a kind is configured on, if any.
    pub fn configured_path(&self, kind: TrackKind) -> Option<DecoderPath> {
        let state = match kind {
            TrackKind::Video => self.video.state,
            TrackKind::Audio => self.audio.state,
        };
        match state {
            KindState::Configured(path) => Some(path),
            _ => None,
        }
    }

    /// Selects and configures a decoder for the track: accelerated first,
    /// software on any accelerated failure. Both failing is fatal for the
    /// load and carries both causes.
    pub fn select_and_configure(&mut self, track: &TrackInfo) -> Result<DecoderPath, DecodeError> {
        match track.kind {
            TrackKind::Video => {
                if self.video.state == KindState::Closed {
                    return Err(DecodeError::Closed);
                }
            }
            TrackKind::Audio => {
                if self.audio.state == KindState::Closed {
                    return Err(DecodeError::Closed);
                }
            }
        }

        let probe = Arc::clone(&self.probe);
        let accel_reason;
        if probe.supports(track.kind, &track.codec_string) {
            let attempt = match track.kind {
                TrackKind::Video => probe
                    .create_video(track)
                    .map(|adapter| self.install_video(track, adapter, DecoderPath::Accelerated)),
                TrackKind::Audio => probe
                    .create_audio(track)
                    .map(|adapter| self.install_audio(track, adapter, DecoderPath::Accelerated)),
            };
            match attempt {
                Ok(()) => {
                    tracing::info!(
                        codec = %track.codec_string,
                        "configured accelerated {:?} decoder",
                        track.kind
                    );
                    return Ok(DecoderPath::Accelerated);
                }
                Err(e) => {
                    tracing::warn!(
                        codec = %track.codec_string,
                        "accelerated {:?} decoder failed, falling back to software: {e}",
                        track.kind
                    );
                    accel_reason = e.to_string();
                }
            }
        } else {
            accel_reason = "codec not in accelerated support table".to_string();
        }

        let software_attempt: Result<(), DecodeError> = match track.kind {
            TrackKind::Video => {
                let mut adapter = Box::new(SoftwareVideoDecoder::new());
                adapter.configure(track).map(|()| {
                    self.install_video(track, adapter, DecoderPath::Software);
                })
            }
            TrackKind::Audio => {
                let mut adapter = Box::new(SoftwareAudioDecoder::new());
                adapter.configure(track).map(|()| {
                    self.install_audio(track, adapter, DecoderPath::Software);
                })
            }
        };

        match software_attempt {
            Ok(()) => {
                tracing::info!(
                    codec = %track.codec_string,
                    "configured software {:?} decoder",
                    track.kind
                );
                Ok(DecoderPath::Software)
            }
            Err(software_err) => Err(DecodeError::NoDecoder {
                kind: track.kind,
                codec: track.codec_string.clone(),
                accel_reason,
                software_reason: software_err.to_string(),
            }),
        }
    }

    fn install_video(
        &mut self,
        track: &TrackInfo,
        adapter: Box<dyn VideoDecoderAdapter>,
        path: DecoderPath,
    ) {
        self.teardown_video();
        self.video.worker = Some(spawn_video_worker(
            adapter,
            Arc::clone(&self.sink),
            Arc::clone(&self.counters),
        ));
        self.video.state = KindState::Configured(path);
        self.video.track_id = track.id;
        self.video.has_init_data = track.init_data.is_some();
        self.video.seen_keyframe = false;
    }

    fn install_audio(
        &mut self,
        track: &TrackInfo,
        adapter: Box<dyn AudioDecoderAdapter>,
        path: DecoderPath,
    ) {
        self.teardown_audio();
        self.audio.worker = Some(spawn_audio_worker(
            adapter,
            Arc::clone(&self.sink),
            Arc::clone(&self.counters),
        ));
        self.audio.state = KindState::Configured(path);
        self.audio.track_id = track.id;
        self.audio.has_init_data = track.init_data.is_some();
        self.audio.seen_keyframe = false;
    }

    /// Submits a sample to whichever path is configured for the kind.
    ///
    /// Fire-and-forget: frames arrive via the sink. Pre-keyframe samples on
    /// an uninitialized stream are dropped here (never queued) and counted
    /// — submitting them would only make the decoder error.
    pub fn decode(&mut self, kind: TrackKind, sample: CodedSample) -> Result<(), DecodeError> {
        match kind {
            TrackKind::Video => {
                if !matches!(self.video.state, KindState::Configured(_)) {
                    return Err(DecodeError::NotConfigured(sample.track_id));
                }
                if !self.video.has_init_data && !self.video.seen_keyframe {
                    if !sample.keyframe {
                        self.counters.keyframe_skips.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(
                            pts = ?sample.pts,
                            "dropping pre-keyframe video sample"
                        );
                        return Err(DecodeError::KeyframeRequired {
                            track_id: sample.track_id,
                        });
                    }
                }
                if sample.keyframe {
                    self.video.seen_keyframe = true;
                }
                if let Some(worker) = &self.video.worker {
                    let _ = worker.tx.send(VideoCommand::Decode(sample));
                }
                Ok(())
            }
            TrackKind::Audio => {
                if !matches!(self.audio.state, KindState::Configured(_)) {
                    return Err(DecodeError::NotConfigured(sample.track_id));
                }
                if !self.audio.has_init_data && !self.audio.seen_keyframe && !sample.keyframe {
                    self.counters.keyframe_skips.fetch_add(1, Ordering::Relaxed);
                    return Err(DecodeError::KeyframeRequired {
                        track_id: sample.track_id,
                    });
                }
                if sample.keyframe {
                    self.audio.seen_keyframe = true;
                }
                if let Some(worker) = &self.audio.worker {
                    let _ = worker.tx.send(AudioCommand::Decode(sample));
                }
                Ok(())
            }
        }
    }

    /// Re-arms keyframe gating after a seek: the next video sample
    /// delivered must again be a sync sample when no init data exists.
    pub fn rearm_keyframe_gate(&mut self) {
        self.video.seen_keyframe = false;
        self.audio.seen_keyframe = false;
    }

    /// Drains in-flight decode work on both kinds. Resolves only after
    /// every previously submitted sample has produced output or been
    /// definitively dropped.
    pub fn flush(&mut self) {
        let mut acks = Vec::new();
        if let Some(worker) = &self.video.worker {
            let (tx, rx) = crossbeam_channel::bounded(1);
            if worker.tx.send(VideoCommand::Flush(tx)).is_ok() {
                acks.push(rx);
            }
        }
        if let Some(worker) = &self.audio.worker {
            let (tx, rx) = crossbeam_channel::bounded(1);
            if worker.tx.send(AudioCommand::Flush(tx)).is_ok() {
                acks.push(rx);
            }
        }
        for rx in acks {
            let _ = rx.recv();
        }
    }

    /// Closes both kinds and joins the workers. Terminal and idempotent.
    pub fn close(&mut self) {
        self.teardown_video();
        self.teardown_audio();
        self.video.state = KindState::Closed;
        self.audio.state = KindState::Closed;
    }

    fn teardown_video(&mut self) {
        if let Some(mut worker) = self.video.worker.take() {
            let _ = worker.tx.send(VideoCommand::Close);
            worker.join();
        }
    }

    fn teardown_audio(&mut self) {
        if let Some(mut worker) = self.audio.worker.take() {
            let _ = worker.tx.send(AudioCommand::Close);
            worker.join();
        }
    }
}

impl Drop for DecoderSelector {
    fn drop(&mut self) {
        self.close();
    }
}
