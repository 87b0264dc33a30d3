//! Playback controller: the state machine that owns the pipeline.
//!
//! [`Player`] wires byte source → demuxer → decoder selector → frame
//! queues → {render thread, audio engine}, drives the
//! load/play/pause/seek lifecycle, and folds component failures into one
//! classified error emission per episode.
//!
//! All observers are registered exactly once, at construction time, and
//! survive every reset and new load. Late callbacks from a superseded
//! load cycle are filtered by an epoch token instead of racing new state.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::audio::{
    AudioEngine, AudioOutputBackend, ClockHandle, ClockSource, CpalOutput, WallClock,
};
use crate::decode::{
    AcceleratorProbe, DecodeCounters, DecodedFrame, DecoderSelector, FrameSink, SystemProbe,
};
use crate::demux::{Demuxer, DemuxerEvents};
use crate::error::{AudioError, PlayerError, RenderError, SourceError};
use crate::events::{MediaSourceEvents, NullEvents, PlayerEvents};
use crate::frame_queue::{AudioFrameQueue, VideoFrameQueue};
use crate::media::{CodedSample, MediaInfo, TrackKind};
use crate::render::{select_renderer, Renderer};
use crate::scheduler::{IntervalTicker, RenderThread, TickSource};
use crate::source::{FileSource, HttpSource, MediaSource, MemorySource};
use crate::sync_metrics::{SyncMetrics, SyncMetricsSnapshot};

/// Playback position reports are coalesced to roughly this cadence.
const TIME_UPDATE_INTERVAL: Duration = Duration::from_millis(250);

/// Tolerance when deciding the clock has reached the end of the media.
const END_SLACK: Duration = Duration::from_millis(50);

/// Sleep quantum for decode workers paced against a full frame queue.
const PACE_INTERVAL: Duration = Duration::from_millis(2);

/// Ring headroom (in stereo frames) required before the audio staging
/// queue drains another decoded frame into the engine.
const AUDIO_DRAIN_HEADROOM: usize = 2048;

/// Loading-stall watchdog cadence (drives the demuxer's forced re-check).
const WATCHDOG_INTERVAL: Duration = Duration::from_millis(250);

/// Controller lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Idle,
    Loading,
    Ready,
    Playing,
    Paused,
    /// Transient while a seek re-bases the pipeline; `resume` restores
    /// the prior playing/paused split on completion.
    Seeking { resume: bool },
    Ended,
    Error,
    Destroyed,
}

/// Point-in-time snapshot of the externally visible player state.
#[derive(Debug, Clone)]
pub struct PlayerState {
    pub state: PlaybackState,
    pub playing: bool,
    pub current_time: Duration,
    pub duration: Duration,
    pub volume: f32,
    pub muted: bool,
    pub playback_rate: f32,
    pub loading: bool,
    pub buffering: bool,
    pub error: Option<String>,
}

/// Running playback statistics, aggregated across the pipeline.
#[derive(Debug, Clone, Default)]
pub struct PlayerStats {
    /// Video frames lost to queue overflow or staleness.
    pub video_frames_dropped: u64,
    /// Audio frames lost to queue overflow.
    pub audio_frames_dropped: u64,
    /// Samples dropped before the first keyframe.
    pub keyframe_skips: u64,
    /// Samples the decoder rejected transiently.
    pub decode_skips: u64,
    /// Bytes delivered by the source so far.
    pub bytes_loaded: u64,
    /// Audio callback underruns.
    pub audio_underruns: u64,
    pub sync: SyncMetricsSnapshot,
}

/// Builds the audio output backend for a load. Invoked once per load that
/// carries an audio track.
pub type AudioBackendFactory =
    Box<dyn Fn() -> Result<Box<dyn AudioOutputBackend>, AudioError> + Send + Sync>;

/// Builds the renderer for a load, walking whatever tier chain the
/// embedder wants. Invoked once per load.
pub type RendererFactory = Box<dyn Fn() -> Result<Box<dyn Renderer>, RenderError> + Send + Sync>;

/// Builds the display tick source for the render thread.
pub type TickSourceFactory = Box<dyn Fn() -> Box<dyn TickSource> + Send + Sync>;

/// Configures and constructs a [`Player`].
pub struct PlayerBuilder {
    events: Arc<dyn PlayerEvents>,
    probe: Arc<dyn AcceleratorProbe>,
    audio_backend: AudioBackendFactory,
    renderer: RendererFactory,
    ticker: TickSourceFactory,
}

impl PlayerBuilder {
    fn new() -> Self {
        Self {
            events: Arc::new(NullEvents),
            probe: Arc::new(SystemProbe),
            audio_backend: Box::new(|| {
                CpalOutput::new().map(|b| Box::new(b) as Box<dyn AudioOutputBackend>)
            }),
            renderer: Box::new(select_renderer),
            ticker: Box::new(|| Box::new(IntervalTicker::display_rate()) as Box<dyn TickSource>),
        }
    }

    /// Observer for lifecycle notifications. Registered once; survives
    /// every load.
    pub fn events(mut self, events: Arc<dyn PlayerEvents>) -> Self {
        self.events = events;
        self
    }

    /// Platform-accelerated decoder integration. Defaults to the portable
    /// probe, which routes everything down the software path.
    pub fn accelerator_probe(mut self, probe: Arc<dyn AcceleratorProbe>) -> Self {
        self.probe = probe;
        self
    }

    pub fn audio_backend(mut self, factory: AudioBackendFactory) -> Self {
        self.audio_backend = factory;
        self
    }

    pub fn renderer(mut self, factory: RendererFactory) -> Self {
        self.renderer = factory;
        self
    }

    pub fn tick_source(mut self, factory: TickSourceFactory) -> Self {
        self.ticker = factory;
        self
    }

    pub fn build(self) -> Player {
        Player::from_builder(self)
    }
}

/// The clock the presentation driver reads for the current load.
#[derive(Clone)]
enum ActiveClock {
    /// No load, or load still in flight.
    None,
    /// Audio-driven: written by the audio callback only.
    Audio(ClockHandle),
    /// No audio track: pause-aware wall clock, written by the controller
    /// only.
    Wall(Arc<WallClock>),
}

impl ActiveClock {
    fn position(&self) -> Duration {
        match self {
            ActiveClock::None => Duration::ZERO,
            ActiveClock::Audio(handle) => handle.position(),
            ActiveClock::Wall(wall) => wall.position(),
        }
    }
}

/// Mutable controller state behind one lock.
struct Control {
    state: PlaybackState,
    info: Option<MediaInfo>,
    clock: ActiveClock,
    /// Track ids routed to the decoders (first track of each kind).
    video_track: Option<u32>,
    audio_track: Option<u32>,
    streamed: bool,
    fast_start: bool,
    /// play() arrived before the fast-start threshold; re-entered when it
    /// fires.
    pending_play: bool,
    source_complete: bool,
    bytes_loaded: u64,
    buffering: bool,
    last_time_update: Option<Instant>,
    error: Option<String>,
    error_code: Option<&'static str>,
    decode_counters: Option<Arc<DecodeCounters>>,
}

impl Control {
    fn fresh(state: PlaybackState) -> Self {
        Self {
            state,
            info: None,
            clock: ActiveClock::None,
            video_track: None,
            audio_track: None,
            streamed: false,
            fast_start: false,
            pending_play: false,
            source_complete: false,
            bytes_loaded: 0,
            buffering: false,
            last_time_update: None,
            error: None,
            error_code: None,
            decode_counters: None,
        }
    }

    fn duration(&self) -> Duration {
        self.info.as_ref().map(|i| i.duration).unwrap_or_default()
    }
}

struct Core {
    weak: Weak<Core>,
    events: Arc<dyn PlayerEvents>,
    probe: Arc<dyn AcceleratorProbe>,
    audio_backend: AudioBackendFactory,
    renderer_factory: RendererFactory,
    ticker_factory: TickSourceFactory,

    /// Bumped on every load/reset/destroy; callbacks from a superseded
    /// cycle compare and become no-ops.
    epoch: AtomicU64,
    /// True while a seek/teardown is discarding frames; paced decode
    /// workers stop waiting for queue room and fall through.
    clearing: AtomicBool,

    control: Mutex<Control>,
    demuxer: Mutex<Demuxer>,
    selector: Mutex<Option<DecoderSelector>>,
    audio: Mutex<Option<AudioEngine>>,
    render: Mutex<Option<RenderThread>>,
    source: Mutex<Option<Box<dyn MediaSource>>>,

    video_queue: Arc<VideoFrameQueue>,
    audio_queue: Arc<AudioFrameQueue>,
    metrics: SyncMetrics,

    // Persist across loads; applied to each new clock.
    volume_milli: AtomicU32,
    muted: AtomicBool,
    rate_milli: AtomicU32,
}

/// Demuxer observer: forwards into the controller. Lives for the whole
/// player; the demuxer is reset per load, never re-registered.
struct DemuxHub {
    core: Weak<Core>,
}

impl DemuxerEvents for DemuxHub {
    fn on_ready(&self, info: MediaInfo) {
        if let Some(core) = self.core.upgrade() {
            core.handle_demux_ready(info);
        }
    }

    fn on_samples(&self, track_id: u32, batch: Vec<CodedSample>) {
        if let Some(core) = self.core.upgrade() {
            core.handle_samples(track_id, batch);
        }
    }
}

/// Byte-source observer for one load cycle, pinned to its epoch.
struct SourceHub {
    core: Weak<Core>,
    epoch: u64,
    streamed: bool,
}

impl SourceHub {
    fn core(&self) -> Option<Arc<Core>> {
        let core = self.core.upgrade()?;
        if core.epoch.load(Ordering::Acquire) != self.epoch {
            return None;
        }
        Some(core)
    }
}

impl MediaSourceEvents for SourceHub {
    fn on_chunk(&self, data: Bytes, file_offset: u64) {
        if let Some(core) = self.core() {
            core.handle_chunk(&data, file_offset, self.streamed);
        }
    }

    fn on_progress(&self, loaded: u64, _total: Option<u64>) {
        if let Some(core) = self.core() {
            core.control.lock().bytes_loaded = loaded;
        }
    }

    fn on_fast_start(&self) {
        if let Some(core) = self.core() {
            core.handle_fast_start();
        }
    }

    fn on_complete(&self) {
        if let Some(core) = self.core() {
            core.handle_source_complete();
        }
    }

    fn on_error(&self, error: SourceError) {
        if let Some(core) = self.core() {
            core.fail(classify_source(error));
        }
    }
}

fn classify_source(error: SourceError) -> PlayerError {
    match error {
        SourceError::Io(io) => PlayerError::Io(io),
        other => PlayerError::Network(other),
    }
}

impl Core {
    // ------------------------------------------------------------------
    // Source / demux callbacks
    // ------------------------------------------------------------------

    fn handle_chunk(&self, data: &[u8], file_offset: u64, streamed: bool) {
        let result = self
            .demuxer
            .lock()
            .append_bytes(data, file_offset, streamed);
        if let Err(e) = result {
            self.fail(PlayerError::MalformedContainer(e));
        }
    }

    fn handle_fast_start(&self) {
        let start = {
            let mut control = self.control.lock();
            control.fast_start = true;
            control.pending_play && control.state == PlaybackState::Ready
        };
        if start {
            self.start_playing();
        }
    }

    fn handle_source_complete(&self) {
        self.control.lock().source_complete = true;
        let result = self.demuxer.lock().source_complete();
        if let Err(e) = result {
            self.fail(PlayerError::MalformedContainer(e));
        }
    }

    /// Structural metadata parsed: configure decoders, bring up output,
    /// transition to Ready.
    fn handle_demux_ready(&self, info: MediaInfo) {
        {
            let mut control = self.control.lock();
            if control.state != PlaybackState::Loading {
                return;
            }
            control.info = Some(info.clone());
        }

        self.events.on_duration_change(info.duration);

        if let Err(e) = self.configure_decoders(&info) {
            self.fail(e);
            return;
        }
        if let Err(e) = self.bring_up_output(&info) {
            self.fail(e);
            return;
        }

        let start = {
            let mut control = self.control.lock();
            control.state = PlaybackState::Ready;
            control.pending_play && (!control.streamed || control.fast_start)
        };
        if start {
            self.start_playing();
        }
    }

    fn configure_decoders(&self, info: &MediaInfo) -> Result<(), PlayerError> {
        let epoch = self.epoch.load(Ordering::Acquire);
        let sink = self.make_sink(epoch);
        let mut selector = DecoderSelector::new(Arc::clone(&self.probe), sink);
        for kind in [TrackKind::Video, TrackKind::Audio] {
            if let Some(track) = info.track(kind) {
                selector
                    .select_and_configure(track)
                    .map_err(PlayerError::NoDecoderAvailable)?;
            }
        }
        let counters = selector.counters();
        *self.selector.lock() = Some(selector);

        let mut control = self.control.lock();
        control.decode_counters = Some(counters);
        control.video_track = info.track(TrackKind::Video).map(|t| t.id);
        control.audio_track = info.track(TrackKind::Audio).map(|t| t.id);
        Ok(())
    }

    /// Audio engine (or wall-clock fallback), renderer tier chain, and
    /// the render thread. Also the retry path after an audio-init error.
    fn bring_up_output(&self, info: &MediaInfo) -> Result<(), PlayerError> {
        let volume = self.volume_milli.load(Ordering::Relaxed) as f32 / 1000.0;
        let muted = self.muted.load(Ordering::Relaxed);
        let rate = self.rate_milli.load(Ordering::Relaxed) as f32 / 1000.0;

        let clock = if info.track(TrackKind::Audio).is_some() {
            let backend =
                (self.audio_backend)().map_err(|e| PlayerError::AudioInit(e.to_string()))?;
            let engine =
                AudioEngine::new(backend).map_err(|e| PlayerError::AudioInit(e.to_string()))?;
            let handle = engine.clock();
            handle.set_volume(volume);
            handle.set_muted(muted);
            handle.set_playback_rate(rate);
            *self.audio.lock() = Some(engine);
            ActiveClock::Audio(handle)
        } else {
            let wall = Arc::new(WallClock::new());
            wall.set_playback_rate(rate);
            ActiveClock::Wall(wall)
        };

        let renderer =
            (self.renderer_factory)().map_err(|e| PlayerError::NoRendererAvailable(e.to_string()))?;

        let clock_source: Arc<dyn ClockSource> = match &clock {
            ActiveClock::Audio(handle) => Arc::new(handle.clone()),
            ActiveClock::Wall(wall) => Arc::clone(wall) as Arc<dyn ClockSource>,
            ActiveClock::None => unreachable!("clock chosen above"),
        };

        let epoch = self.epoch.load(Ordering::Acquire);
        let weak = self.weak.clone();
        let on_tick = Box::new(move |position: Duration, _rendered: bool| {
            let Some(core) = weak.upgrade() else { return };
            if core.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            core.handle_tick(position);
        });

        let thread = RenderThread::new(
            Arc::clone(&self.video_queue),
            renderer,
            clock_source,
            self.metrics.clone(),
            (self.ticker_factory)(),
            on_tick,
        );
        *self.render.lock() = Some(thread);
        self.control.lock().clock = clock;
        Ok(())
    }

    fn handle_samples(&self, track_id: u32, batch: Vec<CodedSample>) {
        let kind = {
            let control = self.control.lock();
            if control.video_track == Some(track_id) {
                TrackKind::Video
            } else if control.audio_track == Some(track_id) {
                TrackKind::Audio
            } else {
                return;
            }
        };
        let mut selector = self.selector.lock();
        let Some(selector) = selector.as_mut() else { return };
        for sample in batch {
            // Pre-keyframe drops and transient skips are counted inside
            // the selector; nothing here is fatal.
            let _ = selector.decode(kind, sample);
        }
    }

    /// Frame-delivery callback handed to the selector, pinned to an
    /// epoch. Runs on the decode worker threads.
    ///
    /// Pacing: when a bounded queue is full the worker is held here, so
    /// the compressed backlog waits in the worker's command channel
    /// instead of flooding decoded frames through drop-oldest. Seeks and
    /// teardown break the wait via the clearing flag.
    fn make_sink(&self, epoch: u64) -> FrameSink {
        let weak = self.weak.clone();
        Arc::new(move |frame| {
            let Some(core) = weak.upgrade() else { return };
            if core.epoch.load(Ordering::Acquire) != epoch {
                return;
            }
            match frame {
                DecodedFrame::Video(frame) => {
                    while core.video_queue.is_full() {
                        if core.epoch.load(Ordering::Acquire) != epoch
                            || core.clearing.load(Ordering::Acquire)
                        {
                            break;
                        }
                        std::thread::sleep(PACE_INTERVAL);
                    }
                    core.video_queue.push(frame);
                }
                DecodedFrame::Audio(frame) => {
                    loop {
                        core.drain_audio();
                        if !core.audio_queue.is_full()
                            || core.epoch.load(Ordering::Acquire) != epoch
                            || core.clearing.load(Ordering::Acquire)
                        {
                            break;
                        }
                        std::thread::sleep(PACE_INTERVAL);
                    }
                    core.audio_queue.push(frame);
                    core.drain_audio();
                }
            }
        })
    }

    /// Moves staged audio frames into the engine while the ring has room.
    fn drain_audio(&self) {
        let mut audio = self.audio.lock();
        let Some(engine) = audio.as_mut() else { return };
        loop {
            let metrics = engine.ring_metrics();
            let free = metrics.capacity_frames.saturating_sub(metrics.fill_frames);
            if free < AUDIO_DRAIN_HEADROOM {
                return;
            }
            let Some(frame) = self.audio_queue.pop() else { return };
            engine.enqueue(frame);
        }
    }

    // ------------------------------------------------------------------
    // Render tick
    // ------------------------------------------------------------------

    fn handle_tick(&self, position: Duration) {
        self.drain_audio();

        let mut time_update = None;
        let mut buffering_change = None;
        let mut ended = false;
        {
            let mut control = self.control.lock();
            if control.state != PlaybackState::Playing {
                return;
            }

            let now = Instant::now();
            let due = control
                .last_time_update
                .map(|t| now.duration_since(t) >= TIME_UPDATE_INTERVAL)
                .unwrap_or(true);
            if due {
                control.last_time_update = Some(now);
                time_update = Some(position);
            }

            let duration = control.duration();
            let drained = self.video_queue.is_empty() && self.audio_queue.is_empty();
            if control.source_complete
                && duration > Duration::ZERO
                && drained
                && position + END_SLACK >= duration
            {
                control.state = PlaybackState::Ended;
                if let ActiveClock::Wall(wall) = &control.clock {
                    wall.pause();
                }
                control.buffering = false;
                ended = true;
            } else {
                let stalled = match &control.clock {
                    ActiveClock::Audio(handle) => handle.is_stalled(),
                    _ => false,
                };
                let starving = control.video_track.is_some() && self.video_queue.is_empty();
                let buffering = !control.source_complete && (stalled || starving);
                if buffering != control.buffering {
                    control.buffering = buffering;
                    buffering_change = Some(buffering);
                }
            }
        }

        if ended {
            if let Some(engine) = self.audio.lock().as_mut() {
                engine.pause();
            }
            if let Some(render) = self.render.lock().as_ref() {
                render.pause();
            }
            tracing::info!("playback reached end of media");
            self.events.on_play_state_change(false);
            self.events.on_ended();
            return;
        }
        if let Some(position) = time_update {
            self.events.on_time_update(position);
        }
        match buffering_change {
            Some(true) => self.events.on_buffering_start(),
            Some(false) => self.events.on_buffering_end(),
            None => {}
        }
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    fn start_playing(&self) {
        {
            let mut control = self.control.lock();
            control.pending_play = false;
            control.state = PlaybackState::Playing;
            if let ActiveClock::Wall(wall) = &control.clock {
                wall.start();
            }
        }
        if let Some(engine) = self.audio.lock().as_mut() {
            engine.play();
        }
        if let Some(render) = self.render.lock().as_ref() {
            render.play();
        }
        self.events.on_play_state_change(true);
    }

    /// One classified emission per failure episode: a player already in
    /// Error (or destroyed) absorbs further failures silently.
    fn fail(&self, error: PlayerError) {
        {
            let mut control = self.control.lock();
            if matches!(
                control.state,
                PlaybackState::Error | PlaybackState::Destroyed
            ) {
                return;
            }
            control.state = PlaybackState::Error;
            control.error = Some(error.to_string());
            control.error_code = Some(error.code());
            control.pending_play = false;
            control.buffering = false;
        }
        tracing::error!(code = error.code(), "player error: {error}");
        if let Some(source) = self.source.lock().as_mut() {
            source.abort();
        }
        if let Some(engine) = self.audio.lock().as_mut() {
            engine.pause();
        }
        if let Some(render) = self.render.lock().as_ref() {
            render.pause();
        }
        self.events.on_error(&error);
    }

    /// Tears the pipeline down to a cold state. `state` becomes the new
    /// controller state.
    fn reset_pipeline(&self, state: PlaybackState) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.clearing.store(true, Ordering::Release);

        if let Some(mut source) = self.source.lock().take() {
            source.abort();
        }
        // Take the workers out of their slots before dropping them: the
        // drops join, and a final in-flight tick may still need the locks.
        let render = self.render.lock().take();
        drop(render);
        let selector = self.selector.lock().take();
        if let Some(mut selector) = selector {
            selector.close();
        }
        // Dropping the engine releases the output stream thread.
        let audio = self.audio.lock().take();
        drop(audio);
        self.demuxer.lock().reset();
        self.video_queue.clear();
        self.audio_queue.clear();
        self.metrics.reset();

        self.clearing.store(false, Ordering::Release);
        *self.control.lock() = Control::fresh(state);
    }
}

/// The playback controller and public API surface.
///
/// Construction is cheap; the heavy components (decoders, renderer,
/// audio stream) come up per load. Methods are safe to call from any
/// thread; event callbacks arrive on internal worker threads.
pub struct Player {
    core: Arc<Core>,
    watchdog_stop: crossbeam_channel::Sender<()>,
    watchdog: Option<JoinHandle<()>>,
}

impl Player {
    pub fn builder() -> PlayerBuilder {
        PlayerBuilder::new()
    }

    /// A player with default wiring: portable probe, cpal audio, the
    /// full renderer tier chain, display-rate ticks.
    pub fn new() -> Self {
        PlayerBuilder::new().build()
    }

    fn from_builder(builder: PlayerBuilder) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<Core>| Core {
            weak: weak.clone(),
            events: builder.events,
            probe: builder.probe,
            audio_backend: builder.audio_backend,
            renderer_factory: builder.renderer,
            ticker_factory: builder.ticker,
            epoch: AtomicU64::new(0),
            clearing: AtomicBool::new(false),
            control: Mutex::new(Control::fresh(PlaybackState::Idle)),
            demuxer: Mutex::new(Demuxer::new(Arc::new(DemuxHub { core: weak.clone() }))),
            selector: Mutex::new(None),
            audio: Mutex::new(None),
            render: Mutex::new(None),
            source: Mutex::new(None),
            video_queue: Arc::new(VideoFrameQueue::with_video_capacity()),
            audio_queue: Arc::new(AudioFrameQueue::with_audio_capacity()),
            metrics: SyncMetrics::new(),
            volume_milli: AtomicU32::new(1000),
            muted: AtomicBool::new(false),
            rate_milli: AtomicU32::new(1000),
        });

        // Loading-stall watchdog: drives the demuxer's forced re-check
        // when appends go quiet mid-load.
        let (watchdog_stop, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let weak = Arc::downgrade(&core);
        let watchdog = std::thread::Builder::new()
            .name("vireo-watchdog".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(WATCHDOG_INTERVAL) {
                    Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        let Some(core) = weak.upgrade() else { break };
                        let loading = core.control.lock().state == PlaybackState::Loading;
                        if loading {
                            let result = core.demuxer.lock().poll_ready();
                            if let Err(e) = result {
                                core.fail(PlayerError::MalformedContainer(e));
                            }
                        }
                    }
                }
            })
            .expect("spawn watchdog thread");

        Self {
            core,
            watchdog_stop,
            watchdog: Some(watchdog),
        }
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    /// Loads a local file. The whole container arrives in one append.
    pub fn load_file(&self, path: impl Into<std::path::PathBuf>) -> Result<(), PlayerError> {
        self.load(Box::new(FileSource::new(path)))
    }

    /// Loads a progressive HTTP(S) source with the fast-start path.
    pub fn load_url(&self, url: impl Into<String>) -> Result<(), PlayerError> {
        self.load(Box::new(HttpSource::new(url)))
    }

    /// Loads from an already-buffered container.
    pub fn load_bytes(&self, data: impl Into<Bytes>) -> Result<(), PlayerError> {
        self.load(Box::new(MemorySource::new(data)))
    }

    /// Starts a new load cycle from any non-destroyed state, superseding
    /// whatever was loaded before.
    pub fn load(&self, mut source: Box<dyn MediaSource>) -> Result<(), PlayerError> {
        let core = &self.core;
        if core.control.lock().state == PlaybackState::Destroyed {
            return Err(PlayerError::Destroyed);
        }
        core.reset_pipeline(PlaybackState::Loading);

        let streamed = source.is_streamed();
        core.control.lock().streamed = streamed;

        let epoch = core.epoch.load(Ordering::Acquire);
        let hub = Arc::new(SourceHub {
            core: Arc::downgrade(core),
            epoch,
            streamed,
        });
        // A synchronous start failure never entered the pipeline; report
        // it through the Result alone and return to Idle.
        if let Err(e) = source.start(hub) {
            core.control.lock().state = PlaybackState::Idle;
            return Err(classify_source(e));
        }
        *core.source.lock() = Some(source);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    /// Starts or resumes playback. From `Ended`, rewinds to the start
    /// first. On a streaming load that has not reached the fast-start
    /// threshold yet, playback is deferred and starts automatically once
    /// it fires. No-op in other states.
    pub fn play(&self) {
        let core = &self.core;
        let deferred = {
            let mut control = core.control.lock();
            match control.state {
                PlaybackState::Ready | PlaybackState::Paused => {}
                PlaybackState::Playing => return,
                PlaybackState::Ended => {
                    drop(control);
                    self.seek(Duration::ZERO);
                    self.play();
                    return;
                }
                PlaybackState::Loading => {
                    // Arriving early is fine; Ready picks it up.
                    control.pending_play = true;
                    return;
                }
                _ => return,
            }
            if control.streamed && !control.fast_start {
                control.pending_play = true;
                true
            } else {
                false
            }
        };
        if !deferred {
            core.start_playing();
        }
    }

    /// Freezes playback; the clock holds its value for resume.
    pub fn pause(&self) {
        let core = &self.core;
        {
            let mut control = core.control.lock();
            control.pending_play = false;
            if control.state != PlaybackState::Playing {
                return;
            }
            control.state = PlaybackState::Paused;
            if let ActiveClock::Wall(wall) = &control.clock {
                wall.pause();
            }
        }
        if let Some(engine) = core.audio.lock().as_mut() {
            engine.pause();
        }
        if let Some(render) = core.render.lock().as_ref() {
            render.pause();
        }
        core.events.on_play_state_change(false);
    }

    /// Seeks to `time` (clamped to the media duration), clearing both
    /// frame queues and re-basing the clock, then re-enters the prior
    /// playing/paused state.
    pub fn seek(&self, time: Duration) {
        let core = &self.core;
        let (target, resume, clock) = {
            let mut control = core.control.lock();
            match control.state {
                PlaybackState::Playing
                | PlaybackState::Paused
                | PlaybackState::Ready
                | PlaybackState::Ended => {}
                _ => return,
            }
            let target = time.min(control.duration());
            let resume = control.state == PlaybackState::Playing;
            control.state = PlaybackState::Seeking { resume };
            (target, resume, control.clock.clone())
        };
        tracing::debug!(?target, resume, "seek");

        // Let paced decode workers fall through, then drain whatever was
        // in flight so no pre-seek frame lands after the clear.
        core.clearing.store(true, Ordering::Release);
        if let Some(selector) = core.selector.lock().as_mut() {
            selector.flush();
            selector.rearm_keyframe_gate();
        }
        core.video_queue.clear();
        core.audio_queue.clear();
        core.clearing.store(false, Ordering::Release);

        match &clock {
            ActiveClock::Wall(wall) => wall.rebase(target),
            ActiveClock::Audio(_) => {
                if let Some(engine) = core.audio.lock().as_mut() {
                    engine.seek(target);
                }
            }
            ActiveClock::None => {}
        }
        if let Some(render) = core.render.lock().as_ref() {
            render.seek();
        }

        // Reposition extraction at the preceding sync sample; emission
        // resumes synchronously from there.
        core.demuxer.lock().seek(target);

        {
            let mut control = core.control.lock();
            if let PlaybackState::Seeking { resume } = control.state {
                control.state = if resume {
                    PlaybackState::Playing
                } else {
                    PlaybackState::Paused
                };
            }
        }
        if resume {
            if let Some(engine) = core.audio.lock().as_mut() {
                engine.play();
            }
            if let ActiveClock::Wall(wall) = &clock {
                wall.start();
            }
        }
    }

    // ------------------------------------------------------------------
    // Settings
    // ------------------------------------------------------------------

    /// Sets the output volume in `[0, 1]`, applied as a final gain after
    /// downmix and resampling.
    pub fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        self.core
            .volume_milli
            .store((volume * 1000.0).round() as u32, Ordering::Relaxed);
        if let ActiveClock::Audio(handle) = &self.core.control.lock().clock {
            handle.set_volume(volume);
        }
    }

    pub fn set_muted(&self, muted: bool) {
        self.core.muted.store(muted, Ordering::Relaxed);
        if let ActiveClock::Audio(handle) = &self.core.control.lock().clock {
            handle.set_muted(muted);
        }
    }

    /// Sets the playback rate, clamped to `[0.1, 4.0]`. Audio is
    /// linearly interpolated at the new rate without pitch correction.
    pub fn set_playback_rate(&self, rate: f32) {
        let rate = rate.clamp(0.1, 4.0);
        self.core
            .rate_milli
            .store((rate * 1000.0).round() as u32, Ordering::Relaxed);
        match &self.core.control.lock().clock {
            ActiveClock::Audio(handle) => handle.set_playback_rate(rate),
            ActiveClock::Wall(wall) => wall.set_playback_rate(rate),
            ActiveClock::None => {}
        }
    }

    /// Re-attempts audio bring-up after an audio-init failure (commonly a
    /// platform gesture requirement). Returns true when the player
    /// recovered to Ready.
    pub fn retry_audio(&self) -> bool {
        let core = &self.core;
        let info = {
            let mut control = core.control.lock();
            if control.state != PlaybackState::Error
                || control.error_code != Some("audio-init")
            {
                return false;
            }
            let Some(info) = control.info.clone() else {
                return false;
            };
            // A fresh episode: a repeat failure is reported again.
            control.state = PlaybackState::Loading;
            control.error = None;
            control.error_code = None;
            info
        };
        match core.bring_up_output(&info) {
            Ok(()) => {
                core.control.lock().state = PlaybackState::Ready;
                true
            }
            Err(e) => {
                core.fail(e);
                false
            }
        }
    }

    /// Propagates a layout change to the renderer. Cheap and idempotent.
    pub fn resize(&self, width: u32, height: u32) {
        if let Some(render) = self.core.render.lock().as_ref() {
            render.resize(width, height);
        }
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    pub fn state(&self) -> PlayerState {
        let core = &self.core;
        let control = core.control.lock();
        PlayerState {
            state: control.state,
            playing: control.state == PlaybackState::Playing,
            current_time: control.clock.position(),
            duration: control.duration(),
            volume: core.volume_milli.load(Ordering::Relaxed) as f32 / 1000.0,
            muted: core.muted.load(Ordering::Relaxed),
            playback_rate: core.rate_milli.load(Ordering::Relaxed) as f32 / 1000.0,
            loading: control.state == PlaybackState::Loading,
            buffering: control.buffering,
            error: control.error.clone(),
        }
    }

    /// Metadata for the current load, once Ready.
    pub fn media_info(&self) -> Option<MediaInfo> {
        self.core.control.lock().info.clone()
    }

    pub fn stats(&self) -> PlayerStats {
        let core = &self.core;
        let (keyframe_skips, decode_skips, bytes_loaded) = {
            let control = core.control.lock();
            let (kf, ds) = control
                .decode_counters
                .as_ref()
                .map(|c| {
                    (
                        c.keyframe_skips.load(Ordering::Relaxed),
                        c.decode_skips.load(Ordering::Relaxed),
                    )
                })
                .unwrap_or((0, 0));
            (kf, ds, control.bytes_loaded)
        };
        let audio_underruns = core
            .audio
            .lock()
            .as_ref()
            .map(|engine| engine.ring_metrics().underrun_count)
            .unwrap_or(0);
        PlayerStats {
            video_frames_dropped: core.video_queue.dropped(),
            audio_frames_dropped: core.audio_queue.dropped(),
            keyframe_skips,
            decode_skips,
            bytes_loaded,
            audio_underruns,
            sync: core.metrics.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Drops the current load and returns to Idle. Observer registrations
    /// are unaffected. Idempotent.
    pub fn reset(&self) {
        if self.core.control.lock().state == PlaybackState::Destroyed {
            return;
        }
        self.core.reset_pipeline(PlaybackState::Idle);
    }

    /// Terminal teardown: joins every worker and releases all decoder,
    /// audio, and renderer resources. Idempotent; every call after the
    /// first is a no-op.
    pub fn destroy(&self) {
        {
            let mut control = self.core.control.lock();
            if control.state == PlaybackState::Destroyed {
                return;
            }
            control.state = PlaybackState::Destroyed;
        }
        self.core.reset_pipeline(PlaybackState::Destroyed);
    }
}

impl Default for Player {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.destroy();
        let _ = self.watchdog_stop.send(());
        if let Some(handle) = self.watchdog.take() {
            let _ = handle.join();
        }
    }
}
