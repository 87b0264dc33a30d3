//! Incremental container demuxer.
//!
//! The demuxer consumes contiguous byte chunks tagged with absolute file
//! offsets, locates and parses the structural metadata box, and then emits
//! per-track coded-sample batches as the referenced byte ranges become
//! resident. It never requires the whole file in memory: streamed loads run
//! inside the bounded [`StreamBuffer`] window.
//!
//! Metadata-first files ("fast start" layout) become ready on the first
//! append that covers the `moov` box; metadata-at-end files keep accepting
//! chunks until the box is seen. Both paths are first-class — the fast-start
//! signature heuristic only accelerates the former, it never gates the
//! latter.

mod boxes;
mod sample_table;
mod stream_buffer;

pub use boxes::MoovLocation;
pub use sample_table::{Movie, ParsedTrack, SampleEntry};
pub use stream_buffer::{StreamBuffer, DEFAULT_RETAINED_CAP, FAST_START_WINDOW};

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::DemuxError;
use crate::media::{CodedSample, MediaInfo, TrackKind};

/// Max samples per `on_samples` emission. Amortization bound: large files
/// are delivered as many batches, never one giant emission.
pub const SAMPLE_BATCH: usize = 100;

/// How long parsing may sit idle after an append before a forced re-check
/// of already-buffered data is due.
pub const FORCED_CHECK_DELAY: Duration = Duration::from_millis(500);

/// Demuxer notifications. Registered once at construction; survives
/// `reset()`.
pub trait DemuxerEvents: Send + Sync {
    /// Structural metadata is fully parsed. Fired exactly once per load
    /// cycle.
    fn on_ready(&self, info: MediaInfo);

    /// A batch of coded samples for one track, in decode order.
    fn on_samples(&self, track_id: u32, batch: Vec<CodedSample>);
}

/// Incremental push-based MP4 demuxer.
pub struct Demuxer {
    events: Arc<dyn DemuxerEvents>,
    buffer: StreamBuffer,
    started: bool,
    streamed: bool,
    /// Box-walk progress for the top-level moov search.
    scan_offset: u64,
    /// Located metadata box, possibly not yet fully buffered.
    moov: Option<MoovLocation>,
    /// True when `moov` came from the raw signature scan rather than the
    /// box walk; such a candidate is discarded on parse failure instead of
    /// failing the load.
    moov_from_heuristic: bool,
    movie: Option<Movie>,
    /// Per-track next-sample indices, parallel to `movie.tracks`.
    cursors: Vec<usize>,
    ready_fired: bool,
    /// Last time an append made progress without reaching ready.
    last_attempt: Option<Instant>,
}

impl Demuxer {
    pub fn new(events: Arc<dyn DemuxerEvents>) -> Self {
        Self {
            events,
            buffer: StreamBuffer::new(false),
            started: false,
            streamed: false,
            scan_offset: 0,
            moov: None,
            moov_from_heuristic: false,
            movie: None,
            cursors: Vec::new(),
            ready_fired: false,
            last_attempt: None,
        }
    }

    /// True once `on_ready` has fired for the current load cycle.
    pub fn is_ready(&self) -> bool {
        self.ready_fired
    }

    /// Next absolute file offset an append must start at.
    pub fn next_expected_offset(&self) -> u64 {
        self.buffer.next_expected()
    }

    /// Appends a contiguous chunk. Returns the next expected offset.
    ///
    /// The first append of a load cycle fixes the source mode: `streamed`
    /// enables window eviction and marks the resulting [`MediaInfo`].
    pub fn append_bytes(
        &mut self,
        data: &[u8],
        file_offset: u64,
        streamed: bool,
    ) -> Result<u64, DemuxError> {
        if !self.started {
            self.buffer = StreamBuffer::new(streamed);
            self.streamed = streamed;
            self.started = true;
        }
        let next = self.buffer.append(data, file_offset)?;
        self.last_attempt = Some(Instant::now());
        self.advance()?;
        Ok(next)
    }

    /// Forced re-check: re-queries already-buffered data for structural
    /// metadata and pending samples.
    ///
    /// Liveness safeguard for the case where parsing stalled between
    /// appends (a chunk boundary split the metadata, or the caller's
    /// source went quiet). Cheap when already ready. Returns the ready
    /// state.
    pub fn poll_ready(&mut self) -> Result<bool, DemuxError> {
        if self.started && !self.ready_fired {
            let due = self
                .last_attempt
                .map(|t| t.elapsed() >= FORCED_CHECK_DELAY)
                .unwrap_or(false);
            if due {
                tracing::debug!("demuxer forced re-check of buffered data");
                self.last_attempt = Some(Instant::now());
                self.advance()?;
            }
        }
        Ok(self.ready_fired)
    }

    /// Called by the controller when the byte source has delivered all
    /// bytes. A source that ends before the structural metadata was found
    /// is a malformed load.
    pub fn source_complete(&mut self) -> Result<(), DemuxError> {
        self.advance()?;
        if !self.ready_fired {
            return Err(DemuxError::Malformed(
                "stream ended before structural metadata was found".into(),
            ));
        }
        Ok(())
    }

    /// Maps a target time to the nearest preceding sync sample, repositions
    /// every track cursor there, and resumes emission from that point.
    ///
    /// Returns the sync sample's presentation timestamp, or `None` when
    /// called before ready (a deliberate no-op).
    pub fn seek(&mut self, time: Duration) -> Option<Duration> {
        let movie = self.movie.as_ref()?;

        let mut rebased = None;
        for (i, track) in movie.tracks.iter().enumerate() {
            let idx = track.sync_sample_before(time);
            self.cursors[i] = idx;
            if track.info.kind == TrackKind::Video || rebased.is_none() {
                let pts = track.samples.get(idx).map(|s| s.pts);
                if track.info.kind == TrackKind::Video {
                    rebased = pts;
                } else if rebased.is_none() {
                    rebased = pts;
                }
            }
        }

        let target = rebased.unwrap_or(time);
        tracing::debug!(?time, ?target, "demuxer seek to preceding sync sample");

        if let Err(e) = self.extract_samples() {
            // Extraction after a seek only reads already-validated tables;
            // an error here means the buffer lost the range, which the
            // controller handles by re-feeding. Log and carry on.
            tracing::warn!("post-seek extraction: {e}");
        }
        Some(target)
    }

    /// Drops all parse state. Safe to call from any state, repeatedly.
    /// Event registration is unaffected.
    pub fn reset(&mut self) {
        self.buffer.reset();
        self.started = false;
        self.streamed = false;
        self.scan_offset = 0;
        self.moov = None;
        self.moov_from_heuristic = false;
        self.movie = None;
        self.cursors.clear();
        self.ready_fired = false;
        self.last_attempt = None;
    }

    /// The parsed movie, once ready. Exposed for the controller's seek and
    /// duration plumbing.
    pub fn movie(&self) -> Option<&Movie> {
        self.movie.as_ref()
    }

    // ------------------------------------------------------------------
    // Internal driving
    // ------------------------------------------------------------------

    fn advance(&mut self) -> Result<(), DemuxError> {
        if self.movie.is_none() {
            self.locate_moov()?;
            self.try_parse_moov()?;
        }
        if self.movie.is_some() {
            self.extract_samples()?;
        }
        Ok(())
    }

    fn locate_moov(&mut self) -> Result<(), DemuxError> {
        if self.moov.is_some() {
            return Ok(());
        }

        // Primary: top-level box walk. Handles metadata anywhere in the
        // file, including after a large mdat.
        let end = self.buffer.end_offset();
        let buffer = &self.buffer;
        let (next_scan, found) =
            boxes::walk_for_moov(self.scan_offset, end, |off, len| buffer.slice(off, len))?;
        self.scan_offset = next_scan;
        if let Some(loc) = found {
            tracing::debug!(offset = loc.offset, size = loc.size, "moov located by box walk");
            self.moov = Some(loc);
            self.moov_from_heuristic = false;
            return Ok(());
        }

        // Fast-start heuristic: raw signature scan limited to the priority
        // window. Best effort — validated by the parse attempt, discarded
        // on failure.
        if let Some(head) = self.buffer.slice(0, self.priority_window_len()) {
            if let Some(loc) = boxes::scan_window_for_moov(head, 0) {
                if loc.offset >= self.scan_offset {
                    tracing::debug!(
                        offset = loc.offset,
                        "moov candidate from fast-start signature scan"
                    );
                    self.moov = Some(loc);
                    self.moov_from_heuristic = true;
                }
            }
        }
        Ok(())
    }

    fn priority_window_len(&self) -> usize {
        self.buffer
            .end_offset()
            .min(FAST_START_WINDOW) as usize
    }

    fn try_parse_moov(&mut self) -> Result<(), DemuxError> {
        let Some(loc) = self.moov else {
            return Ok(());
        };
        let payload_off = loc.offset + loc.header_len as u64;
        let payload_len = (loc.size - loc.header_len as u64) as usize;
        let Some(payload) = self.buffer.slice(payload_off, payload_len) else {
            // Not fully buffered yet.
            return Ok(());
        };

        match sample_table::parse_moov(payload) {
            Ok(movie) => {
                // Pin the metadata range so eviction can never lose it.
                self.buffer.pin(loc.offset, loc.size as usize);
                self.cursors = vec![0; movie.tracks.len()];
                let info = MediaInfo {
                    duration: movie.duration,
                    tracks: movie.tracks.iter().map(|t| t.info.clone()).collect(),
                    streamed: self.streamed,
                    seekable: !self.streamed,
                };
                tracing::info!(
                    duration_ms = info.duration.as_millis() as u64,
                    tracks = info.tracks.len(),
                    streamed = info.streamed,
                    "demuxer ready"
                );
                self.movie = Some(movie);
                self.ready_fired = true;
                self.events.on_ready(info);
                Ok(())
            }
            Err(e) if self.moov_from_heuristic => {
                // False positive from the signature scan. Drop the
                // candidate and let the box walk find the real one.
                tracing::debug!("discarding heuristic moov candidate: {e}");
                self.moov = None;
                self.moov_from_heuristic = false;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn extract_samples(&mut self) -> Result<(), DemuxError> {
        let Some(movie) = &self.movie else {
            return Ok(());
        };

        let mut emissions: Vec<(u32, Vec<CodedSample>)> = Vec::new();
        for (i, track) in movie.tracks.iter().enumerate() {
            let mut batch = Vec::new();
            while self.cursors[i] < track.samples.len() {
                let entry = &track.samples[self.cursors[i]];
                let Some(payload) = self.buffer.slice(entry.offset, entry.size as usize) else {
                    break;
                };
                batch.push(CodedSample {
                    track_id: track.info.id,
                    data: Bytes::copy_from_slice(payload),
                    pts: entry.pts,
                    duration: entry.duration,
                    keyframe: entry.keyframe,
                });
                self.cursors[i] += 1;
                if batch.len() >= SAMPLE_BATCH {
                    emissions.push((track.info.id, std::mem::take(&mut batch)));
                }
            }
            if !batch.is_empty() {
                emissions.push((track.info.id, batch));
            }
        }

        // Everything below the least unconsumed offset is eligible for
        // eviction.
        let watermark = movie
            .tracks
            .iter()
            .enumerate()
            .map(|(i, track)| match track.samples.get(self.cursors[i]) {
                Some(next) => next.offset,
                None => track.data_end(),
            })
            .min()
            .unwrap_or(0);
        self.buffer.set_watermark(watermark);

        for (track_id, batch) in emissions {
            tracing::trace!(track_id, count = batch.len(), "emitting sample batch");
            self.events.on_samples(track_id, batch);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collected {
        ready: Vec<MediaInfo>,
        batches: Vec<(u32, Vec<CodedSample>)>,
    }

    #[derive(Default)]
    struct Recorder {
        inner: Mutex<Collected>,
    }

    impl DemuxerEvents for Recorder {
        fn on_ready(&self, info: MediaInfo) {
            self.inner.lock().ready.push(info);
        }
        fn on_samples(&self, track_id: u32, batch: Vec<CodedSample>) {
            self.inner.lock().batches.push((track_id, batch));
        }
    }

    #[test]
    fn rejects_non_contiguous_appends() {
        let events = Arc::new(Recorder::default());
        let mut demuxer = Demuxer::new(events);
        demuxer.append_bytes(&[0u8; 8], 0, false).ok();
        let err = demuxer.append_bytes(&[0u8; 8], 100, false).unwrap_err();
        assert!(matches!(err, DemuxError::NonContiguous { .. }));
    }

    #[test]
    fn seek_before_ready_is_noop() {
        let events = Arc::new(Recorder::default());
        let mut demuxer = Demuxer::new(events);
        assert!(demuxer.seek(Duration::from_secs(1)).is_none());
    }

    #[test]
    fn reset_is_idempotent() {
        let events = Arc::new(Recorder::default());
        let mut demuxer = Demuxer::new(events);
        demuxer.append_bytes(&[0u8; 16], 0, true).ok();
        demuxer.reset();
        demuxer.reset();
        assert_eq!(demuxer.next_expected_offset(), 0);
        assert!(!demuxer.is_ready());
    }

    // Full end-to-end demux coverage (ready, batching, metadata-at-end,
    // seek) lives in tests/pipeline_test.rs against synthetic MP4 files.
}
