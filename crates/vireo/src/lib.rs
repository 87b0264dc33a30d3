//! vireo: a streaming MP4 playback engine.
//!
//! The pipeline ingests container bytes in arbitrary-sized chunks (whole
//! local files or progressive network streams with a fast-start path),
//! incrementally demuxes the box structure into per-track coded samples,
//! decodes them through a capability-negotiated accelerated→software
//! fallback, and presents video frames against an audio-driven playback
//! clock.
//!
//! Entry point: [`Player`]. Everything else is exposed for embedders
//! that integrate a platform decoder ([`decode::AcceleratorProbe`]), a
//! custom renderer tier, or an alternative audio backend.
//!
//! ```no_run
//! use vireo::Player;
//!
//! let player = Player::new();
//! player.load_file("movie.mp4")?;
//! player.play();
//! # Ok::<(), vireo::PlayerError>(())
//! ```

pub mod audio;
/// Internal SPSC ring between the audio feeder and the output callback.
/// Public for the audio engine's seam; not semver-stable.
#[doc(hidden)]
pub mod audio_ring_buffer;
pub mod decode;
pub mod demux;
pub mod error;
pub mod events;
pub mod frame_queue;
pub mod media;
pub mod player;
pub mod render;
pub mod scheduler;
pub mod source;
pub mod sync_metrics;

pub use error::{AudioError, DecodeError, DemuxError, PlayerError, RenderError, SourceError};
pub use events::{NullEvents, PlayerEvents};
pub use media::{AudioFrame, CodedSample, MediaInfo, TrackInfo, TrackKind, VideoFrame};
pub use player::{PlaybackState, Player, PlayerBuilder, PlayerState, PlayerStats};
pub use render::{RasterRenderer, Renderer, RendererKind, SharedFramebuffer};
pub use source::{FileSource, HttpSource, MediaSource, MemorySource};
pub use sync_metrics::SyncMetricsSnapshot;
