//! Audio-driven haptic synchronization for streamed video.
//!
//! The pipeline turns a video's audio track into a time-indexed intensity
//! curve and keeps that curve aligned with an independently clocked player:
//! samples flow down through [`FeatureExtractor`] and [`AudioAnalyzer`] into
//! an [`IntensityTrack`], while playback ticks flow up through the
//! [`SyncOrchestrator`], which prefetches chunks via [`ChunkManager`] and
//! drives a [`HapticSink`] with latency-compensated lookups.

pub mod audio;
pub mod chunk;
pub mod config;
pub mod events;
pub mod source;
pub mod sync;
pub mod track;

pub use audio::{AudioAnalyzer, FeatureExtractor, FrameFeatures};
pub use chunk::{ChunkManager, ChunkState};
pub use config::SyncSettings;
pub use events::{event_channel, EventReceiver, EventSender, SyncEvent};
pub use source::{looks_like_video_url, AudioSource, HapticSink};
pub use sync::{map_to_device, PlaybackClock, SessionContext, SyncOrchestrator, SyncState};
pub use track::{IntensitySegment, IntensityTrack};
