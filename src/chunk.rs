use anyhow::{anyhow, bail, Context, Result};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::audio::{AudioAnalyzer, FFT_SIZE, HOP_SIZE};
use crate::config::SyncSettings;
use crate::events::{emit, EventSender, SyncEvent};
use crate::source::AudioSource;
use crate::track::{IntensitySegment, IntensityTrack};

/// Lifecycle of one fixed-duration audio chunk. Transitions are monotonic
/// except `Failed`, which is terminal until an explicit `retry_chunk`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Downloading,
    Analyzing,
    Ready,
    Failed,
}

struct ChunkSlot {
    state: ChunkState,
    /// Session generation the slot was spawned under; state updates from a
    /// task of any other generation are no-ops.
    generation: u64,
    notify: watch::Sender<ChunkState>,
}

struct Inner {
    video_url: Option<String>,
    duration_secs: f64,
    chunks: HashMap<usize, ChunkSlot>,
    tasks: JoinSet<()>,
}

/// Owns the download/analyze lifecycle of all chunks for one video.
///
/// Download and analysis run on supervised background tasks; the session
/// generation (carried by the [`IntensityTrack`]) makes completions from a
/// previous session no-ops, so a reset can never leak a late segment into a
/// fresh track. The only blocking entry points are `start_first_chunk` and
/// `ensure_chunk_ready`; everything else reads current state or fires work
/// and returns.
pub struct ChunkManager {
    weak: Weak<ChunkManager>,
    settings: SyncSettings,
    /// Configured chunk duration rounded to a whole number of analysis hops,
    /// so consecutive segments tile with no uncovered sliver at the seams.
    chunk_secs: f64,
    source: Arc<dyn AudioSource>,
    analyzer: tokio::sync::Mutex<AudioAnalyzer>,
    track: Arc<IntensityTrack>,
    events: EventSender,
    inner: Mutex<Inner>,
}

impl ChunkManager {
    pub fn new(
        settings: SyncSettings,
        source: Arc<dyn AudioSource>,
        track: Arc<IntensityTrack>,
        events: EventSender,
    ) -> Arc<Self> {
        let frame_interval = HOP_SIZE as f64 / settings.sample_rate as f64;
        let hops = (settings.chunk_duration_secs / frame_interval).round().max(1.0);
        Arc::new_cyclic(|weak| Self {
            weak: weak.clone(),
            analyzer: tokio::sync::Mutex::new(AudioAnalyzer::new(settings.clone())),
            chunk_secs: hops * frame_interval,
            settings,
            source,
            track,
            events,
            inner: Mutex::new(Inner {
                video_url: None,
                duration_secs: 0.0,
                chunks: HashMap::new(),
                tasks: JoinSet::new(),
            }),
        })
    }

    /// Begin a session for `video_url`. Discards any previous session first.
    /// Failure here (unreachable source) is an unrecoverable setup error and
    /// propagates to the caller.
    pub async fn initialize(&self, video_url: &str) -> Result<()> {
        self.reset().await;
        let duration = self
            .source
            .duration_secs(video_url)
            .await
            .with_context(|| format!("querying duration of {}", video_url))?;
        let mut inner = self.inner.lock().unwrap();
        inner.video_url = Some(video_url.to_string());
        inner.duration_secs = duration;
        info!("session initialized: {} ({:.1}s)", video_url, duration);
        Ok(())
    }

    /// Kick off chunk 0 and wait for it to resolve.
    pub async fn start_first_chunk(&self) -> Result<()> {
        self.spawn_chunk(0);
        self.ensure_chunk_ready(0).await
    }

    /// Look-ahead prefetch: make sure every chunk covering
    /// `[current_time, current_time + prefetch_window)` is at least in
    /// flight. Never blocks; failures surface through the `Error` event.
    pub fn check_buffer_and_process(&self, current_time: f64) {
        let duration = {
            let inner = self.inner.lock().unwrap();
            if inner.video_url.is_none() {
                return;
            }
            inner.duration_secs
        };
        if duration <= 0.0 {
            return;
        }

        let max_index = ((duration / self.chunk_secs).ceil() as usize).saturating_sub(1);
        let t = current_time.max(0.0);
        let first = self.chunk_index_for_time(t).min(max_index);
        let last = self
            .chunk_index_for_time(t + self.settings.prefetch_window_secs)
            .min(max_index);
        for index in first..=last {
            self.spawn_chunk(index);
        }
    }

    /// Await a chunk until it is `Ready` (Ok) or `Failed` (Err). Used only on
    /// seeks into unready territory; does not duplicate in-flight work.
    pub async fn ensure_chunk_ready(&self, index: usize) -> Result<()> {
        self.spawn_chunk(index);
        let mut rx = {
            let inner = self.inner.lock().unwrap();
            let slot = inner
                .chunks
                .get(&index)
                .ok_or_else(|| anyhow!("no active session"))?;
            slot.notify.subscribe()
        };
        loop {
            match *rx.borrow_and_update() {
                ChunkState::Ready => return Ok(()),
                ChunkState::Failed => bail!("chunk {} failed", index),
                _ => {}
            }
            rx.changed()
                .await
                .map_err(|_| anyhow!("session ended while waiting for chunk {}", index))?;
        }
    }

    pub fn chunk_state(&self, index: usize) -> Option<ChunkState> {
        self.inner
            .lock()
            .unwrap()
            .chunks
            .get(&index)
            .map(|slot| slot.state)
    }

    pub fn is_chunk_ready(&self, index: usize) -> bool {
        self.chunk_state(index) == Some(ChunkState::Ready)
    }

    pub fn is_first_chunk_ready(&self) -> bool {
        self.is_chunk_ready(0)
    }

    pub fn chunk_index_for_time(&self, time: f64) -> usize {
        (time.max(0.0) / self.chunk_secs) as usize
    }

    /// Re-queue a `Failed` chunk. No-op for chunks in any other state.
    pub fn retry_chunk(&self, index: usize) {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.chunks.get(&index) {
                Some(slot) if slot.state == ChunkState::Failed => {
                    inner.chunks.remove(&index);
                }
                _ => return,
            }
        }
        self.spawn_chunk(index);
    }

    /// Abort all in-flight work and discard chunks, track, and analyzer
    /// state. The track's generation is advanced first, so a task that
    /// already passed its last await point has its insert rejected.
    pub async fn reset(&self) {
        self.track.clear();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.tasks.abort_all();
            inner.chunks.clear();
            inner.video_url = None;
            inner.duration_secs = 0.0;
        }
        self.analyzer.lock().await.reset();
    }

    /// Launch background processing for a chunk unless it is already
    /// tracked (in flight, ready, or failed).
    fn spawn_chunk(&self, index: usize) {
        let generation = self.track.generation();
        let mut inner = self.inner.lock().unwrap();
        if inner.video_url.is_none() || inner.chunks.contains_key(&index) {
            return;
        }
        let (notify, _) = watch::channel(ChunkState::Pending);
        inner.chunks.insert(
            index,
            ChunkSlot {
                state: ChunkState::Pending,
                generation,
                notify,
            },
        );
        let Some(this) = self.weak.upgrade() else {
            return;
        };
        inner.tasks.spawn(async move {
            this.process_chunk(index, generation).await;
        });
    }

    async fn process_chunk(&self, index: usize, generation: u64) {
        if let Err(e) = self.run_chunk(index, generation).await {
            if self.track.generation() != generation {
                return;
            }
            warn!("chunk {} failed: {:#}", index, e);
            self.set_state(index, generation, ChunkState::Failed);
            emit(
                &self.events,
                SyncEvent::Error(format!("chunk {}: {:#}", index, e)),
            );
        }
    }

    async fn run_chunk(&self, index: usize, generation: u64) -> Result<()> {
        let (url, start, end, fetch_end) = {
            let inner = self.inner.lock().unwrap();
            let url = inner
                .video_url
                .clone()
                .ok_or_else(|| anyhow!("no active session"))?;
            let start = index as f64 * self.chunk_secs;
            let end = (start + self.chunk_secs).min(inner.duration_secs);
            // Fetch one FFT window minus one hop beyond the chunk end, so the
            // frames covering the chunk's final hops have full windows and the
            // segment reaches the next chunk's start exactly.
            let overlap = (FFT_SIZE - HOP_SIZE) as f64 / self.settings.sample_rate as f64;
            let fetch_end = (end + overlap).min(inner.duration_secs);
            (url, start, end, fetch_end)
        };
        if end <= start {
            bail!("chunk {} lies outside the media duration", index);
        }

        self.set_state(index, generation, ChunkState::Downloading);
        emit(&self.events, SyncEvent::ChunkLoadingStarted(index));
        emit(
            &self.events,
            SyncEvent::ProcessingProgress {
                chunk_index: index,
                percent: 0.0,
            },
        );
        info!("downloading chunk {} ({:.1}s..{:.1}s)", index, start, end);

        let samples = self
            .source
            .fetch_samples(&url, start, fetch_end)
            .await
            .with_context(|| format!("downloading audio for chunk {}", index))?;
        if self.track.generation() != generation {
            return Ok(());
        }

        self.set_state(index, generation, ChunkState::Analyzing);
        emit(
            &self.events,
            SyncEvent::ProcessingProgress {
                chunk_index: index,
                percent: 50.0,
            },
        );

        let (mut values, frame_interval) = {
            let mut analyzer = self.analyzer.lock().await;
            let values = analyzer
                .analyze(&samples)
                .with_context(|| format!("analyzing chunk {}", index))?;
            (values, analyzer.frame_interval())
        };
        // Frames produced from the overlap samples belong to the next chunk.
        let own_frames = ((end - start) * self.settings.sample_rate as f64).round() as usize
            / HOP_SIZE;
        values.truncate(own_frames);

        if !self.track.insert_segment(
            generation,
            index,
            IntensitySegment::new(start, frame_interval, values),
        ) {
            return Ok(());
        }
        self.set_state(index, generation, ChunkState::Ready);
        emit(
            &self.events,
            SyncEvent::ProcessingProgress {
                chunk_index: index,
                percent: 100.0,
            },
        );
        emit(&self.events, SyncEvent::ChunkReady(index));
        info!("chunk {} ready", index);
        Ok(())
    }

    fn set_state(&self, index: usize, generation: u64, state: ChunkState) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.chunks.get_mut(&index) {
            if slot.generation != generation {
                return;
            }
            slot.state = state;
            slot.notify.send_replace(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::event_channel;
    use async_trait::async_trait;

    struct SilentSource {
        duration: f64,
        sample_rate: u32,
    }

    #[async_trait]
    impl AudioSource for SilentSource {
        async fn fetch_samples(&self, _url: &str, start: f64, end: f64) -> Result<Vec<f32>> {
            let n = ((end - start).max(0.0) * self.sample_rate as f64).round() as usize;
            Ok(vec![0.0; n])
        }

        async fn duration_secs(&self, _url: &str) -> Result<f64> {
            Ok(self.duration)
        }
    }

    fn test_settings() -> SyncSettings {
        SyncSettings {
            chunk_duration_secs: 1.0,
            prefetch_window_secs: 2.0,
            sample_rate: 8000,
            ..Default::default()
        }
    }

    #[test]
    fn test_chunk_index_for_time() {
        let (events, _rx) = event_channel();
        let manager = ChunkManager::new(
            SyncSettings {
                chunk_duration_secs: 30.0,
                ..Default::default()
            },
            Arc::new(SilentSource {
                duration: 120.0,
                sample_rate: 8000,
            }),
            Arc::new(IntensityTrack::new()),
            events,
        );
        assert_eq!(manager.chunk_index_for_time(0.0), 0);
        assert_eq!(manager.chunk_index_for_time(29.9), 0);
        // Boundaries are rounded to whole analysis hops, so at 44.1 kHz the
        // effective chunk length is a fraction of a frame over 30 s.
        assert_eq!(manager.chunk_index_for_time(30.1), 1);
        assert_eq!(manager.chunk_index_for_time(95.0), 3);
        assert_eq!(manager.chunk_index_for_time(-5.0), 0);
    }

    #[tokio::test]
    async fn test_first_chunk_lifecycle() {
        let (events, rx) = event_channel();
        let track = Arc::new(IntensityTrack::new());
        let manager = ChunkManager::new(
            test_settings(),
            Arc::new(SilentSource {
                duration: 3.0,
                sample_rate: 8000,
            }),
            track.clone(),
            events,
        );

        manager.initialize("https://example.com/clip.mp4").await.unwrap();
        manager.start_first_chunk().await.unwrap();

        assert!(manager.is_first_chunk_ready());
        assert!(track.has_chunk(0));
        let seen: Vec<_> = rx.try_iter().collect();
        assert!(seen.contains(&SyncEvent::ChunkLoadingStarted(0)));
        assert!(seen.contains(&SyncEvent::ChunkReady(0)));
    }

    #[tokio::test]
    async fn test_prefetch_covers_window_without_blocking() {
        let (events, _rx) = event_channel();
        let track = Arc::new(IntensityTrack::new());
        let manager = ChunkManager::new(
            test_settings(),
            Arc::new(SilentSource {
                duration: 10.0,
                sample_rate: 8000,
            }),
            track.clone(),
            events,
        );

        manager.initialize("https://example.com/clip.mp4").await.unwrap();
        manager.check_buffer_and_process(0.0);
        // The 2 s prefetch window with ~1 s chunks keeps at least chunks 0
        // and 1 in flight; chunk 2 is spawned by the explicit await below.
        for index in 0..=2 {
            manager.ensure_chunk_ready(index).await.unwrap();
        }
        assert_eq!(track.segment_count(), 3);
    }

    #[tokio::test]
    async fn test_segments_tile_across_chunk_seams() {
        let (events, _rx) = event_channel();
        let track = Arc::new(IntensityTrack::new());
        let manager = ChunkManager::new(
            test_settings(),
            Arc::new(SilentSource {
                duration: 3.0,
                sample_rate: 8000,
            }),
            track.clone(),
            events,
        );

        manager.initialize("https://example.com/clip.mp4").await.unwrap();
        manager.ensure_chunk_ready(0).await.unwrap();
        manager.ensure_chunk_ready(1).await.unwrap();

        // Every lookup inside the first two chunks must resolve, including
        // the frames right at the seam between them.
        let end = 2.0 * manager.chunk_secs;
        let mut t = 0.0;
        while t < end - 1e-9 {
            assert!(
                track.query(t).is_some(),
                "no data at t={:.4}s across the chunk seam",
                t
            );
            t += 0.01;
        }
    }

    #[tokio::test]
    async fn test_chunk_past_duration_fails_cleanly() {
        let (events, rx) = event_channel();
        let manager = ChunkManager::new(
            test_settings(),
            Arc::new(SilentSource {
                duration: 2.0,
                sample_rate: 8000,
            }),
            Arc::new(IntensityTrack::new()),
            events,
        );

        manager.initialize("https://example.com/clip.mp4").await.unwrap();
        assert!(manager.ensure_chunk_ready(10).await.is_err());
        assert_eq!(manager.chunk_state(10), Some(ChunkState::Failed));
        assert!(rx
            .try_iter()
            .any(|e| matches!(e, SyncEvent::Error(_))));
    }
}
