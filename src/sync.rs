use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::chunk::ChunkManager;
use crate::config::SyncSettings;
use crate::events::{emit, EventSender, SyncEvent};
use crate::source::{looks_like_video_url, AudioSource, HapticSink};
use crate::track::IntensityTrack;

/// How long latency-compensated look-ahead may run before the orchestrator
/// re-anchors to the exact reported playback time.
const RESYNC_INTERVAL: Duration = Duration::from_millis(5000);

/// Device power below this level is imperceptible on most hardware.
const MIN_PERCEPTIBLE: f32 = 0.08;

/// Track intensity below this level counts as silence for device mapping.
const SILENCE_EPSILON: f32 = 1e-3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    Processing,
    Ready,
    Playing,
    Paused,
    WaitingForChunk,
}

/// The orchestrator's view of the external video player. Mutated only by
/// playback-tick and seek events.
#[derive(Debug, Clone)]
pub struct PlaybackClock {
    pub current_time: f64,
    pub paused: bool,
    last_resync: Instant,
}

impl PlaybackClock {
    fn new() -> Self {
        Self {
            current_time: 0.0,
            paused: true,
            last_resync: Instant::now(),
        }
    }

    fn update(&mut self, current_time: f64, paused: bool) {
        self.current_time = current_time;
        self.paused = paused;
    }

    /// The track timestamp to query this tick. Every `RESYNC_INTERVAL` the
    /// latency offset is dropped and the clock re-anchors to the reported
    /// time exactly, bounding accumulated drift.
    fn look_ahead_time(&mut self, now: Instant, offset_secs: f64) -> f64 {
        if now.duration_since(self.last_resync) >= RESYNC_INTERVAL {
            self.last_resync = now;
            self.current_time
        } else {
            self.current_time + offset_secs
        }
    }

    fn reset_resync(&mut self, now: Instant) {
        self.last_resync = now;
    }
}

/// Session-scoped collaborators, injected once at construction instead of
/// being looked up through globals.
pub struct SessionContext {
    pub settings: SyncSettings,
    pub haptics: Arc<dyn HapticSink>,
    pub events: EventSender,
}

/// Top-level coordinator: consumes playback ticks from the video surface,
/// keeps the chunk pipeline fed, queries the intensity track with
/// latency-compensated look-ahead, and drives the haptic sink.
pub struct SyncOrchestrator {
    ctx: SessionContext,
    chunks: Arc<ChunkManager>,
    track: Arc<IntensityTrack>,
    state: SyncState,
    clock: PlaybackClock,
    haptics_enabled: bool,
}

impl SyncOrchestrator {
    pub fn new(ctx: SessionContext, source: Arc<dyn AudioSource>) -> Self {
        let track = Arc::new(IntensityTrack::new());
        let chunks = ChunkManager::new(
            ctx.settings.clone(),
            source,
            track.clone(),
            ctx.events.clone(),
        );
        Self {
            ctx,
            chunks,
            track,
            state: SyncState::Idle,
            clock: PlaybackClock::new(),
            haptics_enabled: false,
        }
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    pub fn playback_clock(&self) -> &PlaybackClock {
        &self.clock
    }

    pub fn haptics_enabled(&self) -> bool {
        self.haptics_enabled
    }

    pub fn chunk_manager(&self) -> &Arc<ChunkManager> {
        &self.chunks
    }

    /// Begin a session for a detected video. Non-video URLs are ignored and
    /// the orchestrator stays `Idle`. Waits for the first chunk up to the
    /// configured deadline; on timeout the session continues with haptics
    /// disabled so video start is never blocked indefinitely.
    pub async fn start_session(&mut self, url: &str) -> Result<()> {
        if !looks_like_video_url(url) {
            debug!("ignoring non-video url: {}", url);
            return Ok(());
        }

        self.state = SyncState::Processing;
        self.haptics_enabled = false;
        self.clock = PlaybackClock::new();

        if let Err(e) = self.chunks.initialize(url).await {
            self.state = SyncState::Idle;
            emit(&self.ctx.events, SyncEvent::Error(format!("{:#}", e)));
            return Err(e).context("session setup failed");
        }
        emit(
            &self.ctx.events,
            SyncEvent::ProcessingStarted("Analyzing audio for haptic sync".to_string()),
        );

        let deadline = Duration::from_secs_f64(self.ctx.settings.first_chunk_timeout_secs);
        match tokio::time::timeout(deadline, self.chunks.start_first_chunk()).await {
            Ok(Ok(())) => {
                self.haptics_enabled = true;
                self.state = SyncState::Ready;
                emit(&self.ctx.events, SyncEvent::ProcessingCompleted);
                info!("first chunk ready, session live");
            }
            Ok(Err(e)) => {
                // Could not acquire the first chunk at all: unrecoverable.
                self.chunks.reset().await;
                self.state = SyncState::Idle;
                emit(&self.ctx.events, SyncEvent::Error(format!("{:#}", e)));
                return Err(e).context("first chunk unavailable");
            }
            Err(_) => {
                self.state = SyncState::Ready;
                warn!("first chunk not ready within deadline, continuing without haptics");
                emit(
                    &self.ctx.events,
                    SyncEvent::Error("audio analysis timed out; playing without haptics".into()),
                );
            }
        }
        Ok(())
    }

    /// Handle one `(current_time, paused)` report from the video surface.
    /// Never blocks: chunk work is fired and forgotten, track reads are
    /// non-blocking, and a missing track value skips the tick silently.
    pub async fn handle_tick(&mut self, current_time: f64, paused: bool) {
        match self.state {
            SyncState::Idle | SyncState::Processing | SyncState::WaitingForChunk => return,
            SyncState::Ready | SyncState::Playing | SyncState::Paused => {}
        }

        let now = Instant::now();
        let was_paused = self.clock.paused;
        self.clock.update(current_time, paused);

        if paused {
            if self.state == SyncState::Playing {
                self.state = SyncState::Paused;
                self.send_intensity(0.0).await;
            }
            return;
        }

        if self.state != SyncState::Playing {
            self.state = SyncState::Playing;
            if was_paused {
                self.clock.reset_resync(now);
            }
        }

        self.chunks.check_buffer_and_process(current_time);

        if !self.haptics_enabled {
            return;
        }

        let offset = self.ctx.settings.lookahead_offset_secs();
        let look_ahead = self.clock.look_ahead_time(now, offset);
        // No data yet for this position: skip the tick rather than guess.
        let Some(intensity) = self.track.query(look_ahead) else {
            return;
        };
        let mapped = map_to_device(intensity, self.ctx.settings.live_intensity);
        self.send_intensity(mapped).await;
    }

    /// Handle a discrete seek. A seek into a not-yet-ready chunk parks the
    /// session in `WaitingForChunk`, asks the surface to show loading, and
    /// resumes once the chunk resolves.
    pub async fn seek(&mut self, new_time: f64) {
        match self.state {
            SyncState::Ready | SyncState::Playing | SyncState::Paused => {}
            _ => return,
        }

        let now = Instant::now();
        self.clock.current_time = new_time;
        self.clock.reset_resync(now);

        let index = self.chunks.chunk_index_for_time(new_time);
        if self.chunks.is_chunk_ready(index) {
            self.chunks.check_buffer_and_process(new_time);
            return;
        }

        info!("seek to {:.1}s needs chunk {}", new_time, index);
        self.state = SyncState::WaitingForChunk;
        emit(&self.ctx.events, SyncEvent::ChunkLoadingRequired(index));
        self.send_intensity(0.0).await;

        match self.chunks.ensure_chunk_ready(index).await {
            Ok(()) => {
                emit(&self.ctx.events, SyncEvent::ChunkLoadingCompleted);
                self.state = SyncState::Playing;
                self.clock.reset_resync(Instant::now());
            }
            Err(e) => {
                warn!("chunk {} never became ready: {:#}", index, e);
                emit(&self.ctx.events, SyncEvent::Error(format!("{:#}", e)));
                self.state = SyncState::Paused;
            }
        }
    }

    /// The video reached its end: tear the session down.
    pub async fn ended(&mut self) {
        self.reset().await;
    }

    /// Navigation away or explicit stop. Cancels all chunk work, zeroes the
    /// device, and discards the track and analyzer state.
    pub async fn reset(&mut self) {
        if self.state == SyncState::Idle {
            return;
        }
        info!("session reset");
        self.chunks.reset().await;
        if let Err(e) = self.ctx.haptics.stop().await {
            warn!("haptic stop failed: {:#}", e);
        }
        self.haptics_enabled = false;
        self.state = SyncState::Idle;
    }

    async fn send_intensity(&self, value: f32) {
        if let Err(e) = self.ctx.haptics.set_intensity(value).await {
            // Transport errors are per-tick noise, never fatal.
            warn!("haptic send failed: {:#}", e);
        }
    }
}

/// Map a track intensity into the device's power range under the user's
/// `live` ceiling. Silence stays silent; at normal ceilings any non-silent
/// content is lifted above the perceptibility threshold; at very low ceilings
/// plain proportional scaling preserves the user's intent.
pub fn map_to_device(intensity: f32, live: f32) -> f32 {
    if intensity < SILENCE_EPSILON || live <= 0.0 {
        return 0.0;
    }
    if live < MIN_PERCEPTIBLE {
        return intensity * live;
    }
    MIN_PERCEPTIBLE + intensity * (live - MIN_PERCEPTIBLE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_silence_and_zero_ceiling() {
        assert_eq!(map_to_device(0.0, 1.0), 0.0);
        assert_eq!(map_to_device(0.5, 0.0), 0.0);
        assert_eq!(map_to_device(0.0005, 0.8), 0.0);
    }

    #[test]
    fn test_map_low_ceiling_is_proportional() {
        let out = map_to_device(0.5, 0.05);
        assert!((out - 0.025).abs() < 1e-6);
    }

    #[test]
    fn test_map_normal_ceiling_is_perceptible() {
        let out = map_to_device(0.01, 0.5);
        assert!(out >= MIN_PERCEPTIBLE);
        assert!(map_to_device(1.0, 0.5) <= 0.5);
    }

    #[test]
    fn test_map_monotonic_in_intensity() {
        for &live in &[0.05, 0.08, 0.3, 1.0] {
            let mut prev = 0.0;
            for step in 0..=100 {
                let i = step as f32 / 100.0;
                let out = map_to_device(i, live);
                assert!(out >= prev, "live={} i={}", live, i);
                prev = out;
            }
        }
    }

    #[test]
    fn test_look_ahead_resyncs_within_interval() {
        let start = Instant::now();
        let mut clock = PlaybackClock::new();
        clock.reset_resync(start);
        let offset = 0.12;

        // Jittered ticks at ~30 Hz for 12 simulated seconds.
        let mut seed = 0x1234_5678u32;
        let mut elapsed = Duration::ZERO;
        let mut since_resync = Duration::ZERO;
        for tick in 0..360 {
            seed = seed.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
            let jitter_ms = (seed >> 24) % 20; // 0..20 ms of timer jitter
            let step = Duration::from_millis(33 + jitter_ms as u64);
            elapsed += step;
            since_resync += step;

            let now = start + elapsed;
            let t = elapsed.as_secs_f64();
            clock.update(t, false);
            let look_ahead = clock.look_ahead_time(now, offset);

            if since_resync >= RESYNC_INTERVAL {
                assert_eq!(look_ahead, t, "tick {} must hard-resync", tick);
                since_resync = Duration::ZERO;
            } else {
                assert!((look_ahead - (t + offset)).abs() < 1e-9);
            }
            // Drift from the compensated ideal never exceeds the offset
            // itself, and the anchor is refreshed at least every 5 s.
            assert!(since_resync < RESYNC_INTERVAL);
        }
    }
}
