use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-session synchronization settings.
///
/// Supplied by the embedding application at session start and treated as
/// immutable by the core: the analyzer, chunk pipeline, and orchestrator all
/// read from the same snapshot. Weights and bounds shape the intensity curve;
/// the latency fields shape how far ahead of the reported playback position
/// the track is queried.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    // Intensity composition weights
    pub rms_weight: f32,
    pub bass_weight: f32,
    pub onset_weight: f32,

    // Shaping
    /// Power-law exponent control: output = intensity^(1/sensitivity).
    pub sensitivity: f32,
    pub min_intensity: f32,
    pub max_intensity: f32,
    /// One-pole smoothing coefficient (0 = none, close to 1 = heavy).
    pub smoothing: f32,

    // Device latency compensation (milliseconds)
    pub base_device_latency_ms: f32,
    pub device_anticipation_ms: f32,
    pub manual_offset_ms: f32,

    /// User-configured device power ceiling, 0.0-1.0.
    pub live_intensity: f32,

    // Pipeline geometry
    pub sample_rate: u32,
    pub chunk_duration_secs: f64,
    pub prefetch_window_secs: f64,
    pub first_chunk_timeout_secs: f64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            rms_weight: 1.0,
            bass_weight: 1.0,
            onset_weight: 0.5,

            sensitivity: 1.0,
            min_intensity: 0.0,
            max_intensity: 1.0,
            smoothing: 0.3,

            base_device_latency_ms: 80.0,
            device_anticipation_ms: 40.0,
            manual_offset_ms: 0.0,

            live_intensity: 1.0,

            sample_rate: 44100,
            chunk_duration_secs: 30.0,
            prefetch_window_secs: 45.0,
            first_chunk_timeout_secs: 120.0,
        }
    }
}

impl SyncSettings {
    /// Total look-ahead offset applied between hard resyncs, in seconds.
    pub fn lookahead_offset_secs(&self) -> f64 {
        (self.base_device_latency_ms + self.device_anticipation_ms + self.manual_offset_ms) as f64
            / 1000.0
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = std::fs::read_to_string(&path)
            .with_context(|| format!("reading settings from {:?}", path.as_ref()))?;
        let settings = serde_json::from_str(&json)?;
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)
            .with_context(|| format!("writing settings to {:?}", path.as_ref()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_settings_are_sane() {
        let s = SyncSettings::default();
        assert!(s.min_intensity <= s.max_intensity);
        assert!(s.max_intensity <= 1.0);
        assert!((0.0..1.0).contains(&s.smoothing));
        assert!(s.sensitivity > 0.0);
        assert!(s.chunk_duration_secs > 0.0);
        assert!(s.prefetch_window_secs >= s.chunk_duration_secs);
    }

    #[test]
    fn test_lookahead_offset() {
        let s = SyncSettings {
            base_device_latency_ms: 80.0,
            device_anticipation_ms: 40.0,
            manual_offset_ms: -20.0,
            ..Default::default()
        };
        assert!((s.lookahead_offset_secs() - 0.1).abs() < 1e-9);
    }
}
