use anyhow::{bail, Result};
use log::debug;
use std::collections::VecDeque;

use super::{FeatureExtractor, FrameFeatures, FFT_SIZE, HOP_SIZE};
use crate::config::SyncSettings;

// Adaptive baseline coefficients, per frame. Asymmetric so sustained
// background tones are absorbed into the baseline quickly but the baseline
// releases slowly through quiet passages.
const BASELINE_RISE: f32 = 0.015;
const BASELINE_FALL: f32 = 0.003;

// Rolling flux history length: ~0.5 s at the 86 Hz frame rate.
const FLUX_HISTORY_FRAMES: usize = 43;
// A detector needs this much history before it may fire.
const FLUX_WARMUP_FRAMES: usize = 10;

const HIGH_TRIGGER_RATIO: f32 = 2.0;
const BASS_TRIGGER_RATIO: f32 = 2.5;

// Absolute flux floors so near-silence noise can never trigger a pulse.
const HIGH_FLUX_FLOOR: f32 = 0.05;
const BASS_FLUX_FLOOR: f32 = 0.01;

/// Transient pulse plateau levels and lengths. The cooldown of each detector
/// equals its pulse length, so a detector cannot retrigger mid-pulse.
const HIGH_PULSE_LEVEL: f32 = 1.0;
const BASS_PULSE_LEVEL: f32 = 0.95;
const HIGH_PULSE_FRAMES: u32 = 6;
const BASS_PULSE_FRAMES: u32 = 10;

// Frames below this fraction of the chunk's median raw intensity are silence.
const GATE_RATIO: f32 = 0.3;

const COMPOSITE_SCALE: f32 = 0.85;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pulse {
    High,
    Bass,
}

/// Mutable per-session analysis state.
///
/// Persists across chunk boundaries of the same video so baselines and
/// smoothing never restart at the 30-60 s chunk seams; reset only when a new
/// video session starts.
#[derive(Debug, Clone)]
struct AnalyzerState {
    baseline_rms: f32,
    baseline_bass: f32,
    high_flux_history: VecDeque<f32>,
    bass_flux_history: VecDeque<f32>,
    high_cooldown: u32,
    bass_cooldown: u32,
    last_smoothed: f32,
}

impl Default for AnalyzerState {
    fn default() -> Self {
        Self {
            baseline_rms: 0.0,
            baseline_bass: 0.0,
            high_flux_history: VecDeque::with_capacity(FLUX_HISTORY_FRAMES),
            bass_flux_history: VecDeque::with_capacity(FLUX_HISTORY_FRAMES),
            high_cooldown: 0,
            bass_cooldown: 0,
            last_smoothed: 0.0,
        }
    }
}

/// Converts one chunk of mono PCM into a normalized intensity sequence at the
/// fixed hop rate.
///
/// Three passes per chunk: feature extraction, baseline/composite with
/// transient detection, then gating/shaping/smoothing. Output is
/// deterministic for identical samples, settings, and prior state.
pub struct AudioAnalyzer {
    settings: SyncSettings,
    extractor: FeatureExtractor,
    state: AnalyzerState,
}

impl AudioAnalyzer {
    pub fn new(settings: SyncSettings) -> Self {
        let sample_rate = settings.sample_rate as f32;
        Self {
            settings,
            extractor: FeatureExtractor::new(sample_rate),
            state: AnalyzerState::default(),
        }
    }

    /// Seconds between successive output frames.
    pub fn frame_interval(&self) -> f64 {
        HOP_SIZE as f64 / self.settings.sample_rate as f64
    }

    /// Discard all per-session state. Called when a new video session starts.
    pub fn reset(&mut self) {
        self.state = AnalyzerState::default();
        self.extractor.reset();
    }

    /// Analyze one chunk of mono PCM, producing one intensity value per hop.
    ///
    /// Fails if the chunk is shorter than a single FFT window; the caller
    /// marks that chunk failed and the session continues.
    pub fn analyze(&mut self, samples: &[f32]) -> Result<Vec<f32>> {
        if samples.len() < FFT_SIZE {
            bail!(
                "chunk too short for analysis: {} samples, need at least {}",
                samples.len(),
                FFT_SIZE
            );
        }

        let features = self.feature_pass(samples);
        let (raw, pulses) = self.composite_pass(&features);
        let intensities = self.shaping_pass(&raw, &pulses);

        debug!(
            "analyzed chunk: {} samples -> {} frames",
            samples.len(),
            intensities.len()
        );
        Ok(intensities)
    }

    /// Pass 1: slide the FFT window across the chunk and collect per-frame
    /// spectral features.
    fn feature_pass(&mut self, samples: &[f32]) -> Vec<FrameFeatures> {
        let mut features = Vec::with_capacity(samples.len() / HOP_SIZE);
        let mut start = 0;
        while start + FFT_SIZE <= samples.len() {
            features.push(self.extractor.extract(&samples[start..start + FFT_SIZE]));
            start += HOP_SIZE;
        }
        features
    }

    /// Pass 2: chunk-local normalization, adaptive baselines, composite raw
    /// intensity, and the two transient detectors.
    fn composite_pass(&mut self, features: &[FrameFeatures]) -> (Vec<f32>, Vec<Option<Pulse>>) {
        // Chunk-local maxima make normalization adaptive per chunk rather
        // than fixed; epsilon keeps all-silence chunks at zero.
        let mut max_rms = f32::EPSILON;
        let mut max_bass = f32::EPSILON;
        let mut max_flux = f32::EPSILON;
        for f in features {
            max_rms = max_rms.max(f.rms);
            max_bass = max_bass.max(f.bass_energy);
            max_flux = max_flux.max(f.flux);
        }

        let state = &mut self.state;
        let mut raw = Vec::with_capacity(features.len());
        let mut pulses = Vec::with_capacity(features.len());

        for f in features {
            let norm_rms = f.rms / max_rms;
            let norm_bass = f.bass_energy / max_bass;
            let norm_flux = f.flux / max_flux;

            update_baseline(&mut state.baseline_rms, norm_rms);
            update_baseline(&mut state.baseline_bass, norm_bass);

            let composite = COMPOSITE_SCALE
                * (norm_rms - state.baseline_rms).max(0.0)
                * self.settings.rms_weight
                + COMPOSITE_SCALE
                    * (norm_bass - state.baseline_bass).max(0.0)
                    * self.settings.bass_weight
                + norm_flux * self.settings.onset_weight;
            raw.push(composite);

            state.high_cooldown = state.high_cooldown.saturating_sub(1);
            state.bass_cooldown = state.bass_cooldown.saturating_sub(1);

            let high_fired = detect_transient(
                &mut state.high_flux_history,
                &mut state.high_cooldown,
                f.high_flux,
                HIGH_TRIGGER_RATIO,
                HIGH_FLUX_FLOOR,
                HIGH_PULSE_FRAMES,
            );
            let bass_fired = detect_transient(
                &mut state.bass_flux_history,
                &mut state.bass_cooldown,
                f.bass_flux,
                BASS_TRIGGER_RATIO,
                BASS_FLUX_FLOOR,
                BASS_PULSE_FRAMES,
            );
            if high_fired {
                debug!("high-band transient fired (flux {:.4})", f.high_flux);
            }
            if bass_fired {
                debug!("bass onset fired (flux {:.4})", f.bass_flux);
            }

            // A high-band pulse always pre-empts a concurrent bass pulse.
            let pulse = if state.high_cooldown > 0 {
                Some(Pulse::High)
            } else if state.bass_cooldown > 0 {
                Some(Pulse::Bass)
            } else {
                None
            };
            pulses.push(pulse);
        }

        (raw, pulses)
    }

    /// Pass 3: median noise-floor gating, sensitivity shaping, one-pole
    /// smoothing, then clamping. Pulse frames bypass shaping and seed the
    /// smoother with their plateau; the clamp runs after the smoother so the
    /// frames decaying out of a pulse (or rising out of a gated stretch) still
    /// land inside `[min_intensity, max_intensity]`.
    fn shaping_pass(&mut self, raw: &[f32], pulses: &[Option<Pulse>]) -> Vec<f32> {
        let gate = GATE_RATIO * median(raw);
        let exponent = 1.0 / self.settings.sensitivity.max(0.1);
        let smoothing = self.settings.smoothing.clamp(0.0, 0.99);

        let state = &mut self.state;
        raw.iter()
            .zip(pulses.iter())
            .map(|(&value, pulse)| match pulse {
                Some(Pulse::High) => {
                    state.last_smoothed = HIGH_PULSE_LEVEL;
                    HIGH_PULSE_LEVEL
                }
                Some(Pulse::Bass) => {
                    state.last_smoothed = BASS_PULSE_LEVEL;
                    BASS_PULSE_LEVEL
                }
                None if value <= gate => {
                    state.last_smoothed = 0.0;
                    0.0
                }
                None => {
                    let shaped = value.min(1.0).powf(exponent);
                    let smoothed =
                        state.last_smoothed * smoothing + shaped * (1.0 - smoothing);
                    let clamped =
                        smoothed.clamp(self.settings.min_intensity, self.settings.max_intensity);
                    state.last_smoothed = clamped;
                    clamped
                }
            })
            .collect()
    }
}

fn update_baseline(baseline: &mut f32, value: f32) {
    if value > *baseline {
        *baseline += (value - *baseline) * BASELINE_RISE;
    } else {
        *baseline -= (*baseline - value) * BASELINE_FALL;
    }
}

/// Push `flux` into the rolling history and report whether a transient fired.
/// Firing sets the cooldown to the pulse length; a nonzero cooldown means the
/// pulse is still active and the detector may not retrigger.
fn detect_transient(
    history: &mut VecDeque<f32>,
    cooldown: &mut u32,
    flux: f32,
    ratio: f32,
    floor: f32,
    pulse_frames: u32,
) -> bool {
    let fired = if history.len() >= FLUX_WARMUP_FRAMES && *cooldown == 0 {
        let avg = history.iter().sum::<f32>() / history.len() as f32;
        flux > floor && flux > ratio * avg
    } else {
        false
    };

    history.push_back(flux);
    if history.len() > FLUX_HISTORY_FRAMES {
        history.pop_front();
    }

    if fired {
        *cooldown = pulse_frames;
    }
    fired
}

fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    sorted[sorted.len() / 2]
}
