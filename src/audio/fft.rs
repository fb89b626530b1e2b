use rustfft::{num_complex::Complex, FftPlanner};
use std::ops::Range;
use std::sync::Arc;

use super::FFT_SIZE;

/// Spectral features for one 2048-sample analysis frame.
#[derive(Debug, Clone, Default)]
pub struct FrameFeatures {
    /// Root-mean-square of the raw (unwindowed) frame.
    pub rms: f32,
    /// Summed magnitude in the bass band (~21-258 Hz).
    pub bass_energy: f32,
    /// Spectral flux: summed positive magnitude increase vs. the previous frame.
    pub flux: f32,
    /// Flux restricted to the bass band (20-258 Hz), for bass-onset detection.
    pub bass_flux: f32,
    /// Flux restricted to the high band (~2000-6450 Hz), for snap/clap detection.
    pub high_flux: f32,
}

// Band edges in Hz.
const BASS_LOW_HZ: f32 = 21.0;
const BASS_FLUX_LOW_HZ: f32 = 20.0;
const BASS_HIGH_HZ: f32 = 258.0;
const HIGH_LOW_HZ: f32 = 2000.0;
const HIGH_HIGH_HZ: f32 = 6450.0;

/// Windowed-FFT feature extractor.
///
/// Holds the planned FFT, the precomputed Hann window, and the previous
/// frame's magnitude spectrum (needed for spectral flux). One extractor per
/// analysis session; `reset` clears the flux history at session boundaries.
pub struct FeatureExtractor {
    sample_rate: f32,
    fft: Arc<dyn rustfft::Fft<f32>>,
    window: Vec<f32>,
    prev_magnitudes: Vec<f32>,
    bass_bins: Range<usize>,
    bass_flux_bins: Range<usize>,
    high_bins: Range<usize>,
}

impl FeatureExtractor {
    pub fn new(sample_rate: f32) -> Self {
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(FFT_SIZE);
        let half = FFT_SIZE / 2;

        let bin_width = sample_rate / FFT_SIZE as f32;
        let bin_for = |hz: f32| ((hz / bin_width) as usize).min(half);

        Self {
            sample_rate,
            fft,
            window: Self::hann_window(FFT_SIZE),
            prev_magnitudes: vec![0.0; half],
            // Skip the DC bin even when the band edge rounds down to it; band
            // tops clamp to Nyquist for low sample rates.
            bass_bins: bin_for(BASS_LOW_HZ).max(1)..(bin_for(BASS_HIGH_HZ) + 1).min(half),
            bass_flux_bins: bin_for(BASS_FLUX_LOW_HZ).max(1)..(bin_for(BASS_HIGH_HZ) + 1).min(half),
            high_bins: bin_for(HIGH_LOW_HZ).min(half)..(bin_for(HIGH_HIGH_HZ) + 1).min(half),
        }
    }

    pub fn sample_rate(&self) -> f32 {
        self.sample_rate
    }

    /// Forget the previous frame's spectrum. Called at session boundaries so
    /// the first frame of a new video never computes flux against stale data.
    pub fn reset(&mut self) {
        self.prev_magnitudes.fill(0.0);
    }

    /// Extract features from one frame of exactly `FFT_SIZE` samples.
    pub fn extract(&mut self, frame: &[f32]) -> FrameFeatures {
        debug_assert_eq!(frame.len(), FFT_SIZE);

        let rms = (frame.iter().map(|x| x * x).sum::<f32>() / frame.len() as f32).sqrt();

        let mut buffer: Vec<Complex<f32>> = frame
            .iter()
            .zip(self.window.iter())
            .map(|(&x, &w)| Complex::new(x * w, 0.0))
            .collect();
        self.fft.process(&mut buffer);

        let half = FFT_SIZE / 2;
        let magnitudes: Vec<f32> = buffer[..half]
            .iter()
            .map(|c| c.norm() * 2.0 / FFT_SIZE as f32)
            .collect();

        let bass_energy = magnitudes[self.bass_bins.clone()].iter().sum();

        let positive_flux = |bins: Range<usize>| -> f32 {
            magnitudes[bins.clone()]
                .iter()
                .zip(self.prev_magnitudes[bins].iter())
                .map(|(cur, prev)| (cur - prev).max(0.0))
                .sum()
        };

        let flux = positive_flux(1..half);
        let bass_flux = positive_flux(self.bass_flux_bins.clone());
        let high_flux = positive_flux(self.high_bins.clone());

        self.prev_magnitudes = magnitudes;

        FrameFeatures {
            rms,
            bass_energy,
            flux,
            bass_flux,
            high_flux,
        }
    }

    fn hann_window(size: usize) -> Vec<f32> {
        (0..size)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / (size - 1) as f32;
                0.5 * (1.0 - phase.cos())
            })
            .collect()
    }
}
