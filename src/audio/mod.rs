pub mod analyzer;
pub mod fft;

pub use analyzer::AudioAnalyzer;
pub use fft::{FeatureExtractor, FrameFeatures};

/// FFT window length in samples.
pub const FFT_SIZE: usize = 2048;

/// Hop between successive analysis frames. At 44.1 kHz this yields the fixed
/// intensity output rate of ~86 frames per second.
pub const HOP_SIZE: usize = 512;
