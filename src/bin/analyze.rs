use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use hapsync::audio::{FFT_SIZE, HOP_SIZE};
use hapsync::{AudioAnalyzer, IntensitySegment, SyncSettings};

#[derive(Parser)]
#[command(name = "hapsync-analyze")]
#[command(about = "Analyze a WAV file into a haptic intensity track")]
struct Args {
    /// WAV file to analyze
    #[arg()]
    input_file: String,

    /// Output file for the intensity track (JSON)
    #[arg(short, long, default_value = "intensity_track.json")]
    output: String,

    /// Optional sync settings file (JSON); defaults otherwise
    #[arg(long)]
    settings: Option<String>,

    /// Chunk length in seconds, matching the live pipeline's chunking
    #[arg(long, default_value = "30.0")]
    chunk_secs: f64,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    info!("HapSync offline analyzer");
    info!("Input file: {}", args.input_file);
    info!("Output file: {}", args.output);

    let mut settings = match &args.settings {
        Some(path) => SyncSettings::load(path)?,
        None => SyncSettings::default(),
    };

    let (samples, sample_rate) = load_wav_mono(&args.input_file)?;
    settings.sample_rate = sample_rate;
    settings.chunk_duration_secs = args.chunk_secs;

    let duration = samples.len() as f64 / sample_rate as f64;
    info!(
        "Loaded {} samples ({:.2}s at {} Hz)",
        samples.len(),
        duration,
        sample_rate
    );

    let mut analyzer = AudioAnalyzer::new(settings.clone());
    let frame_interval = analyzer.frame_interval();
    // Chunk length in whole analysis hops, with one window of overlap fed to
    // each chunk so consecutive segments tile with no seam.
    let hops = ((args.chunk_secs / frame_interval).round() as usize).max(1);
    let chunk_samples = hops * HOP_SIZE;
    let overlap = FFT_SIZE - HOP_SIZE;

    let mut segments: Vec<IntensitySegment> = Vec::new();
    let mut index = 0usize;
    let mut start = 0usize;
    while start < samples.len() {
        let end = (start + chunk_samples).min(samples.len());
        let fetch_end = (end + overlap).min(samples.len());
        let start_time = start as f64 / sample_rate as f64;
        match analyzer.analyze(&samples[start..fetch_end]) {
            Ok(mut values) => {
                values.truncate((end - start) / HOP_SIZE);
                segments.push(IntensitySegment::new(start_time, frame_interval, values));
                info!(
                    "Analyzed chunk {} ({:.1}s of {:.1}s)",
                    index,
                    end as f64 / sample_rate as f64,
                    duration
                );
            }
            Err(e) => {
                // Typically the undersized tail of the file; skip it like the
                // live pipeline skips a failed chunk.
                info!("Skipping chunk {}: {:#}", index, e);
            }
        }
        index += 1;
        start = end;
    }

    print_summary(&segments);

    let json = serde_json::to_string_pretty(&segments)?;
    std::fs::write(&args.output, &json)
        .with_context(|| format!("writing intensity track to {}", args.output))?;
    info!(
        "Intensity track saved ({:.1} KB)",
        json.len() as f64 / 1024.0
    );

    Ok(())
}

fn load_wav_mono(path: &str) -> Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening WAV file {}", path))?;
    let spec = reader.spec();
    let channels = spec.channels as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
    };

    let mono = interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();

    Ok((mono, spec.sample_rate))
}

fn print_summary(segments: &[IntensitySegment]) {
    let total_frames: usize = segments.iter().map(|s| s.values.len()).sum();
    if total_frames == 0 {
        info!("No frames produced");
        return;
    }

    let mut peak = 0.0f32;
    let mut sum = 0.0f64;
    let mut active_frames = 0usize;
    let mut pulse_frames = 0usize;
    for value in segments.iter().flat_map(|s| s.values.iter()) {
        peak = peak.max(*value);
        sum += *value as f64;
        if *value > 0.0 {
            active_frames += 1;
        }
        if *value >= 0.95 {
            pulse_frames += 1;
        }
    }

    info!("=== ANALYSIS RESULTS ===");
    info!("Segments: {}", segments.len());
    info!("Frames: {}", total_frames);
    info!("Peak intensity: {:.3}", peak);
    info!("Mean intensity: {:.3}", sum / total_frames as f64);
    info!(
        "Active frames: {} ({:.1}%)",
        active_frames,
        100.0 * active_frames as f64 / total_frames as f64
    );
    info!("Transient pulse frames: {}", pulse_frames);
}
