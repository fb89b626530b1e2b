use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use hapsync::{AudioAnalyzer, FeatureExtractor, SyncSettings};

const SAMPLE_RATE: u32 = 44100;

/// Synthetic music-like signal: a bass line, a mid tone, and a percussive
/// burst every half second, so the transient detectors have real work to do.
fn synth_audio(secs: f64) -> Vec<f32> {
    let n = (secs * SAMPLE_RATE as f64) as usize;
    (0..n)
        .map(|i| {
            let t = i as f64 / SAMPLE_RATE as f64;
            let bass = 0.4 * (2.0 * std::f64::consts::PI * 80.0 * t).sin();
            let mid = 0.2 * (2.0 * std::f64::consts::PI * 440.0 * t).sin();
            let burst = if t.fract() < 0.02 || (t.fract() - 0.5).abs() < 0.02 {
                0.5 * (2.0 * std::f64::consts::PI * 3000.0 * t).sin()
            } else {
                0.0
            };
            (bass + mid + burst) as f32
        })
        .collect()
}

fn bench_analyze(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze");
    for secs in [1.0, 5.0, 30.0] {
        let samples = synth_audio(secs);
        group.throughput(Throughput::Elements(samples.len() as u64));
        group.bench_function(format!("{}s_chunk", secs), |b| {
            let mut analyzer = AudioAnalyzer::new(SyncSettings::default());
            b.iter(|| {
                let values = analyzer.analyze(black_box(&samples)).unwrap();
                black_box(values);
            });
        });
    }
    group.finish();
}

fn bench_extract_frame(c: &mut Criterion) {
    let samples = synth_audio(1.0);
    let frame = &samples[..2048];
    c.bench_function("extract_frame", |b| {
        let mut extractor = FeatureExtractor::new(SAMPLE_RATE as f32);
        b.iter(|| black_box(extractor.extract(black_box(frame))));
    });
}

criterion_group!(benches, bench_analyze, bench_extract_frame);
criterion_main!(benches);
