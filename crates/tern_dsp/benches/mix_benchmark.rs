//! Mixer benchmarks
//!
//! Run with: cargo bench -p tern_dsp

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use tern_dsp::{f32_to_interleaved, mix_add, LinearResampler, SampleFormat};

fn bench_mix_add(c: &mut Criterion) {
    // One 10ms stereo period at 48kHz
    let src = vec![0.5f32; 480 * 2];
    let mut dst = vec![0.0f32; 480 * 2];

    c.bench_function("mix_add_480_frames", |b| {
        b.iter(|| {
            mix_add(black_box(&mut dst), black_box(&src), 0.7);
        });
    });
}

fn bench_encode_s16(c: &mut Criterion) {
    let src = vec![0.5f32; 480 * 2];
    let mut dst = vec![0u8; 480 * 2 * 2];

    c.bench_function("encode_s16_480_frames", |b| {
        b.iter(|| {
            f32_to_interleaved(SampleFormat::S16Le, black_box(&src), black_box(&mut dst));
        });
    });
}

fn bench_resample(c: &mut Criterion) {
    let src = vec![0.5f32; 441 * 2];
    let mut dst = vec![0.0f32; 512 * 2];

    c.bench_function("resample_44k_to_48k_441_frames", |b| {
        let mut r = LinearResampler::new(44100, 48000, 2).unwrap();
        b.iter(|| {
            r.process(black_box(&src), black_box(&mut dst));
        });
    });
}

criterion_group!(benches, bench_mix_add, bench_encode_s16, bench_resample);
criterion_main!(benches);
