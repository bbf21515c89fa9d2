//! Mix Buffer Operations
//!
//! The engine mixes every attached stream into an f32 scratch buffer sized
//! at device open, then converts once into the device's native format when
//! committing. Saturation therefore happens exactly once, at the device
//! format's full-scale value.
//!
//! All functions here are allocation-free and safe to call from the service
//! cycle.

use crate::sample::SampleFormat;

/// Accumulate `src` into `dst`, scaled.
///
/// `dst` and `src` must be the same length. Scale of 1.0 with a single
/// stream is a plain copy-add; saturation is deferred to the final format
/// conversion.
#[inline]
pub fn mix_add(dst: &mut [f32], src: &[f32], scale: f32) {
    debug_assert_eq!(dst.len(), src.len());
    if scale == 1.0 {
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d += *s;
        }
    } else {
        for (d, s) in dst.iter_mut().zip(src.iter()) {
            *d += *s * scale;
        }
    }
}

/// Scale a buffer in place (software volume stage)
#[inline]
pub fn scale(buf: &mut [f32], factor: f32) {
    if factor == 1.0 {
        return;
    }
    for s in buf.iter_mut() {
        *s *= factor;
    }
}

/// Zero a mix buffer
#[inline]
pub fn silence(buf: &mut [f32]) {
    buf.fill(0.0);
}

/// Exchange the first two channels of every frame.
///
/// Applied when the active node has its left/right swap flag set. Channels
/// beyond the first pair are untouched.
#[inline]
pub fn swap_left_right(buf: &mut [f32], channels: usize) {
    if channels < 2 {
        return;
    }
    for frame in buf.chunks_exact_mut(channels) {
        frame.swap(0, 1);
    }
}

/// Decode interleaved `fmt` bytes into f32 samples.
///
/// Returns the number of samples decoded (bounded by whichever side is
/// smaller, in whole samples).
pub fn interleaved_to_f32(fmt: SampleFormat, src: &[u8], dst: &mut [f32]) -> usize {
    let sb = fmt.sample_bytes();
    let count = (src.len() / sb).min(dst.len());
    for (i, out) in dst.iter_mut().enumerate().take(count) {
        *out = fmt.decode(&src[i * sb..]);
    }
    count
}

/// Encode f32 samples into interleaved `fmt` bytes, saturating.
///
/// Returns the number of samples encoded.
pub fn f32_to_interleaved(fmt: SampleFormat, src: &[f32], dst: &mut [u8]) -> usize {
    let sb = fmt.sample_bytes();
    let count = src.len().min(dst.len() / sb);
    for (i, &s) in src.iter().enumerate().take(count) {
        fmt.encode(s, &mut dst[i * sb..(i + 1) * sb]);
    }
    count
}
