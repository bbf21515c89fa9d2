//! Loopback Device Backend
//!
//! A loopback device is a virtual capture device fed by a tap on an output
//! device's finished mix. The engine holds the producing side
//! ([`LoopbackTap`]) in its sample-hook list; the consuming side lives
//! inside the loopback iodev. Transfer is a lock-free byte ring sized at
//! four loopback periods - the tap never blocks the sender's service cycle
//! and simply drops what does not fit.
//!
//! Until the tapped output actually starts producing, `frames_queued`
//! synthesizes silence frames from wall time so a capture client can start
//! reading immediately instead of stalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};

use tern_dsp::{AudioFormat, SampleFormat};

use crate::error::{EngineError, EngineResult};

/// Where in the output pipeline the tap copies from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoopbackKind {
    PostMixPreDsp,
    PostDsp,
    /// Post-DSP with a pre-filled buffer so the consumer sees an initial
    /// latency matching real hardware
    PostDspDelayed,
}

/// Loopback devices run a fixed format, like the hardware they shadow
pub const LOOPBACK_RATE: u32 = 48_000;
pub const LOOPBACK_CHANNELS: usize = 2;
/// 10ms period
pub const LOOPBACK_PERIOD_FRAMES: usize = 480;
/// Byte buffer covers four periods
pub const LOOPBACK_BUFFER_FRAMES: usize = LOOPBACK_PERIOD_FRAMES * 4;

pub fn loopback_format() -> AudioFormat {
    AudioFormat::new(LOOPBACK_RATE, LOOPBACK_CHANNELS, SampleFormat::S16Le)
}

#[derive(Debug, Default)]
struct TapShared {
    sender_started: AtomicBool,
}

/// Producer half, invoked by the engine after the mix (and, depending on
/// the kind, after DSP) on the tapped output device.
pub struct LoopbackTap {
    kind: LoopbackKind,
    producer: Producer<u8>,
    shared: Arc<TapShared>,
    scratch: Vec<u8>,
}

impl LoopbackTap {
    pub fn kind(&self) -> LoopbackKind {
        self.kind
    }

    /// Copy a finished mix into the tap ring.
    ///
    /// `mix` is interleaved f32 in the sender's channel count; the first
    /// two channels map to the loopback's stereo frame (mono duplicates).
    /// Excess beyond the ring's free space is dropped.
    pub fn push_mix(&mut self, mix: &[f32], sender_channels: usize) {
        if sender_channels == 0 {
            return;
        }
        let frames = mix.len() / sender_channels;
        let fb = loopback_format().frame_bytes();
        let need = frames * fb;
        if self.scratch.len() < need {
            // Sender period grew past our pre-size; resize outside the
            // fast path.
            self.scratch.resize(need, 0);
        }

        for f in 0..frames {
            let left = mix[f * sender_channels];
            let right = if sender_channels > 1 {
                mix[f * sender_channels + 1]
            } else {
                left
            };
            SampleFormat::S16Le.encode(left, &mut self.scratch[f * fb..]);
            SampleFormat::S16Le.encode(right, &mut self.scratch[f * fb + 2..]);
        }

        // Whole frames only; the tap side is best-effort.
        let free = self.producer.slots() / fb * fb;
        let take = need.min(free);
        if take > 0 {
            if let Ok(mut chunk) = self.producer.write_chunk_uninit(take) {
                let (first, second) = chunk.as_mut_slices();
                let first_len = first.len();
                for (i, slot) in first.iter_mut().enumerate() {
                    slot.write(self.scratch[i]);
                }
                for (i, slot) in second.iter_mut().enumerate() {
                    slot.write(self.scratch[first_len + i]);
                }
                // SAFETY: every slot in the chunk was initialized above
                unsafe { chunk.commit_all() };
            }
        }

        self.shared.sender_started.store(true, Ordering::Release);
    }
}

impl std::fmt::Debug for LoopbackTap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTap")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Consumer half: the loopback iodev's backend state
pub struct LoopbackBackend {
    kind: LoopbackKind,
    consumer: Consumer<u8>,
    shared: Arc<TapShared>,
    /// Producer side, handed to the engine's hook list at configure
    tap: Option<LoopbackTap>,
    window: Vec<u8>,
    configured_at: Option<Instant>,
    /// Silence frames already synthesized before the sender started
    synth_read: u64,
}

impl LoopbackBackend {
    pub fn new(kind: LoopbackKind) -> Self {
        let fb = loopback_format().frame_bytes();
        let (producer, consumer) = RingBuffer::<u8>::new(LOOPBACK_BUFFER_FRAMES * fb);
        let shared = Arc::new(TapShared::default());
        Self {
            kind,
            consumer,
            shared: Arc::clone(&shared),
            tap: Some(LoopbackTap {
                kind,
                producer,
                shared,
                scratch: vec![0u8; LOOPBACK_BUFFER_FRAMES * fb],
            }),
            window: Vec::new(),
            configured_at: None,
            synth_read: 0,
        }
    }

    pub fn kind(&self) -> LoopbackKind {
        self.kind
    }

    /// The producer half for the engine's sample-hook list. Present until
    /// first taken.
    pub fn take_tap(&mut self) -> Option<LoopbackTap> {
        self.tap.take()
    }

    pub fn configure(&mut self) -> usize {
        let fb = loopback_format().frame_bytes();
        self.window = vec![0u8; LOOPBACK_BUFFER_FRAMES * fb];
        self.configured_at = Some(Instant::now());
        self.synth_read = 0;

        if self.kind == LoopbackKind::PostDspDelayed {
            if let Some(tap) = self.tap.as_mut() {
                // Pre-fill with one full buffer of silence for the delayed
                // initial latency.
                let silence = vec![0.0f32; LOOPBACK_BUFFER_FRAMES * LOOPBACK_CHANNELS];
                tap.push_mix(&silence, LOOPBACK_CHANNELS);
                tap.shared.sender_started.store(false, Ordering::Release);
            }
        }
        LOOPBACK_BUFFER_FRAMES
    }

    pub fn close(&mut self) {
        self.window = Vec::new();
        self.configured_at = None;
    }

    fn sender_started(&self) -> bool {
        self.shared.sender_started.load(Ordering::Acquire)
    }

    fn ring_frames(&self) -> usize {
        self.consumer.slots() / loopback_format().frame_bytes()
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        let configured_at = self.configured_at.ok_or(EngineError::DeviceNotOpen)?;
        let ring = self.ring_frames();
        if self.sender_started() {
            return Ok(ring);
        }
        // Tap target not producing yet: synthesize silence against wall
        // time so readers never stall.
        let clock = (configured_at.elapsed().as_secs_f64() * LOOPBACK_RATE as f64) as u64;
        let synth = clock
            .saturating_sub(self.synth_read)
            .min(LOOPBACK_BUFFER_FRAMES as u64) as usize;
        Ok(ring + synth)
    }

    pub fn delay_frames(&mut self) -> EngineResult<usize> {
        let queued = self.frames_queued()?;
        Ok(match self.kind {
            LoopbackKind::PostDspDelayed => LOOPBACK_BUFFER_FRAMES + queued,
            _ => queued,
        })
    }

    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        if self.configured_at.is_none() {
            return Err(EngineError::DeviceNotOpen);
        }
        let fb = loopback_format().frame_bytes();
        let frames = frames.min(LOOPBACK_BUFFER_FRAMES);

        let from_ring = frames.min(self.ring_frames());
        let bytes = from_ring * fb;
        if let Ok(chunk) = self.consumer.read_chunk(bytes) {
            let (first, second) = chunk.as_slices();
            self.window[..first.len()].copy_from_slice(first);
            self.window[first.len()..first.len() + second.len()].copy_from_slice(second);
            chunk.commit_all();
        }

        // Shortfall is silence; account for it so the synth clock does not
        // double-pay.
        let pad = frames - from_ring;
        if pad > 0 {
            self.window[bytes..frames * fb].fill(0);
            if !self.sender_started() {
                self.synth_read += pad as u64;
            }
        }
        Ok(&mut self.window[..frames * fb])
    }

    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        // Consumption already happened in get_buffer
        Ok(frames)
    }

    pub fn flush(&mut self) {
        let fb = loopback_format().frame_bytes();
        let bytes = self.consumer.slots() / fb * fb;
        if let Ok(chunk) = self.consumer.read_chunk(bytes) {
            chunk.commit_all();
        }
    }
}

impl std::fmt::Debug for LoopbackBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackBackend")
            .field("kind", &self.kind)
            .field("ring_frames", &self.ring_frames())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tap_roundtrip_exact_frames() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostMixPreDsp);
        backend.configure();
        let mut tap = backend.take_tap().unwrap();

        // 100 stereo frames of a recognizable value
        let mix = vec![0.5f32; 100 * 2];
        tap.push_mix(&mix, 2);

        assert_eq!(backend.frames_queued().unwrap(), 100);
        let buf = backend.get_buffer(100).unwrap();
        let sample = i16::from_le_bytes([buf[0], buf[1]]);
        assert_eq!(sample, (0.5f32 * 32768.0).round() as i16);
        backend.put_buffer(100).unwrap();
        // Exactly N frames in, N frames out
        assert_eq!(backend.ring_frames(), 0);
    }

    #[test]
    fn test_tap_drops_excess() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostMixPreDsp);
        backend.configure();
        let mut tap = backend.take_tap().unwrap();

        let mix = vec![0.1f32; (LOOPBACK_BUFFER_FRAMES + 500) * 2];
        tap.push_mix(&mix, 2);
        // Ring holds at most the buffer; the rest was dropped
        assert_eq!(backend.ring_frames(), LOOPBACK_BUFFER_FRAMES);
    }

    #[test]
    fn test_mono_sender_duplicates() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostDsp);
        backend.configure();
        let mut tap = backend.take_tap().unwrap();

        tap.push_mix(&[0.25f32], 1);
        let buf = backend.get_buffer(1).unwrap();
        let left = i16::from_le_bytes([buf[0], buf[1]]);
        let right = i16::from_le_bytes([buf[2], buf[3]]);
        assert_eq!(left, right);
    }

    #[test]
    fn test_silence_synthesis_before_sender_starts() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostMixPreDsp);
        backend.configure();
        let _tap = backend.take_tap().unwrap();

        std::thread::sleep(std::time::Duration::from_millis(10));
        // ~480 frames of wall time at 48kHz, synthesized as silence
        let queued = backend.frames_queued().unwrap();
        assert!(queued > 100, "expected synthesized silence, got {queued}");

        let buf = backend.get_buffer(queued).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_delayed_variant_reports_buffer_delay() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostDspDelayed);
        backend.configure();
        // Immediately after configure: delay covers at least the buffer
        assert!(backend.delay_frames().unwrap() >= LOOPBACK_BUFFER_FRAMES);
        // And the ring was pre-filled with silence
        assert_eq!(backend.ring_frames(), LOOPBACK_BUFFER_FRAMES);
    }

    #[test]
    fn test_not_configured_errors() {
        let mut backend = LoopbackBackend::new(LoopbackKind::PostDsp);
        assert!(backend.frames_queued().is_err());
    }
}
