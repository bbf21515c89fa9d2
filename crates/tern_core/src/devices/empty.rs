//! Empty Device Backend
//!
//! When no hardware is enabled in a direction, streams still need a device
//! to live on. The empty backend sinks or sources silence at the cadence
//! its bound format declares, using wall time as the clock: an output
//! "consumes" committed frames at the nominal rate, an input "captures"
//! silence at it.

use std::time::Instant;

use tern_dsp::{AudioFormat, Direction};

use crate::error::{EngineError, EngineResult};

/// Largest buffer the empty device pretends to have
const EMPTY_MAX_BUFFER_FRAMES: usize = 8192;

#[derive(Debug)]
pub struct EmptyBackend {
    direction: Direction,
    format: Option<AudioFormat>,
    buffer_frames: usize,
    window: Vec<u8>,
    started_at: Option<Instant>,
    /// Output: frames committed. Input: frames handed to the engine.
    frames_moved: u64,
}

impl EmptyBackend {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            format: None,
            buffer_frames: 0,
            window: Vec::new(),
            started_at: None,
            frames_moved: 0,
        }
    }

    pub fn configure(&mut self, format: &AudioFormat, buffer_frames_hint: usize) -> usize {
        let buffer_frames = buffer_frames_hint.clamp(2, EMPTY_MAX_BUFFER_FRAMES);
        self.window = vec![0u8; buffer_frames * format.frame_bytes()];
        self.format = Some(*format);
        self.buffer_frames = buffer_frames;
        self.started_at = None;
        self.frames_moved = 0;
        buffer_frames
    }

    pub fn close(&mut self) {
        self.format = None;
        self.window = Vec::new();
        self.started_at = None;
        self.frames_moved = 0;
    }

    fn rate(&self) -> EngineResult<u64> {
        Ok(self
            .format
            .as_ref()
            .ok_or(EngineError::DeviceNotOpen)?
            .frame_rate as u64)
    }

    /// Wall-clock frames since start
    fn clock_frames(&self) -> EngineResult<u64> {
        let rate = self.rate()?;
        Ok(self
            .started_at
            .map(|t| (t.elapsed().as_secs_f64() * rate as f64) as u64)
            .unwrap_or(0))
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        let clock = self.clock_frames()?;
        Ok(match self.direction {
            // Committed frames drain at the nominal rate
            Direction::Output => self
                .frames_moved
                .saturating_sub(clock)
                .min(self.buffer_frames as u64) as usize,
            // Silence accumulates at the nominal rate
            Direction::Input => clock
                .saturating_sub(self.frames_moved)
                .min(self.buffer_frames as u64) as usize,
        })
    }

    pub fn delay_frames(&mut self) -> EngineResult<usize> {
        self.frames_queued()
    }

    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        let frame_bytes = self
            .format
            .as_ref()
            .ok_or(EngineError::DeviceNotOpen)?
            .frame_bytes();
        let len = frames.min(self.buffer_frames) * frame_bytes;
        if self.direction == Direction::Input {
            self.window[..len].fill(0);
        }
        Ok(&mut self.window[..len])
    }

    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        self.frames_moved += frames as u64;
        Ok(frames)
    }

    pub fn flush(&mut self) {
        self.frames_moved = 0;
        if self.started_at.is_some() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn start(&mut self) {
        if self.started_at.is_none() {
            self.started_at = Some(Instant::now());
        }
    }

    pub fn is_started(&self) -> bool {
        self.started_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tern_dsp::SampleFormat;

    fn fmt() -> AudioFormat {
        AudioFormat::new(48_000, 2, SampleFormat::S16Le)
    }

    #[test]
    fn test_output_drains_over_time() {
        let mut dev = EmptyBackend::new(Direction::Output);
        dev.configure(&fmt(), 2048);

        dev.get_buffer(480).unwrap();
        dev.put_buffer(480).unwrap();
        // Not started: nothing drains
        assert_eq!(dev.frames_queued().unwrap(), 480);

        dev.start();
        std::thread::sleep(Duration::from_millis(15));
        // ~720 frames have elapsed at 48kHz; the queue must have drained
        let queued = dev.frames_queued().unwrap();
        assert!(queued < 480, "queued {queued} did not drain");
    }

    #[test]
    fn test_input_produces_silence_clock() {
        let mut dev = EmptyBackend::new(Direction::Input);
        dev.configure(&fmt(), 2048);
        assert_eq!(dev.frames_queued().unwrap(), 0);

        dev.start();
        std::thread::sleep(Duration::from_millis(15));
        let queued = dev.frames_queued().unwrap();
        assert!(queued > 200, "silence clock produced only {queued}");

        let buf = dev.get_buffer(queued).unwrap();
        assert!(buf.iter().all(|&b| b == 0));
        dev.put_buffer(queued).unwrap();
        assert!(dev.frames_queued().unwrap() < queued);
    }

    #[test]
    fn test_queue_capped_at_buffer() {
        let mut dev = EmptyBackend::new(Direction::Input);
        dev.configure(&fmt(), 256);
        dev.start();
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(dev.frames_queued().unwrap(), 256);
    }

    #[test]
    fn test_not_configured_errors() {
        let mut dev = EmptyBackend::new(Direction::Output);
        assert!(dev.frames_queued().is_err());
        assert!(dev.get_buffer(10).is_err());
    }
}
