//! Bluetooth Device Backends
//!
//! Thin engine-side wrappers around the transports `tern_platform` builds
//! from the Bluetooth manager's acquired fds. The A2DP backend is output
//! only; HFP runs one backend per direction over its SCO transport.

use std::collections::VecDeque;

use tern_dsp::{AudioFormat, Direction};
use tern_platform::bluetooth::{A2dpTransport, ScoTransport};

use crate::error::{EngineError, EngineResult};

/// Frames of socket lead the backend pretends to buffer
const BT_BUFFER_FRAMES: usize = 4096;

#[derive(Debug)]
pub struct A2dpBackend {
    transport: A2dpTransport,
    window: Vec<u8>,
    buffer_frames: usize,
    started: bool,
}

impl A2dpBackend {
    pub fn new(transport: A2dpTransport) -> Self {
        Self {
            transport,
            window: Vec::new(),
            buffer_frames: 0,
            started: false,
        }
    }

    pub fn format(&self) -> AudioFormat {
        *self.transport.format()
    }

    pub fn configure(&mut self, buffer_frames_hint: usize) -> usize {
        let buffer_frames = buffer_frames_hint.clamp(2, BT_BUFFER_FRAMES);
        self.window = vec![0u8; buffer_frames * self.format().frame_bytes()];
        self.buffer_frames = buffer_frames;
        self.started = false;
        buffer_frames
    }

    pub fn close(&mut self) {
        self.window = Vec::new();
        self.transport.flush();
        self.started = false;
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        if self.window.is_empty() {
            return Err(EngineError::DeviceNotOpen);
        }
        Ok(self.transport.frames_queued().min(self.buffer_frames))
    }

    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        if self.window.is_empty() {
            return Err(EngineError::DeviceNotOpen);
        }
        let fb = self.format().frame_bytes();
        let len = frames.min(self.buffer_frames) * fb;
        Ok(&mut self.window[..len])
    }

    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        let fb = self.format().frame_bytes();
        let written = self.transport.write_frames(&self.window[..frames * fb])?;
        Ok(written)
    }

    pub fn flush(&mut self) {
        self.transport.flush();
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[derive(Debug)]
pub struct HfpBackend {
    transport: ScoTransport,
    direction: Direction,
    window: Vec<u8>,
    /// Capture bytes drained from the socket ahead of get_buffer
    pending: VecDeque<u8>,
    buffer_frames: usize,
    started: bool,
}

impl HfpBackend {
    pub fn new(transport: ScoTransport, direction: Direction) -> Self {
        Self {
            transport,
            direction,
            window: Vec::new(),
            pending: VecDeque::new(),
            buffer_frames: 0,
            started: false,
        }
    }

    pub fn format(&self) -> AudioFormat {
        *self.transport.format()
    }

    pub fn configure(&mut self, buffer_frames_hint: usize) -> usize {
        let buffer_frames = buffer_frames_hint.clamp(2, BT_BUFFER_FRAMES);
        let bytes = buffer_frames * self.format().frame_bytes();
        self.window = vec![0u8; bytes];
        self.pending = VecDeque::with_capacity(bytes);
        self.buffer_frames = buffer_frames;
        self.started = false;
        buffer_frames
    }

    pub fn close(&mut self) {
        self.window = Vec::new();
        self.pending.clear();
        self.transport.flush();
        self.started = false;
    }

    fn drain_socket(&mut self) -> EngineResult<()> {
        let fb = self.format().frame_bytes();
        let room = self.buffer_frames * fb - self.pending.len();
        if room < fb {
            return Ok(());
        }
        let len = room.min(self.window.len());
        let got = {
            let window = &mut self.window[..len];
            self.transport.read_frames(window)?
        };
        self.pending.extend(&self.window[..got * fb]);
        Ok(())
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        if self.window.is_empty() {
            return Err(EngineError::DeviceNotOpen);
        }
        let fb = self.format().frame_bytes();
        match self.direction {
            Direction::Output => Ok(self.transport.frames_queued().min(self.buffer_frames)),
            Direction::Input => {
                self.drain_socket()?;
                Ok(self.pending.len() / fb)
            }
        }
    }

    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        if self.window.is_empty() {
            return Err(EngineError::DeviceNotOpen);
        }
        let fb = self.format().frame_bytes();
        let frames = frames.min(self.buffer_frames);
        match self.direction {
            Direction::Output => Ok(&mut self.window[..frames * fb]),
            Direction::Input => {
                let take = (frames * fb).min(self.pending.len() / fb * fb);
                for b in self.window[..take].iter_mut() {
                    *b = self.pending.pop_front().unwrap_or(0);
                }
                Ok(&mut self.window[..take])
            }
        }
    }

    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        match self.direction {
            Direction::Output => {
                let fb = self.format().frame_bytes();
                Ok(self.transport.write_frames(&self.window[..frames * fb])?)
            }
            Direction::Input => Ok(frames),
        }
    }

    pub fn flush(&mut self) {
        self.pending.clear();
        self.transport.flush();
    }

    pub fn start(&mut self) {
        self.started = true;
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::OwnedFd;
    use tern_dsp::SampleFormat;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        // Transport fds are non-blocking in production; mirror that here
        nix::unistd::pipe2(nix::fcntl::OFlag::O_NONBLOCK).unwrap()
    }

    fn sco_format() -> AudioFormat {
        AudioFormat::new(8_000, 1, SampleFormat::S16Le)
    }

    #[test]
    fn test_a2dp_commit_writes_transport() {
        let (r, w) = pipe_pair();
        let fmt = AudioFormat::new(44_100, 2, SampleFormat::S16Le);
        let mut backend = A2dpBackend::new(A2dpTransport::new(w, 512, fmt));
        backend.configure(1024);

        let buf = backend.get_buffer(10).unwrap();
        buf.fill(3);
        assert_eq!(backend.put_buffer(10).unwrap(), 10);

        let mut sink = vec![0u8; 40];
        let got = nix::unistd::read(std::os::fd::AsFd::as_fd(&r), &mut sink).unwrap();
        assert_eq!(got, 40);
        assert!(sink.iter().all(|&b| b == 3));
    }

    #[test]
    fn test_hfp_capture_pulls_socket() {
        let (r, w) = pipe_pair();
        let mut backend = HfpBackend::new(ScoTransport::new(r, 48, sco_format()), Direction::Input);
        backend.configure(256);

        // Remote sends 24 mono S16 frames
        let bytes: Vec<u8> = (0..48u8).collect();
        nix::unistd::write(std::os::fd::AsFd::as_fd(&w), &bytes).unwrap();

        assert_eq!(backend.frames_queued().unwrap(), 24);
        let buf = backend.get_buffer(24).unwrap();
        assert_eq!(buf, &bytes[..]);
        backend.put_buffer(24).unwrap();
        assert_eq!(backend.frames_queued().unwrap(), 0);
    }

    #[test]
    fn test_unconfigured_errors() {
        let (_r, w) = pipe_pair();
        let mut backend = A2dpBackend::new(A2dpTransport::new(
            w,
            512,
            AudioFormat::new(44_100, 2, SampleFormat::S16Le),
        ));
        assert!(backend.frames_queued().is_err());
    }
}
