//! Sim Device Backend
//!
//! A scriptable backend for engine tests: the test holds a [`SimHandle`]
//! and steers `frames_queued`, feeds capture bytes, injects errors, and
//! inspects everything the engine committed. No clocks, no hardware.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tern_dsp::{AudioFormat, Direction};

use crate::error::{EngineError, EngineResult};
use tern_platform::PlatformError;

/// Shared sim state; tests mutate it through a [`SimHandle`]
#[derive(Debug, Default)]
pub struct SimState {
    /// Value the next `frames_queued` returns (output devices)
    pub queued: usize,
    /// Bytes the engine committed via put_buffer, in device format
    pub committed: Vec<u8>,
    /// Bytes the engine will capture via get_buffer
    pub capture_src: VecDeque<u8>,
    /// One-shot errno injected into the next `frames_queued`
    pub fail_queued_errno: Option<i32>,
    pub started: bool,
    pub flush_count: u32,
    pub configure_count: u32,
    pub put_count: u32,
}

pub type SimHandle = Arc<Mutex<SimState>>;

#[derive(Debug)]
pub struct SimBackend {
    direction: Direction,
    state: SimHandle,
    format: Option<AudioFormat>,
    buffer_frames: usize,
    window: Vec<u8>,
}

impl SimBackend {
    pub fn new(direction: Direction) -> (Self, SimHandle) {
        let state: SimHandle = Arc::default();
        (
            Self {
                direction,
                state: Arc::clone(&state),
                format: None,
                buffer_frames: 0,
                window: Vec::new(),
            },
            state,
        )
    }

    pub fn configure(&mut self, format: &AudioFormat, buffer_frames_hint: usize) -> usize {
        self.window = vec![0u8; buffer_frames_hint * format.frame_bytes()];
        self.format = Some(*format);
        self.buffer_frames = buffer_frames_hint;
        let mut s = self.state.lock().unwrap();
        s.configure_count += 1;
        buffer_frames_hint
    }

    pub fn close(&mut self) {
        self.format = None;
        let mut s = self.state.lock().unwrap();
        s.started = false;
    }

    fn frame_bytes(&self) -> EngineResult<usize> {
        Ok(self
            .format
            .as_ref()
            .ok_or(EngineError::DeviceNotOpen)?
            .frame_bytes())
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        let fb = self.frame_bytes()?;
        let mut s = self.state.lock().unwrap();
        if let Some(errno) = s.fail_queued_errno.take() {
            return Err(EngineError::Backend(PlatformError::Io(
                std::io::Error::from_raw_os_error(errno),
            )));
        }
        Ok(match self.direction {
            Direction::Output => s.queued,
            Direction::Input => s.capture_src.len() / fb,
        })
    }

    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        let fb = self.frame_bytes()?;
        let frames = frames.min(self.buffer_frames);
        match self.direction {
            Direction::Output => Ok(&mut self.window[..frames * fb]),
            Direction::Input => {
                let mut s = self.state.lock().unwrap();
                let avail = s.capture_src.len() / fb;
                let take = frames.min(avail);
                for b in self.window[..take * fb].iter_mut() {
                    *b = s.capture_src.pop_front().unwrap_or(0);
                }
                Ok(&mut self.window[..take * fb])
            }
        }
    }

    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        let fb = self.frame_bytes()?;
        let mut s = self.state.lock().unwrap();
        s.put_count += 1;
        if self.direction == Direction::Output {
            s.committed.extend_from_slice(&self.window[..frames * fb]);
            s.queued += frames;
        }
        Ok(frames)
    }

    pub fn flush(&mut self) {
        let mut s = self.state.lock().unwrap();
        s.flush_count += 1;
        s.queued = 0;
    }

    pub fn start(&mut self) {
        self.state.lock().unwrap().started = true;
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().unwrap().started
    }
}
