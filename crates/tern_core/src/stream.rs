//! Client Streams
//!
//! An [`RStream`] is the server-side half of one client playback or capture
//! stream: its negotiated parameters, the shared-memory ring, and the wake
//! pipe the engine pokes when the client should service its callback.
//!
//! Stream ids pack the owning client in the high 16 bits and the client's
//! own stream index in the low 16, so the control thread can validate that
//! a client only ever names its own streams.

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use bitflags::bitflags;
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};

use tern_dsp::{AudioFormat, Direction};

use crate::error::{EngineError, EngineResult};
use crate::shm::AudioShm;

/// Unique stream id: `client_id << 16 | stream_index`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(pub u32);

impl StreamId {
    pub fn new(client_id: u16, index: u16) -> Self {
        Self((client_id as u32) << 16 | index as u32)
    }

    pub fn client_id(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn index(self) -> u16 {
        self.0 as u16
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

bitflags! {
    /// Audio effects requested on a stream
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct EffectFlags: u32 {
        const ECHO_CANCELLATION = 1 << 0;
        const NOISE_SUPPRESSION = 1 << 1;
        const AUTO_GAIN_CONTROL = 1 << 2;
    }
}

/// What kind of client owns a stream, for metrics and policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientType {
    Unknown,
    Test,
    App,
    System,
}

/// Parameters fixed at `CONNECT_STREAM` time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamParams {
    pub id: StreamId,
    pub direction: Direction,
    pub client_type: ClientType,
    pub format: AudioFormat,
    /// Ring half-buffer size in frames
    pub buffer_frames: u32,
    /// Frames below which the client is asked for more (playback) or woken
    /// to consume (capture)
    pub cb_threshold: u32,
    pub effects: EffectFlags,
    /// Fixed device index; pinned streams ignore routing changes
    pub pinned_dev: Option<u32>,
}

impl StreamParams {
    /// Validate everything that does not need the shm segment
    pub fn validate(&self) -> EngineResult<()> {
        self.format.validate()?;
        if self.buffer_frames == 0 {
            return Err(EngineError::InvalidStream("buffer_frames is zero".into()));
        }
        if self.cb_threshold == 0 || self.cb_threshold > self.buffer_frames {
            return Err(EngineError::InvalidStream(format!(
                "cb_threshold {} outside 1..={}",
                self.cb_threshold, self.buffer_frames
            )));
        }
        // One period must fit in half the ring or a transfer could split
        // more than once.
        if self.cb_threshold > self.buffer_frames / 2 {
            return Err(EngineError::InvalidStream(format!(
                "cb_threshold {} exceeds half the ring ({})",
                self.cb_threshold,
                self.buffer_frames / 2
            )));
        }
        Ok(())
    }
}

/// Server-side stream state. Owned by the engine thread after `AddStream`.
pub struct RStream {
    params: StreamParams,
    shm: AudioShm,
    /// Write end of the client wake pipe
    wake_tx: OwnedFd,
    /// Linear volume applied on top of node volume, set by the control
    /// plane (1.0 = unity)
    pub volume: f32,
    /// Frames moved through dev_stream adapters
    pub total_fetched: u64,
    /// Cycles where the ring could not satisfy the device
    pub underruns: u64,
}

impl RStream {
    /// Create the stream, its shm segment and its wake pipe.
    ///
    /// Returns the stream plus the two fds to send to the client: the shm
    /// fd and the read end of the wake pipe.
    pub fn new(params: StreamParams) -> EngineResult<(Self, File, OwnedFd)> {
        params.validate()?;
        let frame_bytes = params.format.frame_bytes() as u32;
        let shm = AudioShm::create(frame_bytes, params.buffer_frames)?;

        let (wake_rx, wake_tx) =
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;

        let client_shm = shm.dup_file()?;
        Ok((
            Self {
                params,
                shm,
                wake_tx,
                volume: 1.0,
                total_fetched: 0,
                underruns: 0,
            },
            client_shm,
            wake_rx,
        ))
    }

    pub fn id(&self) -> StreamId {
        self.params.id
    }

    pub fn direction(&self) -> Direction {
        self.params.direction
    }

    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn format(&self) -> &AudioFormat {
        &self.params.format
    }

    pub fn cb_threshold(&self) -> usize {
        self.params.cb_threshold as usize
    }

    pub fn shm(&mut self) -> &mut AudioShm {
        &mut self.shm
    }

    pub fn shm_ref(&self) -> &AudioShm {
        &self.shm
    }

    /// Rebind the client type of a live stream
    pub fn switch_client_type(&mut self, client_type: ClientType) {
        self.params.client_type = client_type;
    }

    /// Wake the client: set callback_pending and poke the wake pipe.
    ///
    /// Never blocks; a full pipe means a wake is already pending.
    pub fn notify(&self) {
        self.shm.set_callback_pending(true);
        let _ = nix::unistd::write(self.wake_tx.as_fd(), &[1u8]);
    }

    pub fn wake_fd(&self) -> BorrowedFd<'_> {
        self.wake_tx.as_fd()
    }
}

impl std::fmt::Debug for RStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RStream")
            .field("id", &self.params.id)
            .field("direction", &self.params.direction)
            .field("buffer_frames", &self.params.buffer_frames)
            .field("cb_threshold", &self.params.cb_threshold)
            .finish_non_exhaustive()
    }
}
