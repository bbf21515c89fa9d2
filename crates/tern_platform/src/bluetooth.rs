//! Bluetooth Audio Transports
//!
//! The Bluetooth daemon negotiates A2DP/HFP links over the system bus and
//! hands us a connected transport file descriptor plus its MTUs. That side
//! is an external collaborator: the server only needs the [`BtManager`]
//! trait's event stream and the two transport wrappers here.
//!
//! Transport fds are non-blocking. Writes that would block simply report
//! zero progress; the engine treats the unsent frames as still queued and
//! retries next cycle.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::time::Instant;

use nix::errno::Errno;
use tracing::debug;

use tern_dsp::AudioFormat;

use crate::error::{PlatformError, PlatformResult};

/// Fixed A2DP media packet payload size in bytes
pub const A2DP_FIX_PACKET_SIZE: usize = 800;

/// Clamp a negotiated MTU.
///
/// Some stacks report absurd MTUs; anything above 4x the fixed packet size
/// is treated as unreliable and clamped down to one packet.
pub fn clamp_mtu(mtu: usize) -> usize {
    if mtu > 4 * A2DP_FIX_PACKET_SIZE {
        A2DP_FIX_PACKET_SIZE
    } else {
        mtu
    }
}

/// Events the Bluetooth manager delivers to the server
#[derive(Debug)]
pub enum TransportEvent {
    /// A media transport became ready for audio
    Acquired {
        fd: OwnedFd,
        read_mtu: usize,
        write_mtu: usize,
    },
    /// The transport was torn down by the remote or the daemon
    Released,
    /// Absolute speaker volume from the headset (0..=127)
    VolumeChanged(u8),
    DeviceAdded { address: String, name: String },
    DeviceRemoved { address: String },
}

/// What the server requires of the Bluetooth collaborator: a non-blocking
/// source of transport events. Implementations own the bus connection.
pub trait BtManager: Send {
    fn try_next_event(&mut self) -> Option<TransportEvent>;
}

/// Streaming state shared by both transport kinds
#[derive(Debug)]
struct FdStream {
    fd: OwnedFd,
    format: AudioFormat,
    /// Frames handed to the socket since (re)start
    frames_written: u64,
    started_at: Option<Instant>,
}

impl FdStream {
    fn write_chunked(&mut self, bytes: &[u8], chunk: usize) -> PlatformResult<usize> {
        let frame_bytes = self.format.frame_bytes();
        let mut sent = 0usize;
        while sent < bytes.len() {
            let end = (sent + chunk).min(bytes.len());
            match nix::unistd::write(self.fd.as_fd(), &bytes[sent..end]) {
                Ok(0) => break,
                Ok(n) => sent += n,
                Err(Errno::EAGAIN) => break,
                Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => {
                    return Err(PlatformError::TransportClosed)
                }
                Err(e) => return Err(PlatformError::Io(e.into())),
            }
        }
        let frames = sent / frame_bytes;
        self.frames_written += frames as u64;
        if self.started_at.is_none() && frames > 0 {
            self.started_at = Some(Instant::now());
        }
        Ok(frames)
    }

    fn read_some(&mut self, buf: &mut [u8]) -> PlatformResult<usize> {
        match nix::unistd::read(self.fd.as_fd(), buf) {
            Ok(n) => Ok(n / self.format.frame_bytes()),
            Err(Errno::EAGAIN) => Ok(0),
            Err(Errno::EPIPE) | Err(Errno::ECONNRESET) => Err(PlatformError::TransportClosed),
            Err(e) => Err(PlatformError::Io(e.into())),
        }
    }

    /// Frames still in flight, estimated from wall time: written minus what
    /// the remote has consumed at the nominal rate.
    fn frames_queued(&self) -> usize {
        let Some(started) = self.started_at else {
            return 0;
        };
        let consumed = (started.elapsed().as_secs_f64() * self.format.frame_rate as f64) as u64;
        self.frames_written.saturating_sub(consumed) as usize
    }

    fn reset(&mut self) {
        self.frames_written = 0;
        self.started_at = None;
    }
}

/// A2DP media transport (output only)
#[derive(Debug)]
pub struct A2dpTransport {
    stream: FdStream,
    write_mtu: usize,
}

impl A2dpTransport {
    pub fn new(fd: OwnedFd, write_mtu: usize, format: AudioFormat) -> Self {
        let write_mtu = clamp_mtu(write_mtu);
        debug!(write_mtu, rate = format.frame_rate, "A2DP transport up");
        Self {
            stream: FdStream {
                fd,
                format,
                frames_written: 0,
                started_at: None,
            },
            write_mtu,
        }
    }

    pub fn write_mtu(&self) -> usize {
        self.write_mtu
    }

    pub fn format(&self) -> &AudioFormat {
        &self.stream.format
    }

    /// Send device-format frames; returns frames accepted by the socket.
    pub fn write_frames(&mut self, bytes: &[u8]) -> PlatformResult<usize> {
        let mtu = self.write_mtu;
        self.stream.write_chunked(bytes, mtu)
    }

    pub fn frames_queued(&self) -> usize {
        self.stream.frames_queued()
    }

    pub fn flush(&mut self) {
        self.stream.reset();
    }

    pub fn fd(&self) -> BorrowedFd<'_> {
        self.stream.fd.as_fd()
    }
}

/// HFP SCO transport. The manager hands one per direction (duplicated fd),
/// so each iodev owns its transport exclusively.
#[derive(Debug)]
pub struct ScoTransport {
    stream: FdStream,
    packet_size: usize,
}

impl ScoTransport {
    pub fn new(fd: OwnedFd, packet_size: usize, format: AudioFormat) -> Self {
        Self {
            stream: FdStream {
                fd,
                format,
                frames_written: 0,
                started_at: None,
            },
            packet_size,
        }
    }

    pub fn packet_size(&self) -> usize {
        self.packet_size
    }

    pub fn format(&self) -> &AudioFormat {
        &self.stream.format
    }

    pub fn write_frames(&mut self, bytes: &[u8]) -> PlatformResult<usize> {
        let chunk = self.packet_size;
        self.stream.write_chunked(bytes, chunk)
    }

    /// Read captured frames into `buf`; returns frames read (0 if the
    /// socket has nothing).
    pub fn read_frames(&mut self, buf: &mut [u8]) -> PlatformResult<usize> {
        self.stream.read_some(buf)
    }

    pub fn frames_queued(&self) -> usize {
        self.stream.frames_queued()
    }

    pub fn flush(&mut self) {
        self.stream.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tern_dsp::SampleFormat;

    fn pipe_pair() -> (OwnedFd, OwnedFd) {
        let (r, w) = nix::unistd::pipe().unwrap();
        (r, w)
    }

    #[test]
    fn test_mtu_clamp() {
        assert_eq!(clamp_mtu(600), 600);
        assert_eq!(clamp_mtu(4 * A2DP_FIX_PACKET_SIZE), 4 * A2DP_FIX_PACKET_SIZE);
        assert_eq!(clamp_mtu(4 * A2DP_FIX_PACKET_SIZE + 1), A2DP_FIX_PACKET_SIZE);
        assert_eq!(clamp_mtu(65535), A2DP_FIX_PACKET_SIZE);
    }

    #[test]
    fn test_a2dp_write_counts_frames() {
        let (r, w) = pipe_pair();
        let fmt = AudioFormat::new(44_100, 2, SampleFormat::S16Le);
        let mut transport = A2dpTransport::new(w, 512, fmt);

        // 100 stereo S16 frames = 400 bytes
        let bytes = vec![0u8; 400];
        let frames = transport.write_frames(&bytes).unwrap();
        assert_eq!(frames, 100);

        let mut sink = vec![0u8; 400];
        let got = nix::unistd::read(r.as_fd(), &mut sink).unwrap();
        assert_eq!(got, 400);
    }

    #[test]
    fn test_a2dp_queue_tracks_writes() {
        let (_r, w) = pipe_pair();
        let fmt = AudioFormat::new(48_000, 2, SampleFormat::S16Le);
        let mut transport = A2dpTransport::new(w, 512, fmt);

        assert_eq!(transport.frames_queued(), 0);
        transport.write_frames(&vec![0u8; 480 * 4]).unwrap();
        // Immediately after the write nearly everything is still queued
        assert!(transport.frames_queued() > 400);

        transport.flush();
        assert_eq!(transport.frames_queued(), 0);
    }

    #[test]
    fn test_sco_roundtrip() {
        let (r, w) = pipe_pair();
        let fmt = AudioFormat::new(8_000, 1, SampleFormat::S16Le);
        let mut tx = ScoTransport::new(w, 48, fmt);
        let mut rx = ScoTransport::new(r, 48, fmt);

        let bytes: Vec<u8> = (0..96u8).collect();
        let sent = tx.write_frames(&bytes).unwrap();
        assert_eq!(sent, 48);

        let mut buf = vec![0u8; 96];
        let got = rx.read_frames(&mut buf).unwrap();
        assert_eq!(got, 48);
        assert_eq!(buf, bytes);
    }

    #[test]
    fn test_write_closed_pipe_is_fatal() {
        let (r, w) = pipe_pair();
        drop(r);
        let fmt = AudioFormat::new(48_000, 2, SampleFormat::S16Le);
        let mut transport = A2dpTransport::new(w, 512, fmt);

        // The Rust runtime ignores SIGPIPE, so the dead pipe surfaces as EPIPE
        let res = transport.write_frames(&[0u8; 4]);
        assert!(matches!(res, Err(PlatformError::TransportClosed)));
    }
}
