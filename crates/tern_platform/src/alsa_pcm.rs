//! ALSA PCM Backend
//!
//! Wraps one ALSA PCM handle with the accounting the engine's service cycle
//! needs: free/queued frame counts from `avail_update`, a window buffer
//! filled by the mixer and committed with `writei`, and xrun/suspend
//! recovery through `try_recover`.
//!
//! The synchronous `writei`/`readi` API is used rather than the mmap API;
//! the window buffer is sized once at configure time so the service cycle
//! itself never allocates.

use alsa::pcm::{Access, Format, HwParams, State, PCM};
use alsa::{Direction as AlsaDirection, ValueOr};
use tracing::{debug, warn};

use tern_dsp::{AudioFormat, ChannelLayout, Direction, SampleFormat, SupportedFormats};

use crate::error::{PlatformError, PlatformResult};

/// Sample rates probed when reporting a device's supported set
const PROBE_RATES: [u32; 7] = [8000, 16000, 44100, 48000, 88200, 96000, 192000];

/// Geometry chosen by [`AlsaPcm::configure`]
#[derive(Debug, Clone, Copy)]
pub struct PcmGeometry {
    pub buffer_frames: usize,
    pub period_frames: usize,
}

/// One open ALSA PCM in a fixed direction.
///
/// Lifecycle: `open` (handle exists, nothing bound) -> `configure` (format
/// bound, buffers sized) -> `start`/`commit`/`read` -> `close` by drop.
pub struct AlsaPcm {
    pcm: PCM,
    name: String,
    direction: Direction,
    format: Option<AudioFormat>,
    buffer_frames: usize,
    period_frames: usize,
    can_resume: bool,
    /// Device-format byte window handed to the mixer
    window: Vec<u8>,
    /// Staging for writei/readi in the element type ALSA expects
    xfer_i16: Vec<i16>,
    xfer_i32: Vec<i32>,
}

impl AlsaPcm {
    /// Open a PCM by ALSA device name (e.g. "hw:0,0"), non-blocking.
    pub fn open(name: &str, direction: Direction) -> PlatformResult<Self> {
        let alsa_dir = match direction {
            Direction::Output => AlsaDirection::Playback,
            Direction::Input => AlsaDirection::Capture,
        };
        let pcm = PCM::new(name, alsa_dir, true)?;
        debug!(device = name, ?direction, "opened ALSA PCM");
        Ok(Self {
            pcm,
            name: name.to_string(),
            direction,
            format: None,
            buffer_frames: 0,
            period_frames: 0,
            can_resume: false,
            window: Vec::new(),
            xfer_i16: Vec::new(),
            xfer_i32: Vec::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    pub fn period_frames(&self) -> usize {
        self.period_frames
    }

    /// Probe the supported rate/channel/format vectors.
    ///
    /// Rates are tested against the hw param min/max range; formats by
    /// attempting to set them on a scratch param set.
    pub fn probe_supported(&self) -> PlatformResult<SupportedFormats> {
        let hwp = HwParams::any(&self.pcm)?;

        let rate_min = hwp.get_rate_min()?;
        let rate_max = hwp.get_rate_max()?;
        let rates = PROBE_RATES
            .iter()
            .copied()
            .filter(|&r| r >= rate_min && r <= rate_max)
            .collect();

        let ch_min = hwp.get_channels_min()? as usize;
        let ch_max = (hwp.get_channels_max()? as usize).min(8);
        let channel_counts = (ch_min..=ch_max).collect();

        let mut sample_formats = Vec::new();
        for (fmt, alsa_fmt) in [
            (SampleFormat::S16Le, Format::S16LE),
            (SampleFormat::S32Le, Format::S32LE),
            (SampleFormat::U8, Format::U8),
        ] {
            let probe = HwParams::any(&self.pcm)?;
            if probe.set_format(alsa_fmt).is_ok() {
                sample_formats.push(fmt);
            }
        }

        let layouts = (ch_min..=ch_max).map(ChannelLayout::default_for).collect();

        Ok(SupportedFormats {
            rates,
            channel_counts,
            sample_formats,
            layouts,
            variable_positions: false,
        })
    }

    /// Bind a format and buffer geometry.
    ///
    /// `buffer_frames_hint` is rounded down to even and passed to ALSA as a
    /// near value; the actual geometry comes back in [`PcmGeometry`].
    pub fn configure(
        &mut self,
        format: &AudioFormat,
        buffer_frames_hint: usize,
    ) -> PlatformResult<PcmGeometry> {
        let alsa_fmt = match format.sample_format {
            SampleFormat::S16Le => Format::S16LE,
            SampleFormat::S32Le => Format::S32LE,
            SampleFormat::U8 => Format::U8,
            SampleFormat::S24Le => {
                // The 4-byte S24 container has no checked transfer type in
                // the alsa crate; negotiation excludes it for this backend.
                return Err(PlatformError::UnsupportedFormat("S24_LE".into()));
            }
        };

        let hint = (buffer_frames_hint & !1).max(2) as alsa::pcm::Frames;
        {
            let hwp = HwParams::any(&self.pcm)?;
            hwp.set_channels(format.num_channels as u32)?;
            hwp.set_rate(format.frame_rate, ValueOr::Nearest)?;
            hwp.set_format(alsa_fmt)?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_buffer_size_near(hint)?;
            hwp.set_period_size_near(hint / 4, ValueOr::Nearest)?;
            self.pcm.hw_params(&hwp)?;
            self.can_resume = hwp.can_resume();
        }

        let (buffer_frames, period_frames) = self.pcm.get_params()?;
        let buffer_frames = buffer_frames as usize;
        let period_frames = period_frames as usize;

        // The engine starts the device explicitly; an automatic start on
        // first commit would race the fill level.
        {
            let swp = self.pcm.sw_params_current()?;
            swp.set_start_threshold(alsa::pcm::Frames::MAX)?;
            swp.set_avail_min(period_frames as alsa::pcm::Frames)?;
            self.pcm.sw_params(&swp)?;
        }

        self.pcm.prepare()?;

        let frame_bytes = format.frame_bytes();
        self.window = vec![0u8; buffer_frames * frame_bytes];
        match format.sample_format {
            SampleFormat::S16Le => {
                self.xfer_i16 = vec![0i16; buffer_frames * format.num_channels];
            }
            SampleFormat::S32Le => {
                self.xfer_i32 = vec![0i32; buffer_frames * format.num_channels];
            }
            _ => {}
        }

        self.format = Some(*format);
        self.buffer_frames = buffer_frames;
        self.period_frames = period_frames;

        debug!(
            device = %self.name,
            rate = format.frame_rate,
            channels = format.num_channels,
            buffer_frames,
            period_frames,
            "configured ALSA PCM"
        );

        Ok(PcmGeometry {
            buffer_frames,
            period_frames,
        })
    }

    fn format(&self) -> PlatformResult<&AudioFormat> {
        self.format.as_ref().ok_or(PlatformError::NotConfigured)
    }

    /// Frames currently queued in the hardware buffer.
    ///
    /// For playback this is `buffer_size - avail`; for capture it is the
    /// count of captured frames ready to read.
    pub fn frames_queued(&mut self) -> PlatformResult<usize> {
        let avail = self.pcm.avail_update()? as usize;
        Ok(match self.direction {
            Direction::Output => self.buffer_frames.saturating_sub(avail),
            Direction::Input => avail.min(self.buffer_frames),
        })
    }

    /// Frames of delay between a committed sample and the speaker (or the
    /// microphone and a readable sample).
    pub fn delay_frames(&mut self) -> PlatformResult<usize> {
        let delay = self.pcm.delay()?;
        Ok(delay.max(0) as usize)
    }

    /// Borrow a window of `frames` frames for the mixer to fill (playback)
    /// or for a caller to copy out of after [`read`](Self::read) (capture).
    pub fn window(&mut self, frames: usize) -> PlatformResult<&mut [u8]> {
        let frame_bytes = self.format()?.frame_bytes();
        let len = frames.min(self.buffer_frames) * frame_bytes;
        Ok(&mut self.window[..len])
    }

    /// Commit `frames` frames of the window to the hardware (playback).
    ///
    /// Recoverable errors (xrun/suspend) are healed in place and reported
    /// so the engine can mark the device for re-prime.
    pub fn commit(&mut self, frames: usize) -> PlatformResult<usize> {
        let format = *self.format()?;
        let channels = format.num_channels;
        let samples = frames * channels;

        let res = match format.sample_format {
            SampleFormat::S16Le => {
                for (i, chunk) in self.window[..samples * 2].chunks_exact(2).enumerate() {
                    self.xfer_i16[i] = i16::from_le_bytes([chunk[0], chunk[1]]);
                }
                let io = self.pcm.io_i16()?;
                io.writei(&self.xfer_i16[..samples])
            }
            SampleFormat::S32Le => {
                for (i, chunk) in self.window[..samples * 4].chunks_exact(4).enumerate() {
                    self.xfer_i32[i] = i32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                }
                let io = self.pcm.io_i32()?;
                io.writei(&self.xfer_i32[..samples])
            }
            SampleFormat::U8 => {
                let io = self.pcm.io_u8()?;
                io.writei(&self.window[..samples])
            }
            SampleFormat::S24Le => return Err(PlatformError::UnsupportedFormat("S24_LE".into())),
        };

        match res {
            Ok(written) => Ok(written),
            Err(e) => {
                let wrapped = PlatformError::from(e);
                if wrapped.is_recoverable() {
                    warn!(device = %self.name, "xrun on commit, recovering");
                    self.recover(e)?;
                    Ok(0)
                } else {
                    Err(wrapped)
                }
            }
        }
    }

    /// Read up to `frames` captured frames into the window (capture).
    /// Returns the frame count actually read.
    pub fn read(&mut self, frames: usize) -> PlatformResult<usize> {
        let format = *self.format()?;
        let channels = format.num_channels;
        let frames = frames.min(self.buffer_frames);
        let samples = frames * channels;

        let res = match format.sample_format {
            SampleFormat::S16Le => {
                let got = {
                    let io = self.pcm.io_i16()?;
                    io.readi(&mut self.xfer_i16[..samples])
                };
                if let Ok(n) = got {
                    for i in 0..n * channels {
                        let s = self.xfer_i16[i];
                        self.window[i * 2..i * 2 + 2].copy_from_slice(&s.to_le_bytes());
                    }
                }
                got
            }
            SampleFormat::S32Le => {
                let got = {
                    let io = self.pcm.io_i32()?;
                    io.readi(&mut self.xfer_i32[..samples])
                };
                if let Ok(n) = got {
                    for i in 0..n * channels {
                        let s = self.xfer_i32[i];
                        self.window[i * 4..i * 4 + 4].copy_from_slice(&s.to_le_bytes());
                    }
                }
                got
            }
            SampleFormat::U8 => {
                let io = self.pcm.io_u8()?;
                io.readi(&mut self.window[..samples])
            }
            SampleFormat::S24Le => return Err(PlatformError::UnsupportedFormat("S24_LE".into())),
        };

        match res {
            Ok(got) => Ok(got),
            Err(e) => {
                let wrapped = PlatformError::from(e);
                if wrapped.is_recoverable() {
                    warn!(device = %self.name, "overrun on read, recovering");
                    self.recover(e)?;
                    Ok(0)
                } else {
                    Err(wrapped)
                }
            }
        }
    }

    /// Start the hardware clock
    pub fn start(&mut self) -> PlatformResult<()> {
        if self.pcm.state() != State::Running {
            self.pcm.start()?;
        }
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.pcm.state() == State::Running
    }

    /// Drop queued frames and return to the prepared state
    pub fn flush(&mut self) -> PlatformResult<()> {
        self.pcm.drop()?;
        self.pcm.prepare()?;
        Ok(())
    }

    /// Recover from an xrun or suspend, re-preparing when resume is not
    /// available.
    pub fn recover(&mut self, err: alsa::Error) -> PlatformResult<()> {
        if err.errno() == libc::ESTRPIPE && self.can_resume {
            if self.pcm.resume().is_ok() {
                return Ok(());
            }
        }
        self.pcm.try_recover(err, true)?;
        Ok(())
    }

    /// Suspend hardware, keeping the bound format
    pub fn suspend(&mut self) -> PlatformResult<()> {
        self.pcm.drop()?;
        Ok(())
    }

    /// Resume after [`suspend`](Self::suspend), falling back to re-prepare
    pub fn resume(&mut self) -> PlatformResult<()> {
        if self.pcm.state() == State::Suspended && self.can_resume {
            if self.pcm.resume().is_ok() {
                return Ok(());
            }
        }
        self.pcm.prepare()?;
        Ok(())
    }
}

impl std::fmt::Debug for AlsaPcm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlsaPcm")
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("buffer_frames", &self.buffer_frames)
            .finish_non_exhaustive()
    }
}
