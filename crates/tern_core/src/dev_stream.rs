//! Device-Stream Adapters
//!
//! A [`DevStream`] binds one stream to one device and owns every piece of
//! conversion state between them: the resampler phase, the channel remap
//! matrix, and the scratch buffers. Created when a stream attaches, torn
//! down when either side goes away.
//!
//! Pipeline (playback): shm bytes -> f32 -> channel remap to the device
//! layout -> resample to the device rate -> accumulate into the device mix.
//! Capture is the mirror, ending in an shm write. Scratch buffers are sized
//! at attach for the device's full buffer, so per-cycle calls never
//! allocate.

use std::cell::RefCell;
use std::rc::Rc;

use tern_dsp::{
    interleaved_to_f32, f32_to_interleaved, mix_add, AudioFormat, ChannelLayout, ChannelMatrix,
    LinearResampler,
};

use crate::error::EngineResult;
use crate::stream::RStream;

/// Channel interleaving descriptor for the adapter's current window
#[derive(Debug, Clone, Copy)]
pub struct AudioArea {
    pub frames: usize,
    pub channels: usize,
    pub layout: ChannelLayout,
}

/// Result of one playback fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullResult {
    /// Device-rate frames contributed to the mix
    pub frames: usize,
    /// The ring could not cover the request; the gap was zero-filled
    pub underrun: bool,
}

pub struct DevStream {
    stream: Rc<RefCell<RStream>>,
    dev_index: u32,
    dev_format: AudioFormat,
    resampler: Option<LinearResampler>,
    matrix: Option<ChannelMatrix>,
    /// Stream-format bytes moving to/from the shm ring
    xfer_bytes: Vec<u8>,
    /// Decoded samples in the source interleaving
    decode_f32: Vec<f32>,
    /// After channel remap
    remap_f32: Vec<f32>,
    /// After rate conversion
    rate_f32: Vec<f32>,
    /// Frame count of the most recent fetch
    pub last_fetched: usize,
    area: AudioArea,
}

impl DevStream {
    pub fn new(
        stream: Rc<RefCell<RStream>>,
        dev_index: u32,
        dev_format: &AudioFormat,
        dev_buffer_frames: usize,
    ) -> EngineResult<Self> {
        let (s_format, is_output) = {
            let s = stream.borrow();
            (*s.format(), s.direction().is_output())
        };

        let resampler = if s_format.frame_rate != dev_format.frame_rate {
            // Playback converts stream->device; capture the reverse. Both
            // run on device-channel interleaving.
            let (from, to) = if is_output {
                (s_format.frame_rate, dev_format.frame_rate)
            } else {
                (dev_format.frame_rate, s_format.frame_rate)
            };
            Some(LinearResampler::new(from, to, dev_format.num_channels)?)
        } else {
            None
        };

        let same_layout = s_format.num_channels == dev_format.num_channels
            && s_format.channel_layout.matches_exactly(&dev_format.channel_layout);
        let matrix = if same_layout {
            None
        } else if is_output {
            Some(ChannelMatrix::new(
                &s_format.channel_layout,
                &dev_format.channel_layout,
            )?)
        } else {
            Some(ChannelMatrix::new(
                &dev_format.channel_layout,
                &s_format.channel_layout,
            )?)
        };

        // Worst-case frames on either side of the rate converter, plus the
        // interpolation edge.
        let rate_ratio =
            s_format.frame_rate.max(dev_format.frame_rate) as usize / s_format.frame_rate.min(dev_format.frame_rate) as usize
                + 1;
        let max_frames = dev_buffer_frames * rate_ratio + 2;
        let max_ch = s_format.num_channels.max(dev_format.num_channels);

        Ok(Self {
            stream,
            dev_index,
            dev_format: *dev_format,
            resampler,
            matrix,
            xfer_bytes: vec![0u8; max_frames * s_format.frame_bytes()],
            decode_f32: vec![0.0; max_frames * max_ch],
            remap_f32: vec![0.0; max_frames * max_ch],
            rate_f32: vec![0.0; max_frames * max_ch],
            last_fetched: 0,
            area: AudioArea {
                frames: 0,
                channels: dev_format.num_channels,
                layout: dev_format.channel_layout,
            },
        })
    }

    pub fn dev_index(&self) -> u32 {
        self.dev_index
    }

    pub fn stream(&self) -> &Rc<RefCell<RStream>> {
        &self.stream
    }

    pub fn area(&self) -> &AudioArea {
        &self.area
    }

    /// Fetch up to `dev_frames` device-rate frames from the stream's ring,
    /// convert, scale and accumulate into `mix` (interleaved f32 in device
    /// channels). Shortfall is left as-is in `mix`, i.e. zero-filled from
    /// the stream's perspective, and reported as an underrun.
    pub fn pull_output(&mut self, mix: &mut [f32], dev_frames: usize, scale: f32) -> PullResult {
        let d_ch = self.dev_format.num_channels;
        let mut s = self.stream.borrow_mut();
        let s_format = *s.format();
        let s_fb = s_format.frame_bytes();
        let s_ch = s_format.num_channels;

        let need_in = self
            .resampler
            .as_ref()
            .map_or(dev_frames, |r| r.input_needed(dev_frames));
        let avail = s.shm().readable_frames();
        let take = need_in.min(avail);
        let underrun = take < need_in && dev_frames > 0;

        let got = s.shm().read_frames(&mut self.xfer_bytes[..take * s_fb]);
        s.total_fetched += got as u64;
        if underrun {
            s.underruns += 1;
        }

        interleaved_to_f32(
            s_format.sample_format,
            &self.xfer_bytes[..got * s_fb],
            &mut self.decode_f32[..got * s_ch],
        );

        let remapped: &[f32] = match &self.matrix {
            Some(m) => {
                m.apply(&self.decode_f32, &mut self.remap_f32, got);
                &self.remap_f32[..got * d_ch]
            }
            None => &self.decode_f32[..got * d_ch],
        };

        let frames = match &mut self.resampler {
            Some(r) => r.process(remapped, &mut self.rate_f32[..dev_frames * d_ch]),
            None => {
                let frames = got.min(dev_frames);
                self.rate_f32[..frames * d_ch].copy_from_slice(&remapped[..frames * d_ch]);
                frames
            }
        };

        let volume = s.volume * scale;
        mix_add(&mut mix[..frames * d_ch], &self.rate_f32[..frames * d_ch], volume);

        // Ask the client for more once the ring is below its callback
        // threshold.
        if s.shm().readable_frames() < s.cb_threshold() {
            s.notify();
        }

        self.last_fetched = frames;
        self.area.frames = frames;
        PullResult { frames, underrun }
    }

    /// Push `frames` captured device-format frames into the stream's ring,
    /// scaled by `gain` (the node's capture gain). Returns stream-rate
    /// frames written; a full ring drops the excess.
    pub fn push_input(&mut self, captured: &[u8], frames: usize, gain: f32) -> usize {
        let d_ch = self.dev_format.num_channels;
        let mut s = self.stream.borrow_mut();
        let s_format = *s.format();
        let s_ch = s_format.num_channels;
        let d_fb = self.dev_format.frame_bytes();

        interleaved_to_f32(
            self.dev_format.sample_format,
            &captured[..frames * d_fb],
            &mut self.decode_f32[..frames * d_ch],
        );
        tern_dsp::scale(&mut self.decode_f32[..frames * d_ch], gain);

        let (rate_out, produced) = match &mut self.resampler {
            Some(r) => {
                let max_out = r.output_possible(frames);
                let produced = r.process(
                    &self.decode_f32[..frames * d_ch],
                    &mut self.rate_f32[..max_out * d_ch],
                );
                (&self.rate_f32[..produced * d_ch], produced)
            }
            None => (&self.decode_f32[..frames * d_ch], frames),
        };

        let final_f32: &[f32] = match &self.matrix {
            Some(m) => {
                m.apply(rate_out, &mut self.remap_f32, produced);
                &self.remap_f32[..produced * s_ch]
            }
            None => &rate_out[..produced * s_ch],
        };

        f32_to_interleaved(
            s_format.sample_format,
            final_f32,
            &mut self.xfer_bytes[..produced * s_format.frame_bytes()],
        );

        // Zero-length writes are dropped rather than committed
        let written = if produced > 0 {
            s.shm()
                .write_frames(&self.xfer_bytes[..produced * s_format.frame_bytes()])
        } else {
            0
        };
        s.total_fetched += written as u64;

        if s.shm().readable_frames() >= s.cb_threshold() {
            s.notify();
        }

        self.last_fetched = written;
        self.area.frames = written;
        written
    }
}

impl std::fmt::Debug for DevStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DevStream")
            .field("dev_index", &self.dev_index)
            .field("stream", &self.stream.borrow().id())
            .field("resampled", &self.resampler.is_some())
            .field("remapped", &self.matrix.is_some())
            .finish()
    }
}
