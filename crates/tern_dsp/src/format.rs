//! Audio Format Description
//!
//! The (rate, channel count, sample format, channel layout) tuple bound to
//! an open device, and requested by streams. Exactly one format is bound
//! while a device is open; the engine negotiates it from the supported
//! vectors the backend reports.

use serde::{Deserialize, Serialize};

use crate::channel::ChannelLayout;
use crate::error::{DspError, DspResult};
use crate::sample::SampleFormat;

/// Direction of a stream or device, from the server's point of view:
/// output = playback toward hardware, input = capture toward clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub fn is_output(self) -> bool {
        matches!(self, Direction::Output)
    }
}

/// A fully specified PCM format
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    /// Frames per second
    pub frame_rate: u32,
    /// Interleaved channels per frame
    pub num_channels: usize,
    /// Sample encoding
    pub sample_format: SampleFormat,
    /// Position-to-index map for the interleaved channels
    pub channel_layout: ChannelLayout,
}

impl AudioFormat {
    pub fn new(frame_rate: u32, num_channels: usize, sample_format: SampleFormat) -> Self {
        Self {
            frame_rate,
            num_channels,
            sample_format,
            channel_layout: ChannelLayout::default_for(num_channels),
        }
    }

    /// Bytes in one interleaved frame
    pub fn frame_bytes(&self) -> usize {
        self.num_channels * self.sample_format.sample_bytes()
    }

    /// Reject rates and channel counts no backend can bind
    pub fn validate(&self) -> DspResult<()> {
        if self.frame_rate < 4000 || self.frame_rate > 192_000 {
            return Err(DspError::UnsupportedRate(self.frame_rate));
        }
        if self.num_channels == 0 || self.num_channels > 8 {
            return Err(DspError::InvalidChannelCount(self.num_channels));
        }
        Ok(())
    }
}

impl Default for AudioFormat {
    /// 48kHz stereo S16, the negotiation starting point
    fn default() -> Self {
        Self::new(48_000, 2, SampleFormat::S16Le)
    }
}

/// The format vectors a backend reports before negotiation binds one tuple
#[derive(Debug, Clone, Default)]
pub struct SupportedFormats {
    pub rates: Vec<u32>,
    pub channel_counts: Vec<usize>,
    pub sample_formats: Vec<SampleFormat>,
    /// Channel layouts the backend accepts, in preference order
    pub layouts: Vec<ChannelLayout>,
    /// Whether the backend accepts arbitrary position reordering
    pub variable_positions: bool,
}

impl SupportedFormats {
    /// A backend that takes exactly one format
    pub fn fixed(format: &AudioFormat) -> Self {
        Self {
            rates: vec![format.frame_rate],
            channel_counts: vec![format.num_channels],
            sample_formats: vec![format.sample_format],
            layouts: vec![format.channel_layout],
            variable_positions: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_bytes() {
        let fmt = AudioFormat::default();
        assert_eq!(fmt.frame_bytes(), 4);

        let fmt = AudioFormat::new(44_100, 6, SampleFormat::S32Le);
        assert_eq!(fmt.frame_bytes(), 24);
    }

    #[test]
    fn test_validate() {
        assert!(AudioFormat::default().validate().is_ok());
        assert!(AudioFormat::new(100, 2, SampleFormat::S16Le).validate().is_err());
        assert!(AudioFormat::new(48_000, 0, SampleFormat::S16Le)
            .validate()
            .is_err());
        assert!(AudioFormat::new(48_000, 9, SampleFormat::S16Le)
            .validate()
            .is_err());
    }

    #[test]
    fn test_mono_gets_mono_layout() {
        let fmt = AudioFormat::new(16_000, 1, SampleFormat::S16Le);
        assert_eq!(fmt.channel_layout, ChannelLayout::mono());
    }

    #[test]
    fn test_layout_covers_every_channel() {
        // The constructed layout must describe exactly num_channels
        // positions, including multichannel formats.
        for channels in 1..=8 {
            let fmt = AudioFormat::new(48_000, channels, SampleFormat::S16Le);
            assert_eq!(fmt.channel_layout.channel_count(), channels);
        }
        let quad = AudioFormat::new(48_000, 4, SampleFormat::S16Le);
        assert_eq!(quad.channel_layout, ChannelLayout::default_for(4));
    }
}
