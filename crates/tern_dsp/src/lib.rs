//! Tern DSP - Mixing and Format Conversion
//!
//! This crate provides the processing kernels the audio engine runs inside
//! its per-device service cycle:
//!
//! - Sample format conversion with saturation ([`sample`])
//! - Channel layout description and remap matrices ([`channel`])
//! - Deterministic linear sample-rate conversion ([`resample`])
//! - Mix accumulation into a device scratch buffer ([`mixer`])
//! - Volume curves mapping UI steps to linear scalers ([`volume`])
//!
//! # Real-time Safety
//!
//! Every function that runs per service cycle operates on caller-provided
//! buffers and performs no allocation. Buffers are sized once, at device
//! open, by the engine.

mod channel;
mod error;
mod format;
mod mixer;
mod resample;
mod sample;
mod volume;

pub use channel::{
    select_layout, ChannelLayout, ChannelMatrix, ChannelPosition, LayoutMatch, NUM_CHANNEL_POSITIONS,
};
pub use error::{DspError, DspResult};
pub use format::{AudioFormat, Direction, SupportedFormats};
pub use mixer::{interleaved_to_f32, f32_to_interleaved, mix_add, scale, silence, swap_left_right};
pub use resample::LinearResampler;
pub use sample::SampleFormat;
pub use volume::{VolumeCurve, MAX_VOLUME_STEP};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        // Verify public API is accessible
        let _fmt = SampleFormat::S16Le;
        let _curve = VolumeCurve::default();
    }
}
