//! Volume Curves
//!
//! A node's volume curve maps the 101 UI volume steps (0..=100) to a dBFS
//! value, stored as dB x 100 to keep curve arithmetic integral. The engine
//! turns the dBFS at the current step into a linear scaler and applies it in
//! the software-volume stage for nodes that need it.

use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};

/// Highest UI volume step
pub const MAX_VOLUME_STEP: usize = 100;

/// Maps UI volume steps to output attenuation.
///
/// Values are dBFS x 100 (so -300 is -3 dBFS). Two shapes exist:
///
/// - `SimpleStep`: step 100 sits at `max_volume` and every step below
///   subtracts `volume_step`.
/// - `Explicit`: one value per step, from a card config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeCurve {
    SimpleStep {
        /// dBFS x 100 at step 100
        max_volume: i32,
        /// dB x 100 removed per step below 100
        volume_step: i32,
    },
    Explicit(Vec<i32>),
}

impl VolumeCurve {
    /// Stepped curve; `volume_step` must be positive.
    pub fn simple_step(max_volume: i32, volume_step: i32) -> DspResult<Self> {
        if volume_step <= 0 {
            return Err(DspError::InvalidCurve(format!(
                "volume_step must be positive, got {volume_step}"
            )));
        }
        Ok(VolumeCurve::SimpleStep {
            max_volume,
            volume_step,
        })
    }

    /// Explicit curve; requires exactly 101 entries (dB_at_0 .. dB_at_100).
    pub fn explicit(values: Vec<i32>) -> DspResult<Self> {
        if values.len() != MAX_VOLUME_STEP + 1 {
            return Err(DspError::InvalidCurve(format!(
                "explicit curve needs {} entries, got {}",
                MAX_VOLUME_STEP + 1,
                values.len()
            )));
        }
        Ok(VolumeCurve::Explicit(values))
    }

    /// dBFS x 100 at a UI step (steps above 100 clamp to 100)
    pub fn db_at(&self, step: usize) -> i32 {
        let step = step.min(MAX_VOLUME_STEP);
        match self {
            VolumeCurve::SimpleStep {
                max_volume,
                volume_step,
            } => max_volume - (MAX_VOLUME_STEP - step) as i32 * volume_step,
            VolumeCurve::Explicit(values) => values[step],
        }
    }

    /// Linear scaler at a UI step
    pub fn scaler_at(&self, step: usize) -> f32 {
        let db = self.db_at(step) as f32 / 100.0;
        10.0_f32.powf(db / 20.0)
    }
}

impl Default for VolumeCurve {
    /// 0 dBFS at full volume, 0.5 dB per step
    fn default() -> Self {
        VolumeCurve::SimpleStep {
            max_volume: 0,
            volume_step: 50,
        }
    }
}
