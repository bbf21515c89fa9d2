//! Channel Layouts and Remapping
//!
//! A [`ChannelLayout`] maps each named speaker position to the interleaved
//! channel index that carries it (or none). Streams and devices each carry a
//! layout; when they disagree, a [`ChannelMatrix`] built once at attach time
//! remaps frames between them.
//!
//! Device layout selection follows a fixed priority order against the
//! layouts the backend reports as supported:
//!
//! 1. exact layout match
//! 2. same set of positions in any order, if the backend can reorder
//! 3. match with front/rear pairs swapped
//! 4. best-effort via a conversion matrix
//! 5. (capture) first candidate with a matching channel count

use serde::{Deserialize, Serialize};

use crate::error::{DspError, DspResult};

/// Named speaker positions, in the order they appear in a layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelPosition {
    /// Front left
    FL,
    /// Front right
    FR,
    /// Rear left
    RL,
    /// Rear right
    RR,
    /// Front center
    FC,
    /// Low frequency effects
    LFE,
    /// Side left
    SL,
    /// Side right
    SR,
    /// Rear center
    RC,
    /// Front left of center
    FLC,
    /// Front right of center
    FRC,
}

/// Number of named positions a layout can describe
pub const NUM_CHANNEL_POSITIONS: usize = 11;

const ALL_POSITIONS: [ChannelPosition; NUM_CHANNEL_POSITIONS] = [
    ChannelPosition::FL,
    ChannelPosition::FR,
    ChannelPosition::RL,
    ChannelPosition::RR,
    ChannelPosition::FC,
    ChannelPosition::LFE,
    ChannelPosition::SL,
    ChannelPosition::SR,
    ChannelPosition::RC,
    ChannelPosition::FLC,
    ChannelPosition::FRC,
];

/// Index-per-position channel layout.
///
/// `slots[p]` is the interleaved channel index carrying position `p`, or -1
/// if the position is absent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelLayout {
    slots: [i8; NUM_CHANNEL_POSITIONS],
}

impl ChannelLayout {
    /// Layout with no positions assigned
    pub const fn unset() -> Self {
        Self {
            slots: [-1; NUM_CHANNEL_POSITIONS],
        }
    }

    /// Standard stereo: FL=0, FR=1
    pub fn stereo() -> Self {
        let mut l = Self::unset();
        l.set(ChannelPosition::FL, 0);
        l.set(ChannelPosition::FR, 1);
        l
    }

    /// Mono: FC=0
    pub fn mono() -> Self {
        let mut l = Self::unset();
        l.set(ChannelPosition::FC, 0);
        l
    }

    /// Conventional layout for a channel count: mono is FC, everything else
    /// fills FL, FR, RL, RR, FC, LFE, SL, SR in order.
    pub fn default_for(channels: usize) -> Self {
        if channels == 1 {
            return Self::mono();
        }
        let order = [
            ChannelPosition::FL,
            ChannelPosition::FR,
            ChannelPosition::RL,
            ChannelPosition::RR,
            ChannelPosition::FC,
            ChannelPosition::LFE,
            ChannelPosition::SL,
            ChannelPosition::SR,
        ];
        let mut l = Self::unset();
        for (i, &p) in order.iter().enumerate().take(channels.min(order.len())) {
            l.set(p, i as i8);
        }
        l
    }

    /// Build a layout from an index-per-position slice, -1 meaning absent.
    pub fn from_slots(slots: &[i8]) -> DspResult<Self> {
        if slots.len() != NUM_CHANNEL_POSITIONS {
            return Err(DspError::LayoutMismatch(slots.len()));
        }
        let mut l = Self::unset();
        l.slots.copy_from_slice(slots);
        Ok(l)
    }

    pub fn set(&mut self, position: ChannelPosition, index: i8) {
        self.slots[position as usize] = index;
    }

    /// Channel index for a position, if present
    pub fn index_of(&self, position: ChannelPosition) -> Option<usize> {
        let idx = self.slots[position as usize];
        (idx >= 0).then_some(idx as usize)
    }

    /// Number of distinct channel indices assigned
    pub fn channel_count(&self) -> usize {
        let mut seen = [false; NUM_CHANNEL_POSITIONS];
        for &s in &self.slots {
            if s >= 0 && (s as usize) < NUM_CHANNEL_POSITIONS {
                seen[s as usize] = true;
            }
        }
        seen.iter().filter(|&&s| s).count()
    }

    /// Iterate over positions present in this layout
    pub fn positions(&self) -> impl Iterator<Item = (ChannelPosition, usize)> + '_ {
        ALL_POSITIONS
            .iter()
            .filter_map(move |&p| self.index_of(p).map(|i| (p, i)))
    }

    /// True if both layouts assign the same index to every position
    pub fn matches_exactly(&self, other: &ChannelLayout) -> bool {
        self.slots == other.slots
    }

    /// True if both layouts carry the same set of positions, indices aside
    pub fn same_positions(&self, other: &ChannelLayout) -> bool {
        ALL_POSITIONS
            .iter()
            .all(|&p| self.index_of(p).is_some() == other.index_of(p).is_some())
    }

    /// This layout with stereo-pair members exchanged (FL<->FR, RL<->RR,
    /// SL<->SR, FLC<->FRC).
    pub fn pair_swapped(&self) -> Self {
        let mut out = *self;
        let pairs = [
            (ChannelPosition::FL, ChannelPosition::FR),
            (ChannelPosition::RL, ChannelPosition::RR),
            (ChannelPosition::SL, ChannelPosition::SR),
            (ChannelPosition::FLC, ChannelPosition::FRC),
        ];
        for (a, b) in pairs {
            out.slots.swap(a as usize, b as usize);
        }
        out
    }
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self::stereo()
    }
}

/// How a device layout was chosen from the backend's supported set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutMatch {
    Exact(usize),
    Reordered(usize),
    PairSwapped(usize),
    /// No structural match; the caller should remap through a matrix
    /// against the returned candidate.
    Matrix(usize),
    CountOnly(usize),
}

/// Choose a device channel layout for `wanted` from `candidates`.
///
/// `variable_positions` tells whether the backend accepts arbitrary
/// reordering of positions; `capture` enables the count-only fallback.
pub fn select_layout(
    wanted: &ChannelLayout,
    candidates: &[ChannelLayout],
    variable_positions: bool,
    capture: bool,
) -> Option<LayoutMatch> {
    if let Some(i) = candidates.iter().position(|c| c.matches_exactly(wanted)) {
        return Some(LayoutMatch::Exact(i));
    }
    if variable_positions {
        if let Some(i) = candidates.iter().position(|c| c.same_positions(wanted)) {
            return Some(LayoutMatch::Reordered(i));
        }
    }
    let swapped = wanted.pair_swapped();
    if let Some(i) = candidates.iter().position(|c| c.matches_exactly(&swapped)) {
        return Some(LayoutMatch::PairSwapped(i));
    }
    if let Some(i) = candidates.iter().position(|c| {
        c.channel_count() >= wanted.channel_count()
            && wanted.positions().any(|(p, _)| c.index_of(p).is_some())
    }) {
        return Some(LayoutMatch::Matrix(i));
    }
    if capture {
        let count = wanted.channel_count();
        if let Some(i) = candidates.iter().position(|c| c.channel_count() == count) {
            return Some(LayoutMatch::CountOnly(i));
        }
    }
    None
}

/// Dense remap matrix from a source layout to a destination layout.
///
/// `coef[d][s]` is the weight of source channel `s` in destination channel
/// `d`. Built once when a stream attaches to a device, then applied per
/// fetch without allocating.
#[derive(Debug, Clone)]
pub struct ChannelMatrix {
    coef: Vec<Vec<f32>>,
    src_channels: usize,
    dst_channels: usize,
}

impl ChannelMatrix {
    /// Build the conversion matrix between two layouts.
    ///
    /// Positions present on both sides map 1:1. A source FC or LFE with no
    /// destination slot folds into FL/FR at -3 dB; any other unmatched
    /// source position is dropped.
    pub fn new(src: &ChannelLayout, dst: &ChannelLayout) -> DspResult<Self> {
        let src_channels = src.channel_count();
        let dst_channels = dst.channel_count();
        if src_channels == 0 || dst_channels == 0 {
            return Err(DspError::InvalidChannelCount(0));
        }

        const FOLD: f32 = std::f32::consts::FRAC_1_SQRT_2;

        let mut coef = vec![vec![0.0f32; src_channels]; dst_channels];
        for (pos, s_idx) in src.positions() {
            if let Some(d_idx) = dst.index_of(pos) {
                coef[d_idx][s_idx] = 1.0;
                continue;
            }
            // Fold center and LFE content into the front pair when the
            // destination has nowhere else to put it.
            if matches!(pos, ChannelPosition::FC | ChannelPosition::LFE) {
                for front in [ChannelPosition::FL, ChannelPosition::FR] {
                    if let Some(d_idx) = dst.index_of(front) {
                        coef[d_idx][s_idx] += FOLD;
                    }
                }
            }
        }

        // A mono source feeding a layout without FL/FR still needs a path;
        // duplicate into every destination channel.
        if coef.iter().all(|row| row.iter().all(|&c| c == 0.0)) {
            for row in coef.iter_mut() {
                for c in row.iter_mut() {
                    *c = 1.0 / src_channels as f32;
                }
            }
        }

        Ok(Self {
            coef,
            src_channels,
            dst_channels,
        })
    }

    /// Identity matrix for layouts that already agree
    pub fn identity(channels: usize) -> Self {
        let mut coef = vec![vec![0.0f32; channels]; channels];
        for (i, row) in coef.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        Self {
            coef,
            src_channels: channels,
            dst_channels: channels,
        }
    }

    pub fn src_channels(&self) -> usize {
        self.src_channels
    }

    pub fn dst_channels(&self) -> usize {
        self.dst_channels
    }

    /// Remap `frames` interleaved frames from `src` into `dst`.
    ///
    /// `dst` must hold at least `frames * dst_channels` samples.
    pub fn apply(&self, src: &[f32], dst: &mut [f32], frames: usize) {
        debug_assert!(src.len() >= frames * self.src_channels);
        debug_assert!(dst.len() >= frames * self.dst_channels);

        for f in 0..frames {
            let s_base = f * self.src_channels;
            let d_base = f * self.dst_channels;
            for (d, row) in self.coef.iter().enumerate() {
                let mut acc = 0.0f32;
                for (s, &c) in row.iter().enumerate() {
                    if c != 0.0 {
                        acc += src[s_base + s] * c;
                    }
                }
                dst[d_base + d] = acc;
            }
        }
    }
}
