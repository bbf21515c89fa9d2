//! Device Nodes
//!
//! A node is one logical endpoint on a device: a speaker pair, a headphone
//! jack, one HDMI port. The control plane selects nodes, sets per-node
//! volume, and flips attributes; the engine reads node state when applying
//! the software volume stage.

use serde::{Deserialize, Serialize};

use tern_dsp::VolumeCurve;

/// Stable node identity, derived from a content hash of the node name so
/// it survives re-enumeration and server restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl NodeId {
    /// FNV-1a over the node name
    pub fn from_name(name: &str) -> Self {
        let mut hash: u32 = 0x811c_9dc5;
        for byte in name.bytes() {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        }
        Self(hash)
    }
}

/// What a node physically is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Speaker,
    Headphone,
    InternalMic,
    Mic,
    Usb,
    Hdmi,
    BluetoothA2dp,
    BluetoothHfp,
    LoopbackPostMix,
    LoopbackPostDsp,
    Fallback,
}

/// One logical endpoint on a device
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    /// Index of the owning device
    pub dev_index: u32,
    pub name: String,
    pub node_type: NodeType,
    pub plugged: bool,
    /// UI volume step, 0..=100
    pub volume: u8,
    /// Extra gain from the UI slider beyond the curve (1.0 = none)
    pub ui_gain_scaler: f32,
    pub volume_curve: VolumeCurve,
    pub left_right_swapped: bool,
    /// False when the backend applies volume in hardware
    pub software_volume_needed: bool,
}

impl Node {
    pub fn new(dev_index: u32, name: &str, node_type: NodeType) -> Self {
        Self {
            id: NodeId::from_name(name),
            dev_index,
            name: name.to_string(),
            node_type,
            plugged: true,
            volume: 100,
            ui_gain_scaler: 1.0,
            volume_curve: VolumeCurve::default(),
            left_right_swapped: false,
            software_volume_needed: true,
        }
    }

    /// Linear scaler for the software-volume stage: curve value at the
    /// current step times the UI gain. 1.0 when hardware owns volume.
    pub fn volume_scaler(&self) -> f32 {
        if !self.software_volume_needed {
            return self.ui_gain_scaler;
        }
        self.volume_curve.scaler_at(self.volume as usize) * self.ui_gain_scaler
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable() {
        let a = NodeId::from_name("Speaker");
        let b = NodeId::from_name("Speaker");
        assert_eq!(a, b);
        assert_ne!(a, NodeId::from_name("Headphone"));
    }

    #[test]
    fn test_new_node_defaults() {
        let node = Node::new(0, "Speaker", NodeType::Speaker);
        assert_eq!(node.volume, 100);
        assert!(node.plugged);
        assert!(!node.left_right_swapped);
        assert!((node.volume_scaler() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_volume_scaler_follows_curve() {
        let mut node = Node::new(0, "Speaker", NodeType::Speaker);
        node.volume = 88; // 12 steps x 0.5 dB = -6 dB
        assert!((node.volume_scaler() - 0.501).abs() < 0.01);

        node.ui_gain_scaler = 2.0;
        assert!((node.volume_scaler() - 1.002).abs() < 0.02);
    }

    #[test]
    fn test_hardware_volume_skips_curve() {
        let mut node = Node::new(0, "Speaker", NodeType::Speaker);
        node.volume = 10;
        node.software_volume_needed = false;
        assert_eq!(node.volume_scaler(), 1.0);
    }
}
