//! Engine Commands and Events
//!
//! Commands flow from the control thread to the engine over a bounded
//! channel; the engine drains them at the top of every service iteration,
//! before any device is touched. Commands needing a synchronous answer
//! carry a `bounded(1)` reply sender - the control thread blocks on it, the
//! engine never does.
//!
//! Events flow back the other way and are drained by the control thread at
//! its leisure.

use crossbeam_channel::Sender;
use serde::Serialize;

use tern_dsp::Direction;

use crate::iodev::{DeviceState, Iodev};
use crate::node::NodeId;
use crate::stream::{ClientType, RStream, StreamId};

/// Commands the engine thread executes
pub enum EngineCommand {
    AddStream {
        stream: RStream,
    },
    RemoveStream {
        id: StreamId,
    },
    AddDev {
        dev: Iodev,
    },
    RemoveDev {
        index: u32,
    },
    /// Drop unpinned streams from a device that leaves the enabled set but
    /// stays open for its pinned streams
    DetachUnpinned {
        index: u32,
    },
    /// Reply with 0 once the stream's ring is empty. The control side
    /// enforces the timeout; a missing stream answers -EINVAL immediately.
    Drain {
        id: StreamId,
        reply: Sender<i32>,
    },
    Suspend,
    Resume,
    /// State snapshot for diagnostics and metrics
    Dump {
        reply: Sender<EngineSnapshot>,
    },
    SetNodeVolume {
        dev_index: u32,
        node: NodeId,
        volume: u8,
    },
    SetActiveNode {
        dev_index: u32,
        node: NodeId,
    },
    SetNodeSwapLeftRight {
        dev_index: u32,
        node: NodeId,
        swap: bool,
    },
    SetSystemVolume {
        volume: u8,
        muted: bool,
    },
    SwitchStreamType {
        id: StreamId,
        client_type: ClientType,
    },
    Shutdown,
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineCommand::AddStream { stream } => write!(f, "AddStream({})", stream.id()),
            EngineCommand::RemoveStream { id } => write!(f, "RemoveStream({id})"),
            EngineCommand::AddDev { dev } => write!(f, "AddDev({})", dev.name()),
            EngineCommand::RemoveDev { index } => write!(f, "RemoveDev({index})"),
            EngineCommand::DetachUnpinned { index } => write!(f, "DetachUnpinned({index})"),
            EngineCommand::Drain { id, .. } => write!(f, "Drain({id})"),
            EngineCommand::Suspend => write!(f, "Suspend"),
            EngineCommand::Resume => write!(f, "Resume"),
            EngineCommand::Dump { .. } => write!(f, "Dump"),
            EngineCommand::SetNodeVolume {
                dev_index, volume, ..
            } => write!(f, "SetNodeVolume(dev {dev_index} -> {volume})"),
            EngineCommand::SetActiveNode { dev_index, .. } => {
                write!(f, "SetActiveNode(dev {dev_index})")
            }
            EngineCommand::SetNodeSwapLeftRight { dev_index, swap, .. } => {
                write!(f, "SetNodeSwapLeftRight(dev {dev_index}, {swap})")
            }
            EngineCommand::SetSystemVolume { volume, muted } => {
                write!(f, "SetSystemVolume({volume}, muted={muted})")
            }
            EngineCommand::SwitchStreamType { id, .. } => write!(f, "SwitchStreamType({id})"),
            EngineCommand::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// Events the engine reports to the control thread
pub enum EngineEvent {
    /// A stream is gone (removed, or its device vanished with no fallback)
    StreamRemoved { id: StreamId },
    /// Ownership of a closed device returned after RemoveDev
    DeviceClosed { dev: Box<Iodev> },
    /// The backend failed unrecoverably; the device was dropped
    DeviceFailed { index: u32 },
    Underrun { dev_index: u32, stream: StreamId },
    SevereUnderrun { dev_index: u32 },
}

impl std::fmt::Debug for EngineEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineEvent::StreamRemoved { id } => write!(f, "StreamRemoved({id})"),
            EngineEvent::DeviceClosed { dev } => write!(f, "DeviceClosed({})", dev.name()),
            EngineEvent::DeviceFailed { index } => write!(f, "DeviceFailed({index})"),
            EngineEvent::Underrun { dev_index, stream } => {
                write!(f, "Underrun(dev {dev_index}, {stream})")
            }
            EngineEvent::SevereUnderrun { dev_index } => write!(f, "SevereUnderrun({dev_index})"),
        }
    }
}

/// Point-in-time engine state, serializable for diagnostics
#[derive(Debug, Clone, Serialize)]
pub struct EngineSnapshot {
    pub suspended: bool,
    pub devices: Vec<DeviceSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub index: u32,
    pub name: String,
    pub direction: Direction,
    pub backend: &'static str,
    pub state: DeviceState,
    pub buffer_frames: usize,
    pub attached_streams: usize,
    pub frames_serviced: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub id: StreamId,
    pub direction: Direction,
    pub client_type: ClientType,
    pub buffer_frames: u32,
    pub cb_threshold: u32,
    pub total_fetched: u64,
    pub underruns: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_serializes() {
        let snapshot = EngineSnapshot {
            suspended: false,
            devices: vec![DeviceSnapshot {
                index: 0,
                name: "Fallback Output".into(),
                direction: Direction::Output,
                backend: "empty",
                state: DeviceState::Running,
                buffer_frames: 2048,
                attached_streams: 1,
                frames_serviced: 4800,
            }],
            streams: vec![],
        };
        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("Fallback Output"));
        assert!(json.contains("4800"));
    }

    #[test]
    fn test_command_debug_hides_payload() {
        let (tx, _rx) = crossbeam_channel::bounded(1);
        let cmd = EngineCommand::Drain {
            id: StreamId(0x10002),
            reply: tx,
        };
        assert_eq!(format!("{cmd:?}"), "Drain(0x10002)");
    }
}
