//! Observer Registry
//!
//! State changes fan out to subscribers as tagged events over channels.
//! The registry is plain owned state on the control thread - no globals -
//! and a subscriber that stops draining its receiver is silently dropped
//! on the next notify.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;

use tern_dsp::Direction;

use crate::node::NodeId;
use crate::stream::StreamId;

/// Everything the control plane can announce
#[derive(Debug, Clone, Serialize)]
pub enum ObserverEvent {
    SystemVolumeChanged { volume: u8 },
    SystemMuteChanged { muted: bool },
    NodeVolumeChanged { node: NodeId, volume: u8 },
    NodeAttrChanged { node: NodeId },
    NodesChanged,
    ActiveNodeChanged { direction: Direction, node: Option<NodeId> },
    DeviceAdded { index: u32 },
    DeviceRemoved { index: u32 },
    DeviceEnabled { index: u32 },
    DeviceDisabled { index: u32 },
    StreamAdded { id: StreamId },
    StreamRemoved { id: StreamId },
    Underrun { dev_index: u32, stream: StreamId },
    SevereUnderrun { dev_index: u32 },
}

/// Subscriber registry; owned by the control thread
#[derive(Default)]
pub struct ObserverRegistry {
    subscribers: Vec<Sender<ObserverEvent>>,
}

impl ObserverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscriber and return its event receiver
    pub fn subscribe(&mut self) -> Receiver<ObserverEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver an event to every live subscriber, pruning dead ones
    pub fn notify(&mut self, event: &ObserverEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_and_notify() {
        let mut registry = ObserverRegistry::new();
        let rx1 = registry.subscribe();
        let rx2 = registry.subscribe();

        registry.notify(&ObserverEvent::SystemVolumeChanged { volume: 42 });

        for rx in [&rx1, &rx2] {
            match rx.try_recv().unwrap() {
                ObserverEvent::SystemVolumeChanged { volume } => assert_eq!(volume, 42),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[test]
    fn test_dropped_subscriber_pruned() {
        let mut registry = ObserverRegistry::new();
        let rx = registry.subscribe();
        drop(rx);
        let _keep = registry.subscribe();

        registry.notify(&ObserverEvent::NodesChanged);
        assert_eq!(registry.subscriber_count(), 1);
    }

    #[test]
    fn test_event_serializes() {
        let event = ObserverEvent::Underrun {
            dev_index: 1,
            stream: StreamId(0x10002),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("Underrun"));
    }
}
