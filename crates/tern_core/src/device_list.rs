//! Device List and Routing
//!
//! The control thread owns the set of known devices; the engine thread
//! owns whichever of them are open. Ownership moves over the command
//! channel: enabling a device ships its `Iodev` to the engine (`AddDev`),
//! disabling asks for it back (`RemoveDev` answered by `DeviceClosed`).
//! Backend handles are therefore only ever touched by the engine while
//! open.
//!
//! Per direction, at most one device is "active" for unpinned streams.
//! When the last real device of a direction goes away, the fallback empty
//! device is swapped in so streams always have somewhere to live. Devices
//! that pinned streams depend on stay open off to the side and ignore
//! routing changes.

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};

use tern_dsp::Direction;

use crate::error::{EngineError, EngineResult};
use crate::iodev::Iodev;
use crate::message::EngineCommand;
use crate::node::NodeId;
use crate::observer::{ObserverEvent, ObserverRegistry};

/// Where a device currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// Parked here, closed
    Parked,
    /// Owned by the engine
    Engine,
}

struct DeviceEntry {
    index: u32,
    name: String,
    direction: Direction,
    node_ids: Vec<NodeId>,
    placement: Placement,
    /// Present while parked
    iodev: Option<Iodev>,
    /// Counts pinned streams that need this device open
    pinned_streams: u32,
}

/// Control-thread device registry and router
pub struct DeviceList {
    cmd_tx: Sender<EngineCommand>,
    entries: Vec<DeviceEntry>,
    next_index: u32,
    /// Active device per direction (the one unpinned streams follow)
    active_output: Option<u32>,
    active_input: Option<u32>,
    /// Indices of the two fallback devices
    empty_output: u32,
    empty_input: u32,
}

impl DeviceList {
    /// Build the list, register the fallback empty devices, and enable
    /// them so streams are serviced before any hardware shows up.
    pub fn new(cmd_tx: Sender<EngineCommand>, observer: &mut ObserverRegistry) -> Self {
        let mut list = Self {
            cmd_tx,
            entries: Vec::new(),
            next_index: 0,
            active_output: None,
            active_input: None,
            empty_output: 0,
            empty_input: 0,
        };
        list.empty_output = list.add_device(Iodev::empty(Direction::Output), observer);
        list.empty_input = list.add_device(Iodev::empty(Direction::Input), observer);
        list.enable(list.empty_output, observer);
        list.enable(list.empty_input, observer);
        list
    }

    /// Register a device (closed) and assign its index
    pub fn add_device(&mut self, mut iodev: Iodev, observer: &mut ObserverRegistry) -> u32 {
        let index = self.next_index;
        self.next_index += 1;
        iodev.set_index(index);
        info!(index, name = iodev.name(), "device added");

        self.entries.push(DeviceEntry {
            index,
            name: iodev.name().to_string(),
            direction: iodev.direction(),
            node_ids: iodev.nodes().iter().map(|n| n.id).collect(),
            placement: Placement::Parked,
            iodev: Some(iodev),
            pinned_streams: 0,
        });
        observer.notify(&ObserverEvent::DeviceAdded { index });
        observer.notify(&ObserverEvent::NodesChanged);
        index
    }

    /// Remove a device entirely. Unpinned streams move to whatever becomes
    /// active; the engine returns the iodev which is then dropped via
    /// [`restore`](Self::restore).
    pub fn remove_device(&mut self, index: u32, observer: &mut ObserverRegistry) {
        let Some(pos) = self.entries.iter().position(|e| e.index == index) else {
            return;
        };
        if self.entries[pos].placement == Placement::Engine {
            let _ = self.cmd_tx.send(EngineCommand::RemoveDev { index });
        }
        let entry = self.entries.remove(pos);
        info!(index, name = %entry.name, "device removed");
        observer.notify(&ObserverEvent::DeviceRemoved { index });
        observer.notify(&ObserverEvent::NodesChanged);

        if self.active_output == Some(index) {
            self.active_output = None;
            self.fallback(Direction::Output, observer);
        }
        if self.active_input == Some(index) {
            self.active_input = None;
            self.fallback(Direction::Input, observer);
        }
    }

    /// Accept an iodev the engine shipped back. Devices still in the list
    /// are parked for re-enable; removed ones are dropped here.
    pub fn restore(&mut self, iodev: Iodev) {
        let index = iodev.index();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) {
            debug!(index, "device returned to parking");
            entry.placement = Placement::Parked;
            entry.iodev = Some(iodev);
        }
    }

    /// Select the active node for a direction: open the owning device if
    /// needed, move unpinned streams over, and fire the enabled/disabled
    /// hooks. Streams pinned elsewhere are not touched.
    pub fn add_active_node(
        &mut self,
        direction: Direction,
        node_id: NodeId,
        observer: &mut ObserverRegistry,
    ) -> EngineResult<()> {
        let new_index = self
            .entries
            .iter()
            .find(|e| e.direction == direction && e.node_ids.contains(&node_id))
            .ok_or(EngineError::DeviceNotFound(0))?
            .index;

        let old_active = match direction {
            Direction::Output => self.active_output,
            Direction::Input => self.active_input,
        };

        if old_active != Some(new_index) {
            // Enable the new device first so streams never go unserviced
            self.enable(new_index, observer);
            match direction {
                Direction::Output => self.active_output = Some(new_index),
                Direction::Input => self.active_input = Some(new_index),
            }
            if let Some(old) = old_active {
                self.disable(old, observer);
            }
        }

        // Point the device at the selected node
        self.set_active_node_on_device(new_index, node_id);

        observer.notify(&ObserverEvent::ActiveNodeChanged {
            direction,
            node: Some(node_id),
        });
        Ok(())
    }

    fn set_active_node_on_device(&mut self, index: u32, node_id: NodeId) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) else {
            return;
        };
        match entry.placement {
            Placement::Engine => {
                let _ = self.cmd_tx.send(EngineCommand::SetActiveNode {
                    dev_index: index,
                    node: node_id,
                });
            }
            Placement::Parked => {
                if let Some(dev) = entry.iodev.as_mut() {
                    let _ = dev.update_active_node(node_id);
                }
            }
        }
    }

    /// Track a pinned stream attaching to a device, opening it if needed
    pub fn pin_stream(&mut self, index: u32, observer: &mut ObserverRegistry) -> EngineResult<()> {
        let parked = {
            let entry = self
                .entries
                .iter_mut()
                .find(|e| e.index == index)
                .ok_or(EngineError::DeviceNotFound(index))?;
            entry.pinned_streams += 1;
            entry.placement == Placement::Parked
        };
        if parked {
            self.enable(index, observer);
        }
        Ok(())
    }

    /// A pinned stream went away; its device closes if nothing else
    /// keeps it.
    pub fn unpin_stream(&mut self, index: u32, observer: &mut ObserverRegistry) {
        let is_active =
            self.active_output == Some(index) || self.active_input == Some(index);
        let release = match self.entries.iter_mut().find(|e| e.index == index) {
            Some(entry) => {
                entry.pinned_streams = entry.pinned_streams.saturating_sub(1);
                entry.pinned_streams == 0 && !is_active
            }
            None => false,
        };
        if release {
            self.disable(index, observer);
        }
    }

    fn enable(&mut self, index: u32, observer: &mut ObserverRegistry) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) else {
            return;
        };
        if entry.placement == Placement::Engine {
            return;
        }
        let Some(iodev) = entry.iodev.take() else {
            warn!(index, "device neither parked nor engine-owned");
            return;
        };
        entry.placement = Placement::Engine;
        let _ = self.cmd_tx.send(EngineCommand::AddDev { dev: iodev });
        observer.notify(&ObserverEvent::DeviceEnabled { index });
    }

    fn disable(&mut self, index: u32, observer: &mut ObserverRegistry) {
        let Some(entry) = self.entries.iter_mut().find(|e| e.index == index) else {
            return;
        };
        if entry.placement != Placement::Engine {
            return;
        }
        if entry.pinned_streams > 0 {
            // Pinned streams keep it open; only unpinned routing moves on
            let _ = self.cmd_tx.send(EngineCommand::DetachUnpinned { index });
        } else {
            entry.placement = Placement::Parked;
            let _ = self.cmd_tx.send(EngineCommand::RemoveDev { index });
        }
        observer.notify(&ObserverEvent::DeviceDisabled { index });
    }

    /// Ensure a direction keeps exactly one serviced device when its last
    /// real device disappears.
    fn fallback(&mut self, direction: Direction, observer: &mut ObserverRegistry) {
        let empty = match direction {
            Direction::Output => self.empty_output,
            Direction::Input => self.empty_input,
        };
        info!(?direction, "no enabled device left, enabling fallback");
        self.enable(empty, observer);
        match direction {
            Direction::Output => self.active_output = Some(empty),
            Direction::Input => self.active_input = Some(empty),
        }
    }

    pub fn active_device(&self, direction: Direction) -> Option<u32> {
        match direction {
            Direction::Output => self.active_output,
            Direction::Input => self.active_input,
        }
    }

    pub fn device_indices(&self) -> Vec<u32> {
        self.entries.iter().map(|e| e.index).collect()
    }

    /// Map node id to owning device index
    pub fn find_node(&self, node_id: NodeId) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.node_ids.contains(&node_id))
            .map(|e| e.index)
    }

    /// Whether a device currently lives on the engine
    pub fn is_enabled(&self, index: u32) -> bool {
        self.entries
            .iter()
            .any(|e| e.index == index && e.placement == Placement::Engine)
    }

    /// Per-node volume; forwarded to the engine when the device is open
    pub fn set_node_volume(
        &mut self,
        node_id: NodeId,
        volume: u8,
        observer: &mut ObserverRegistry,
    ) -> EngineResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.node_ids.contains(&node_id))
            .ok_or(EngineError::DeviceNotFound(0))?;
        let index = entry.index;
        match entry.placement {
            Placement::Engine => {
                let _ = self.cmd_tx.send(EngineCommand::SetNodeVolume {
                    dev_index: index,
                    node: node_id,
                    volume,
                });
            }
            Placement::Parked => {
                if let Some(dev) = entry.iodev.as_mut() {
                    if let Some(node) = dev.node_mut(node_id) {
                        node.volume = volume.min(100);
                    }
                }
            }
        }
        observer.notify(&ObserverEvent::NodeVolumeChanged {
            node: node_id,
            volume,
        });
        Ok(())
    }

    /// Per-node left/right swap; forwarded to the engine when open
    pub fn set_node_swap(
        &mut self,
        node_id: NodeId,
        swap: bool,
        observer: &mut ObserverRegistry,
    ) -> EngineResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.node_ids.contains(&node_id))
            .ok_or(EngineError::DeviceNotFound(0))?;
        let index = entry.index;
        match entry.placement {
            Placement::Engine => {
                let _ = self.cmd_tx.send(EngineCommand::SetNodeSwapLeftRight {
                    dev_index: index,
                    node: node_id,
                    swap,
                });
            }
            Placement::Parked => {
                if let Some(dev) = entry.iodev.as_mut() {
                    if let Some(node) = dev.node_mut(node_id) {
                        node.left_right_swapped = swap;
                    }
                }
            }
        }
        observer.notify(&ObserverEvent::NodeAttrChanged { node: node_id });
        Ok(())
    }

    /// Plugged state is control-plane routing input only; the engine does
    /// not consult it mid-cycle.
    pub fn set_node_plugged(
        &mut self,
        node_id: NodeId,
        plugged: bool,
        observer: &mut ObserverRegistry,
    ) -> EngineResult<()> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.node_ids.contains(&node_id))
            .ok_or(EngineError::DeviceNotFound(0))?;
        if let Some(dev) = entry.iodev.as_mut() {
            if let Some(node) = dev.node_mut(node_id) {
                node.plugged = plugged;
            }
        }
        observer.notify(&ObserverEvent::NodeAttrChanged { node: node_id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use std::collections::HashMap;

    /// Simplified view of engine commands the list issued
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Seen {
        Add(u32),
        Remove(u32),
        Detach(u32),
        Other,
    }

    /// Stands in for the engine thread: holds shipped iodevs and answers
    /// every RemoveDev by returning the device, like DeviceClosed does.
    struct FakeEngine {
        owned: HashMap<u32, Iodev>,
    }

    impl FakeEngine {
        fn new() -> Self {
            Self {
                owned: HashMap::new(),
            }
        }

        fn pump(&mut self, list: &mut DeviceList, rx: &Receiver<EngineCommand>) -> Vec<Seen> {
            let mut seen = Vec::new();
            while let Ok(cmd) = rx.try_recv() {
                match cmd {
                    EngineCommand::AddDev { dev } => {
                        seen.push(Seen::Add(dev.index()));
                        self.owned.insert(dev.index(), dev);
                    }
                    EngineCommand::RemoveDev { index } => {
                        seen.push(Seen::Remove(index));
                        if let Some(dev) = self.owned.remove(&index) {
                            list.restore(dev);
                        }
                    }
                    EngineCommand::DetachUnpinned { index } => seen.push(Seen::Detach(index)),
                    _ => seen.push(Seen::Other),
                }
            }
            seen
        }
    }

    fn setup() -> (
        DeviceList,
        Receiver<EngineCommand>,
        ObserverRegistry,
        FakeEngine,
    ) {
        let (tx, rx) = unbounded();
        let mut observer = ObserverRegistry::new();
        let mut list = DeviceList::new(tx, &mut observer);
        let mut engine = FakeEngine::new();
        engine.pump(&mut list, &rx);
        (list, rx, observer, engine)
    }

    fn sim_output(name: &str) -> Iodev {
        let (dev, _) = Iodev::sim(name, Direction::Output);
        dev
    }

    #[test]
    fn test_fallbacks_enabled_at_start() {
        let (tx, rx) = unbounded();
        let mut observer = ObserverRegistry::new();
        let mut list = DeviceList::new(tx, &mut observer);

        // One AddDev per direction
        let seen = FakeEngine::new().pump(&mut list, &rx);
        let adds = seen
            .iter()
            .filter(|s| matches!(s, Seen::Add(_)))
            .count();
        assert_eq!(adds, 2);
        assert!(list.active_device(Direction::Output).is_some());
        assert!(list.active_device(Direction::Input).is_some());
    }

    #[test]
    fn test_activate_real_device_swaps_out_empty() {
        let (mut list, rx, mut observer, mut engine) = setup();
        let empty = list.active_device(Direction::Output).unwrap();

        let dev = sim_output("spk");
        let node_id = dev.nodes()[0].id;
        let index = list.add_device(dev, &mut observer);

        list.add_active_node(Direction::Output, node_id, &mut observer)
            .unwrap();
        assert_eq!(list.active_device(Direction::Output), Some(index));
        assert!(list.is_enabled(index));
        assert!(!list.is_enabled(empty));

        // AddDev for the new device, RemoveDev for the fallback
        let seen = engine.pump(&mut list, &rx);
        assert!(seen.contains(&Seen::Add(index)));
        assert!(seen.contains(&Seen::Remove(empty)));
    }

    #[test]
    fn test_removing_last_device_restores_empty() {
        let (mut list, rx, mut observer, mut engine) = setup();
        let empty = list.active_device(Direction::Output).unwrap();

        let dev = sim_output("spk");
        let node_id = dev.nodes()[0].id;
        let index = list.add_device(dev, &mut observer);
        list.add_active_node(Direction::Output, node_id, &mut observer)
            .unwrap();
        engine.pump(&mut list, &rx);

        list.remove_device(index, &mut observer);
        // Exactly the fallback is active again
        assert_eq!(list.active_device(Direction::Output), Some(empty));
        assert!(list.is_enabled(empty));
        let seen = engine.pump(&mut list, &rx);
        assert!(seen.contains(&Seen::Remove(index)));
        assert!(seen.contains(&Seen::Add(empty)));
    }

    #[test]
    fn test_pinned_device_survives_routing_change() {
        let (mut list, rx, mut observer, mut engine) = setup();

        let dev_a = sim_output("a");
        let node_a = dev_a.nodes()[0].id;
        let index_a = list.add_device(dev_a, &mut observer);
        let dev_b = sim_output("b");
        let node_b = dev_b.nodes()[0].id;
        let _index_b = list.add_device(dev_b, &mut observer);

        list.add_active_node(Direction::Output, node_a, &mut observer)
            .unwrap();
        list.pin_stream(index_a, &mut observer).unwrap();
        engine.pump(&mut list, &rx);

        // Route to B; A keeps its pinned stream and only detaches unpinned
        list.add_active_node(Direction::Output, node_b, &mut observer)
            .unwrap();
        assert!(list.is_enabled(index_a));
        let seen = engine.pump(&mut list, &rx);
        assert!(seen.contains(&Seen::Detach(index_a)));
        assert!(
            !seen.contains(&Seen::Remove(index_a)),
            "pinned device must not close"
        );

        // Last pin released: now it closes
        list.unpin_stream(index_a, &mut observer);
        assert!(!list.is_enabled(index_a));
        let seen = engine.pump(&mut list, &rx);
        assert!(seen.contains(&Seen::Remove(index_a)));
    }

    #[test]
    fn test_observer_sees_routing_events() {
        let (mut list, rx, mut observer, mut engine) = setup();
        let events = observer.subscribe();

        let dev = sim_output("spk");
        let node_id = dev.nodes()[0].id;
        list.add_device(dev, &mut observer);
        list.add_active_node(Direction::Output, node_id, &mut observer)
            .unwrap();
        engine.pump(&mut list, &rx);

        let seen: Vec<_> = events.try_iter().collect();
        assert!(seen
            .iter()
            .any(|e| matches!(e, ObserverEvent::DeviceAdded { .. })));
        assert!(seen
            .iter()
            .any(|e| matches!(e, ObserverEvent::ActiveNodeChanged { .. })));
    }

    #[test]
    fn test_unknown_node_rejected() {
        let (mut list, _rx, mut observer, _engine) = setup();
        let missing = crate::node::NodeId::from_name("missing");
        assert!(list
            .add_active_node(Direction::Output, missing, &mut observer)
            .is_err());
    }
}

