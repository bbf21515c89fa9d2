//! Device Abstraction
//!
//! An [`Iodev`] is one playback or capture endpoint the engine services:
//! identity, direction, its nodes, the format bound while open, and a
//! [`Backend`] variant owning the actual transport exclusively. The
//! capability set is uniform across backends - `configure`, `close`,
//! `frames_queued`, `delay_frames`, `get_buffer`, `put_buffer`,
//! `flush_buffer`, `start`, `no_stream`, `update_channel_layout`,
//! `update_active_node` - so the service cycle never branches on what kind
//! of hardware it is driving.
//!
//! State machine: `Closed -> Open (format bound) -> Running -> Closed`,
//! with `Suspended` reachable from `Running` and back.

use serde::Serialize;

use tern_dsp::{
    select_layout, AudioFormat, ChannelLayout, Direction, LayoutMatch, SampleFormat,
    SupportedFormats,
};
use tern_platform::bluetooth::{A2dpTransport, ScoTransport};

use crate::devices::bt::{A2dpBackend, HfpBackend};
use crate::devices::empty::EmptyBackend;
use crate::devices::loopback::{loopback_format, LoopbackBackend, LoopbackKind, LoopbackTap};
use crate::devices::sim::{SimBackend, SimHandle};
use crate::error::{EngineError, EngineResult};
use crate::node::{Node, NodeId, NodeType};

#[cfg(target_os = "linux")]
use tern_platform::alsa_pcm::AlsaPcm;

/// Lifecycle state of a device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeviceState {
    Closed,
    Open,
    Running,
    Suspended,
}

/// Backend variants, each owning its transport state exclusively
pub enum Backend {
    #[cfg(target_os = "linux")]
    Alsa(AlsaPcm),
    A2dp(A2dpBackend),
    Hfp(HfpBackend),
    Empty(EmptyBackend),
    Loopback(LoopbackBackend),
    Sim(SimBackend),
}

impl Backend {
    fn kind_name(&self) -> &'static str {
        match self {
            #[cfg(target_os = "linux")]
            Backend::Alsa(_) => "alsa",
            Backend::A2dp(_) => "a2dp",
            Backend::Hfp(_) => "hfp",
            Backend::Empty(_) => "empty",
            Backend::Loopback(_) => "loopback",
            Backend::Sim(_) => "sim",
        }
    }
}

/// One device as the engine sees it
pub struct Iodev {
    index: u32,
    name: String,
    direction: Direction,
    nodes: Vec<Node>,
    active_node: usize,
    supported: SupportedFormats,
    format: Option<AudioFormat>,
    buffer_frames: usize,
    state: DeviceState,
    no_stream_state: bool,
    backend: Backend,
}

impl Iodev {
    fn new(name: &str, direction: Direction, supported: SupportedFormats, backend: Backend) -> Self {
        Self {
            index: 0,
            name: name.to_string(),
            direction,
            nodes: Vec::new(),
            active_node: 0,
            supported,
            format: None,
            buffer_frames: 0,
            state: DeviceState::Closed,
            no_stream_state: false,
            backend,
        }
    }

    /// The always-available silence device for a direction
    pub fn empty(direction: Direction) -> Self {
        let name = match direction {
            Direction::Output => "Fallback Output",
            Direction::Input => "Fallback Input",
        };
        let supported = SupportedFormats {
            rates: vec![8_000, 16_000, 44_100, 48_000],
            channel_counts: vec![1, 2],
            sample_formats: vec![SampleFormat::S16Le, SampleFormat::S32Le],
            layouts: vec![ChannelLayout::mono(), ChannelLayout::stereo()],
            variable_positions: false,
        };
        let mut dev = Self::new(name, direction, supported, Backend::Empty(EmptyBackend::new(direction)));
        dev.nodes.push(Node::new(0, name, NodeType::Fallback));
        dev
    }

    /// Virtual capture device tapping an output mix
    pub fn loopback(kind: LoopbackKind) -> Self {
        let (name, node_type) = match kind {
            LoopbackKind::PostMixPreDsp => ("Loopback Post Mix", NodeType::LoopbackPostMix),
            LoopbackKind::PostDsp => ("Loopback Post DSP", NodeType::LoopbackPostDsp),
            LoopbackKind::PostDspDelayed => ("Loopback Post DSP Delayed", NodeType::LoopbackPostDsp),
        };
        let supported = SupportedFormats::fixed(&loopback_format());
        let mut dev = Self::new(
            name,
            Direction::Input,
            supported,
            Backend::Loopback(LoopbackBackend::new(kind)),
        );
        dev.nodes.push(Node::new(0, name, node_type));
        dev
    }

    #[cfg(target_os = "linux")]
    /// Wrap an opened ALSA PCM. Nodes come from the enumeration layer.
    pub fn alsa(name: &str, pcm: AlsaPcm, nodes: Vec<Node>) -> EngineResult<Self> {
        let supported = pcm.probe_supported()?;
        let direction = pcm.direction();
        let mut dev = Self::new(name, direction, supported, Backend::Alsa(pcm));
        dev.nodes = nodes;
        if dev.nodes.is_empty() {
            dev.nodes.push(Node::new(0, name, NodeType::Speaker));
        }
        Ok(dev)
    }

    /// Wrap an acquired A2DP transport (output only)
    pub fn a2dp(name: &str, transport: A2dpTransport) -> Self {
        let supported = SupportedFormats::fixed(transport.format());
        let mut dev = Self::new(
            name,
            Direction::Output,
            supported,
            Backend::A2dp(A2dpBackend::new(transport)),
        );
        let mut node = Node::new(0, name, NodeType::BluetoothA2dp);
        // Absolute volume lives on the headset
        node.software_volume_needed = false;
        dev.nodes.push(node);
        dev
    }

    /// Wrap an acquired HFP SCO transport for one direction
    pub fn hfp(name: &str, transport: ScoTransport, direction: Direction) -> Self {
        let supported = SupportedFormats::fixed(transport.format());
        let mut dev = Self::new(
            name,
            direction,
            supported,
            Backend::Hfp(HfpBackend::new(transport, direction)),
        );
        dev.nodes.push(Node::new(0, name, NodeType::BluetoothHfp));
        dev
    }

    /// Scriptable backend for tests
    pub fn sim(name: &str, direction: Direction) -> (Self, SimHandle) {
        let (backend, handle) = SimBackend::new(direction);
        let supported = SupportedFormats {
            rates: vec![16_000, 44_100, 48_000],
            channel_counts: vec![1, 2],
            sample_formats: vec![SampleFormat::S16Le, SampleFormat::S32Le],
            layouts: vec![ChannelLayout::mono(), ChannelLayout::stereo()],
            variable_positions: false,
        };
        let mut dev = Self::new(name, direction, supported, Backend::Sim(backend));
        dev.nodes.push(Node::new(0, name, NodeType::Speaker));
        (dev, handle)
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Assign the device index (done by the device list on add)
    pub fn set_index(&mut self, index: u32) {
        self.index = index;
        for node in &mut self.nodes {
            node.dev_index = index;
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn backend_kind(&self) -> &'static str {
        self.backend.kind_name()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state != DeviceState::Closed
    }

    pub fn format(&self) -> Option<&AudioFormat> {
        self.format.as_ref()
    }

    pub fn buffer_frames(&self) -> usize {
        self.buffer_frames
    }

    pub fn supported(&self) -> &SupportedFormats {
        &self.supported
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Node] {
        &mut self.nodes
    }

    pub fn active_node(&self) -> &Node {
        &self.nodes[self.active_node]
    }

    pub fn active_node_mut(&mut self) -> &mut Node {
        &mut self.nodes[self.active_node]
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.iter_mut().find(|n| n.id == id)
    }

    /// Loopback only: take the tap producer for the engine's hook list
    pub fn take_loopback_tap(&mut self) -> Option<LoopbackTap> {
        match &mut self.backend {
            Backend::Loopback(b) => b.take_tap(),
            _ => None,
        }
    }

    pub fn loopback_kind(&self) -> Option<LoopbackKind> {
        match &self.backend {
            Backend::Loopback(b) => Some(b.kind()),
            _ => None,
        }
    }

    /// Choose the format to bind for this device given the formats of the
    /// streams that will attach.
    pub fn negotiate(&self, stream_formats: &[AudioFormat]) -> EngineResult<AudioFormat> {
        let sup = &self.supported;

        let want_rate = stream_formats
            .iter()
            .map(|f| f.frame_rate)
            .max()
            .unwrap_or(48_000);
        let frame_rate = if sup.rates.is_empty() || sup.rates.contains(&want_rate) {
            want_rate
        } else {
            *sup.rates
                .iter()
                .min_by_key(|&&r| (r as i64 - want_rate as i64).abs())
                .unwrap()
        };

        let want_ch = stream_formats
            .iter()
            .map(|f| f.num_channels)
            .max()
            .unwrap_or(2);
        let num_channels = if sup.channel_counts.is_empty() || sup.channel_counts.contains(&want_ch)
        {
            want_ch
        } else {
            sup.channel_counts
                .iter()
                .copied()
                .filter(|&c| c > want_ch)
                .min()
                .or_else(|| sup.channel_counts.iter().copied().max())
                .ok_or(EngineError::FormatNegotiationFailed)?
        };

        const PRIORITY: [SampleFormat; 4] = [
            SampleFormat::S32Le,
            SampleFormat::S24Le,
            SampleFormat::S16Le,
            SampleFormat::U8,
        ];
        let sample_format = if sup.sample_formats.is_empty() {
            SampleFormat::S16Le
        } else {
            PRIORITY
                .iter()
                .copied()
                .find(|f| {
                    sup.sample_formats.contains(f)
                        && stream_formats.iter().any(|s| s.sample_format == *f)
                })
                .or_else(|| {
                    PRIORITY
                        .iter()
                        .copied()
                        .find(|f| sup.sample_formats.contains(f))
                })
                .ok_or(EngineError::FormatNegotiationFailed)?
        };

        let wanted_layout = stream_formats
            .iter()
            .max_by_key(|f| f.num_channels)
            .map(|f| f.channel_layout)
            .filter(|l| l.channel_count() == num_channels)
            .unwrap_or_else(|| ChannelLayout::default_for(num_channels));
        let channel_layout = if sup.layouts.is_empty() {
            wanted_layout
        } else {
            match select_layout(
                &wanted_layout,
                &sup.layouts,
                sup.variable_positions,
                self.direction == Direction::Input,
            ) {
                Some(LayoutMatch::Exact(_)) | Some(LayoutMatch::Reordered(_)) => wanted_layout,
                Some(LayoutMatch::PairSwapped(i))
                | Some(LayoutMatch::Matrix(i))
                | Some(LayoutMatch::CountOnly(i)) => sup.layouts[i],
                None => ChannelLayout::default_for(num_channels),
            }
        };

        Ok(AudioFormat {
            frame_rate,
            num_channels,
            sample_format,
            channel_layout,
        })
    }

    /// Bind a format and open the backend. While open, exactly one format
    /// is bound and buffer geometry is fixed.
    pub fn configure(
        &mut self,
        format: &AudioFormat,
        buffer_frames_hint: usize,
    ) -> EngineResult<()> {
        // The hardware hint must be even-valued
        let hint = (buffer_frames_hint & !1).max(2);
        let mut bound = *format;
        let buffer_frames = match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => pcm.configure(format, hint)?.buffer_frames,
            Backend::A2dp(b) => {
                bound = b.format();
                b.configure(hint)
            }
            Backend::Hfp(b) => {
                bound = b.format();
                b.configure(hint)
            }
            Backend::Empty(b) => b.configure(format, hint),
            Backend::Loopback(b) => {
                bound = loopback_format();
                b.configure()
            }
            Backend::Sim(b) => b.configure(format, hint),
        };
        self.format = Some(bound);
        self.buffer_frames = buffer_frames;
        self.state = DeviceState::Open;
        Ok(())
    }

    pub fn close(&mut self) -> EngineResult<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => {
                let _ = pcm.flush();
            }
            Backend::A2dp(b) => b.close(),
            Backend::Hfp(b) => b.close(),
            Backend::Empty(b) => b.close(),
            Backend::Loopback(b) => b.close(),
            Backend::Sim(b) => b.close(),
        }
        self.format = None;
        self.buffer_frames = 0;
        self.state = DeviceState::Closed;
        self.no_stream_state = false;
        Ok(())
    }

    pub fn frames_queued(&mut self) -> EngineResult<usize> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => Ok(pcm.frames_queued()?),
            Backend::A2dp(b) => b.frames_queued(),
            Backend::Hfp(b) => b.frames_queued(),
            Backend::Empty(b) => b.frames_queued(),
            Backend::Loopback(b) => b.frames_queued(),
            Backend::Sim(b) => b.frames_queued(),
        }
    }

    pub fn delay_frames(&mut self) -> EngineResult<usize> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => Ok(pcm.delay_frames()?),
            Backend::A2dp(b) => b.frames_queued(),
            Backend::Hfp(b) => b.frames_queued(),
            Backend::Empty(b) => b.delay_frames(),
            Backend::Loopback(b) => b.delay_frames(),
            Backend::Sim(b) => b.frames_queued(),
        }
    }

    /// Borrow up to `frames` frames of device-format bytes. The returned
    /// slice length reports the granted frame count.
    pub fn get_buffer(&mut self, frames: usize) -> EngineResult<&mut [u8]> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => {
                if self.direction == Direction::Input {
                    let got = pcm.read(frames)?;
                    Ok(pcm.window(got)?)
                } else {
                    Ok(pcm.window(frames)?)
                }
            }
            Backend::A2dp(b) => b.get_buffer(frames),
            Backend::Hfp(b) => b.get_buffer(frames),
            Backend::Empty(b) => b.get_buffer(frames),
            Backend::Loopback(b) => b.get_buffer(frames),
            Backend::Sim(b) => b.get_buffer(frames),
        }
    }

    /// Commit `frames` frames from the window. Returns frames accepted.
    pub fn put_buffer(&mut self, frames: usize) -> EngineResult<usize> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => {
                if self.direction == Direction::Output {
                    Ok(pcm.commit(frames)?)
                } else {
                    Ok(frames)
                }
            }
            Backend::A2dp(b) => b.put_buffer(frames),
            Backend::Hfp(b) => b.put_buffer(frames),
            Backend::Empty(b) => b.put_buffer(frames),
            Backend::Loopback(b) => b.put_buffer(frames),
            Backend::Sim(b) => b.put_buffer(frames),
        }
    }

    /// Drop everything queued and return to a primed state
    pub fn flush_buffer(&mut self) -> EngineResult<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => pcm.flush()?,
            Backend::A2dp(b) => b.flush(),
            Backend::Hfp(b) => b.flush(),
            Backend::Empty(b) => b.flush(),
            Backend::Loopback(b) => b.flush(),
            Backend::Sim(b) => b.flush(),
        }
        Ok(())
    }

    pub fn start(&mut self) -> EngineResult<()> {
        match &mut self.backend {
            #[cfg(target_os = "linux")]
            Backend::Alsa(pcm) => pcm.start()?,
            Backend::A2dp(b) => b.start(),
            Backend::Hfp(b) => b.start(),
            Backend::Empty(b) => b.start(),
            Backend::Loopback(_) => {}
            Backend::Sim(b) => b.start(),
        }
        self.state = DeviceState::Running;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.state == DeviceState::Running
    }

    /// Tell the backend no streams are attached; it keeps the clock alive
    /// with silence until one arrives.
    pub fn no_stream(&mut self, enable: bool) -> EngineResult<()> {
        self.no_stream_state = enable;
        Ok(())
    }

    pub fn in_no_stream(&self) -> bool {
        self.no_stream_state
    }

    /// Rebind the channel layout of the open format
    pub fn update_channel_layout(&mut self, layout: &ChannelLayout) -> EngineResult<()> {
        let format = self.format.as_mut().ok_or(EngineError::DeviceNotOpen)?;
        if layout.channel_count() != format.num_channels {
            return Err(EngineError::Dsp(tern_dsp::DspError::LayoutMismatch(
                layout.channel_count(),
            )));
        }
        format.channel_layout = *layout;
        Ok(())
    }

    pub fn update_active_node(&mut self, id: NodeId) -> EngineResult<()> {
        let pos = self
            .nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(EngineError::DeviceNotFound(self.index))?;
        self.active_node = pos;
        Ok(())
    }

    pub fn suspend(&mut self) -> EngineResult<()> {
        #[cfg(target_os = "linux")]
        if let Backend::Alsa(pcm) = &mut self.backend {
            pcm.suspend()?;
        }
        self.state = DeviceState::Suspended;
        Ok(())
    }

    /// Attempt to resume a suspended device; ends Open (caller re-primes
    /// and re-starts).
    pub fn resume(&mut self) -> EngineResult<()> {
        #[cfg(target_os = "linux")]
        if let Backend::Alsa(pcm) = &mut self.backend {
            pcm.resume()?;
        }
        self.state = DeviceState::Open;
        Ok(())
    }
}

impl std::fmt::Debug for Iodev {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Iodev")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("direction", &self.direction)
            .field("backend", &self.backend.kind_name())
            .field("state", &self.state)
            .finish()
    }
}
