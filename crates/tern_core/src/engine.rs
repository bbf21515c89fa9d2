//! Audio Engine Thread
//!
//! One soft-real-time thread services every open device cooperatively:
//!
//! ```text
//! loop {
//!     drain control commands          (never blocks mid-cycle)
//!     sleep until the earliest device deadline, or a command arrives
//!     service due devices in deadline order:
//!       output: frames_queued -> pull streams -> mix -> volume ->
//!               taps/DSP -> get_buffer/put_buffer -> maybe start
//!       input:  frames_queued -> get_buffer -> push into streams
//!     answer pending drains
//! }
//! ```
//!
//! The cycle never allocates: mix and conversion buffers are sized when a
//! device opens, loopback taps drop what does not fit, and synchronous
//! replies go through pre-armed bounded channels.
//!
//! Backend errors split two ways: recoverable (xrun/suspend) flushes and
//! re-primes the device on its next deadline; anything else removes the
//! device and surfaces `DeviceFailed` so the control plane can reroute.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use tern_dsp::{f32_to_interleaved, scale, silence, swap_left_right, Direction, VolumeCurve};

use crate::dev_stream::DevStream;
use crate::devices::loopback::{LoopbackKind, LoopbackTap};
use crate::error::{EngineError, EngineResult};
use crate::iodev::Iodev;
use crate::message::{DeviceSnapshot, EngineCommand, EngineEvent, EngineSnapshot, StreamSnapshot};
use crate::stream::{RStream, StreamId};

/// Buffer-size hint handed to backends at configure
pub const DEV_BUFFER_HINT_FRAMES: usize = 2048;
/// Fallback target level when no stream dictates one (frames)
const DEFAULT_TARGET_FRACTION: usize = 4;
/// Floor on computed sleep intervals
const MIN_SLEEP: Duration = Duration::from_millis(1);
/// Severe-underrun warnings are limited to one per device per this window
const SEVERE_WARN_INTERVAL: Duration = Duration::from_secs(30);

/// Severe-underrun margin for a buffer size: `queued` beyond
/// `buffer + margin` means the hardware pointer ran away and the device is
/// re-primed.
pub fn severe_underrun_margin(buffer_frames: usize) -> usize {
    buffer_frames / 2
}

/// Handle to the engine thread. Lives on the control thread; commands go
/// through [`sender`](Self::sender), events come back on
/// [`events`](Self::events).
pub struct AudioEngine {
    cmd_tx: Sender<EngineCommand>,
    event_rx: Receiver<EngineEvent>,
    thread: Option<JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl AudioEngine {
    /// Spawn the engine thread
    pub fn start() -> EngineResult<Self> {
        let (cmd_tx, cmd_rx) = bounded::<EngineCommand>(64);
        let (event_tx, event_rx) = unbounded::<EngineEvent>();
        let shutdown = Arc::new(AtomicBool::new(false));

        let shutdown_clone = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("tern-audio".into())
            .spawn(move || {
                EngineThread::new(cmd_rx, event_tx, shutdown_clone).run();
            })
            .map_err(EngineError::Io)?;

        Ok(Self {
            cmd_tx,
            event_rx,
            thread: Some(thread),
            shutdown,
        })
    }

    pub fn sender(&self) -> Sender<EngineCommand> {
        self.cmd_tx.clone()
    }

    pub fn events(&self) -> &Receiver<EngineEvent> {
        &self.event_rx
    }

    pub fn send(&self, command: EngineCommand) -> EngineResult<()> {
        self.cmd_tx
            .send(command)
            .map_err(|_| EngineError::ChannelSend)
    }

    pub fn add_stream(&self, stream: RStream) -> EngineResult<()> {
        self.send(EngineCommand::AddStream { stream })
    }

    pub fn remove_stream(&self, id: StreamId) -> EngineResult<()> {
        self.send(EngineCommand::RemoveStream { id })
    }

    pub fn add_device(&self, dev: Iodev) -> EngineResult<()> {
        self.send(EngineCommand::AddDev { dev })
    }

    pub fn remove_device(&self, index: u32) -> EngineResult<()> {
        self.send(EngineCommand::RemoveDev { index })
    }

    /// Block until the stream's ring is empty or `timeout` passes.
    /// Returns 0, or a negative errno (-EINVAL unknown stream,
    /// -ETIMEDOUT on timeout). The engine itself never blocks on this.
    pub fn drain_stream(&self, id: StreamId, timeout: Duration) -> i32 {
        let (reply_tx, reply_rx) = bounded(1);
        if self
            .send(EngineCommand::Drain {
                id,
                reply: reply_tx,
            })
            .is_err()
        {
            return -libc::EINVAL;
        }
        match reply_rx.recv_timeout(timeout) {
            Ok(code) => code,
            Err(_) => -libc::ETIMEDOUT,
        }
    }

    /// Fetch a state snapshot; `None` if the engine is gone
    pub fn dump(&self, timeout: Duration) -> Option<EngineSnapshot> {
        let (reply_tx, reply_rx) = bounded(1);
        self.send(EngineCommand::Dump { reply: reply_tx }).ok()?;
        reply_rx.recv_timeout(timeout).ok()
    }

    pub fn suspend(&self) -> EngineResult<()> {
        self.send(EngineCommand::Suspend)
    }

    pub fn resume(&self) -> EngineResult<()> {
        self.send(EngineCommand::Resume)
    }
}

impl Drop for AudioEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.cmd_tx.send(EngineCommand::Shutdown);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

/// A loopback tap registered on an output device
struct TapHook {
    /// Device index of the loopback iodev that owns the consumer side
    loopback_index: u32,
    /// Output device currently tapped
    target: Option<u32>,
    kind: LoopbackKind,
    tap: LoopbackTap,
}

/// One open device inside the engine
struct OpenDev {
    dev: Iodev,
    dev_streams: Vec<DevStream>,
    /// Pre-sized f32 mix scratch (buffer_frames x channels)
    mix: Vec<f32>,
    /// Level the deadline scheduler steers toward, in device frames
    target_level: usize,
    /// Whether unpinned streams may attach (false once routing moved on)
    attach_unpinned: bool,
    frames_serviced: u64,
    started_at: Option<Instant>,
    next_wake: Instant,
    last_severe_warn: Option<Instant>,
    /// Optional post-mix processing stage
    dsp: Option<Box<dyn FnMut(&mut [f32], usize) + Send>>,
}

enum ServiceOutcome {
    Ok,
    /// Unrecoverable backend failure; drop the device
    Failed,
}

struct EngineThread {
    cmd_rx: Receiver<EngineCommand>,
    event_tx: Sender<EngineEvent>,
    shutdown: Arc<AtomicBool>,
    devices: Vec<OpenDev>,
    streams: Vec<Rc<RefCell<RStream>>>,
    taps: Vec<TapHook>,
    pending_drains: Vec<(StreamId, Sender<i32>)>,
    suspended: bool,
    system_volume: u8,
    system_muted: bool,
    system_curve: VolumeCurve,
    /// Reused service-order scratch
    due: Vec<usize>,
}

impl EngineThread {
    fn new(
        cmd_rx: Receiver<EngineCommand>,
        event_tx: Sender<EngineEvent>,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            cmd_rx,
            event_tx,
            shutdown,
            devices: Vec::new(),
            streams: Vec::new(),
            taps: Vec::new(),
            pending_drains: Vec::new(),
            suspended: false,
            system_volume: 100,
            system_muted: false,
            system_curve: VolumeCurve::default(),
            due: Vec::new(),
        }
    }

    fn run(mut self) {
        info!("audio thread started");
        loop {
            // Commands are handled before any device is serviced in the
            // iteration.
            loop {
                match self.cmd_rx.try_recv() {
                    Ok(EngineCommand::Shutdown) => {
                        info!("audio thread shutting down");
                        return;
                    }
                    Ok(cmd) => self.handle_command(cmd),
                    Err(_) => break,
                }
            }
            if self.shutdown.load(Ordering::SeqCst) {
                info!("audio thread shutting down");
                return;
            }

            let deadline = self
                .devices
                .iter()
                .filter(|d| d.dev.is_open())
                .map(|d| d.next_wake)
                .min();

            let wait = match deadline {
                _ if self.suspended => Duration::from_millis(500),
                Some(t) => t.saturating_duration_since(Instant::now()),
                None => Duration::from_millis(500),
            };
            if !wait.is_zero() {
                match self.cmd_rx.recv_timeout(wait) {
                    Ok(EngineCommand::Shutdown) => {
                        info!("audio thread shutting down");
                        return;
                    }
                    Ok(cmd) => {
                        self.handle_command(cmd);
                        continue;
                    }
                    Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => {
                        warn!("command channel disconnected");
                        return;
                    }
                }
            }

            if !self.suspended {
                self.service_due_devices();
            }
            self.check_drains();
        }
    }

    fn handle_command(&mut self, command: EngineCommand) {
        match command {
            EngineCommand::AddStream { stream } => self.add_stream(stream),
            EngineCommand::RemoveStream { id } => self.remove_stream(id),
            EngineCommand::AddDev { dev } => self.add_device(dev),
            EngineCommand::RemoveDev { index } => self.remove_device(index, true),
            EngineCommand::DetachUnpinned { index } => self.detach_unpinned(index),
            EngineCommand::Drain { id, reply } => {
                if self.streams.iter().any(|s| s.borrow().id() == id) {
                    self.pending_drains.push((id, reply));
                } else {
                    let _ = reply.send(-libc::EINVAL);
                }
            }
            EngineCommand::Suspend => {
                self.suspended = true;
                for od in &mut self.devices {
                    if od.dev.is_open() {
                        let _ = od.dev.suspend();
                    }
                }
                info!("engine suspended");
            }
            EngineCommand::Resume => {
                self.suspended = false;
                let now = Instant::now();
                for od in &mut self.devices {
                    let _ = od.dev.resume();
                    let _ = od.dev.flush_buffer();
                    od.started_at = None;
                    od.frames_serviced = 0;
                    od.next_wake = now;
                    if od.dev.direction() == Direction::Input {
                        let _ = od.dev.start();
                        od.started_at = Some(now);
                    }
                }
                info!("engine resumed");
            }
            EngineCommand::Dump { reply } => {
                let _ = reply.send(self.snapshot());
            }
            EngineCommand::SetNodeVolume {
                dev_index,
                node,
                volume,
            } => {
                if let Some(od) = self.devices.iter_mut().find(|d| d.dev.index() == dev_index) {
                    if let Some(n) = od.dev.node_mut(node) {
                        n.volume = volume.min(100);
                    }
                }
            }
            EngineCommand::SetNodeSwapLeftRight {
                dev_index,
                node,
                swap,
            } => {
                if let Some(od) = self.devices.iter_mut().find(|d| d.dev.index() == dev_index) {
                    if let Some(n) = od.dev.node_mut(node) {
                        n.left_right_swapped = swap;
                    }
                }
            }
            EngineCommand::SetActiveNode { dev_index, node } => {
                if let Some(od) = self.devices.iter_mut().find(|d| d.dev.index() == dev_index) {
                    if let Err(e) = od.dev.update_active_node(node) {
                        warn!(dev_index, error = %e, "active node update failed");
                    }
                }
            }
            EngineCommand::SetSystemVolume { volume, muted } => {
                self.system_volume = volume.min(100);
                self.system_muted = muted;
            }
            EngineCommand::SwitchStreamType { id, client_type } => {
                if let Some(s) = self.streams.iter().find(|s| s.borrow().id() == id) {
                    s.borrow_mut().switch_client_type(client_type);
                }
            }
            EngineCommand::Shutdown => unreachable!("handled by the caller"),
        }
    }

    fn system_scaler(&self) -> f32 {
        if self.system_muted {
            return 0.0;
        }
        self.system_curve.scaler_at(self.system_volume as usize)
    }

    // ---- stream management ----

    fn add_stream(&mut self, stream: RStream) {
        let id = stream.id();
        debug!(%id, "adding stream");
        let stream = Rc::new(RefCell::new(stream));
        for od in &mut self.devices {
            if Self::should_attach(&stream.borrow(), od) {
                match Self::make_dev_stream(&stream, od) {
                    Ok(ds) => {
                        od.dev_streams.push(ds);
                        let _ = od.dev.no_stream(false);
                    }
                    Err(e) => warn!(%id, error = %e, "failed to attach stream"),
                }
            }
        }
        self.streams.push(stream);
        self.retarget_levels();
    }

    fn should_attach(stream: &RStream, od: &OpenDev) -> bool {
        if stream.direction() != od.dev.direction() || !od.dev.is_open() {
            return false;
        }
        match stream.params().pinned_dev {
            Some(pin) => pin == od.dev.index(),
            None => od.attach_unpinned,
        }
    }

    fn make_dev_stream(stream: &Rc<RefCell<RStream>>, od: &OpenDev) -> EngineResult<DevStream> {
        let format = *od.dev.format().ok_or(EngineError::DeviceNotOpen)?;
        DevStream::new(
            Rc::clone(stream),
            od.dev.index(),
            &format,
            od.dev.buffer_frames(),
        )
    }

    fn remove_stream(&mut self, id: StreamId) {
        for od in &mut self.devices {
            od.dev_streams
                .retain(|ds| ds.stream().borrow().id() != id);
            if od.dev_streams.is_empty() {
                let _ = od.dev.no_stream(true);
            }
        }
        let before = self.streams.len();
        self.streams.retain(|s| s.borrow().id() != id);
        if self.streams.len() < before {
            debug!(%id, "stream removed");
            let _ = self.event_tx.send(EngineEvent::StreamRemoved { id });
        }
        self.pending_drains.retain(|(drain_id, reply)| {
            if *drain_id == id {
                let _ = reply.send(-libc::EINVAL);
                false
            } else {
                true
            }
        });
        self.retarget_levels();
    }

    // ---- device management ----

    fn add_device(&mut self, mut dev: Iodev) {
        let index = dev.index();
        let direction = dev.direction();
        debug!(index, name = dev.name(), "adding device");

        // Negotiate against the streams that will attach
        let formats: Vec<_> = self
            .streams
            .iter()
            .map(|s| s.borrow())
            .filter(|s| {
                s.direction() == direction
                    && match s.params().pinned_dev {
                        Some(pin) => pin == index,
                        None => true,
                    }
            })
            .map(|s| *s.format())
            .collect();

        let format = match dev.negotiate(&formats) {
            Ok(f) => f,
            Err(e) => {
                warn!(index, error = %e, "format negotiation failed");
                let _ = self.event_tx.send(EngineEvent::DeviceFailed { index });
                let _ = self
                    .event_tx
                    .send(EngineEvent::DeviceClosed { dev: Box::new(dev) });
                return;
            }
        };
        if let Err(e) = dev.configure(&format, DEV_BUFFER_HINT_FRAMES) {
            warn!(index, error = %e, "device configure failed");
            let _ = self.event_tx.send(EngineEvent::DeviceFailed { index });
            let _ = self
                .event_tx
                .send(EngineEvent::DeviceClosed { dev: Box::new(dev) });
            return;
        }

        // Loopback devices hand their producer side to the hook list,
        // tapping the first open output.
        if let Some(tap) = dev.take_loopback_tap() {
            let target = self.first_output_index();
            self.taps.push(TapHook {
                loopback_index: index,
                target,
                kind: tap.kind(),
                tap,
            });
        }

        let buffer = dev.buffer_frames();
        let channels = format.num_channels;
        let mut od = OpenDev {
            dev,
            dev_streams: Vec::new(),
            mix: vec![0.0; buffer * channels],
            target_level: buffer / DEFAULT_TARGET_FRACTION,
            attach_unpinned: true,
            frames_serviced: 0,
            started_at: None,
            next_wake: Instant::now(),
            last_severe_warn: None,
            dsp: None,
        };

        for stream in &self.streams {
            if Self::should_attach(&stream.borrow(), &od) {
                match Self::make_dev_stream(stream, &od) {
                    Ok(ds) => od.dev_streams.push(ds),
                    Err(e) => warn!(error = %e, "failed to attach stream to new device"),
                }
            }
        }
        let _ = od.dev.no_stream(od.dev_streams.is_empty());

        // Capture clocks run from open; playback starts at fill threshold
        if direction == Direction::Input {
            if od.dev.start().is_ok() {
                od.started_at = Some(Instant::now());
            }
        }

        self.devices.push(od);
        self.retarget_levels();
        self.retarget_taps();
    }

    fn remove_device(&mut self, index: u32, return_dev: bool) {
        let Some(pos) = self.devices.iter().position(|d| d.dev.index() == index) else {
            return;
        };
        let mut od = self.devices.remove(pos);
        debug!(index, name = od.dev.name(), "removing device");

        od.dev_streams.clear();
        let _ = od.dev.close();

        // Drop this device's own tap, then move taps aimed at it
        self.taps.retain(|t| t.loopback_index != index);
        self.retarget_taps();

        if return_dev {
            let _ = self
                .event_tx
                .send(EngineEvent::DeviceClosed { dev: Box::new(od.dev) });
        }
    }

    fn detach_unpinned(&mut self, index: u32) {
        if let Some(od) = self.devices.iter_mut().find(|d| d.dev.index() == index) {
            od.attach_unpinned = false;
            od.dev_streams
                .retain(|ds| ds.stream().borrow().params().pinned_dev == Some(index));
            if od.dev_streams.is_empty() {
                let _ = od.dev.no_stream(true);
            }
        }
    }

    fn first_output_index(&self) -> Option<u32> {
        self.devices
            .iter()
            .find(|d| d.dev.direction() == Direction::Output && d.dev.is_open())
            .map(|d| d.dev.index())
    }

    /// Point every tap at the first enabled output (or nothing)
    fn retarget_taps(&mut self) {
        let target = self.first_output_index();
        for hook in &mut self.taps {
            if hook.target != target {
                debug!(
                    loopback = hook.loopback_index,
                    ?target,
                    "loopback tap migrating"
                );
                hook.target = target;
            }
        }
    }

    /// Recompute per-device target levels from attached streams' callback
    /// thresholds, scaled to the device rate.
    fn retarget_levels(&mut self) {
        for od in &mut self.devices {
            let Some(format) = od.dev.format().copied() else {
                continue;
            };
            let buffer = od.dev.buffer_frames();
            let mut target = buffer / DEFAULT_TARGET_FRACTION;
            for ds in &od.dev_streams {
                let s = ds.stream().borrow();
                let scaled = s.cb_threshold() as u64 * format.frame_rate as u64
                    / s.format().frame_rate.max(1) as u64;
                target = target.max(scaled as usize);
            }
            od.target_level = target.min(buffer / 2).max(1);
        }
    }

    // ---- service cycle ----

    fn service_due_devices(&mut self) {
        let now = Instant::now();
        let mut due = std::mem::take(&mut self.due);
        due.clear();
        for (i, od) in self.devices.iter().enumerate() {
            if od.dev.is_open() && od.next_wake <= now {
                due.push(i);
            }
        }
        // Strict deadline order across devices
        due.sort_by_key(|&i| self.devices[i].next_wake);

        let mut failed: Vec<u32> = Vec::new();
        for &i in &due {
            let index = self.devices[i].dev.index();
            match self.service_device(i) {
                ServiceOutcome::Ok => {}
                ServiceOutcome::Failed => failed.push(index),
            }
        }
        self.due = due;

        for index in failed {
            warn!(index, "device failed, removing");
            let _ = self.event_tx.send(EngineEvent::DeviceFailed { index });
            self.remove_device(index, true);
        }
    }

    fn service_device(&mut self, i: usize) -> ServiceOutcome {
        let direction = self.devices[i].dev.direction();

        let queued = match self.devices[i].dev.frames_queued() {
            Ok(q) => q,
            Err(e) if e.is_recoverable() => {
                debug!(error = %e, "recoverable backend error, re-priming");
                let od = &mut self.devices[i];
                let _ = od.dev.flush_buffer();
                od.frames_serviced = 0;
                od.started_at = None;
                od.next_wake = Instant::now() + MIN_SLEEP;
                return ServiceOutcome::Ok;
            }
            Err(_) => return ServiceOutcome::Failed,
        };

        let buffer = self.devices[i].dev.buffer_frames();
        if queued > buffer + severe_underrun_margin(buffer) {
            return self.recover_severe(i, queued);
        }

        match direction {
            Direction::Output => self.service_output(i, queued),
            Direction::Input => self.service_input(i, queued),
        }
    }

    /// `frames_queued` beyond the severe threshold means lost time:
    /// re-prime with silence and carry on.
    fn recover_severe(&mut self, i: usize, queued: usize) -> ServiceOutcome {
        let od = &mut self.devices[i];
        let index = od.dev.index();
        let now = Instant::now();
        let should_warn = od
            .last_severe_warn
            .map_or(true, |t| now.duration_since(t) >= SEVERE_WARN_INTERVAL);
        if should_warn {
            warn!(
                index,
                queued,
                buffer = od.dev.buffer_frames(),
                "severe underrun, re-priming with silence"
            );
            od.last_severe_warn = Some(now);
        }

        if od.dev.flush_buffer().is_err() {
            return ServiceOutcome::Failed;
        }
        od.frames_serviced = 0;
        od.started_at = None;
        od.next_wake = now + MIN_SLEEP;
        let _ = self.event_tx.send(EngineEvent::SevereUnderrun { dev_index: index });
        ServiceOutcome::Ok
    }

    fn service_output(&mut self, i: usize, queued: usize) -> ServiceOutcome {
        let system_scaler = self.system_scaler();
        let muted = self.system_muted;
        let od = &mut self.devices[i];
        let index = od.dev.index();
        let Some(format) = od.dev.format().copied() else {
            return ServiceOutcome::Failed;
        };
        let channels = format.num_channels;
        let buffer = od.dev.buffer_frames();
        let free = buffer.saturating_sub(queued);

        let mut written = 0usize;
        let mut underruns: Vec<StreamId> = Vec::new();
        if free > 0 {
            let started = od.started_at.is_some();
            let mix = &mut od.mix[..free * channels];
            silence(mix);

            // Streams are pulled in insertion order; each gets the same
            // window so none can starve another.
            for ds in &mut od.dev_streams {
                let result = ds.pull_output(mix, free, 1.0);
                if result.underrun && started {
                    underruns.push(ds.stream().borrow().id());
                }
            }

            // Software volume and mute at the node level
            let node = od.dev.active_node();
            let scaler = node.volume_scaler() * system_scaler;
            let swap = node.left_right_swapped;
            if muted {
                silence(mix);
            } else {
                scale(mix, scaler);
            }
            if swap {
                swap_left_right(mix, channels);
            }

            // Tap, DSP, tap again: pre-DSP hooks see the mixed/attenuated
            // signal, post-DSP hooks the processed one.
            for hook in &mut self.taps {
                if hook.target == Some(index) && hook.kind == LoopbackKind::PostMixPreDsp {
                    hook.tap.push_mix(mix, channels);
                }
            }
            if let Some(dsp) = od.dsp.as_mut() {
                dsp(mix, channels);
            }
            for hook in &mut self.taps {
                if hook.target == Some(index) && hook.kind != LoopbackKind::PostMixPreDsp {
                    hook.tap.push_mix(mix, channels);
                }
            }

            // Commit to the backend window
            let granted = {
                let window = match od.dev.get_buffer(free) {
                    Ok(w) => w,
                    Err(e) if e.is_recoverable() => {
                        let _ = od.dev.flush_buffer();
                        od.next_wake = Instant::now() + MIN_SLEEP;
                        return ServiceOutcome::Ok;
                    }
                    Err(_) => return ServiceOutcome::Failed,
                };
                let granted = window.len() / format.frame_bytes();
                f32_to_interleaved(
                    format.sample_format,
                    &od.mix[..granted * channels],
                    window,
                );
                granted
            };
            written = match od.dev.put_buffer(granted) {
                Ok(n) => n,
                Err(e) if e.is_recoverable() => {
                    let _ = od.dev.flush_buffer();
                    od.next_wake = Instant::now() + MIN_SLEEP;
                    return ServiceOutcome::Ok;
                }
                Err(_) => return ServiceOutcome::Failed,
            };
            od.frames_serviced += written as u64;
        }

        let level = queued + written;
        if od.started_at.is_none() && level >= od.target_level {
            if od.dev.start().is_ok() {
                od.started_at = Some(Instant::now());
                debug!(index, level, "output device started");
            }
        }

        od.next_wake = Self::next_wake(od, level, &format, Direction::Output);

        for id in underruns {
            let _ = self.event_tx.send(EngineEvent::Underrun {
                dev_index: index,
                stream: id,
            });
        }
        ServiceOutcome::Ok
    }

    fn service_input(&mut self, i: usize, queued: usize) -> ServiceOutcome {
        let od = &mut self.devices[i];
        let Some(format) = od.dev.format().copied() else {
            return ServiceOutcome::Failed;
        };
        let gain = od.dev.active_node().volume_scaler();

        if queued > 0 {
            let granted = {
                let window = match od.dev.get_buffer(queued) {
                    Ok(w) => w,
                    Err(e) if e.is_recoverable() => {
                        let _ = od.dev.flush_buffer();
                        od.next_wake = Instant::now() + MIN_SLEEP;
                        return ServiceOutcome::Ok;
                    }
                    Err(_) => return ServiceOutcome::Failed,
                };
                let granted = window.len() / format.frame_bytes();
                for ds in &mut od.dev_streams {
                    ds.push_input(window, granted, gain);
                }
                granted
            };
            if od.dev.put_buffer(granted).is_err() {
                return ServiceOutcome::Failed;
            }
            od.frames_serviced += granted as u64;
        }

        let remaining = match od.dev.frames_queued() {
            Ok(q) => q,
            Err(_) => 0,
        };
        od.next_wake = Self::next_wake(od, remaining, &format, Direction::Input);
        ServiceOutcome::Ok
    }

    /// Deadline for the next service of a device, anchored at its start
    /// time: `start + (frames_consumed + sleep_frames) / rate`.
    fn next_wake(
        od: &OpenDev,
        level: usize,
        format: &tern_dsp::AudioFormat,
        direction: Direction,
    ) -> Instant {
        let rate = format.frame_rate.max(1) as f64;
        let sleep_frames = match direction {
            // Sleep until the hw level drains to the target
            Direction::Output => level.saturating_sub(od.target_level).max(1),
            // Sleep until a target's worth of capture accumulates
            Direction::Input => od.target_level.saturating_sub(level).max(1),
        };

        match od.started_at {
            Some(start) => {
                let consumed = od.frames_serviced.saturating_sub(level as u64);
                let t = start
                    + Duration::from_secs_f64((consumed + sleep_frames as u64) as f64 / rate);
                let floor = Instant::now() + MIN_SLEEP;
                t.max(floor)
            }
            None => Instant::now() + Duration::from_secs_f64(sleep_frames as f64 / rate).max(MIN_SLEEP),
        }
    }

    fn check_drains(&mut self) {
        if self.pending_drains.is_empty() {
            return;
        }
        let streams = &self.streams;
        self.pending_drains.retain(|(id, reply)| {
            match streams.iter().find(|s| s.borrow().id() == *id) {
                None => {
                    let _ = reply.send(-libc::EINVAL);
                    false
                }
                Some(s) => {
                    if s.borrow().shm_ref().readable_frames() == 0 {
                        let _ = reply.send(0);
                        false
                    } else {
                        true
                    }
                }
            }
        });
    }

    fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            suspended: self.suspended,
            devices: self
                .devices
                .iter()
                .map(|od| DeviceSnapshot {
                    index: od.dev.index(),
                    name: od.dev.name().to_string(),
                    direction: od.dev.direction(),
                    backend: od.dev.backend_kind(),
                    state: od.dev.state(),
                    buffer_frames: od.dev.buffer_frames(),
                    attached_streams: od.dev_streams.len(),
                    frames_serviced: od.frames_serviced,
                })
                .collect(),
            streams: self
                .streams
                .iter()
                .map(|s| {
                    let s = s.borrow();
                    StreamSnapshot {
                        id: s.id(),
                        direction: s.direction(),
                        client_type: s.params().client_type,
                        buffer_frames: s.params().buffer_frames,
                        cb_threshold: s.params().cb_threshold,
                        total_fetched: s.total_fetched,
                        underruns: s.underruns,
                    }
                })
                .collect(),
        }
    }
}
