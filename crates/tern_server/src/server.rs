//! Control Thread
//!
//! Owns the listening socket and every per-client socket, parses all IPC,
//! and is the only code that talks to the engine's command channel. The
//! engine never sees a socket.
//!
//! Per §handshake: a connecting client is assigned an id and greeted with
//! `CLIENT_CONNECTED`; stream ids it sends must carry that id in their
//! high 16 bits. A failed `CONNECT_STREAM` always answers with the echoed
//! stream id and a negative errno, leaving no server-side state behind.

use std::os::fd::{AsFd, AsRawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, info, warn};

use tern_core::devices::loopback::LoopbackKind;
use tern_core::{
    AudioEngine, AudioFormat, ClientType, Direction, EngineCommand, EngineError, EngineEvent,
    Iodev, NodeId, ObserverEvent, ObserverRegistry, RStream, StreamId, StreamParams,
};
use tern_dsp::SampleFormat;
use tern_platform::bluetooth::{clamp_mtu, TransportEvent};

use crate::error::{ServerError, ServerResult};
use crate::rpc::{
    self, ClientMessage, ServerMessage, NODE_ATTR_PLUGGED, NODE_ATTR_SWAP_LEFT_RIGHT,
    NODE_ATTR_VOLUME,
};

/// Default drain allowance beyond the stream's own buffered duration
const DRAIN_GRACE: Duration = Duration::from_millis(20);

struct Client {
    id: u16,
    socket: UnixStream,
    /// Open streams and the direction each one runs in
    streams: Vec<(StreamId, Direction)>,
    /// Streams pinned to a device index
    pinned: Vec<(StreamId, u32)>,
    /// Directions this client may open (input, output)
    allowed_directions: (bool, bool),
    /// Whether this client asked for STATE_CHANGED notifications
    wants_events: bool,
}

/// The audio server: engine + device list + client sessions
pub struct Server {
    listener: UnixListener,
    engine: AudioEngine,
    device_list: tern_core::DeviceList,
    observer: ObserverRegistry,
    observer_rx: crossbeam_channel::Receiver<ObserverEvent>,
    clients: Vec<Client>,
    next_client_id: u16,
}

impl Server {
    /// Bind the control socket and bring up the engine, the fallback
    /// devices and the loopback capture devices.
    pub fn new(socket_path: &Path) -> ServerResult<Self> {
        if socket_path.exists() {
            std::fs::remove_file(socket_path)?;
        }
        if let Some(parent) = socket_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(socket_path)?;
        listener.set_nonblocking(true)?;
        info!(?socket_path, "listening");

        let engine = AudioEngine::start()?;
        let mut observer = ObserverRegistry::new();
        let observer_rx = observer.subscribe();
        let mut device_list = tern_core::DeviceList::new(engine.sender(), &mut observer);

        // Loopback capture devices are always present, parked until a
        // client selects or pins them.
        device_list.add_device(Iodev::loopback(LoopbackKind::PostMixPreDsp), &mut observer);
        device_list.add_device(Iodev::loopback(LoopbackKind::PostDspDelayed), &mut observer);

        Ok(Self {
            listener,
            engine,
            device_list,
            observer,
            observer_rx,
            clients: Vec::new(),
            next_client_id: 1,
        })
    }

    pub fn engine(&self) -> &AudioEngine {
        &self.engine
    }

    pub fn device_list_mut(&mut self) -> (&mut tern_core::DeviceList, &mut ObserverRegistry) {
        (&mut self.device_list, &mut self.observer)
    }

    /// Restrict which directions a client may open streams in
    pub fn set_client_directions(&mut self, client_id: u16, input: bool, output: bool) {
        if let Some(client) = self.clients.iter_mut().find(|c| c.id == client_id) {
            client.allowed_directions = (input, output);
        }
    }

    /// Run forever
    pub fn run(&mut self) -> ServerResult<()> {
        loop {
            self.run_once(Duration::from_millis(50))?;
        }
    }

    /// One poll/dispatch iteration; test entry point
    pub fn run_once(&mut self, timeout: Duration) -> ServerResult<()> {
        self.accept_new_clients()?;

        // Poll every client socket for readability
        let readable: Vec<usize> = {
            let mut fds: Vec<PollFd> = self
                .clients
                .iter()
                .map(|c| PollFd::new(c.socket.as_fd(), PollFlags::POLLIN))
                .collect();
            if fds.is_empty() {
                std::thread::sleep(timeout.min(Duration::from_millis(10)));
                Vec::new()
            } else {
                let wait = PollTimeout::try_from(timeout.as_millis().min(1000) as u16)
                    .unwrap_or(PollTimeout::MAX);
                match poll(&mut fds, wait) {
                    Ok(0) => Vec::new(),
                    Ok(_) => fds
                        .iter()
                        .enumerate()
                        .filter(|(_, fd)| {
                            fd.revents()
                                .map(|r| r.intersects(PollFlags::POLLIN | PollFlags::POLLHUP))
                                .unwrap_or(false)
                        })
                        .map(|(i, _)| i)
                        .collect(),
                    Err(nix::errno::Errno::EINTR) => Vec::new(),
                    Err(e) => return Err(e.into()),
                }
            }
        };

        for idx in readable.into_iter().rev() {
            if let Err(e) = self.service_client(idx) {
                debug!(error = %e, "client dropped");
                self.drop_client(idx);
            }
        }

        self.process_engine_events();
        self.forward_observer_events();
        Ok(())
    }

    fn accept_new_clients(&mut self) -> ServerResult<()> {
        loop {
            match self.listener.accept() {
                Ok((mut socket, _)) => {
                    let id = self.next_client_id;
                    self.next_client_id = self.next_client_id.wrapping_add(1).max(1);
                    socket.set_nonblocking(false)?;

                    let hello = ServerMessage::ClientConnected {
                        client_id: id as u32,
                    };
                    if rpc::write_message(&mut socket, &hello.encode()).is_ok() {
                        info!(client = id, "client connected");
                        self.clients.push(Client {
                            id,
                            socket,
                            streams: Vec::new(),
                            pinned: Vec::new(),
                            allowed_directions: (true, true),
                            wants_events: false,
                        });
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn service_client(&mut self, idx: usize) -> ServerResult<()> {
        let (id, body) = rpc::read_message(&mut self.clients[idx].socket)?;
        match ClientMessage::decode(id, &body) {
            Ok(msg) => self.dispatch(idx, msg),
            Err(e) => {
                // Protocol errors keep the client; log and carry on
                warn!(client = self.clients[idx].id, error = %e, "bad message");
                Ok(())
            }
        }
    }

    fn dispatch(&mut self, idx: usize, msg: ClientMessage) -> ServerResult<()> {
        match msg {
            ClientMessage::ConnectStream {
                stream_id,
                direction,
                client_type,
                rate,
                channels,
                format,
                buffer_frames,
                cb_threshold,
                effects,
                dev_idx,
            } => self.connect_stream(
                idx,
                stream_id,
                direction,
                client_type,
                rate,
                channels,
                format,
                buffer_frames,
                cb_threshold,
                effects,
                dev_idx,
            ),
            ClientMessage::DisconnectStream { stream_id } => {
                self.disconnect_stream(idx, stream_id);
                Ok(())
            }
            ClientMessage::SwitchStreamType {
                stream_id,
                client_type,
            } => {
                if self.clients[idx]
                    .streams
                    .iter()
                    .any(|(s, _)| *s == stream_id)
                {
                    let _ = self.engine.send(EngineCommand::SwitchStreamType {
                        id: stream_id,
                        client_type,
                    });
                }
                Ok(())
            }
            ClientMessage::SetSystemVolume { volume, muted } => {
                let volume = volume.min(100) as u8;
                let _ = self
                    .engine
                    .send(EngineCommand::SetSystemVolume { volume, muted });
                self.observer
                    .notify(&ObserverEvent::SystemVolumeChanged { volume });
                self.observer
                    .notify(&ObserverEvent::SystemMuteChanged { muted });
                Ok(())
            }
            ClientMessage::SetNodeAttr {
                node_id,
                attr,
                value,
            } => {
                let node = NodeId(node_id);
                let result = match attr {
                    NODE_ATTR_VOLUME => self.device_list.set_node_volume(
                        node,
                        value.clamp(0, 100) as u8,
                        &mut self.observer,
                    ),
                    NODE_ATTR_SWAP_LEFT_RIGHT => {
                        self.device_list
                            .set_node_swap(node, value != 0, &mut self.observer)
                    }
                    NODE_ATTR_PLUGGED => {
                        self.device_list
                            .set_node_plugged(node, value != 0, &mut self.observer)
                    }
                    other => {
                        warn!(attr = other, "unknown node attribute");
                        Ok(())
                    }
                };
                if let Err(e) = result {
                    warn!(error = %e, "node attr update failed");
                }
                Ok(())
            }
            ClientMessage::SelectNode { direction, node_id } => {
                match self.device_list.add_active_node(
                    direction,
                    NodeId(node_id),
                    &mut self.observer,
                ) {
                    Ok(()) => self.notify_reattach(direction),
                    Err(e) => warn!(error = %e, "node selection failed"),
                }
                Ok(())
            }
            ClientMessage::DumpState => {
                let payload = self
                    .engine
                    .dump(Duration::from_millis(500))
                    .and_then(|s| serde_json::to_vec(&s).ok())
                    .unwrap_or_default();
                let reply = ServerMessage::DumpReply { payload };
                rpc::write_message(&mut self.clients[idx].socket, &reply.encode())
            }
            ClientMessage::SubscribeEvents => {
                self.clients[idx].wants_events = true;
                Ok(())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn connect_stream(
        &mut self,
        idx: usize,
        stream_id: StreamId,
        direction: Direction,
        client_type: ClientType,
        rate: u32,
        channels: u32,
        format: SampleFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        effects: tern_core::EffectFlags,
        dev_idx: Option<u32>,
    ) -> ServerResult<()> {
        let client_id = self.clients[idx].id;

        let direction_allowed = match direction {
            Direction::Input => self.clients[idx].allowed_directions.0,
            Direction::Output => self.clients[idx].allowed_directions.1,
        };
        let id_matches = stream_id.client_id() == client_id;
        let pinned_exists = dev_idx
            .map(|i| self.device_list.device_indices().contains(&i))
            .unwrap_or(true);

        if !direction_allowed || !id_matches || !pinned_exists {
            return self.reply_stream_error(idx, stream_id, -libc::EINVAL);
        }

        let params = StreamParams {
            id: stream_id,
            direction,
            client_type,
            format: AudioFormat::new(rate, channels as usize, format),
            buffer_frames,
            cb_threshold,
            effects,
            pinned_dev: dev_idx,
        };

        let (stream, shm_file, wake_fd) = match RStream::new(params) {
            Ok(parts) => parts,
            Err(EngineError::Os(_) | EngineError::Io(_)) => {
                return self.reply_stream_error(idx, stream_id, -libc::ENOMEM);
            }
            Err(_) => {
                return self.reply_stream_error(idx, stream_id, -libc::EINVAL);
            }
        };

        let bound = *stream.format();
        let used_size = buffer_frames * bound.frame_bytes() as u32;
        let reply = ServerMessage::StreamConnected {
            err: 0,
            stream_id,
            rate: bound.frame_rate,
            channels: bound.num_channels as u32,
            format: bound.sample_format,
            buffer_frames,
            used_size,
        };
        rpc::write_message_with_fds(
            &self.clients[idx].socket,
            &reply.encode(),
            &[shm_file.as_raw_fd(), wake_fd.as_raw_fd()],
        )?;

        // Only after the reply went out does the stream become real
        self.engine
            .add_stream(stream)
            .map_err(ServerError::Engine)?;
        if let Some(pin) = dev_idx {
            if let Err(e) = self.device_list.pin_stream(pin, &mut self.observer) {
                warn!(error = %e, "pin accounting failed");
            }
            self.clients[idx].pinned.push((stream_id, pin));
        }
        self.clients[idx].streams.push((stream_id, direction));
        self.observer
            .notify(&ObserverEvent::StreamAdded { id: stream_id });
        info!(client = client_id, stream = %stream_id, "stream connected");
        Ok(())
    }

    fn reply_stream_error(
        &mut self,
        idx: usize,
        stream_id: StreamId,
        err: i32,
    ) -> ServerResult<()> {
        debug!(stream = %stream_id, err, "rejecting stream");
        let reply = ServerMessage::StreamConnected {
            err,
            stream_id,
            rate: 0,
            channels: 0,
            format: SampleFormat::S16Le,
            buffer_frames: 0,
            used_size: 0,
        };
        rpc::write_message(&mut self.clients[idx].socket, &reply.encode())
    }

    fn disconnect_stream(&mut self, idx: usize, stream_id: StreamId) {
        let client = &mut self.clients[idx];
        let Some(pos) = client.streams.iter().position(|(s, _)| *s == stream_id) else {
            return;
        };
        client.streams.remove(pos);
        let pin = client
            .pinned
            .iter()
            .position(|(s, _)| *s == stream_id)
            .map(|p| client.pinned.remove(p).1);

        let _ = self.engine.remove_stream(stream_id);
        if let Some(pin) = pin {
            self.device_list.unpin_stream(pin, &mut self.observer);
        }
        self.observer
            .notify(&ObserverEvent::StreamRemoved { id: stream_id });
    }

    /// Ask clients with unpinned streams of the rerouted direction to
    /// reattach. Streams in the other direction are untouched.
    fn notify_reattach(&mut self, direction: Direction) {
        for client in &mut self.clients {
            for (stream_id, stream_dir) in &client.streams {
                if *stream_dir != direction {
                    continue;
                }
                if client.pinned.iter().any(|(s, _)| s == stream_id) {
                    continue;
                }
                let msg = ServerMessage::StreamReattach {
                    stream_id: *stream_id,
                };
                let _ = rpc::write_message(&mut client.socket, &msg.encode());
            }
        }
    }

    fn drop_client(&mut self, idx: usize) {
        let client = self.clients.remove(idx);
        info!(client = client.id, "client disconnected");
        for (stream_id, _) in client.streams {
            let _ = self.engine.remove_stream(stream_id);
            self.observer
                .notify(&ObserverEvent::StreamRemoved { id: stream_id });
        }
        for (_, pin) in client.pinned {
            self.device_list.unpin_stream(pin, &mut self.observer);
        }
    }

    fn process_engine_events(&mut self) {
        while let Ok(event) = self.engine.events().try_recv() {
            match event {
                EngineEvent::DeviceClosed { dev } => {
                    self.device_list.restore(*dev);
                }
                EngineEvent::DeviceFailed { index } => {
                    warn!(index, "backend failure, removing device");
                    self.device_list.remove_device(index, &mut self.observer);
                }
                EngineEvent::StreamRemoved { id } => {
                    for client in &mut self.clients {
                        client.streams.retain(|(s, _)| *s != id);
                        client.pinned.retain(|(s, _)| *s != id);
                    }
                }
                EngineEvent::Underrun { dev_index, stream } => {
                    self.observer.notify(&ObserverEvent::Underrun {
                        dev_index,
                        stream,
                    });
                }
                EngineEvent::SevereUnderrun { dev_index } => {
                    self.observer
                        .notify(&ObserverEvent::SevereUnderrun { dev_index });
                }
            }
        }
    }

    fn forward_observer_events(&mut self) {
        while let Ok(event) = self.observer_rx.try_recv() {
            let Ok(payload) = serde_json::to_vec(&event) else {
                continue;
            };
            let msg = ServerMessage::StateChanged { payload };
            let bytes = msg.encode();
            for client in &mut self.clients {
                if client.wants_events {
                    let _ = rpc::write_message(&mut client.socket, &bytes);
                }
            }
        }
    }

    /// Wire a Bluetooth manager event into the device list. The manager
    /// itself is an external collaborator; this is the seam it feeds.
    pub fn handle_bt_event(&mut self, event: TransportEvent, name: &str) {
        match event {
            TransportEvent::Acquired {
                fd,
                read_mtu: _,
                write_mtu,
            } => {
                let format = AudioFormat::new(44_100, 2, SampleFormat::S16Le);
                let transport = tern_platform::bluetooth::A2dpTransport::new(
                    fd,
                    clamp_mtu(write_mtu),
                    format,
                );
                let dev = Iodev::a2dp(name, transport);
                self.device_list.add_device(dev, &mut self.observer);
            }
            TransportEvent::Released => {
                // The owning device index is tracked by name lookup in the
                // device list; nothing to do until it is selected again.
            }
            TransportEvent::VolumeChanged(level) => {
                let volume = (level as u32 * 100 / 127) as u8;
                let _ = self.engine.send(EngineCommand::SetSystemVolume {
                    volume,
                    muted: false,
                });
            }
            TransportEvent::DeviceAdded { address, name } => {
                debug!(%address, %name, "bluetooth device appeared");
            }
            TransportEvent::DeviceRemoved { address } => {
                debug!(%address, "bluetooth device gone");
            }
        }
    }

    /// Synchronous drain with the default deadline: the stream's buffered
    /// duration plus a grace period.
    pub fn drain_stream(&self, id: StreamId, buffer_frames: u32, rate: u32) -> i32 {
        let buffered = Duration::from_secs_f64(buffer_frames as f64 / rate.max(1) as f64);
        self.engine.drain_stream(id, buffered + DRAIN_GRACE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{read_message, write_message};
    use tern_core::EffectFlags;

    struct TestSetup {
        _dir: tempfile::TempDir,
        server: Server,
        client: UnixStream,
        client_id: u16,
    }

    fn setup() -> TestSetup {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ternd.sock");
        let mut server = Server::new(&path).unwrap();

        let mut client = UnixStream::connect(&path).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        server.run_once(Duration::from_millis(10)).unwrap();

        let (id, body) = read_message(&mut client).unwrap();
        assert_eq!(id, rpc::MSG_CLIENT_CONNECTED);
        let client_id = match ServerMessage::decode(id, &body).unwrap() {
            ServerMessage::ClientConnected { client_id } => client_id as u16,
            other => panic!("expected ClientConnected, got {other:?}"),
        };

        TestSetup {
            _dir: dir,
            server,
            client,
            client_id,
        }
    }

    fn connect_msg(stream_id: u32, direction: Direction) -> ClientMessage {
        ClientMessage::ConnectStream {
            stream_id: StreamId(stream_id),
            direction,
            client_type: ClientType::Test,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            buffer_frames: 480,
            cb_threshold: 240,
            effects: EffectFlags::empty(),
            dev_idx: None,
        }
    }

    fn exchange(setup: &mut TestSetup, msg: &ClientMessage) -> ServerMessage {
        write_message(&mut setup.client, &msg.encode()).unwrap();
        setup.server.run_once(Duration::from_millis(50)).unwrap();
        let (id, body) = read_message(&mut setup.client).unwrap();
        ServerMessage::decode(id, &body).unwrap()
    }

    #[test]
    fn test_connect_and_disconnect_stream() {
        let mut setup = setup();
        let stream_id = (setup.client_id as u32) << 16 | 2;

        let reply = exchange(&mut setup, &connect_msg(stream_id, Direction::Input));
        match reply {
            ServerMessage::StreamConnected {
                err,
                stream_id: echoed,
                rate,
                ..
            } => {
                assert_eq!(err, 0);
                assert_eq!(echoed, StreamId(stream_id));
                assert_eq!(rate, 48_000);
            }
            other => panic!("expected StreamConnected, got {other:?}"),
        }

        // The engine sees the stream...
        let has_stream = |server: &Server| {
            server
                .engine()
                .dump(Duration::from_millis(500))
                .map(|s| s.streams.len())
                .unwrap_or(0)
        };
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while has_stream(&setup.server) != 1 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(has_stream(&setup.server), 1);

        // ...and RemoveStream brings the count back to zero
        let msg = ClientMessage::DisconnectStream {
            stream_id: StreamId(stream_id),
        };
        write_message(&mut setup.client, &msg.encode()).unwrap();
        setup.server.run_once(Duration::from_millis(50)).unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while has_stream(&setup.server) != 0 && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(has_stream(&setup.server), 0);
    }

    #[test]
    fn test_invalid_direction_rejected() {
        let mut setup = setup();
        // Input-only client asking for a playback stream
        setup
            .server
            .set_client_directions(setup.client_id, true, false);

        let stream_id = (setup.client_id as u32) << 16 | 2;
        let reply = exchange(&mut setup, &connect_msg(stream_id, Direction::Output));
        match reply {
            ServerMessage::StreamConnected {
                err,
                stream_id: echoed,
                ..
            } => {
                assert_eq!(err, -libc::EINVAL);
                assert_eq!(echoed, StreamId(stream_id));
            }
            other => panic!("expected StreamConnected, got {other:?}"),
        }
    }

    #[test]
    fn test_cross_client_id_rejected() {
        let mut setup = setup();
        // High 16 bits name some other client
        let foreign = ((setup.client_id as u32) + 1) << 16 | 2;
        let reply = exchange(&mut setup, &connect_msg(foreign, Direction::Input));
        match reply {
            ServerMessage::StreamConnected { err, stream_id, .. } => {
                assert_eq!(err, -libc::EINVAL);
                assert_eq!(stream_id, StreamId(foreign));
            }
            other => panic!("expected StreamConnected, got {other:?}"),
        }
        // No partial state
        let snapshot = setup.server.engine().dump(Duration::from_millis(500)).unwrap();
        assert!(snapshot.streams.is_empty());
    }

    #[test]
    fn test_odd_used_size_rejected() {
        let mut setup = setup();
        let stream_id = (setup.client_id as u32) << 16 | 1;
        // Mono U8 with an odd frame count gives an odd used_size
        let msg = ClientMessage::ConnectStream {
            stream_id: StreamId(stream_id),
            direction: Direction::Output,
            client_type: ClientType::Test,
            rate: 48_000,
            channels: 1,
            format: SampleFormat::U8,
            buffer_frames: 481,
            cb_threshold: 240,
            effects: EffectFlags::empty(),
            dev_idx: None,
        };
        let reply = exchange(&mut setup, &msg);
        match reply {
            ServerMessage::StreamConnected { err, .. } => assert_eq!(err, -libc::EINVAL),
            other => panic!("expected StreamConnected, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_pinned_device_rejected() {
        let mut setup = setup();
        let stream_id = (setup.client_id as u32) << 16 | 1;
        let msg = ClientMessage::ConnectStream {
            stream_id: StreamId(stream_id),
            direction: Direction::Output,
            client_type: ClientType::Test,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            buffer_frames: 480,
            cb_threshold: 240,
            effects: EffectFlags::empty(),
            dev_idx: Some(999),
        };
        let reply = exchange(&mut setup, &msg);
        match reply {
            ServerMessage::StreamConnected { err, .. } => assert_eq!(err, -libc::EINVAL),
            other => panic!("expected StreamConnected, got {other:?}"),
        }
    }

    #[test]
    fn test_reattach_targets_changed_direction_only() {
        let mut setup = setup();
        let input_id = (setup.client_id as u32) << 16 | 1;
        let output_id = (setup.client_id as u32) << 16 | 2;

        let reply = exchange(&mut setup, &connect_msg(input_id, Direction::Input));
        assert!(matches!(
            reply,
            ServerMessage::StreamConnected { err: 0, .. }
        ));
        let reply = exchange(&mut setup, &connect_msg(output_id, Direction::Output));
        assert!(matches!(
            reply,
            ServerMessage::StreamConnected { err: 0, .. }
        ));

        // Reroute capture to the loopback node; the playback stream must
        // not be told to reattach.
        let node = NodeId::from_name("Loopback Post Mix");
        let msg = ClientMessage::SelectNode {
            direction: Direction::Input,
            node_id: node.0,
        };
        write_message(&mut setup.client, &msg.encode()).unwrap();
        setup.server.run_once(Duration::from_millis(50)).unwrap();

        let (id, body) = read_message(&mut setup.client).unwrap();
        match ServerMessage::decode(id, &body).unwrap() {
            ServerMessage::StreamReattach { stream_id } => {
                assert_eq!(stream_id, StreamId(input_id));
            }
            other => panic!("expected StreamReattach, got {other:?}"),
        }

        // Exactly one reattach: nothing further is queued for this client
        setup
            .client
            .set_read_timeout(Some(Duration::from_millis(200)))
            .unwrap();
        assert!(read_message(&mut setup.client).is_err());
    }

    #[test]
    fn test_dump_replies_json() {
        let mut setup = setup();
        let reply = exchange(&mut setup, &ClientMessage::DumpState);
        match reply {
            ServerMessage::DumpReply { payload } => {
                let v: serde_json::Value = serde_json::from_slice(&payload).unwrap();
                assert!(v.get("devices").is_some());
            }
            other => panic!("expected DumpReply, got {other:?}"),
        }
    }

    #[test]
    fn test_client_drop_removes_streams() {
        let mut setup = setup();
        let stream_id = (setup.client_id as u32) << 16 | 2;
        let reply = exchange(&mut setup, &connect_msg(stream_id, Direction::Input));
        assert!(matches!(
            reply,
            ServerMessage::StreamConnected { err: 0, .. }
        ));

        drop(setup.client);
        // A few iterations to observe the hangup and purge
        for _ in 0..5 {
            setup.server.run_once(Duration::from_millis(20)).unwrap();
        }

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        loop {
            let count = setup
                .server
                .engine()
                .dump(Duration::from_millis(500))
                .map(|s| s.streams.len())
                .unwrap_or(1);
            if count == 0 || std::time::Instant::now() > deadline {
                assert_eq!(count, 0);
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}
