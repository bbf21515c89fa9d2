//! Client Wire Protocol
//!
//! Messages on the control socket are fixed-layout little-endian structs
//! behind a two-field header `{ length: u32, id: u32 }`, where `length`
//! covers the whole message including the header. The shm and wake fds of
//! a successful `CONNECT_STREAM` travel as SCM_RIGHTS ancillary data on
//! the `STREAM_CONNECTED` reply.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::sys::socket::{sendmsg, ControlMessage, MsgFlags};
use tern_core::{ClientType, Direction, EffectFlags, SampleFormat, StreamId};

use crate::error::{ServerError, ServerResult};

pub const HEADER_BYTES: usize = 8;
/// Largest message body we accept from a client
pub const MAX_BODY_BYTES: usize = 4096;
/// `CONNECT_STREAM.dev_idx` value meaning "no pinned device"
pub const NO_DEVICE: u32 = u32::MAX;

// Client -> server
pub const MSG_CONNECT_STREAM: u32 = 1;
pub const MSG_DISCONNECT_STREAM: u32 = 2;
pub const MSG_SWITCH_STREAM_TYPE: u32 = 3;
pub const MSG_SET_SYSTEM_VOLUME: u32 = 4;
pub const MSG_SET_NODE_ATTR: u32 = 5;
pub const MSG_SELECT_NODE: u32 = 6;
pub const MSG_DUMP_STATE: u32 = 7;
pub const MSG_SUBSCRIBE_EVENTS: u32 = 8;

// Server -> client
pub const MSG_CLIENT_CONNECTED: u32 = 50;
pub const MSG_STREAM_CONNECTED: u32 = 51;
pub const MSG_STREAM_REATTACH: u32 = 52;
pub const MSG_STATE_CHANGED: u32 = 53;
pub const MSG_DUMP_REPLY: u32 = 54;

/// Node attribute selectors for `SET_NODE_ATTR`
pub const NODE_ATTR_PLUGGED: u32 = 0;
pub const NODE_ATTR_VOLUME: u32 = 1;
pub const NODE_ATTR_SWAP_LEFT_RIGHT: u32 = 2;

/// Little-endian field cursor over a message body
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn u32(&mut self) -> ServerResult<u32> {
        let end = self.pos + 4;
        let bytes = self
            .buf
            .get(self.pos..end)
            .ok_or(ServerError::ShortMessage)?;
        self.pos = end;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    fn i32(&mut self) -> ServerResult<i32> {
        Ok(self.u32()? as i32)
    }

    fn u8(&mut self) -> ServerResult<u8> {
        let b = *self.buf.get(self.pos).ok_or(ServerError::ShortMessage)?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: usize) -> ServerResult<()> {
        if self.pos + n > self.buf.len() {
            return Err(ServerError::ShortMessage);
        }
        self.pos += n;
        Ok(())
    }
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn direction_to_wire(direction: Direction) -> u8 {
    match direction {
        Direction::Input => 0,
        Direction::Output => 1,
    }
}

fn direction_from_wire(v: u8) -> ServerResult<Direction> {
    match v {
        0 => Ok(Direction::Input),
        1 => Ok(Direction::Output),
        other => Err(ServerError::BadField(format!("direction {other}"))),
    }
}

fn client_type_from_wire(v: u8) -> ClientType {
    match v {
        1 => ClientType::Test,
        2 => ClientType::App,
        3 => ClientType::System,
        _ => ClientType::Unknown,
    }
}

fn format_to_wire(fmt: SampleFormat) -> u8 {
    match fmt {
        SampleFormat::U8 => 0,
        SampleFormat::S16Le => 1,
        SampleFormat::S24Le => 2,
        SampleFormat::S32Le => 3,
    }
}

fn format_from_wire(v: u8) -> ServerResult<SampleFormat> {
    match v {
        0 => Ok(SampleFormat::U8),
        1 => Ok(SampleFormat::S16Le),
        2 => Ok(SampleFormat::S24Le),
        3 => Ok(SampleFormat::S32Le),
        other => Err(ServerError::BadField(format!("sample format {other}"))),
    }
}

/// Parsed client -> server message
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    ConnectStream {
        stream_id: StreamId,
        direction: Direction,
        client_type: ClientType,
        rate: u32,
        channels: u32,
        format: SampleFormat,
        buffer_frames: u32,
        cb_threshold: u32,
        effects: EffectFlags,
        dev_idx: Option<u32>,
    },
    DisconnectStream {
        stream_id: StreamId,
    },
    SwitchStreamType {
        stream_id: StreamId,
        client_type: ClientType,
    },
    SetSystemVolume {
        volume: u32,
        muted: bool,
    },
    SetNodeAttr {
        node_id: u32,
        attr: u32,
        value: i32,
    },
    SelectNode {
        direction: Direction,
        node_id: u32,
    },
    DumpState,
    /// Opt in to `STATE_CHANGED` notifications on this connection
    SubscribeEvents,
}

impl ClientMessage {
    /// Decode a message body for a given header id
    pub fn decode(id: u32, body: &[u8]) -> ServerResult<Self> {
        let mut r = Reader::new(body);
        match id {
            MSG_CONNECT_STREAM => {
                let stream_id = StreamId(r.u32()?);
                let direction = direction_from_wire(r.u8()?)?;
                let client_type = client_type_from_wire(r.u8()?);
                r.skip(2)?;
                let rate = r.u32()?;
                let channels = r.u32()?;
                let format = format_from_wire(r.u8()?)?;
                r.skip(3)?;
                let buffer_frames = r.u32()?;
                let cb_threshold = r.u32()?;
                let effects = EffectFlags::from_bits_truncate(r.u32()?);
                let dev_idx = r.u32()?;
                Ok(ClientMessage::ConnectStream {
                    stream_id,
                    direction,
                    client_type,
                    rate,
                    channels,
                    format,
                    buffer_frames,
                    cb_threshold,
                    effects,
                    dev_idx: (dev_idx != NO_DEVICE).then_some(dev_idx),
                })
            }
            MSG_DISCONNECT_STREAM => Ok(ClientMessage::DisconnectStream {
                stream_id: StreamId(r.u32()?),
            }),
            MSG_SWITCH_STREAM_TYPE => {
                let stream_id = StreamId(r.u32()?);
                let client_type = client_type_from_wire(r.u8()?);
                Ok(ClientMessage::SwitchStreamType {
                    stream_id,
                    client_type,
                })
            }
            MSG_SET_SYSTEM_VOLUME => {
                let volume = r.u32()?;
                let muted = r.u32()? != 0;
                Ok(ClientMessage::SetSystemVolume { volume, muted })
            }
            MSG_SET_NODE_ATTR => {
                let node_id = r.u32()?;
                let attr = r.u32()?;
                let value = r.i32()?;
                Ok(ClientMessage::SetNodeAttr {
                    node_id,
                    attr,
                    value,
                })
            }
            MSG_SELECT_NODE => {
                let direction = direction_from_wire(r.u8()?)?;
                r.skip(3)?;
                let node_id = r.u32()?;
                Ok(ClientMessage::SelectNode { direction, node_id })
            }
            MSG_DUMP_STATE => Ok(ClientMessage::DumpState),
            MSG_SUBSCRIBE_EVENTS => Ok(ClientMessage::SubscribeEvents),
            other => Err(ServerError::UnknownMessage(other)),
        }
    }

    /// Encode as a full message (header included); used by clients and the
    /// protocol tests.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let id = match self {
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
            } => {
                push_u32(&mut body, stream_id.0);
                body.push(direction_to_wire(*direction));
                body.push(match client_type {
                    ClientType::Unknown => 0,
                    ClientType::Test => 1,
                    ClientType::App => 2,
                    ClientType::System => 3,
                });
                body.extend_from_slice(&[0u8; 2]);
                push_u32(&mut body, *rate);
                push_u32(&mut body, *channels);
                body.push(format_to_wire(*format));
                body.extend_from_slice(&[0u8; 3]);
                push_u32(&mut body, *buffer_frames);
                push_u32(&mut body, *cb_threshold);
                push_u32(&mut body, effects.bits());
                push_u32(&mut body, dev_idx.unwrap_or(NO_DEVICE));
                MSG_CONNECT_STREAM
            }
            ClientMessage::DisconnectStream { stream_id } => {
                push_u32(&mut body, stream_id.0);
                MSG_DISCONNECT_STREAM
            }
            ClientMessage::SwitchStreamType {
                stream_id,
                client_type,
            } => {
                push_u32(&mut body, stream_id.0);
                body.push(match client_type {
                    ClientType::Unknown => 0,
                    ClientType::Test => 1,
                    ClientType::App => 2,
                    ClientType::System => 3,
                });
                MSG_SWITCH_STREAM_TYPE
            }
            ClientMessage::SetSystemVolume { volume, muted } => {
                push_u32(&mut body, *volume);
                push_u32(&mut body, *muted as u32);
                MSG_SET_SYSTEM_VOLUME
            }
            ClientMessage::SetNodeAttr {
                node_id,
                attr,
                value,
            } => {
                push_u32(&mut body, *node_id);
                push_u32(&mut body, *attr);
                push_u32(&mut body, *value as u32);
                MSG_SET_NODE_ATTR
            }
            ClientMessage::SelectNode { direction, node_id } => {
                body.push(direction_to_wire(*direction));
                body.extend_from_slice(&[0u8; 3]);
                push_u32(&mut body, *node_id);
                MSG_SELECT_NODE
            }
            ClientMessage::DumpState => MSG_DUMP_STATE,
            ClientMessage::SubscribeEvents => MSG_SUBSCRIBE_EVENTS,
        };
        frame(id, &body)
    }
}

/// Server -> client messages
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    ClientConnected {
        client_id: u32,
    },
    StreamConnected {
        err: i32,
        stream_id: StreamId,
        rate: u32,
        channels: u32,
        format: SampleFormat,
        buffer_frames: u32,
        /// Byte size of one shm half-buffer
        used_size: u32,
    },
    StreamReattach {
        stream_id: StreamId,
    },
    /// JSON-encoded observer event
    StateChanged {
        payload: Vec<u8>,
    },
    /// JSON-encoded engine snapshot
    DumpReply {
        payload: Vec<u8>,
    },
}

impl ServerMessage {
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::new();
        let id = match self {
            ServerMessage::ClientConnected { client_id } => {
                push_u32(&mut body, *client_id);
                MSG_CLIENT_CONNECTED
            }
            ServerMessage::StreamConnected {
                err,
                stream_id,
                rate,
                channels,
                format,
                buffer_frames,
                used_size,
            } => {
                push_u32(&mut body, *err as u32);
                push_u32(&mut body, stream_id.0);
                push_u32(&mut body, *rate);
                push_u32(&mut body, *channels);
                body.push(format_to_wire(*format));
                body.extend_from_slice(&[0u8; 3]);
                push_u32(&mut body, *buffer_frames);
                push_u32(&mut body, *used_size);
                MSG_STREAM_CONNECTED
            }
            ServerMessage::StreamReattach { stream_id } => {
                push_u32(&mut body, stream_id.0);
                MSG_STREAM_REATTACH
            }
            ServerMessage::StateChanged { payload } => {
                body.extend_from_slice(payload);
                MSG_STATE_CHANGED
            }
            ServerMessage::DumpReply { payload } => {
                body.extend_from_slice(payload);
                MSG_DUMP_REPLY
            }
        };
        frame(id, &body)
    }

    pub fn decode(id: u32, body: &[u8]) -> ServerResult<Self> {
        let mut r = Reader::new(body);
        match id {
            MSG_CLIENT_CONNECTED => Ok(ServerMessage::ClientConnected {
                client_id: r.u32()?,
            }),
            MSG_STREAM_CONNECTED => {
                let err = r.i32()?;
                let stream_id = StreamId(r.u32()?);
                let rate = r.u32()?;
                let channels = r.u32()?;
                let format = format_from_wire(r.u8()?)?;
                r.skip(3)?;
                let buffer_frames = r.u32()?;
                let used_size = r.u32()?;
                Ok(ServerMessage::StreamConnected {
                    err,
                    stream_id,
                    rate,
                    channels,
                    format,
                    buffer_frames,
                    used_size,
                })
            }
            MSG_STREAM_REATTACH => Ok(ServerMessage::StreamReattach {
                stream_id: StreamId(r.u32()?),
            }),
            MSG_STATE_CHANGED => Ok(ServerMessage::StateChanged {
                payload: body.to_vec(),
            }),
            MSG_DUMP_REPLY => Ok(ServerMessage::DumpReply {
                payload: body.to_vec(),
            }),
            other => Err(ServerError::UnknownMessage(other)),
        }
    }
}

fn frame(id: u32, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_BYTES + body.len());
    push_u32(&mut out, (HEADER_BYTES + body.len()) as u32);
    push_u32(&mut out, id);
    out.extend_from_slice(body);
    out
}

/// Read one framed message: (id, body)
pub fn read_message(socket: &mut UnixStream) -> ServerResult<(u32, Vec<u8>)> {
    let mut header = [0u8; HEADER_BYTES];
    socket.read_exact(&mut header)?;
    let length = u32::from_le_bytes(header[..4].try_into().unwrap()) as usize;
    let id = u32::from_le_bytes(header[4..].try_into().unwrap());
    if length < HEADER_BYTES || length - HEADER_BYTES > MAX_BODY_BYTES {
        return Err(ServerError::BadField(format!("message length {length}")));
    }
    let mut body = vec![0u8; length - HEADER_BYTES];
    socket.read_exact(&mut body)?;
    Ok((id, body))
}

/// Write a framed message with no ancillary data
pub fn write_message(socket: &mut UnixStream, bytes: &[u8]) -> ServerResult<()> {
    socket.write_all(bytes)?;
    Ok(())
}

/// Write a framed message with SCM_RIGHTS fds attached
pub fn write_message_with_fds(
    socket: &UnixStream,
    bytes: &[u8],
    fds: &[RawFd],
) -> ServerResult<()> {
    let iov = [std::io::IoSlice::new(bytes)];
    let cmsg = [ControlMessage::ScmRights(fds)];
    sendmsg::<()>(socket.as_raw_fd(), &iov, &cmsg, MsgFlags::empty(), None)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip_client(msg: ClientMessage) -> ClientMessage {
        let bytes = msg.encode();
        let length = u32::from_le_bytes(bytes[..4].try_into().unwrap()) as usize;
        assert_eq!(length, bytes.len());
        let id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        ClientMessage::decode(id, &bytes[8..]).unwrap()
    }

    #[test]
    fn test_connect_stream_roundtrip() {
        let msg = ClientMessage::ConnectStream {
            stream_id: StreamId(0x10002),
            direction: Direction::Input,
            client_type: ClientType::Test,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            buffer_frames: 480,
            cb_threshold: 240,
            effects: EffectFlags::ECHO_CANCELLATION,
            dev_idx: None,
        };
        assert_eq!(roundtrip_client(msg.clone()), msg);
    }

    #[test]
    fn test_connect_stream_pinned_roundtrip() {
        let msg = ClientMessage::ConnectStream {
            stream_id: StreamId(0x20001),
            direction: Direction::Output,
            client_type: ClientType::App,
            rate: 44_100,
            channels: 1,
            format: SampleFormat::S32Le,
            buffer_frames: 1024,
            cb_threshold: 512,
            effects: EffectFlags::empty(),
            dev_idx: Some(3),
        };
        assert_eq!(roundtrip_client(msg.clone()), msg);
    }

    #[test]
    fn test_small_messages_roundtrip() {
        for msg in [
            ClientMessage::DisconnectStream {
                stream_id: StreamId(7),
            },
            ClientMessage::SetSystemVolume {
                volume: 70,
                muted: true,
            },
            ClientMessage::SetNodeAttr {
                node_id: 0xabcd,
                attr: NODE_ATTR_VOLUME,
                value: -42,
            },
            ClientMessage::SelectNode {
                direction: Direction::Output,
                node_id: 0x1234,
            },
            ClientMessage::DumpState,
            ClientMessage::SubscribeEvents,
        ] {
            assert_eq!(roundtrip_client(msg.clone()), msg);
        }
    }

    #[test]
    fn test_bad_direction_rejected() {
        let mut bytes = ClientMessage::ConnectStream {
            stream_id: StreamId(1),
            direction: Direction::Input,
            client_type: ClientType::Test,
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            buffer_frames: 480,
            cb_threshold: 240,
            effects: EffectFlags::empty(),
            dev_idx: None,
        }
        .encode();
        bytes[12] = 9; // direction byte
        let err = ClientMessage::decode(MSG_CONNECT_STREAM, &bytes[8..]);
        assert!(err.is_err());
    }

    #[test]
    fn test_truncated_body_rejected() {
        let bytes = ClientMessage::DisconnectStream {
            stream_id: StreamId(7),
        }
        .encode();
        let err = ClientMessage::decode(MSG_CONNECT_STREAM, &bytes[8..]);
        assert!(matches!(err, Err(ServerError::ShortMessage)));
    }

    #[test]
    fn test_server_stream_connected_roundtrip() {
        let msg = ServerMessage::StreamConnected {
            err: 0,
            stream_id: StreamId(0x10002),
            rate: 48_000,
            channels: 2,
            format: SampleFormat::S16Le,
            buffer_frames: 480,
            used_size: 480 * 4,
        };
        let bytes = msg.encode();
        let id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(ServerMessage::decode(id, &bytes[8..]).unwrap(), msg);
    }

    #[test]
    fn test_error_reply_echoes_id() {
        let msg = ServerMessage::StreamConnected {
            err: -libc::EINVAL,
            stream_id: StreamId(0x20002),
            rate: 0,
            channels: 0,
            format: SampleFormat::S16Le,
            buffer_frames: 0,
            used_size: 0,
        };
        let bytes = msg.encode();
        let id = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        match ServerMessage::decode(id, &bytes[8..]).unwrap() {
            ServerMessage::StreamConnected { err, stream_id, .. } => {
                assert_eq!(err, -libc::EINVAL);
                assert_eq!(stream_id, StreamId(0x20002));
            }
            other => panic!("wrong variant {other:?}"),
        }
    }

    #[test]
    fn test_framed_socket_roundtrip() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let msg = ClientMessage::SetSystemVolume {
            volume: 55,
            muted: false,
        };
        write_message(&mut a, &msg.encode()).unwrap();

        let (id, body) = read_message(&mut b).unwrap();
        assert_eq!(id, MSG_SET_SYSTEM_VOLUME);
        assert_eq!(ClientMessage::decode(id, &body).unwrap(), msg);
    }

    #[test]
    fn test_oversized_length_rejected() {
        let (mut a, mut b) = UnixStream::pair().unwrap();
        let mut bytes = Vec::new();
        push_u32(&mut bytes, (MAX_BODY_BYTES + HEADER_BYTES + 1) as u32);
        push_u32(&mut bytes, MSG_DUMP_STATE);
        a.write_all(&bytes).unwrap();
        assert!(read_message(&mut b).is_err());
    }
}
