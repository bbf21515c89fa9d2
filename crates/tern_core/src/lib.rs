//! Tern Core - Audio Server Engine
//!
//! The server multiplexes client playback and capture streams onto a
//! smaller set of audio endpoints. This crate is the engine side of that:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Control Thread                          │
//! │  client sockets ──▶ DeviceList / routing ──▶ observers      │
//! └─────────────────────────────────────────────────────────────┘
//!                 │ crossbeam commands / events │
//!                 ▼                             ▲
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Audio Thread (deadline loop)                │
//! │  shm rings ──▶ DevStream convert ──▶ mix ──▶ Iodev commit   │
//! │                        │                                    │
//! │                        └──▶ loopback taps (rtrb)            │
//! │              (zero allocation in this path)                 │
//! └─────────────────────────────────────────────────────────────┘
//!                 ▲ shared-memory rings ▲
//!            client processes (fd passed over socket)
//! ```

pub mod dev_stream;
pub mod device_list;
pub mod devices;
pub mod engine;
pub mod iodev;
pub mod message;
pub mod node;
pub mod observer;
pub mod shm;
pub mod stream;

mod error;

pub use dev_stream::{AudioArea, DevStream, PullResult};
pub use device_list::DeviceList;
pub use engine::{severe_underrun_margin, AudioEngine, DEV_BUFFER_HINT_FRAMES};
pub use error::{EngineError, EngineResult};
pub use iodev::{Backend, DeviceState, Iodev};
pub use message::{EngineCommand, EngineEvent, EngineSnapshot};
pub use node::{Node, NodeId, NodeType};
pub use observer::{ObserverEvent, ObserverRegistry};
pub use shm::AudioShm;
pub use stream::{ClientType, EffectFlags, RStream, StreamId, StreamParams};

// Re-export the format types streams and devices are described with
pub use tern_dsp::{AudioFormat, Direction, SampleFormat};
