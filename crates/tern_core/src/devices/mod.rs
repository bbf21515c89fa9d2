//! Device Backends
//!
//! The engine-facing device abstraction is [`crate::iodev::Iodev`]; these
//! modules hold the state each backend variant owns. The ALSA and
//! Bluetooth wrappers live in `tern_platform`; here are the fully in-process
//! ones: the silence-clocked empty device, the loopback tap, and the
//! scriptable sim backend the engine tests run against.

pub mod bt;
pub mod empty;
pub mod loopback;
pub mod sim;
