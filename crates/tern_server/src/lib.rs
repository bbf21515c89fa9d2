//! Tern Server - control plane library
//!
//! Everything `ternd` is made of: the client wire protocol ([`rpc`]), the
//! control thread that owns all sockets and the device list ([`server`]),
//! and the server-side error type ([`error`]). Split out as a library so
//! protocol and session handling stay testable without a running daemon.

pub mod error;
pub mod rpc;
pub mod server;

pub use error::{ServerError, ServerResult};
pub use server::Server;
