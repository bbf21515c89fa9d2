//! Tern Platform - Hardware Backends
//!
//! Everything that touches an OS audio interface lives here, behind plain
//! structs the engine wraps into its backend variants:
//!
//! - [`alsa_pcm`]: ALSA PCM devices (hw param negotiation, avail/queued
//!   accounting, xrun recovery)
//! - [`bluetooth`]: A2DP and HFP transports over file descriptors handed to
//!   us by the Bluetooth manager, plus the manager trait itself
//! - [`blocklist`]: USB output device blocklist file
//! - [`card_config`]: per-card volume-curve config files
//!
//! The engine core never calls ALSA or reads config files directly; it goes
//! through this crate so the real-time loop's OS surface stays auditable.

#[cfg(target_os = "linux")]
pub mod alsa_pcm;
pub mod blocklist;
pub mod bluetooth;
pub mod card_config;
mod error;

pub use error::{PlatformError, PlatformResult};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crate_exports() {
        let _ = blocklist::Blocklist::default();
        let _ = card_config::CardConfig::default();
    }
}
