//! USB Output Device Blocklist
//!
//! A text file with one `[USB_Outputs]` section lists USB playback devices
//! the server must not expose. Keys are
//! `vendorid_productid_checksum_deviceindex = 1` with vendor/product as
//! lowercase hex (no `0x`), checksum as exactly 8 hex digits (the POSIX
//! `cksum` of the USB `descriptors` sysfs file, computed by the device
//! enumeration layer), and the device index in decimal.
//!
//! A missing file means an empty blocklist; malformed lines are logged and
//! skipped, never fatal.

use std::collections::HashSet;
use std::path::Path;

use tracing::{info, warn};

/// Parsed blocklist; the check is pure over the parsed set.
#[derive(Debug, Clone, Default)]
pub struct Blocklist {
    entries: HashSet<(u16, u16, u32, u32)>,
}

impl Blocklist {
    /// Load from a file path. Missing file yields the empty blocklist.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let list = Self::parse(&text);
                info!(?path, entries = list.entries.len(), "loaded USB blocklist");
                list
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                warn!(?path, error = %e, "failed to read USB blocklist, using empty");
                Self::default()
            }
        }
    }

    /// Parse the blocklist text
    pub fn parse(text: &str) -> Self {
        let mut entries = HashSet::new();
        let mut in_section = false;

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') {
                in_section = line == "[USB_Outputs]";
                continue;
            }
            if !in_section {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = lineno + 1, "blocklist line has no '=', skipping");
                continue;
            };
            if value.trim() != "1" {
                continue;
            }
            match parse_key(key.trim()) {
                Some(entry) => {
                    entries.insert(entry);
                }
                None => {
                    warn!(line = lineno + 1, key = key.trim(), "malformed blocklist key");
                }
            }
        }

        Self { entries }
    }

    /// Whether a USB output is blocked.
    ///
    /// Pure over the parsed config: the same four values always produce the
    /// same answer.
    pub fn contains(&self, vendor_id: u16, product_id: u16, checksum: u32, device_index: u32) -> bool {
        self.entries
            .contains(&(vendor_id, product_id, checksum, device_index))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `vendorid_productid_checksum_index`, strict field widths
fn parse_key(key: &str) -> Option<(u16, u16, u32, u32)> {
    let mut parts = key.split('_');
    let vendor = parts.next()?;
    let product = parts.next()?;
    let checksum = parts.next()?;
    let index = parts.next()?;
    if parts.next().is_some() {
        return None;
    }
    if vendor.len() != 4 || product.len() != 4 || checksum.len() != 8 {
        return None;
    }
    // Lowercase hex only; a key that round-trips differently is a typo, not
    // an alternate spelling.
    for field in [vendor, product, checksum] {
        if field.chars().any(|c| c.is_ascii_uppercase()) {
            return None;
        }
    }
    Some((
        u16::from_str_radix(vendor, 16).ok()?,
        u16::from_str_radix(product, 16).ok()?,
        u32::from_str_radix(checksum, 16).ok()?,
        index.parse().ok()?,
    ))
}
