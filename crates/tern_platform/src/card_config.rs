//! Per-Card Volume Curve Config
//!
//! Each ALSA card may ship an INI file naming volume curves for its nodes.
//! Section names are node labels, resolved in priority order: UCM device
//! name, then jack name, then mixer control name. Keys per section:
//!
//! ```ini
//! [Headphone Jack]
//! volume_curve = simple_step
//! max_volume = -300
//! volume_step = 75
//!
//! [Speaker]
//! volume_curve = explicit
//! dB_at_0 = -7000
//! ...
//! dB_at_100 = 0
//! ```
//!
//! All dB values are dBFS x 100. A file that fails to parse is logged and
//! replaced by the empty config (nodes then use the default curve).

use std::path::Path;

use tracing::{info, warn};

use tern_dsp::{VolumeCurve, MAX_VOLUME_STEP};

use crate::error::{PlatformError, PlatformResult};

/// Parsed card config: node label -> volume curve, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CardConfig {
    sections: Vec<(String, VolumeCurve)>,
}

impl CardConfig {
    /// Load for a card name from `dir/<card>.ini`. Missing file or parse
    /// failure yields the empty config.
    pub fn load(dir: &Path, card: &str) -> Self {
        let path = dir.join(format!("{card}.ini"));
        let text = match std::fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!(?path, error = %e, "failed to read card config");
                return Self::default();
            }
        };
        match Self::parse(&text) {
            Ok(config) => {
                info!(?path, sections = config.sections.len(), "loaded card config");
                config
            }
            Err(e) => {
                warn!(?path, error = %e, "bad card config, using defaults");
                Self::default()
            }
        }
    }

    /// Parse config text
    pub fn parse(text: &str) -> PlatformResult<Self> {
        let mut sections: Vec<(String, VolumeCurve)> = Vec::new();
        let mut current: Option<(String, Vec<(String, i32, usize)>)> = None;

        let mut flush =
            |pending: Option<(String, Vec<(String, i32, usize)>)>,
             out: &mut Vec<(String, VolumeCurve)>|
             -> PlatformResult<()> {
                if let Some((name, keys)) = pending {
                    let curve = build_curve(&name, &keys)?;
                    out.push((name, curve));
                }
                Ok(())
            };

        for (lineno, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                flush(current.take(), &mut sections)?;
                current = Some((name.to_string(), Vec::new()));
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(PlatformError::ConfigParse {
                    line: lineno + 1,
                    reason: "expected 'key = value'".into(),
                });
            };
            let Some((_, keys)) = current.as_mut() else {
                return Err(PlatformError::ConfigParse {
                    line: lineno + 1,
                    reason: "key outside any section".into(),
                });
            };
            let key = key.trim().to_string();
            let value = value.trim();
            if key == "volume_curve" {
                // Curve kind is encoded as a sentinel so ordering against
                // the numeric keys is preserved for validation.
                let kind = match value {
                    "simple_step" => 0,
                    "explicit" => 1,
                    other => {
                        return Err(PlatformError::ConfigParse {
                            line: lineno + 1,
                            reason: format!("unknown volume_curve '{other}'"),
                        })
                    }
                };
                keys.push((key, kind, lineno + 1));
            } else {
                let parsed = value.parse::<i32>().map_err(|_| PlatformError::ConfigParse {
                    line: lineno + 1,
                    reason: format!("'{value}' is not an integer"),
                })?;
                keys.push((key, parsed, lineno + 1));
            }
        }
        flush(current.take(), &mut sections)?;

        Ok(Self { sections })
    }

    /// Emit canonical config text. `parse(emit(c)) == c`, and for input
    /// already in canonical form `emit(parse(t)) == t`.
    pub fn emit(&self) -> String {
        let mut out = String::new();
        for (i, (name, curve)) in self.sections.iter().enumerate() {
            if i > 0 {
                out.push('\n');
            }
            out.push_str(&format!("[{name}]\n"));
            match curve {
                VolumeCurve::SimpleStep {
                    max_volume,
                    volume_step,
                } => {
                    out.push_str("volume_curve = simple_step\n");
                    out.push_str(&format!("max_volume = {max_volume}\n"));
                    out.push_str(&format!("volume_step = {volume_step}\n"));
                }
                VolumeCurve::Explicit(values) => {
                    out.push_str("volume_curve = explicit\n");
                    for (step, v) in values.iter().enumerate() {
                        out.push_str(&format!("dB_at_{step} = {v}\n"));
                    }
                }
            }
        }
        out
    }

    /// Find the curve for a node. Labels are tried in priority order: UCM
    /// device name, jack name, mixer control name.
    pub fn curve_for(
        &self,
        ucm_name: Option<&str>,
        jack_name: Option<&str>,
        mixer_name: Option<&str>,
    ) -> Option<&VolumeCurve> {
        for label in [ucm_name, jack_name, mixer_name].into_iter().flatten() {
            if let Some((_, curve)) = self.sections.iter().find(|(name, _)| name == label) {
                return Some(curve);
            }
        }
        None
    }

    pub fn sections(&self) -> impl Iterator<Item = &(String, VolumeCurve)> {
        self.sections.iter()
    }
}

fn build_curve(section: &str, keys: &[(String, i32, usize)]) -> PlatformResult<VolumeCurve> {
    let kind = keys
        .iter()
        .find(|(k, _, _)| k == "volume_curve")
        .ok_or_else(|| PlatformError::ConfigParse {
            line: 0,
            reason: format!("section [{section}] missing volume_curve"),
        })?;

    let get = |name: &str| keys.iter().find(|(k, _, _)| k == name).map(|(_, v, _)| *v);

    if kind.1 == 0 {
        let max_volume = get("max_volume").ok_or_else(|| PlatformError::ConfigParse {
            line: kind.2,
            reason: format!("section [{section}] missing max_volume"),
        })?;
        let volume_step = get("volume_step").ok_or_else(|| PlatformError::ConfigParse {
            line: kind.2,
            reason: format!("section [{section}] missing volume_step"),
        })?;
        return VolumeCurve::simple_step(max_volume, volume_step).map_err(|e| {
            PlatformError::ConfigParse {
                line: kind.2,
                reason: e.to_string(),
            }
        });
    }

    let mut values = Vec::with_capacity(MAX_VOLUME_STEP + 1);
    for step in 0..=MAX_VOLUME_STEP {
        let v = get(&format!("dB_at_{step}")).ok_or_else(|| PlatformError::ConfigParse {
            line: kind.2,
            reason: format!("section [{section}] missing dB_at_{step}"),
        })?;
        values.push(v);
    }
    VolumeCurve::explicit(values).map_err(|e| PlatformError::ConfigParse {
        line: kind.2,
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE: &str = "[Headphone Jack]\n\
                          volume_curve = simple_step\n\
                          max_volume = -300\n\
                          volume_step = 75\n";

    #[test]
    fn test_parse_simple_step() {
        let config = CardConfig::parse(SIMPLE).unwrap();
        let curve = config.curve_for(None, Some("Headphone Jack"), None).unwrap();
        assert_eq!(curve.db_at(100), -300);
        assert_eq!(curve.db_at(0), -7800);
    }

    #[test]
    fn test_parse_explicit() {
        let mut text = String::from("[Speaker]\nvolume_curve = explicit\n");
        for step in 0..=100 {
            text.push_str(&format!("dB_at_{step} = {}\n", (step as i32 - 100) * 50));
        }
        let config = CardConfig::parse(&text).unwrap();
        let curve = config.curve_for(Some("Speaker"), None, None).unwrap();
        assert_eq!(curve.db_at(100), 0);
        assert_eq!(curve.db_at(0), -5000);
    }

    #[test]
    fn test_explicit_missing_entry_rejected() {
        let mut text = String::from("[Speaker]\nvolume_curve = explicit\n");
        for step in 0..=99 {
            text.push_str(&format!("dB_at_{step} = 0\n"));
        }
        assert!(CardConfig::parse(&text).is_err());
    }

    #[test]
    fn test_label_priority() {
        let text = "[UcmDev]\nvolume_curve = simple_step\nmax_volume = -100\nvolume_step = 50\n\n\
                    [JackName]\nvolume_curve = simple_step\nmax_volume = -200\nvolume_step = 50\n";
        let config = CardConfig::parse(text).unwrap();

        // UCM name wins over jack name
        let curve = config
            .curve_for(Some("UcmDev"), Some("JackName"), None)
            .unwrap();
        assert_eq!(curve.db_at(100), -100);

        // Falls through to jack name when UCM is unknown
        let curve = config
            .curve_for(Some("missing"), Some("JackName"), None)
            .unwrap();
        assert_eq!(curve.db_at(100), -200);

        assert!(config.curve_for(Some("x"), Some("y"), Some("z")).is_none());
    }

    #[test]
    fn test_emit_parse_identity() {
        let mut explicit = String::from("[Speaker]\nvolume_curve = explicit\n");
        for step in 0..=100 {
            explicit.push_str(&format!("dB_at_{step} = {}\n", -(step as i32)));
        }
        let text = format!("{SIMPLE}\n{explicit}");

        let config = CardConfig::parse(&text).unwrap();
        let emitted = config.emit();
        // Canonical input survives a parse/emit round trip byte-for-byte
        assert_eq!(emitted, text);
        // And the emitted form re-parses to the same config
        assert_eq!(CardConfig::parse(&emitted).unwrap(), config);
    }

    #[test]
    fn test_unknown_curve_kind_rejected() {
        let text = "[X]\nvolume_curve = log\n";
        assert!(CardConfig::parse(text).is_err());
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = CardConfig::load(dir.path(), "nocard");
        assert_eq!(config, CardConfig::default());
    }

    #[test]
    fn test_load_bad_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("card.ini"), "[X]\nvolume_curve = bogus\n").unwrap();
        let config = CardConfig::load(dir.path(), "card");
        assert_eq!(config, CardConfig::default());
    }
}
