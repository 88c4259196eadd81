//! Persisted settings.
//!
//! Two JSON files live in the settings directory (default `Settings/`):
//! `detect.json` lists the trackers found by discovery, `markers.json`
//! the marker configuration found by the probe scan. Both are written
//! after a successful scan and re-loaded on later runs, so measurement
//! can start without repeating the scans.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};
use vztrack::{DetectedTcm, MarkerEntry};

/// File name for discovery results.
const DETECT_FILE: &str = "detect.json";

/// File name for the marker configuration.
const MARKERS_FILE: &str = "markers.json";

/// One tracker found by discovery.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackerEntry {
    /// Endpoint name.
    pub port_name: String,
    /// Baud rate the tracker answered at.
    pub baud_rate: u32,
    /// Serial number from the boot announcement, if definitive.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// True when only the driver indicator responded.
    #[serde(default)]
    pub presumptive: bool,
}

/// Saved marker configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkerConfig {
    /// Detected TCMs with per-marker detection rates.
    pub tcms: Vec<DetectedTcm>,
    /// Flattened marker list ready for a measurement session.
    pub marker_list: Vec<MarkerEntry>,
}

fn detect_path(dir: &Path) -> PathBuf {
    dir.join(DETECT_FILE)
}

fn markers_path(dir: &Path) -> PathBuf {
    dir.join(MARKERS_FILE)
}

/// Persist discovery results.
pub fn save_trackers(dir: &Path, trackers: &[TrackerEntry]) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating settings directory {}", dir.display()))?;
    let path = detect_path(dir);
    fs::write(&path, serde_json::to_string_pretty(trackers)?)
        .with_context(|| format!("writing {}", path.display()))?;
    debug!("Saved {} tracker(s) to {}", trackers.len(), path.display());
    Ok(())
}

/// Load saved discovery results; empty when the file does not exist.
pub fn load_trackers(dir: &Path) -> Result<Vec<TrackerEntry>> {
    let path = detect_path(dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let trackers: Vec<TrackerEntry> =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    debug!("Loaded {} tracker(s) from {}", trackers.len(), path.display());
    Ok(trackers)
}

/// Persist a marker configuration.
pub fn save_markers(dir: &Path, config: &MarkerConfig) -> Result<()> {
    fs::create_dir_all(dir)
        .with_context(|| format!("creating settings directory {}", dir.display()))?;
    let path = markers_path(dir);
    fs::write(&path, serde_json::to_string_pretty(config)?)
        .with_context(|| format!("writing {}", path.display()))?;
    debug!(
        "Saved marker config ({} markers) to {}",
        config.marker_list.len(),
        path.display()
    );
    Ok(())
}

/// Load the saved marker configuration, if any.
pub fn load_markers(dir: &Path) -> Result<Option<MarkerConfig>> {
    let path = markers_path(dir);
    if !path.exists() {
        return Ok(None);
    }
    let content =
        fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    let config: MarkerConfig =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(config))
}

/// Parse `tcm:led[:flash]` marker arguments.
pub fn parse_marker_args(args: &[String]) -> Result<Vec<MarkerEntry>> {
    let mut markers = Vec::with_capacity(args.len());
    for arg in args {
        let parts: Vec<&str> = arg.split(':').collect();
        if parts.len() < 2 || parts.len() > 3 {
            anyhow::bail!("invalid marker '{arg}', expected tcm:led or tcm:led:flash");
        }
        let tcm: u8 = parts[0].parse().with_context(|| format!("bad TCM id in '{arg}'"))?;
        let led: u8 = parts[1].parse().with_context(|| format!("bad LED id in '{arg}'"))?;
        let flash: u8 = match parts.get(2) {
            Some(p) => p.parse().with_context(|| format!("bad flash count in '{arg}'"))?,
            None => 1,
        };
        markers.push(MarkerEntry::new(tcm, led, flash));
    }
    Ok(markers)
}

/// Resolve the markers for a measurement: explicit arguments win, then
/// the saved configuration, then a small default scan set.
pub fn resolve_markers(dir: &Path, args: &[String]) -> Result<Vec<MarkerEntry>> {
    if !args.is_empty() {
        return parse_marker_args(args);
    }
    if let Some(config) = load_markers(dir)? {
        if !config.marker_list.is_empty() {
            return Ok(config.marker_list);
        }
    }
    // Default: TCM 1-2, LED 1-3.
    let mut markers = Vec::new();
    for tcm in 1..=2 {
        for led in 1..=3 {
            markers.push(MarkerEntry::new(tcm, led, 1));
        }
    }
    Ok(markers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_marker_args() {
        let markers =
            parse_marker_args(&["1:1".into(), "2:5:3".into()]).unwrap();
        assert_eq!(markers, vec![MarkerEntry::new(1, 1, 1), MarkerEntry::new(2, 5, 3)]);

        assert!(parse_marker_args(&["1".into()]).is_err());
        assert!(parse_marker_args(&["1:2:3:4".into()]).is_err());
        assert!(parse_marker_args(&["x:1".into()]).is_err());
    }

    #[test]
    fn test_tracker_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let trackers = vec![TrackerEntry {
            port_name: "COM7".into(),
            baud_rate: 2_500_000,
            serial_number: Some("703710".into()),
            presumptive: false,
        }];
        save_trackers(dir.path(), &trackers).unwrap();
        let loaded = load_trackers(dir.path()).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].port_name, "COM7");
        assert_eq!(loaded[0].serial_number.as_deref(), Some("703710"));
    }

    #[test]
    fn test_resolve_markers_fallback() {
        let dir = tempfile::tempdir().unwrap();
        let markers = resolve_markers(dir.path(), &[]).unwrap();
        assert_eq!(markers.len(), 6);
        assert_eq!(markers[0], MarkerEntry::new(1, 1, 1));
    }
}
