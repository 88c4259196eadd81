//! Endpoint listing and tracker discovery commands.

use std::path::Path;

use anyhow::Result;
use console::style;
use log::warn;
use vztrack::{Error, NativeLineEnumerator, PortEnumerator};

use crate::config::{self, TrackerEntry};

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativeLineEnumerator::list_ports()?;

    if json {
        let entries: Vec<serde_json::Value> = ports
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial_number,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{}", style("No serial endpoints found").dim());
        return Ok(());
    }
    eprintln!("{}", style("Available endpoints:").bold());
    for p in &ports {
        let usb = match (p.vid, p.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = p.product.as_deref().unwrap_or("");
        eprintln!("  {}{usb} {product}", p.name);
    }
    Ok(())
}

/// Detect command implementation.
pub(crate) fn cmd_detect(
    settings_dir: &Path,
    ports: Vec<String>,
    json: bool,
    save: bool,
) -> Result<()> {
    let candidates = if ports.is_empty() {
        NativeLineEnumerator::list_ports()?
            .into_iter()
            .map(|p| p.name)
            .collect()
    } else {
        ports
    };

    if candidates.is_empty() {
        anyhow::bail!("no serial endpoints to probe");
    }

    let mut found = Vec::new();
    for port in &candidates {
        if vztrack::is_interrupt_requested() {
            break;
        }
        eprintln!("Probing {port}...");
        match vztrack::detect(port) {
            Ok(result) => {
                let marker = if result.presumptive {
                    style("PRESUMPTIVE").yellow()
                } else {
                    style("FOUND").green().bold()
                };
                eprintln!(
                    "  {marker} on {} at {} baud{}",
                    result.port_name,
                    result.baud_rate,
                    result
                        .serial_number
                        .as_deref()
                        .map(|s| format!(", serial {s}"))
                        .unwrap_or_default()
                );
                found.push(TrackerEntry {
                    port_name: result.port_name,
                    baud_rate: result.baud_rate,
                    serial_number: result.serial_number,
                    presumptive: result.presumptive,
                });
            }
            Err(Error::NotFound) => eprintln!("  no tracker"),
            Err(e) => warn!("Probe failed on {port}: {e}"),
        }
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&found)?);
    } else {
        eprintln!(
            "{} tracker(s) found on {} endpoint(s)",
            found.len(),
            candidates.len()
        );
    }

    if save && !found.is_empty() {
        config::save_trackers(settings_dir, &found)?;
        eprintln!("Saved to {}", settings_dir.join("detect.json").display());
    }
    Ok(())
}

/// Resolve the endpoint and baud rate for a hardware command: explicit
/// arguments win, then the first saved tracker.
pub(crate) fn resolve_endpoint(
    settings_dir: &Path,
    port: Option<&str>,
    baud: Option<u32>,
) -> Result<(String, u32)> {
    let saved = config::load_trackers(settings_dir)?;
    let port = match port {
        Some(p) => p.to_string(),
        None => saved
            .first()
            .map(|t| t.port_name.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("no port given and no saved detection; run `vztrack detect` first")
            })?,
    };
    let baud = baud
        .or_else(|| {
            saved
                .iter()
                .find(|t| t.port_name == port)
                .map(|t| t.baud_rate)
        })
        .unwrap_or(2_500_000);
    Ok((port, baud))
}
