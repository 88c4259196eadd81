//! Marker configuration scan and setup validation commands.

use std::path::Path;

use anyhow::{Context, Result};
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use vztrack::{config_detect, validate, Line, ProbeOptions, Severity, ValidationOptions};

use crate::commands::detect::resolve_endpoint;
use crate::commands::measure::open_line;
use crate::config::{self, MarkerConfig};

/// Markers (probe scan) command implementation.
pub(crate) fn cmd_markers(
    settings_dir: &Path,
    port: Option<&str>,
    baud: Option<u32>,
    options: ProbeOptions,
    json: bool,
    save: bool,
) -> Result<()> {
    let (port, baud) = resolve_endpoint(settings_dir, port, baud)?;
    let mut line = open_line(&port, baud)?;

    eprintln!(
        "Scanning TCM 1-{} / LED 1-{} on {} at {baud} baud",
        options.max_tcm_id,
        options.max_led_id,
        line.name()
    );

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::with_template("{spinner} {msg}").unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    spinner.set_message("probing markers (warm-up + evaluation)...");
    spinner.enable_steady_tick(std::time::Duration::from_millis(120));

    let report = config_detect(&mut line, &options);
    spinner.finish_and_clear();
    let report = report.context("probe measurement failed")?;

    if json {
        println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "tcms": report.tcms,
                "markerList": report.marker_list,
                "summary": report.summary,
            }))?
        );
    } else {
        eprintln!("{}", style(&report.summary).bold());
        for tcm in &report.tcms {
            eprintln!("  TCM {}", tcm.tcm_id);
            for m in &tcm.markers {
                eprintln!(
                    "    LED {:2}  {}/{} frames ({:.0}%)",
                    m.led_id,
                    m.frames_detected,
                    m.frames_total,
                    m.detection_rate * 100.0
                );
            }
        }
    }

    if save && !report.marker_list.is_empty() {
        let file = MarkerConfig {
            tcms: report.tcms.clone(),
            marker_list: report.marker_list.clone(),
        };
        config::save_markers(settings_dir, &file)?;
        eprintln!("Saved to {}", settings_dir.join("markers.json").display());
    }
    Ok(())
}

/// Check (offline validation) command implementation.
pub(crate) fn cmd_check(
    settings_dir: &Path,
    freq: u32,
    marker_args: &[String],
    options: ValidationOptions,
    json: bool,
) -> Result<()> {
    let markers = config::resolve_markers(settings_dir, marker_args)?;
    let issues = validate(freq, &markers, &options);

    if json {
        println!("{}", serde_json::to_string_pretty(&issues)?);
    } else if issues.is_empty() {
        println!(
            "{} {freq} Hz with {} markers",
            style("OK").green().bold(),
            markers.len()
        );
    } else {
        for issue in &issues {
            let tag = match issue.severity {
                Severity::Error => style("error:").red().bold(),
                Severity::Warning => style("warning:").yellow().bold(),
            };
            println!("{tag} {}", issue.message);
        }
    }

    let errors = issues.iter().filter(|i| i.severity == Severity::Error).count();
    if errors > 0 {
        anyhow::bail!("{errors} validation error(s)");
    }
    Ok(())
}
