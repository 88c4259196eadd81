//! Streaming measurement command.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use console::style;
use log::info;
use vztrack::{
    start_measurement, Line, LineSettings, NativeLine, Sample, Severity, ValidationOptions,
};

use crate::commands::detect::resolve_endpoint;
use crate::config;

/// Open and configure a native line the way the tracker expects it.
pub(crate) fn open_line(port: &str, baud: u32) -> Result<NativeLine> {
    let mut line =
        NativeLine::open(port).with_context(|| format!("opening {port}"))?;
    // XON threshold as captured for the respective baud rate.
    let xon = if baud == 2_000_000 { 22 } else { 82 };
    line.configure(&LineSettings::tracker(baud, xon))?;
    line.set_rts(true)?;
    line.set_dtr(true)?;
    Ok(line)
}

/// Measure command implementation.
pub(crate) fn cmd_measure(
    settings_dir: &Path,
    port: Option<&str>,
    baud: Option<u32>,
    freq: u32,
    duration_secs: u64,
    marker_args: &[String],
    out: Option<PathBuf>,
) -> Result<()> {
    let (port, baud) = resolve_endpoint(settings_dir, port, baud)?;
    let markers = config::resolve_markers(settings_dir, marker_args)?;

    // Pre-flight validation; errors abort before the port is touched.
    let issues = vztrack::validate(freq, &markers, &ValidationOptions::default());
    let mut errors = 0;
    for issue in &issues {
        match issue.severity {
            Severity::Error => {
                eprintln!("{} {}", style("error:").red().bold(), issue.message);
                errors += 1;
            }
            Severity::Warning => {
                eprintln!("{} {}", style("warning:").yellow().bold(), issue.message);
            }
        }
    }
    if errors > 0 {
        anyhow::bail!("invalid measurement setup");
    }

    let out_path = match out {
        Some(p) => p,
        None => generated_log_path()?,
    };
    let mut log_file = fs::File::create(&out_path)
        .with_context(|| format!("creating {}", out_path.display()))?;
    eprintln!("Logging frames to {}", out_path.display());

    let mut line = open_line(&port, baud)?;
    eprintln!(
        "Starting measurement on {port} at {freq} Hz ({} markers)...",
        markers.len()
    );
    let mut session = start_measurement(&mut line, freq, &markers, 3000)
        .context("starting measurement")?;

    let started = Instant::now();
    let budget = Duration::from_secs(duration_secs);
    let mut samples: Vec<Sample> = Vec::new();
    let mut frame: Vec<Sample> = Vec::new();
    let mut frame_count = 0u64;

    loop {
        if vztrack::is_interrupt_requested() {
            eprintln!("Interrupted, stopping...");
            break;
        }
        if duration_secs > 0 && started.elapsed() >= budget {
            break;
        }

        samples.clear();
        session.fetch(&mut samples);
        if let Some(fault) = session.fault() {
            eprintln!("{} transport fault: {fault}", style("error:").red().bold());
            break;
        }
        for s in &samples {
            println!(
                "t={:10} TCM{} LED{:2} x={:9.2} y={:9.2} z={:9.2}  amb={} R:{} C:{} L:{}{}",
                s.timestamp_us,
                s.tcm_id,
                s.led_id,
                s.x_mm(),
                s.y_mm(),
                s.z_mm(),
                s.ambient_light,
                s.right_eye.anomaly,
                s.center_eye.anomaly,
                s.left_eye.anomaly,
                if s.end_of_frame { " EOF" } else { "" }
            );
            frame.push(s.clone());
            if s.end_of_frame {
                write_frame_ndjson(&mut log_file, &frame)?;
                frame.clear();
                frame_count += 1;
            }
        }
        std::thread::sleep(Duration::from_millis(1));
    }

    // Flush a trailing partial frame before stopping.
    write_frame_ndjson(&mut log_file, &frame)?;
    let acked = session.stop();
    info!("STOP acknowledged: {acked}");
    eprintln!("{frame_count} frame(s) logged to {}", out_path.display());
    Ok(())
}

/// One NDJSON line per completed frame.
fn write_frame_ndjson(file: &mut fs::File, frame: &[Sample]) -> Result<()> {
    if frame.is_empty() {
        return Ok(());
    }
    let markers: Vec<serde_json::Value> = frame
        .iter()
        .map(|s| {
            serde_json::json!({
                "tcmId": s.tcm_id,
                "ledId": s.led_id,
                "position": { "x": s.x_mm(), "y": s.y_mm(), "z": s.z_mm() },
                "quality": {
                    "ambientLight": s.ambient_light,
                    "coordStatus": s.coord_status,
                    "rightEye": { "signal": u8::from(s.right_eye.signal_low), "status": s.right_eye.anomaly },
                    "centerEye": { "signal": u8::from(s.center_eye.signal_low), "status": s.center_eye.anomaly },
                    "leftEye": { "signal": u8::from(s.left_eye.signal_low), "status": s.left_eye.anomaly },
                },
            })
        })
        .collect();
    let record = serde_json::json!({
        "frame": {
            "timestamp_us": frame[0].timestamp_us,
            "markerCount": frame.len(),
            "triggerIndex": frame[0].trigger_index,
        },
        "markers": markers,
    });
    writeln!(file, "{record}")?;
    file.flush()?;
    Ok(())
}

/// Timestamped path under `Output/`.
fn generated_log_path() -> Result<PathBuf> {
    fs::create_dir_all("Output").context("creating Output directory")?;
    let now = chrono::Local::now();
    Ok(PathBuf::from(format!(
        "Output/Measure_{}.ndjson",
        now.format("%Y%m%d_%H%M")
    )))
}
