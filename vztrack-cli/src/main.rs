//! vztrack CLI - Command-line tool for Phoenix-class optical trackers.
//!
//! ## Features
//!
//! - Tracker discovery across serial endpoints
//! - Automatic marker/TCM configuration scan
//! - Streaming measurement with NDJSON frame logging
//! - Setup validation against hardware operational limits
//! - Offline bus-capture conversion to JSON

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;

mod commands;
mod config;

/// vztrack - drive a Phoenix-class 3D optical tracker over serial.
///
/// Environment variables:
///   VZTRACK_PORT          - Default serial port
///   VZTRACK_SETTINGS_DIR  - Settings directory (default: Settings)
#[derive(Parser)]
#[command(name = "vztrack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use (taken from saved detection settings if not
    /// specified).
    #[arg(short, long, global = true, env = "VZTRACK_PORT")]
    port: Option<String>,

    /// Directory for persisted settings.
    #[arg(
        long,
        global = true,
        default_value = "Settings",
        env = "VZTRACK_SETTINGS_DIR"
    )]
    settings_dir: PathBuf,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// List available serial endpoints.
    ListPorts {
        /// Output port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Run tracker discovery on one or more endpoints.
    Detect {
        /// Endpoints to probe (all enumerated ports if omitted).
        ports: Vec<String>,

        /// Output results as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Do not persist results to the settings directory.
        #[arg(long)]
        no_save: bool,
    },

    /// Auto-detect connected TCMs and active LED markers.
    Markers {
        /// Baud rate (taken from saved detection settings if omitted).
        #[arg(short, long)]
        baud: Option<u32>,

        /// Highest TCM id to scan.
        #[arg(long, default_value = "8")]
        max_tcm: u8,

        /// Highest LED id to scan per TCM.
        #[arg(long, default_value = "16")]
        max_led: u8,

        /// Probe measurement frequency in Hz.
        #[arg(long, default_value = "10")]
        freq: u32,

        /// Warm-up duration in milliseconds.
        #[arg(long, default_value = "2000")]
        warmup_ms: u64,

        /// Evaluation duration in milliseconds.
        #[arg(long, default_value = "1500")]
        eval_ms: u64,

        /// Minimum evaluation frames per marker.
        #[arg(long, default_value = "3")]
        min_frames: u32,

        /// Detection threshold (fraction of clean frames).
        #[arg(long, default_value = "0.5")]
        threshold: f64,

        /// Output results as JSON to stdout.
        #[arg(long)]
        json: bool,

        /// Do not persist results to the settings directory.
        #[arg(long)]
        no_save: bool,
    },

    /// Start a measurement and stream samples.
    Measure {
        /// Baud rate (taken from saved detection settings if omitted).
        #[arg(short, long)]
        baud: Option<u32>,

        /// Measurement frequency in Hz.
        #[arg(short, long, default_value = "10")]
        freq: u32,

        /// Duration in seconds (runs until Ctrl-C when 0).
        #[arg(short, long, default_value = "3")]
        duration: u64,

        /// Markers as tcm:led[:flash] pairs (saved config if omitted).
        #[arg(long, value_delimiter = ',')]
        markers: Vec<String>,

        /// NDJSON output file (auto-generated under Output/ if omitted).
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Validate a measurement setup without touching hardware.
    Check {
        /// Measurement frequency in Hz.
        #[arg(short, long, default_value = "10")]
        freq: u32,

        /// Markers as tcm:led[:flash] pairs (saved config if omitted).
        #[arg(long, value_delimiter = ',')]
        markers: Vec<String>,

        /// Sample Operation Time (2-15).
        #[arg(long, default_value = "3")]
        sot: u8,

        /// Assume double sampling.
        #[arg(long)]
        double_sampling: bool,

        /// Assume tetherless operation.
        #[arg(long)]
        tetherless: bool,

        /// Auto-exposure gain.
        #[arg(long, default_value = "0")]
        gain: u8,

        /// Output issues as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Convert an offline bus capture to JSON.
    Convert {
        /// Capture file to convert.
        input: PathBuf,

        /// Output file (input with .json extension if omitted).
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match (cli.quiet, cli.verbose) {
        (true, _) => "error",
        (_, 0) => "warn",
        (_, 1) => "info",
        (_, 2) => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .init();

    // Ctrl-C requests a cooperative stop of long-running library loops.
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&interrupted);
        vztrack::set_interrupt_checker(move || flag.load(Ordering::Relaxed));
    }
    let flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || {
        flag.store(true, Ordering::Relaxed);
    }) {
        debug!("Could not install Ctrl-C handler: {e}");
    }

    let result = run(cli);
    if let Err(e) = result {
        eprintln!("{} {e:#}", console::style("error:").red().bold());
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::ListPorts { json } => commands::detect::cmd_list_ports(json),
        Commands::Detect { ports, json, no_save } => {
            commands::detect::cmd_detect(&cli.settings_dir, ports, json, !no_save)
        }
        Commands::Markers {
            baud,
            max_tcm,
            max_led,
            freq,
            warmup_ms,
            eval_ms,
            min_frames,
            threshold,
            json,
            no_save,
        } => commands::markers::cmd_markers(
            &cli.settings_dir,
            cli.port.as_deref(),
            baud,
            vztrack::ProbeOptions {
                max_tcm_id: max_tcm,
                max_led_id: max_led,
                probe_freq_hz: freq,
                warmup_ms,
                eval_ms,
                min_frames,
                detection_threshold: threshold,
            },
            json,
            !no_save,
        ),
        Commands::Measure { baud, freq, duration, markers, out } => {
            commands::measure::cmd_measure(
                &cli.settings_dir,
                cli.port.as_deref(),
                baud,
                freq,
                duration,
                &markers,
                out,
            )
        }
        Commands::Check { freq, markers, sot, double_sampling, tetherless, gain, json } => {
            commands::markers::cmd_check(
                &cli.settings_dir,
                freq,
                &markers,
                vztrack::ValidationOptions {
                    sot,
                    double_sampling,
                    tetherless,
                    exposure_gain: gain,
                },
                json,
            )
        }
        Commands::Convert { input, output } => commands::convert::cmd_convert(&input, output),
    }
}
