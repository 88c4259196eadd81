//! Tracker discovery on a serial endpoint.
//!
//! A tracker announces itself exactly once: the DTR toggle below is a
//! physical MCU reset, and the 19-byte boot announcement that follows is
//! the only definitive presence signal. Discovery provokes that
//! announcement at each candidate baud rate and scans for it.
//!
//! A driver-level indicator (the input queue going non-zero while the
//! port is being provoked) is tracked as a *presumptive* signal for
//! endpoints where the announcement is missed; it never outranks the
//! announcement and never short-circuits the remaining passes.

use log::{debug, info, trace};

use crate::error::{Error, Result};
use crate::line::{Line, LineSettings, Purge};
use crate::protocol::record::{BootAnnouncement, RECORD_SIZE};

/// Parameters for one detection pass.
#[derive(Debug, Clone, Copy)]
pub struct DetectionPass {
    /// Baud rate probed by this pass.
    pub baud_rate: u32,
    /// XON threshold for the first handshake configuration.
    pub xon_limit_first: u16,
    /// XON threshold for the repeated handshake configuration.
    pub xon_limit_settled: u16,
}

/// Baud rates and XON thresholds tried in order, as captured from the
/// reference host.
pub const DETECTION_PASSES: [DetectionPass; 2] = [
    DetectionPass { baud_rate: 2_000_000, xon_limit_first: 14, xon_limit_settled: 22 },
    DetectionPass { baud_rate: 2_500_000, xon_limit_first: 74, xon_limit_settled: 82 },
];

/// DTR toggle spacing.
const DTR_TOGGLE_DELAY_MS: u64 = 10;

/// Settle delay after the final DTR assert.
const DTR_SETTLE_DELAY_MS: u64 = 190;

/// Driver-indicator polling.
const INDICATOR_MAX_POLLS: u32 = 14;
const INDICATOR_POLL_INTERVAL_MS: u64 = 110;

/// Window for the boot announcement after the reset.
const BOOT_READ_TIMEOUT_MS: u64 = 2500;
const BOOT_READ_INTER_BYTE_MS: u64 = 50;

/// Result of a successful detection.
#[derive(Debug, Clone)]
pub struct DetectionResult {
    /// Endpoint the tracker answered on.
    pub port_name: String,
    /// Baud rate of the successful pass.
    pub baud_rate: u32,
    /// Serial number from the boot announcement, as a decimal string.
    /// `None` on a presumptive (indicator-only) hit.
    pub serial_number: Option<String>,
    /// True when only the driver indicator responded; the announcement
    /// is the authoritative signal.
    pub presumptive: bool,
}

#[derive(Debug, Default)]
struct PassOutcome {
    announcement: Option<BootAnnouncement>,
    indicator: bool,
}

/// Run the discovery sequence against lines produced by `reopen`.
///
/// The opener is invoked once per required open: discovery opens the
/// endpoint twice up front to force a clean driver state, and reopens
/// between passes. Transports that cannot toggle DTR report
/// [`Error::NotFound`]: without the physical reset no announcement can
/// be provoked, and guessing would report ghosts.
pub fn detect_with<L, F>(port_name: &str, mut reopen: F) -> Result<DetectionResult>
where
    L: Line,
    F: FnMut() -> Result<L>,
{
    info!("Starting detection on {port_name}");

    // Open twice: the first open clears any wedged driver state.
    drop(reopen()?);
    let mut line = reopen()?;

    let mut presumptive: Option<DetectionResult> = None;

    for (i, pass) in DETECTION_PASSES.iter().enumerate() {
        debug!("Pass {}: trying {} baud", i + 1, pass.baud_rate);

        let outcome = match run_detection_pass(&mut line, pass) {
            Ok(outcome) => outcome,
            Err(Error::Unsupported(reason)) => {
                // No DTR control means no physical reset, so the
                // announcement can never arrive. Do not guess.
                debug!("Control lines unavailable on {port_name}: {reason}");
                return Err(Error::NotFound);
            }
            Err(e) => return Err(e),
        };

        if let Some(boot) = outcome.announcement {
            let serial = boot.serial_string();
            info!(
                "Tracker detected on {port_name} at {} baud, serial {serial}",
                pass.baud_rate
            );
            return Ok(DetectionResult {
                port_name: port_name.to_string(),
                baud_rate: pass.baud_rate,
                serial_number: Some(serial),
                presumptive: false,
            });
        }

        if outcome.indicator && presumptive.is_none() {
            debug!("Driver indicator responded at {} baud (presumptive)", pass.baud_rate);
            presumptive = Some(DetectionResult {
                port_name: port_name.to_string(),
                baud_rate: pass.baud_rate,
                serial_number: None,
                presumptive: true,
            });
        }

        debug!("No announcement at {} baud", pass.baud_rate);

        // Re-open between passes for a clean driver state.
        if i + 1 < DETECTION_PASSES.len() {
            drop(line);
            line = reopen()?;
        }
    }

    match presumptive {
        Some(result) => {
            info!(
                "Presumptive tracker on {port_name} at {} baud (no announcement)",
                result.baud_rate
            );
            Ok(result)
        }
        None => {
            info!("No tracker on {port_name}");
            Err(Error::NotFound)
        }
    }
}

/// One configuration-provoke-scan cycle at a single baud rate.
fn run_detection_pass<L: Line>(line: &mut L, pass: &DetectionPass) -> Result<PassOutcome> {
    // Read current line state; contents are irrelevant.
    let _ = line.control_lines();

    // DTR toggle: the physical reset that provokes the announcement.
    line.set_dtr(false)?;
    line.sleep_ms(DTR_TOGGLE_DELAY_MS);
    line.set_dtr(true)?;
    line.sleep_ms(DTR_TOGGLE_DELAY_MS);
    line.set_dtr(false)?;
    line.sleep_ms(DTR_TOGGLE_DELAY_MS);
    line.set_dtr(true)?;
    line.sleep_ms(DTR_SETTLE_DELAY_MS);

    line.purge(Purge::All)?;

    // Handshake configuration, twice with adjusted XON thresholds,
    // querying port status in between as the reference host does.
    line.configure(&LineSettings::tracker(pass.baud_rate, pass.xon_limit_first))?;
    let _ = line.input_queue_depth()?;
    let _ = line.control_lines();
    line.configure(&LineSettings::tracker(pass.baud_rate, pass.xon_limit_settled))?;
    let _ = line.input_queue_depth()?;
    let _ = line.control_lines();

    line.set_rts(true)?;
    line.set_dtr(true)?;
    let lines = line.control_lines().unwrap_or_default();
    trace!("Control lines after assert: cts={} dsr={}", lines.cts, lines.dsr);

    // Driver indicator: presumptive only.
    let mut indicator = false;
    for poll in 0..INDICATOR_MAX_POLLS {
        if line.input_queue_depth()? > 0 {
            debug!("Input queue non-zero on poll #{}", poll + 1);
            indicator = true;
            break;
        }
        line.sleep_ms(INDICATOR_POLL_INTERVAL_MS);
    }

    // Scan for the boot announcement: the definitive signal.
    let mut buf = [0u8; 256];
    let got = line.read(&mut buf, BOOT_READ_TIMEOUT_MS, BOOT_READ_INTER_BYTE_MS)?;
    if got < RECORD_SIZE {
        if got > 0 {
            debug!("Read {got} bytes, too short for a boot announcement");
        }
        return Ok(PassOutcome { announcement: None, indicator });
    }

    let announcement = BootAnnouncement::scan(&buf[..got]);
    if announcement.is_none() {
        debug!("No valid boot announcement in {got} bytes");
    }
    Ok(PassOutcome { announcement, indicator })
}

/// Run discovery on a native serial endpoint.
#[cfg(feature = "native")]
pub fn detect(port_name: &str) -> Result<DetectionResult> {
    detect_with(port_name, || crate::line::NativeLine::open(port_name))
}
