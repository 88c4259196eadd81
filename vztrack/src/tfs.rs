//! Target Flashing Sequence representation and setup validation.
//!
//! The TFS is the ordered list the tracker iterates each frame, firing
//! each `(tcm, led)` pair `flash_count` times. [`validate`] checks a
//! requested setup against the hardware operational limits before any
//! I/O happens; issues classified as [`Severity::Error`] will make the
//! measurement fail or produce wrong data, warnings indicate degraded
//! performance or hardware risk.

use std::collections::BTreeMap;

/// Highest supported measurement frequency in Hz.
pub const MAX_FREQUENCY_HZ: u32 = 4600;

/// Default per-marker sampling period in microseconds.
pub const SAMPLING_PERIOD_US: u32 = 115;

/// System-wide TFS entry limit.
pub const MAX_TFS_ENTRIES: usize = 512;

/// Per-TCM TFS entry limit.
pub const MAX_TFS_ENTRIES_PER_TCM: usize = 64;

/// Maximum number of TCM-ID transitions across the sequence.
pub const MAX_TCM_TRANSITIONS: usize = 64;

/// Supported SOT range.
pub const SOT_RANGE: std::ops::RangeInclusive<u8> = 2..=15;

/// Per-target rate numerator: max target rate = 26040 / effective SOT.
const TARGET_RATE_NUMERATOR: f64 = 26_040.0;

/// A single Target Flashing Sequence entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MarkerEntry {
    /// TCM module id (1..8).
    pub tcm_id: u8,
    /// LED marker id (1..64).
    pub led_id: u8,
    /// Flashes per frame for this marker (1..255, typically 1).
    pub flash_count: u8,
}

impl MarkerEntry {
    /// New entry.
    pub fn new(tcm_id: u8, led_id: u8, flash_count: u8) -> Self {
        Self { tcm_id, led_id, flash_count }
    }
}

/// Issue severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Severity {
    /// The measurement will fail or produce incorrect data.
    Error,
    /// Degraded performance or hardware risk.
    Warning,
}

/// A single validation finding.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ValidationIssue {
    /// Issue severity.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

/// Sampling-mode inputs to [`validate`] beyond frequency and markers.
#[derive(Debug, Clone)]
pub struct ValidationOptions {
    /// Sample Operation Time (2..15).
    pub sot: u8,
    /// Double sampling halves the effective per-target rate.
    pub double_sampling: bool,
    /// Tetherless operation.
    pub tetherless: bool,
    /// Auto-exposure gain.
    pub exposure_gain: u8,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            sot: 3,
            double_sampling: false,
            tetherless: false,
            exposure_gain: 0,
        }
    }
}

fn error(issues: &mut Vec<ValidationIssue>, message: String) {
    issues.push(ValidationIssue { severity: Severity::Error, message });
}

fn warning(issues: &mut Vec<ValidationIssue>, message: String) {
    issues.push(ValidationIssue { severity: Severity::Warning, message });
}

/// Validate a measurement setup against the hardware operational limits.
///
/// Runs in O(markers) and never fails; the returned list is empty for a
/// clean setup.
pub fn validate(
    frequency_hz: u32,
    markers: &[MarkerEntry],
    options: &ValidationOptions,
) -> Vec<ValidationIssue> {
    let mut issues = Vec::new();

    if markers.is_empty() {
        error(&mut issues, "No markers specified".into());
    }

    if frequency_hz < 1 {
        error(
            &mut issues,
            format!("Frequency {frequency_hz} Hz is below minimum of 1 Hz"),
        );
    } else if frequency_hz > MAX_FREQUENCY_HZ {
        error(
            &mut issues,
            format!("Frequency {frequency_hz} Hz exceeds maximum of {MAX_FREQUENCY_HZ} Hz"),
        );
    }

    if !SOT_RANGE.contains(&options.sot) {
        error(
            &mut issues,
            format!(
                "SOT {} is outside the supported range {}-{}",
                options.sot,
                SOT_RANGE.start(),
                SOT_RANGE.end()
            ),
        );
    }

    for (i, m) in markers.iter().enumerate() {
        if !(1..=8).contains(&m.tcm_id) {
            error(
                &mut issues,
                format!("Marker {}: TCM ID out of range (got {}, expected 1-8)", i + 1, m.tcm_id),
            );
        }
        if !(1..=64).contains(&m.led_id) {
            error(
                &mut issues,
                format!("Marker {}: LED ID out of range (got {}, expected 1-64)", i + 1, m.led_id),
            );
        }
        if m.flash_count == 0 {
            error(&mut issues, format!("Marker {}: flash count is 0", i + 1));
        }
    }

    if markers.len() > MAX_TFS_ENTRIES {
        error(
            &mut issues,
            format!(
                "{} markers exceeds system maximum of {MAX_TFS_ENTRIES}",
                markers.len()
            ),
        );
    }

    // Per-TCM entry counts and LED coverage, keyed in TCM order.
    let mut per_tcm: BTreeMap<u8, Vec<u8>> = BTreeMap::new();
    for m in markers {
        per_tcm.entry(m.tcm_id).or_default().push(m.led_id);
    }
    for (tcm, leds) in &per_tcm {
        if leds.len() > MAX_TFS_ENTRIES_PER_TCM {
            error(
                &mut issues,
                format!(
                    "TCM {tcm} has {} marker entries in the TFS (limit {MAX_TFS_ENTRIES_PER_TCM})",
                    leds.len()
                ),
            );
        }
    }

    let transitions = markers
        .windows(2)
        .filter(|w| w[0].tcm_id != w[1].tcm_id)
        .count();
    if transitions > MAX_TCM_TRANSITIONS {
        error(
            &mut issues,
            format!("{transitions} TCM ID transitions in the TFS (limit {MAX_TCM_TRANSITIONS})"),
        );
    }

    let total_flashes: u32 = markers.iter().map(|m| u32::from(m.flash_count)).sum();

    if total_flashes > 0 {
        // Hard limit: one frame cannot be shorter than its active time.
        let max_rate_hz = 1.0 / (f64::from(total_flashes) * f64::from(SAMPLING_PERIOD_US) * 1e-6);
        if f64::from(frequency_hz) > max_rate_hz {
            error(
                &mut issues,
                format!(
                    "Maximum achievable rate is {max_rate_hz:.0} Hz with {total_flashes} \
                     flashes per frame (requested {frequency_hz} Hz)"
                ),
            );
        }

        // Soft limit from the per-target exposure budget.
        if SOT_RANGE.contains(&options.sot) {
            let effective_sot =
                f64::from(options.sot) * if options.double_sampling { 2.0 } else { 1.0 };
            let max_target_hz = TARGET_RATE_NUMERATOR / effective_sot;
            let max_fps = max_target_hz / f64::from(total_flashes);
            if f64::from(frequency_hz) > max_fps {
                warning(
                    &mut issues,
                    format!(
                        "Requested {frequency_hz} Hz exceeds the per-target limit of \
                         {max_fps:.0} Hz (SOT {}, {total_flashes} flashes per frame)",
                        options.sot
                    ),
                );
            }
        }
    }

    if frequency_hz > 100 && markers.iter().any(|m| m.flash_count == 1) {
        warning(
            &mut issues,
            format!(
                "Single-flash markers at {frequency_hz} Hz run a continuous duty cycle; \
                 risk of LED overheat"
            ),
        );
    }

    for (tcm, leds) in &per_tcm {
        let mut sorted: Vec<u8> = leds.clone();
        sorted.sort_unstable();
        sorted.dedup();
        let contiguous = sorted
            .windows(2)
            .all(|w| w[1] == w[0] + 1);
        if !contiguous {
            warning(
                &mut issues,
                format!(
                    "TCM {tcm} has gaps in LED IDs ({}); unpopulated slots still consume frame time",
                    sorted
                        .iter()
                        .map(|l| l.to_string())
                        .collect::<Vec<_>>()
                        .join(",")
                ),
            );
        }
    }

    for m in markers {
        if m.flash_count > 10 {
            warning(
                &mut issues,
                format!(
                    "Marker TCM{}/LED{}: flash count {} increases LED heat load",
                    m.tcm_id, m.led_id, m.flash_count
                ),
            );
        }
    }

    if options.double_sampling {
        warning(
            &mut issues,
            "Double Sampling halves the effective per-target rate".into(),
        );
    }
    if options.tetherless {
        warning(
            &mut issues,
            "Tetherless operation is susceptible to optical interference".into(),
        );
    }
    if options.exposure_gain > 10 {
        warning(
            &mut issues,
            format!("Exposure gain {} may saturate the sensors", options.exposure_gain),
        );
    }

    issues
}
