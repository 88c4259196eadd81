//! Automatic marker and TCM discovery.
//!
//! Programs every candidate `(tcm, led)` pair into one probe TFS, runs a
//! short low-rate measurement, and classifies each marker as present or
//! absent from its per-frame statistics. The first stretch of data is
//! discarded while the tracker's auto-exposure settles; only the
//! evaluation window counts.

use std::collections::BTreeMap;

use log::{debug, info};

use crate::error::Result;
use crate::line::Line;
use crate::protocol::Sample;
use crate::session::start_measurement;
use crate::tfs::MarkerEntry;

/// Fetch pacing during the warm-up phase.
const WARMUP_POLL_MS: u64 = 10;

/// Fetch pacing during the evaluation phase.
const EVAL_POLL_MS: u64 = 5;

/// Probe scan configuration.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    /// Scan TCMs `1..=max_tcm_id`.
    pub max_tcm_id: u8,
    /// Scan LEDs `1..=max_led_id` on each TCM.
    pub max_led_id: u8,
    /// Measurement frequency during the probe.
    pub probe_freq_hz: u32,
    /// Data discarded for this long while auto-exposure settles.
    pub warmup_ms: u64,
    /// Evaluation window after warm-up.
    pub eval_ms: u64,
    /// Minimum evaluation frames required for a decision.
    pub min_frames: u32,
    /// Fraction of clean frames required to call a marker present.
    pub detection_threshold: f64,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        Self {
            max_tcm_id: 8,
            max_led_id: 16,
            probe_freq_hz: 10,
            warmup_ms: 2000,
            eval_ms: 1500,
            min_frames: 3,
            detection_threshold: 0.5,
        }
    }
}

/// Per-marker evaluation counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarkerStats {
    /// Frames observed for this marker during evaluation.
    pub frames_total: u32,
    /// Frames where all three eye anomaly codes were zero.
    pub frames_valid: u32,
    /// Frames where the coordinate status was zero.
    pub frames_coord_ok: u32,
}

impl MarkerStats {
    fn record(&mut self, sample: &Sample) {
        self.frames_total += 1;
        if sample.coord_status == 0 {
            self.frames_coord_ok += 1;
        }
        if sample.right_eye.anomaly == 0
            && sample.center_eye.anomaly == 0
            && sample.left_eye.anomaly == 0
        {
            self.frames_valid += 1;
        }
    }

    /// Fraction of evaluation frames that were clean.
    pub fn valid_rate(&self) -> f64 {
        if self.frames_total == 0 {
            0.0
        } else {
            f64::from(self.frames_valid) / f64::from(self.frames_total)
        }
    }
}

/// Decide whether a marker with these statistics is physically present.
///
/// Monotonic in `frames_valid`: more clean frames can only keep or gain
/// presence, never lose it.
pub fn is_present(stats: &MarkerStats, options: &ProbeOptions) -> bool {
    stats.frames_total >= options.min_frames
        && stats.valid_rate() >= options.detection_threshold
}

/// A marker the probe classified as present.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedMarker {
    /// TCM module id.
    pub tcm_id: u8,
    /// LED marker id.
    pub led_id: u8,
    /// Clean frames during evaluation.
    pub frames_detected: u32,
    /// Total frames during evaluation.
    pub frames_total: u32,
    /// `frames_detected / frames_total`.
    pub detection_rate: f64,
}

/// A TCM with at least one detected marker.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DetectedTcm {
    /// TCM module id.
    pub tcm_id: u8,
    /// Detected markers, sorted by LED id.
    pub markers: Vec<DetectedMarker>,
}

/// Full probe result.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProbeReport {
    /// Connected TCMs with their active markers.
    pub tcms: Vec<DetectedTcm>,
    /// Flattened marker list ready for a measurement session.
    pub marker_list: Vec<MarkerEntry>,
    /// Human-readable summary.
    pub summary: String,
}

/// Detect connected TCMs and active LED markers via a probe measurement.
///
/// The caller must not have an active session on the same line.
pub fn config_detect<L: Line>(line: &mut L, options: &ProbeOptions) -> Result<ProbeReport> {
    let max_tcm = options.max_tcm_id.clamp(1, 8);
    let max_led = options.max_led_id.clamp(1, 64);

    let mut candidates = Vec::with_capacity(usize::from(max_tcm) * usize::from(max_led));
    for tcm in 1..=max_tcm {
        for led in 1..=max_led {
            candidates.push(MarkerEntry::new(tcm, led, 1));
        }
    }
    info!(
        "Probing {} candidate markers (TCM 1-{max_tcm}, LED 1-{max_led})",
        candidates.len()
    );

    let mut session = start_measurement(
        line,
        options.probe_freq_hz,
        &candidates,
        crate::session::DEFAULT_RESET_TIMEOUT_MS,
    )?;

    // Warm-up: discard while auto-exposure settles.
    debug!("Warm-up: discarding data for {}ms", options.warmup_ms);
    let warmup_start = session.now_ms();
    let mut samples: Vec<Sample> = Vec::new();
    while session.now_ms().saturating_sub(warmup_start) < options.warmup_ms {
        if crate::is_interrupt_requested() {
            break;
        }
        samples.clear();
        session.fetch(&mut samples);
        session.sleep_ms(WARMUP_POLL_MS);
    }

    // Evaluation: accumulate per-marker counters keyed by (tcm, led).
    debug!("Evaluating for {}ms", options.eval_ms);
    let mut stats: BTreeMap<(u8, u8), MarkerStats> = BTreeMap::new();
    let eval_start = session.now_ms();
    while session.now_ms().saturating_sub(eval_start) < options.eval_ms {
        if crate::is_interrupt_requested() {
            break;
        }
        samples.clear();
        session.fetch(&mut samples);
        for s in &samples {
            stats.entry((s.tcm_id, s.led_id)).or_default().record(s);
        }
        session.sleep_ms(EVAL_POLL_MS);
    }

    session.stop();

    // Classify, grouped by TCM in id order.
    let mut tcms: BTreeMap<u8, Vec<DetectedMarker>> = BTreeMap::new();
    let mut total_detected = 0usize;
    for ((tcm_id, led_id), st) in &stats {
        debug!(
            "TCM{tcm_id} LED{led_id}: total={} valid={} coordOk={} rate={:.0}%",
            st.frames_total,
            st.frames_valid,
            st.frames_coord_ok,
            st.valid_rate() * 100.0
        );
        if is_present(st, options) {
            tcms.entry(*tcm_id).or_default().push(DetectedMarker {
                tcm_id: *tcm_id,
                led_id: *led_id,
                frames_detected: st.frames_valid,
                frames_total: st.frames_total,
                detection_rate: st.valid_rate(),
            });
            total_detected += 1;
        }
    }

    let mut report = ProbeReport {
        tcms: Vec::with_capacity(tcms.len()),
        marker_list: Vec::with_capacity(total_detected),
        summary: String::new(),
    };
    let mut parts = Vec::with_capacity(tcms.len());
    for (tcm_id, mut markers) in tcms {
        markers.sort_by_key(|m| m.led_id);
        let leds: Vec<String> = markers.iter().map(|m| m.led_id.to_string()).collect();
        parts.push(format!("TCM{tcm_id} (LEDs {})", leds.join(",")));
        for m in &markers {
            report.marker_list.push(MarkerEntry::new(m.tcm_id, m.led_id, 1));
        }
        report.tcms.push(DetectedTcm { tcm_id, markers });
    }
    report.summary = format!(
        "Found {} TCM(s): {} -- {total_detected} marker(s) total",
        report.tcms.len(),
        parts.join(", ")
    );
    info!("{}", report.summary);
    Ok(report)
}
