//! Measurement session engine.
//!
//! Drives the command/acknowledgement protocol around a streaming
//! measurement: post-reset drain, the ordered configuration sequence,
//! TFS programming, the streaming mode switch and the stop-and-drain
//! shutdown.
//!
//! Two hardware quirks shape this module. The tracker retains its TFS
//! across software reset and may resume streaming the previous
//! session's data milliseconds after rebooting, so the engine (a) waits
//! for sustained silence before configuring ([`wait_for_ready`]'s dual
//! predicate) and (b) tolerates stale records in front of every
//! expected acknowledgement (the skip-stale ACK matcher). Neither guard
//! is redundant with the other.

use log::{debug, info, trace, warn};

use crate::error::{Error, Result};
use crate::framer::Framer;
use crate::line::{read_exact, Line, Purge};
use crate::protocol::record::RECORD_SIZE;
use crate::protocol::Command;
use crate::tfs::{
    validate, MarkerEntry, Severity, ValidationOptions, MAX_FREQUENCY_HZ, SAMPLING_PERIOD_US,
};

/// Max wait for an acknowledgement after a command.
const ACK_TIMEOUT_MS: u64 = 500;

/// Poll interval while waiting for an acknowledgement.
const ACK_POLL_MS: u64 = 1;

/// Max stale records to skip in front of an acknowledgement.
const ACK_MAX_RETRIES: u32 = 10;

/// Drain budget per STOP attempt.
const STOP_DRAIN_MS: u64 = 2000;

/// Gap between the first and second STOP attempt.
const STOP_RETRY_GAP_MS: u64 = 1500;

/// Poll interval while waiting for the device after reset.
const RESET_POLL_MS: u64 = 10;

/// Required silence after reset before proceeding.
const RESET_SILENCE_MS: u64 = 300;

/// Minimum boot time after software reset.
const RESET_MIN_BOOT_MS: u64 = 1700;

/// Settle time for the initial message after port open / DTR assert.
const INITIAL_DRAIN_DELAY_MS: u64 = 300;

/// Gap after the pre-reset STOP.
const PRE_RESET_STOP_GAP_MS: u64 = 100;

/// Default cap for the post-reset readiness wait.
pub const DEFAULT_RESET_TIMEOUT_MS: u64 = 3000;

/// Configuration values observed on the reference host.
const SQR_LEVEL: u8 = 0x02;
const MSR_LEVEL: u16 = 0x0002;
const EXPOSURE_GAIN: u8 = 0x08;
const SOT_LIMIT: u8 = 0x03;
const TETHER_MODE: u8 = 0x0D;

/// Session lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No session activity.
    Idle,
    /// Configuration sequence in flight.
    Configuring,
    /// Device is streaming measurement records.
    Streaming,
    /// STOP sent, draining toward the acknowledgement.
    Stopping,
    /// Aborted; the session is unusable.
    Closed,
}

/// An active measurement session.
///
/// Borrows the transport for its whole lifetime; the line is never
/// closed by the engine and returns to the caller when the session ends.
pub struct MeasurementSession<'a, L: Line> {
    line: &'a mut L,
    frequency_hz: u32,
    markers: Vec<MarkerEntry>,
    framer: Framer,
    phase: Phase,
    fault: Option<Error>,
}

impl<'a, L: Line> std::fmt::Debug for MeasurementSession<'a, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeasurementSession")
            .field("frequency_hz", &self.frequency_hz)
            .field("markers", &self.markers)
            .field("phase", &self.phase)
            .field("fault", &self.fault)
            .finish_non_exhaustive()
    }
}

/// Start a measurement session on an already-configured line.
///
/// Validates the setup, resets the device, sends the full configuration
/// sequence with per-command acknowledgement, programs the TFS and
/// switches the tracker into streaming mode. The requested frequency is
/// clamped to `[1, 4600]` Hz.
///
/// Validation errors abort before any I/O; any transport error or
/// ACK failure during configuration aborts the session and surfaces to
/// the caller.
pub fn start_measurement<'a, L: Line>(
    line: &'a mut L,
    frequency_hz: u32,
    markers: &[MarkerEntry],
    reset_timeout_ms: u64,
) -> Result<MeasurementSession<'a, L>> {
    let frequency_hz = frequency_hz.clamp(1, MAX_FREQUENCY_HZ);

    let errors: Vec<_> = validate(frequency_hz, markers, &ValidationOptions::default())
        .into_iter()
        .filter(|i| i.severity == Severity::Error)
        .collect();
    if !errors.is_empty() {
        return Err(Error::InvalidSetup(errors));
    }

    let mut session = MeasurementSession {
        line,
        frequency_hz,
        markers: markers.to_vec(),
        framer: Framer::new(),
        phase: Phase::Configuring,
        fault: None,
    };

    match session.run_start_sequence(reset_timeout_ms) {
        Ok(()) => {
            session.phase = Phase::Streaming;
            info!("Measurement started at {frequency_hz} Hz with {} markers", markers.len());
            Ok(session)
        }
        Err(e) => {
            session.phase = Phase::Closed;
            Err(e)
        }
    }
}

impl<L: Line> MeasurementSession<'_, L> {
    /// Clamped measurement frequency.
    pub fn frequency_hz(&self) -> u32 {
        self.frequency_hz
    }

    /// Programmed TFS entries.
    pub fn markers(&self) -> &[MarkerEntry] {
        &self.markers
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Transport error latched during streaming, if any.
    pub fn fault(&self) -> Option<&Error> {
        self.fault.as_ref()
    }

    /// Monotonic milliseconds from the transport's clock.
    pub fn now_ms(&self) -> u64 {
        self.line.now_ms()
    }

    /// Sleep on the transport's clock.
    pub fn sleep_ms(&mut self, ms: u64) {
        self.line.sleep_ms(ms);
    }

    /// Append newly reassembled samples to `out`.
    ///
    /// Non-blocking; returns the number of samples appended (0 when no
    /// full record is available). A transport error does not propagate:
    /// it latches, subsequent calls return 0, and the error is readable
    /// through [`MeasurementSession::fault`].
    pub fn fetch(&mut self, out: &mut Vec<crate::protocol::Sample>) -> usize {
        if self.phase != Phase::Streaming || self.fault.is_some() {
            return 0;
        }
        match self.framer.fetch(self.line, out) {
            Ok(n) => n,
            Err(e) => {
                warn!("Transport fault while streaming: {e}");
                self.fault = Some(e);
                0
            }
        }
    }

    /// Stop the measurement and end the session.
    ///
    /// Sends STOP and drains queued measurement records until the STOP
    /// acknowledgement arrives; on timeout, retries once after a gap.
    /// Errors during this phase are logged, never rethrown — stopping
    /// always releases the session. Returns whether the tracker
    /// acknowledged the STOP.
    pub fn stop(mut self) -> bool {
        info!("Stopping measurement");
        self.phase = Phase::Stopping;

        let acked = match self.send_stop_and_drain(STOP_DRAIN_MS) {
            Ok(()) => true,
            Err(e) => {
                debug!("First STOP attempt failed ({e}), retrying after {STOP_RETRY_GAP_MS}ms");
                self.line.sleep_ms(STOP_RETRY_GAP_MS);
                match self.send_stop_and_drain(STOP_DRAIN_MS) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!("STOP not acknowledged: {e}");
                        false
                    }
                }
            }
        };

        if let Err(e) = self.line.purge(Purge::Rx) {
            warn!("Post-stop purge failed: {e}");
        }
        info!("Measurement stopped");
        acked
    }

    fn run_start_sequence(&mut self, reset_timeout_ms: u64) -> Result<()> {
        let total_flashes: u32 = self.markers.iter().map(|m| u32::from(m.flash_count)).sum();
        debug!(
            "Starting measurement: {} Hz, {} markers ({total_flashes} flashes/frame)",
            self.frequency_hz,
            self.markers.len()
        );

        self.line.purge(Purge::All)?;

        // The tracker sends an initial message after DTR assertion /
        // port open; let it land, then drain it so it cannot collide
        // with the first command acknowledgement.
        self.line.sleep_ms(INITIAL_DRAIN_DELAY_MS);
        let stale = self.line.input_queue_depth()?;
        if stale > 0 {
            debug!("Draining {stale} bytes of initial message");
            let mut sink = vec![0u8; stale];
            let _ = self.line.read(&mut sink, ACK_TIMEOUT_MS, ACK_POLL_MS)?;
        }
        self.line.purge(Purge::Rx)?;

        // Pre-reset STOP: the device retains its TFS across software
        // reset and may still be streaming from a previous session.
        // Result ignored; the device may not be running.
        debug!("Sending pre-reset STOP");
        self.send_only(&Command::stop())?;
        self.line.sleep_ms(PRE_RESET_STOP_GAP_MS);
        self.line.purge(Purge::All)?;

        // Software reset reboots the device; no acknowledgement.
        debug!("Sending software reset");
        self.send_only(&Command::software_reset())?;

        if !wait_for_ready(self.line, reset_timeout_ms)? {
            warn!("Device not ready {reset_timeout_ms}ms after reset, proceeding");
        }

        // Frame timing: one frame spans the active flashing time plus
        // an intermission that pads it out to the requested period.
        let frame_period_us = 1_000_000 / self.frequency_hz;
        let active_time_us = total_flashes * SAMPLING_PERIOD_US;
        let intermission_us = frame_period_us.saturating_sub(active_time_us);
        debug!(
            "Timing: period={SAMPLING_PERIOD_US}us, intermission={intermission_us}us"
        );

        self.send_with_ack(&Command::timing(SAMPLING_PERIOD_US, intermission_us))?;
        self.send_with_ack(&Command::signal_quality(SQR_LEVEL))?;
        self.send_with_ack(&Command::min_signal(MSR_LEVEL))?;
        self.send_with_ack(&Command::exposure_gain(EXPOSURE_GAIN))?;
        self.send_with_ack(&Command::sot_limit(SOT_LIMIT))?;
        self.send_with_ack(&Command::tether_mode(TETHER_MODE))?;
        self.send_with_ack(&Command::single_sampling())?;

        debug!("Programming TFS ({} markers)", self.markers.len());
        self.send_with_ack(&Command::clear_tfs())?;
        let markers = self.markers.clone();
        for m in &markers {
            self.send_with_ack(&Command::append_tfs(m.tcm_id, m.led_id, m.flash_count))?;
        }
        self.send_with_ack(&Command::sync_eof())?;
        self.send_with_ack(&Command::multi_rate_sm0())?;
        self.send_with_ack(&Command::upload_tfs())?;
        self.send_with_ack(&Command::refraction_off())?;
        self.send_with_ack(&Command::internal_trigger())?;

        // START generates no acknowledgement; records follow directly.
        debug!("Sending START");
        self.send_only(&Command::start())?;
        Ok(())
    }

    fn send_only(&mut self, cmd: &Command) -> Result<()> {
        self.line.purge(Purge::Rx)?;
        self.line.write_all_bytes(&cmd.encode())
    }

    /// Send a command and consume its 19-byte acknowledgement.
    ///
    /// Stale measurement records in front of the echo are discarded, up
    /// to the retry budget.
    fn send_with_ack(&mut self, cmd: &Command) -> Result<()> {
        self.line.purge(Purge::Rx)?;
        self.line.write_all_bytes(&cmd.encode())?;
        wait_for_ack(self.line, cmd.code())
    }

    fn send_stop_and_drain(&mut self, timeout_ms: u64) -> Result<()> {
        self.line.purge(Purge::Rx)?;
        self.line.write_all_bytes(&Command::stop().encode())?;

        let start = self.line.now_ms();
        let mut rec = [0u8; RECORD_SIZE];
        let mut discarded = 0usize;

        while self.line.now_ms().saturating_sub(start) < timeout_ms {
            if self.line.input_queue_depth()? >= RECORD_SIZE {
                let got = read_exact(self.line, &mut rec, ACK_TIMEOUT_MS)?;
                if got < RECORD_SIZE {
                    continue;
                }
                if rec[0] == b'5' && rec[1] == b'0' {
                    debug!("STOP acknowledged after discarding {discarded} records");
                    return Ok(());
                }
                // Queued measurement record; keep draining.
                discarded += 1;
            } else {
                self.line.sleep_ms(ACK_POLL_MS);
            }
        }
        Err(Error::StopTimeout(timeout_ms))
    }
}

/// Wait for the device to settle after a software reset.
///
/// The device may stream retained measurement data after rebooting, so
/// incoming data is purged and the silence counter restarted whenever
/// bytes appear. Readiness requires both sustained silence
/// (`>= 300` ms) and a minimum boot time (`>= 1700` ms); either
/// predicate alone lets stale data corrupt the first configuration
/// acknowledgement. On timeout the receive buffer is purged and the
/// caller proceeds anyway.
fn wait_for_ready<L: Line>(line: &mut L, timeout_ms: u64) -> Result<bool> {
    let start = line.now_ms();
    let mut silent_ms: u64 = 0;
    let mut saw_data = false;

    loop {
        let elapsed = line.now_ms().saturating_sub(start);
        if elapsed >= timeout_ms {
            break;
        }

        if line.input_queue_depth()? > 0 {
            if !saw_data {
                debug!("Device responding {elapsed}ms after reset, draining");
                saw_data = true;
            }
            line.purge(Purge::Rx)?;
            silent_ms = 0;
        } else {
            silent_ms += RESET_POLL_MS;
            if silent_ms >= RESET_SILENCE_MS && elapsed >= RESET_MIN_BOOT_MS {
                debug!("Device ready after {elapsed}ms ({silent_ms}ms silence)");
                line.purge(Purge::Rx)?;
                return Ok(true);
            }
        }
        line.sleep_ms(RESET_POLL_MS);
    }

    debug!("Reset wait timed out after {timeout_ms}ms");
    line.purge(Purge::Rx)?;
    Ok(false)
}

/// Consume the acknowledgement for a just-sent command.
fn wait_for_ack<L: Line>(line: &mut L, code: char) -> Result<()> {
    let mut rec = [0u8; RECORD_SIZE];
    let mut last = 0u8;

    for retry in 0..=ACK_MAX_RETRIES {
        // Wait for a full record to queue up.
        let deadline = line.now_ms() + ACK_TIMEOUT_MS;
        let mut depth = line.input_queue_depth()?;
        while depth < RECORD_SIZE && line.now_ms() < deadline {
            line.sleep_ms(ACK_POLL_MS);
            depth = line.input_queue_depth()?;
        }
        if depth < RECORD_SIZE {
            return Err(Error::AckTimeout { command: code, queued: depth });
        }

        let got = read_exact(line, &mut rec, ACK_TIMEOUT_MS)?;
        if got < RECORD_SIZE {
            return Err(Error::AckTimeout { command: code, queued: got });
        }

        if rec[0] == code as u8 {
            trace!("ACK for '{code}'");
            return Ok(());
        }

        last = rec[0];
        debug!(
            "Skipping stale record in front of '{code}' ACK (got 0x{last:02X}), retry {}/{ACK_MAX_RETRIES}",
            retry + 1
        );
    }

    Err(Error::AckMismatch { command: code, got: last, retries: ACK_MAX_RETRIES })
}
