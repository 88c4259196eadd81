//! Line abstraction for cross-platform serial communication.
//!
//! This module provides a unified [`Line`] trait that the protocol and
//! session layers consume. The design keeps I/O out of the protocol
//! logic, so the engine can be driven by a real serial port on native
//! platforms or by a scripted transport in tests.
//!
//! ```text
//! +--------------------+
//! |  Session / Detect  |
//! |  Framer / Probe    |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |     Line trait     |
//! +---------+----------+
//!           |
//!           v
//! +---------+----------+
//! |     NativeLine     |
//! |    (serialport)    |
//! +--------------------+
//! ```
//!
//! Beyond plain reads and writes the trait carries what the tracker
//! protocol actually needs: DTR/RTS control (the physical reset path),
//! buffer purge, input-queue depth, reads bounded by a total and an
//! inter-byte timeout, and a monotonic millisecond clock.

#[cfg(feature = "native")]
pub mod native;

use crate::error::Result;

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    None,
    /// Hardware flow control (CTS/DSR handshake).
    #[default]
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Direction selector for buffer purges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purge {
    /// Discard pending receive data.
    Rx,
    /// Discard pending transmit data.
    Tx,
    /// Discard both directions.
    All,
}

/// Line parameters applied by [`Line::configure`].
///
/// The defaults are the tracker's electrical profile: 8-N-1, hardware
/// CTS/DSR handshake, DTR asserted, DSR sensitivity on, transmission
/// continuing through XOFF.
#[derive(Debug, Clone)]
pub struct LineSettings {
    /// Baud rate.
    pub baud_rate: u32,
    /// Data bits (the tracker always uses 8).
    pub data_bits: u8,
    /// Stop bits (the tracker always uses 1).
    pub stop_bits: u8,
    /// Parity mode.
    pub parity: Parity,
    /// Flow control mode.
    pub flow_control: FlowControl,
    /// Driver XON threshold. Driver-specific; advisory on transports
    /// that do not expose it.
    pub xon_limit: u16,
    /// Driver XOFF threshold.
    pub xoff_limit: u16,
    /// Assert DTR while configured.
    pub dtr_enable: bool,
    /// Honor DSR for receive gating.
    pub dsr_sensitivity: bool,
    /// Keep transmitting after sending XOFF.
    pub tx_continue_on_xoff: bool,
}

impl Default for LineSettings {
    fn default() -> Self {
        Self {
            baud_rate: 2_000_000,
            data_bits: 8,
            stop_bits: 1,
            parity: Parity::None,
            flow_control: FlowControl::Hardware,
            xon_limit: 0,
            xoff_limit: 0,
            dtr_enable: true,
            dsr_sensitivity: true,
            tx_continue_on_xoff: true,
        }
    }
}

impl LineSettings {
    /// Tracker profile at the given baud rate and XON threshold.
    pub fn tracker(baud_rate: u32, xon_limit: u16) -> Self {
        Self {
            baud_rate,
            xon_limit,
            ..Default::default()
        }
    }
}

/// Modem control line state readback, for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControlLines {
    /// Clear To Send.
    pub cts: bool,
    /// Data Set Ready.
    pub dsr: bool,
}

/// Serial endpoint information from enumeration.
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified transport trait for tracker communication.
///
/// Implementations exist for native platforms via the `serialport`
/// crate; the test suite drives the engine through a scripted
/// implementation.
pub trait Line {
    /// Apply line parameters and flow control.
    fn configure(&mut self, settings: &LineSettings) -> Result<()>;

    /// Set the DTR (Data Terminal Ready) control line.
    fn set_dtr(&mut self, level: bool) -> Result<()>;

    /// Set the RTS (Request To Send) control line.
    fn set_rts(&mut self, level: bool) -> Result<()>;

    /// Read back the modem status lines.
    fn control_lines(&mut self) -> Result<ControlLines>;

    /// Discard buffered data in the given direction.
    fn purge(&mut self, direction: Purge) -> Result<()>;

    /// Number of bytes waiting in the receive queue.
    fn input_queue_depth(&mut self) -> Result<usize>;

    /// Read up to `buf.len()` bytes.
    ///
    /// Blocks up to `total_timeout_ms` for the first byte; once data is
    /// flowing, a gap longer than `inter_byte_ms` ends the read. Returns
    /// the number of bytes read (possibly 0 on timeout).
    fn read(&mut self, buf: &mut [u8], total_timeout_ms: u64, inter_byte_ms: u64)
        -> Result<usize>;

    /// Write the whole buffer, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()>;

    /// Monotonic milliseconds. Every bounded wait in the engine uses
    /// this clock, never wall time.
    fn now_ms(&self) -> u64;

    /// Sleep for the given number of milliseconds.
    fn sleep_ms(&mut self, ms: u64);

    /// Endpoint name/path.
    fn name(&self) -> &str;
}

/// Read exactly `buf.len()` bytes or fail with the bytes read so far.
///
/// Used after the input-queue depth already guarantees availability, so
/// the timeout only guards against driver hiccups.
pub(crate) fn read_exact<L: Line + ?Sized>(
    line: &mut L,
    buf: &mut [u8],
    total_timeout_ms: u64,
) -> Result<usize> {
    let mut got = 0;
    let deadline = line.now_ms() + total_timeout_ms;
    while got < buf.len() {
        let remaining = deadline.saturating_sub(line.now_ms());
        if remaining == 0 {
            break;
        }
        let n = line.read(&mut buf[got..], remaining, 1)?;
        if n == 0 {
            break;
        }
        got += n;
    }
    Ok(got)
}

/// Trait for listing available serial endpoints.
///
/// Separated from [`Line`] because enumeration does not require an open
/// endpoint.
pub trait PortEnumerator {
    /// List all available serial endpoints.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::{NativeLine, NativeLineEnumerator};
