//! # vztrack
//!
//! Runtime engine for Phoenix-class 3D optical trackers over a
//! high-speed serial link.
//!
//! The tracker emits fixed-size 19-byte binary measurement records at up
//! to several kilohertz and accepts a compact ASCII-plus-binary command
//! language. This crate provides:
//!
//! - Wire codec for commands, measurement records, ACK messages and the
//!   boot announcement
//! - Tracker discovery by provoking and recognizing the boot
//!   announcement (DTR toggle reset)
//! - Measurement sessions: TFS programming, strictly paced
//!   command/acknowledgement configuration, streaming fetch,
//!   stop-and-drain
//! - Setup validation against the hardware operational limits
//! - Automatic marker/TCM discovery via a probe measurement
//! - Offline bus-capture decoding as a golden corpus for the live codec
//!
//! ## Supported Platforms
//!
//! - **Native** (default): Linux, macOS, Windows via the `serialport`
//!   crate
//!
//! ## Features
//!
//! - `native` (default): Native serial port support
//! - `serde`: Serialization support for data types
//!
//! ## Example
//!
//! ```rust,no_run
//! use vztrack::{detect, start_measurement, MarkerEntry, NativeLine};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Find a tracker and open its endpoint.
//!     let found = detect("/dev/ttyUSB0")?;
//!     let mut line = NativeLine::open(&found.port_name)?;
//!
//!     // Stream three markers on TCM 1 at 100 Hz.
//!     let markers = vec![
//!         MarkerEntry::new(1, 1, 1),
//!         MarkerEntry::new(1, 2, 1),
//!         MarkerEntry::new(1, 3, 1),
//!     ];
//!     let mut session = start_measurement(&mut line, 100, &markers, 3000)?;
//!
//!     let mut samples = Vec::new();
//!     for _ in 0..100 {
//!         session.fetch(&mut samples);
//!     }
//!     session.stop();
//!
//!     println!("Got {} samples", samples.len());
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod capture;
pub mod detect;
pub mod error;
pub mod framer;
pub mod line;
pub mod probe;
pub mod protocol;
pub mod session;
pub mod tfs;

#[cfg(test)]
pub(crate) mod testutil;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library
/// loops.
///
/// The checker should return `true` when the current operation should
/// stop (for example after receiving Ctrl-C in CLI applications).
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding
/// application.
#[must_use]
pub fn is_interrupt_requested() -> bool {
    INTERRUPT_CHECKER.get().is_some_and(|checker| checker())
}

// Re-exports for convenience
// Native-specific re-exports
#[cfg(feature = "native")]
pub use detect::detect;
#[cfg(feature = "native")]
pub use line::{NativeLine, NativeLineEnumerator};
pub use {
    capture::{replay_samples, CaptureReader, Direction, TapEvent},
    detect::{detect_with, DetectionPass, DetectionResult, DETECTION_PASSES},
    error::{Error, Result},
    framer::Framer,
    line::{Line, LineSettings, PortEnumerator, PortInfo, Purge},
    probe::{config_detect, DetectedMarker, DetectedTcm, ProbeOptions, ProbeReport},
    protocol::{classify, BootAnnouncement, Command, Message, RecordKind, Sample, RECORD_SIZE},
    session::{start_measurement, MeasurementSession, Phase},
    tfs::{validate, MarkerEntry, Severity, ValidationIssue, ValidationOptions},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_defaults_to_false() {
        // No checker registered in unit-test context unless a test set
        // one; the default must be "keep running".
        let _ = is_interrupt_requested();
    }
}
