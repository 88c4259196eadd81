//! Error types for vztrack.

use std::io;
use thiserror::Error;

use crate::tfs::ValidationIssue;

/// Result type for vztrack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for vztrack operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial line, file operations). Carries the OS cause.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// No acknowledgement arrived within the ACK wait budget.
    #[error("ACK timeout for command '{command}' ({queued} bytes queued)")]
    AckTimeout {
        /// Command code that went unanswered.
        command: char,
        /// Bytes sitting in the input queue when the wait expired.
        queued: usize,
    },

    /// The expected command echo never appeared within the retry budget.
    #[error("ACK mismatch for command '{command}': got 0x{got:02X} after {retries} retries")]
    AckMismatch {
        /// Command code whose echo was expected.
        command: char,
        /// First byte of the last record read instead.
        got: u8,
        /// Number of stale records skipped before giving up.
        retries: u32,
    },

    /// STOP was not acknowledged within the drain budget.
    #[error("STOP not acknowledged within {0}ms")]
    StopTimeout(u64),

    /// A 19-byte record did not match any known PDU type.
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Measurement parameters violate hardware operational limits.
    #[error("Invalid measurement setup: {}", format_issues(.0))]
    InvalidSetup(Vec<ValidationIssue>),

    /// Invalid bus-capture file format.
    #[error("Invalid capture: {0}")]
    InvalidCapture(String),

    /// Discovery exhausted every pass without finding a tracker.
    #[error("No tracker found")]
    NotFound,

    /// Unsupported operation for the current build or transport.
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

fn format_issues(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.message.as_str())
        .collect::<Vec<_>>()
        .join("; ")
}
