//! Host-to-tracker command encoding.
//!
//! Every command shares the same wire shape:
//!
//! ```text
//! +-----+------+-------+-----+-----+----+----------------+
//! | '&' | code | index | BPP |  N  | CR |  param bytes   |
//! +-----+------+-------+-----+-----+----+----------------+
//! |  1  |  1   |   1   |  1  |  1  | 1  |   BPP x N      |
//! +-----+------+-------+-----+-----+----+----------------+
//! ```
//!
//! `BPP` (bytes per parameter) and `N` (parameter count) are ASCII digits
//! `'0'..'9'`; the parameter bytes that follow are raw binary. Multi-byte
//! parameters are big-endian.

use byteorder::{BigEndian, WriteBytesExt};

/// Command start marker (`'&'`).
pub const COMMAND_PREFIX: u8 = 0x26;

/// Command terminator at offset 5 (carriage return).
pub const COMMAND_CR: u8 = 0x0D;

/// Length of the fixed command prefix, CR included.
pub const COMMAND_HEADER_LEN: usize = 6;

/// A single tracker command, built via the named constructors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    code: char,
    index: char,
    bytes_per_param: u8,
    num_params: u8,
    params: Vec<u8>,
}

impl Command {
    /// Create a parameterless command.
    pub fn new(code: char, index: char) -> Self {
        Self {
            code,
            index,
            bytes_per_param: 0,
            num_params: 0,
            params: Vec::new(),
        }
    }

    /// Create a command carrying `bytes_per_param * num_params` raw bytes.
    ///
    /// `bytes_per_param` and `num_params` must each be single digits; the
    /// parameter slice length must match their product.
    pub fn with_params(
        code: char,
        index: char,
        bytes_per_param: u8,
        num_params: u8,
        params: &[u8],
    ) -> Self {
        debug_assert!(bytes_per_param <= 9 && num_params <= 9);
        debug_assert_eq!(
            params.len(),
            usize::from(bytes_per_param) * usize::from(num_params)
        );
        Self {
            code,
            index,
            bytes_per_param,
            num_params,
            params: params.to_vec(),
        }
    }

    /// Software reset. The device reboots and does not acknowledge.
    pub fn software_reset() -> Self {
        Self::new('`', '0')
    }

    /// Start periodic sampling. No acknowledgement is generated.
    pub fn start() -> Self {
        Self::new('3', '0')
    }

    /// Stop periodic sampling.
    pub fn stop() -> Self {
        Self::new('5', '0')
    }

    /// Ping the tracker.
    pub fn ping() -> Self {
        Self::new('7', '0')
    }

    /// Set the per-marker sampling period and frame intermission, both in
    /// microseconds.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn timing(sampling_period_us: u32, intermission_us: u32) -> Self {
        let mut params = Vec::with_capacity(8);
        params.write_u32::<BigEndian>(sampling_period_us).unwrap();
        params.write_u32::<BigEndian>(intermission_us).unwrap();
        Self::with_params('v', '0', 4, 2, &params)
    }

    /// Set the Signal Quality Requirement (SQR).
    pub fn signal_quality(level: u8) -> Self {
        Self::with_params('L', '0', 1, 1, &[level])
    }

    /// Set the Minimum Signal Requirement (MSR).
    pub fn min_signal(level: u16) -> Self {
        Self::with_params('O', '0', 2, 1, &level.to_be_bytes())
    }

    /// Set the auto-exposure gain.
    pub fn exposure_gain(gain: u8) -> Self {
        Self::with_params('Y', 'A', 1, 1, &[gain])
    }

    /// Set the Sample Operation Time (SOT) limit.
    pub fn sot_limit(sot: u8) -> Self {
        Self::with_params('U', '0', 1, 1, &[sot])
    }

    /// Enable tether mode with the given mode byte.
    pub fn tether_mode(mode: u8) -> Self {
        Self::with_params('^', '0', 1, 1, &[mode])
    }

    /// Enable single sampling.
    pub fn single_sampling() -> Self {
        Self::new('Q', 'A')
    }

    /// Clear the Target Flashing Sequence.
    pub fn clear_tfs() -> Self {
        Self::new('p', '0')
    }

    /// Append one `(led, flash_count)` entry to the TFS of a TCM.
    ///
    /// The TCM is addressed through the command index (`'1'..'8'`).
    pub fn append_tfs(tcm_id: u8, led_id: u8, flash_count: u8) -> Self {
        let tcm = if (1..=8).contains(&tcm_id) { tcm_id } else { 1 };
        let led = if (1..=64).contains(&led_id) { led_id } else { 1 };
        let fc = flash_count.max(1);
        Self::with_params('p', (b'0' + tcm) as char, 1, 2, &[led, fc])
    }

    /// Synchronize the TCMs on the end-of-frame marker.
    pub fn sync_eof() -> Self {
        Self::new('o', '0')
    }

    /// Program multi-rate sampling mode SM0 (all rate slots zeroed).
    pub fn multi_rate_sm0() -> Self {
        Self::with_params('X', '0', 1, 8, &[0u8; 8])
    }

    /// Upload the programmed TFS into the TCMs.
    pub fn upload_tfs() -> Self {
        Self::new('r', '0')
    }

    /// Disable refraction compensation.
    pub fn refraction_off() -> Self {
        Self::new(':', '0')
    }

    /// Enable internal triggering.
    pub fn internal_trigger() -> Self {
        Self::new('S', '0')
    }

    /// Encode the command into its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(COMMAND_HEADER_LEN + self.params.len());
        buf.push(COMMAND_PREFIX);
        buf.push(self.code as u8);
        buf.push(self.index as u8);
        buf.push(b'0' + self.bytes_per_param);
        buf.push(b'0' + self.num_params);
        buf.push(COMMAND_CR);
        buf.extend_from_slice(&self.params);
        buf
    }

    /// Command code character.
    pub fn code(&self) -> char {
        self.code
    }

    /// Command index character.
    pub fn index(&self) -> char {
        self.index
    }

    /// Raw parameter bytes.
    pub fn params(&self) -> &[u8] {
        &self.params
    }

    /// Human-readable name for a command code.
    pub fn name(code: char) -> &'static str {
        match code {
            '`' => "Software Reset",
            'L' => "Set Signal Quality Requirement (SQR)",
            'O' => "Set Minimum Signal Requirement (MSR)",
            'P' => "Enable Double Sampling",
            'Q' => "Enable Single Sampling",
            'S' => "Enable Internal Triggering",
            'U' => "Set Sample Operation Time (SOT)",
            'V' => "Set Manual Exposure",
            'W' => "Enable Automatic Exposure",
            'X' => "Set Multi-Rate Sampling Mode",
            'Y' => "Set Auto-Exposure Gain",
            '6' => "Set Number of Capture Cycles",
            '7' => "Ping",
            'u' => "Toggle Marker On/Off",
            'v' => "Set Sampling/Intermission Period",
            '^' => "Enable Tether Mode",
            '_' => "Enable Tetherless Mode",
            'n' => "TCM Sync on First-TCMID",
            'o' => "TCM Sync on End-Of-Frame",
            'p' => "Target Flashing Sequence (TFS)",
            'q' => "Ready All TCMs",
            'r' => "Program TFS Into TCMs",
            ']' => "Reset All TCMs",
            '3' => "Start Periodic Sampling",
            '5' => "Stop Periodic Sampling",
            'G' => "Activate Vibrator",
            'N' => "Wait for Pulse then Start",
            'R' => "Enable External Triggering",
            '=' => "Return Raw Sensor Data",
            '<' => "Return 3D Coordinates",
            ';' => "Return Raw + 3D",
            '9' => "Enable Refraction Compensation",
            ':' => "Disable Refraction Compensation",
            'Z' => "Set Desired Signal Peak",
            'K' => "External Start + External Trigger",
            'J' => "Fetch Misalignment Parameter",
            'M' => "Change Misalignment Parameter",
            'x' => "Burn Misalignment to ROM",
            '?' => "Query/Identify",
            _ => "Unknown Command",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let cmd = Command::with_params('v', '0', 4, 2, &[0u8; 8]);
        let data = cmd.encode();
        assert_eq!(&data[..6], &[b'&', b'v', b'0', b'4', b'2', 0x0D]);
        assert_eq!(data.len(), 14);
    }

    #[test]
    fn test_parameterless_command() {
        let data = Command::stop().encode();
        assert_eq!(data, vec![b'&', b'5', b'0', b'0', b'0', 0x0D]);
    }

    #[test]
    fn test_timing_params_big_endian() {
        let data = Command::timing(115, 99_885).encode();
        assert_eq!(&data[6..10], &[0x00, 0x00, 0x00, 0x73]); // 115
        assert_eq!(&data[10..14], &[0x00, 0x01, 0x86, 0x2D]); // 99885
    }

    #[test]
    fn test_append_tfs_index_addresses_tcm() {
        let data = Command::append_tfs(3, 17, 2).encode();
        assert_eq!(&data[..6], &[b'&', b'p', b'3', b'1', b'2', 0x0D]);
        assert_eq!(&data[6..], &[17, 2]);
    }

    #[test]
    fn test_append_tfs_clamps_out_of_range_ids() {
        let data = Command::append_tfs(0, 200, 0).encode();
        assert_eq!(data[2], b'1');
        assert_eq!(&data[6..], &[1, 1]);
    }

    #[test]
    fn test_multi_rate_sm0_zero_slots() {
        let data = Command::multi_rate_sm0().encode();
        assert_eq!(&data[..6], &[b'&', b'X', b'0', b'1', b'8', 0x0D]);
        assert_eq!(&data[6..], &[0u8; 8]);
    }

    #[test]
    fn test_ping_command() {
        let data = Command::ping().encode();
        assert_eq!(data, vec![b'&', b'7', b'0', b'0', b'0', 0x0D]);
    }

    #[test]
    fn test_min_signal_big_endian() {
        let data = Command::min_signal(0x0002).encode();
        assert_eq!(&data[..6], &[b'&', b'O', b'0', b'2', b'1', 0x0D]);
        assert_eq!(&data[6..], &[0x00, 0x02]);
    }

    #[test]
    fn test_command_names() {
        assert_eq!(Command::name('3'), "Start Periodic Sampling");
        assert_eq!(Command::name('p'), "Target Flashing Sequence (TFS)");
        assert_eq!(Command::name('!'), "Unknown Command");
    }
}
