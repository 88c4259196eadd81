//! Offline bus-capture conversion.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use vztrack::protocol::record::{BootAnnouncement, Message, RECORD_SIZE};
use vztrack::protocol::{classify, Command, RecordKind, Sample};
use vztrack::{CaptureReader, Direction, TapEvent};

/// Convert command implementation.
pub(crate) fn cmd_convert(input: &Path, output: Option<PathBuf>) -> Result<()> {
    let output = output.unwrap_or_else(|| input.with_extension("json"));
    eprintln!("Converting {}", input.display());

    let reader = CaptureReader::open(input)
        .with_context(|| format!("opening capture {}", input.display()))?;
    let events = reader.read_events().context("decoding capture records")?;

    let tx = events.iter().filter(|e| e.direction == Direction::Tx).count();
    eprintln!("  TX packets: {tx}");
    eprintln!("  RX packets: {}", events.len() - tx);

    let mut frames = Vec::new();
    for event in &events {
        match event.direction {
            Direction::Tx => decode_tx(event, &mut frames),
            Direction::Rx => decode_rx(event, &mut frames),
        }
    }
    eprintln!("  Decoded frames: {}", frames.len());

    let report = serde_json::json!({
        "source": input.display().to_string(),
        "sessionTimestamp": reader.header().session_timestamp,
        "frames": frames,
    });
    fs::write(&output, serde_json::to_string_pretty(&report)?)
        .with_context(|| format!("writing {}", output.display()))?;
    eprintln!("  Output: {}", output.display());
    Ok(())
}

/// A TX payload holds one or more commands: `'&' code index bpp n CR`
/// followed by raw parameter bytes.
fn decode_tx(event: &TapEvent, frames: &mut Vec<serde_json::Value>) {
    let data = &event.payload;
    let mut pos = 0;
    while pos < data.len() {
        if data[pos] != b'&' {
            pos += 1;
            continue;
        }
        if pos + 6 > data.len() {
            break;
        }
        let code = data[pos + 1] as char;
        let index = data[pos + 2] as char;
        if !data[pos + 3].is_ascii_digit() || !data[pos + 4].is_ascii_digit() {
            pos += 1;
            continue;
        }
        let param_len =
            usize::from(data[pos + 3] - b'0') * usize::from(data[pos + 4] - b'0');
        let end = (pos + 6 + param_len).min(data.len());
        let params = &data[(pos + 6).min(end)..end];

        frames.push(serde_json::json!({
            "time": event.timestamp_iso8601(),
            "dir": "TX",
            "kind": "command",
            "code": code.to_string(),
            "index": index.to_string(),
            "name": Command::name(code),
            "params": hex_string(params),
        }));
        pos += 6 + param_len;
    }
}

/// An RX payload is a whole number of 19-byte records.
fn decode_rx(event: &TapEvent, frames: &mut Vec<serde_json::Value>) {
    let data = &event.payload;
    if data.len() % RECORD_SIZE != 0 {
        frames.push(serde_json::json!({
            "time": event.timestamp_iso8601(),
            "dir": "RX",
            "kind": "unknown",
            "bytes": hex_string(data),
        }));
        return;
    }

    for rec in data.chunks_exact(RECORD_SIZE) {
        let value = match classify(rec) {
            RecordKind::Sample => match Sample::decode(rec) {
                Ok(s) => serde_json::json!({
                    "time": event.timestamp_iso8601(),
                    "dir": "RX",
                    "kind": "sample",
                    "timestamp_us": s.timestamp_us,
                    "tcmId": s.tcm_id,
                    "ledId": s.led_id,
                    "position": { "x": s.x_mm(), "y": s.y_mm(), "z": s.z_mm() },
                    "endOfFrame": s.end_of_frame,
                    "coordStatus": s.coord_status,
                    "triggerIndex": s.trigger_index,
                }),
                Err(_) => unknown_record(event, rec),
            },
            RecordKind::Message => {
                let msg = Message::decode(rec);
                serde_json::json!({
                    "time": event.timestamp_iso8601(),
                    "dir": "RX",
                    "kind": if msg.is_ack() { "ack" } else { "message" },
                    "code": (msg.command_code as char).to_string(),
                    "index": (msg.command_index as char).to_string(),
                    "name": Command::name(msg.command_code as char),
                })
            }
            RecordKind::Boot => {
                let boot = BootAnnouncement::decode(rec);
                serde_json::json!({
                    "time": event.timestamp_iso8601(),
                    "dir": "RX",
                    "kind": "boot",
                    "serial": boot.serial_string(),
                })
            }
            RecordKind::Unknown => unknown_record(event, rec),
        };
        frames.push(value);
    }
}

fn unknown_record(event: &TapEvent, rec: &[u8]) -> serde_json::Value {
    serde_json::json!({
        "time": event.timestamp_iso8601(),
        "dir": "RX",
        "kind": "unknown",
        "bytes": hex_string(rec),
    })
}

fn hex_string(bytes: &[u8]) -> String {
    use std::fmt::Write as _;
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(dir: Direction, payload: Vec<u8>) -> TapEvent {
        TapEvent { timestamp: 0x01DB_0000_0000_0100, direction: dir, payload }
    }

    #[test]
    fn test_decode_tx_splits_commands() {
        let mut payload = b"&5000\r".to_vec();
        payload.extend_from_slice(b"&v042\r");
        payload.extend_from_slice(&[0, 0, 0, 115, 0, 1, 0x86, 0x2D]);

        let mut frames = Vec::new();
        decode_tx(&event(Direction::Tx, payload), &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["code"], "5");
        assert_eq!(frames[1]["code"], "v");
        assert_eq!(frames[1]["params"], "000000730001862d");
        assert_eq!(frames[1]["name"], "Set Sampling/Intermission Period");
    }

    #[test]
    fn test_decode_rx_classifies_records() {
        let sample = Sample {
            timestamp_us: 77,
            tcm_id: 1,
            led_id: 2,
            ..Default::default()
        };
        let mut payload = sample.encode().to_vec();
        payload.extend_from_slice(&crate_test_ack());

        let mut frames = Vec::new();
        decode_rx(&event(Direction::Rx, payload), &mut frames);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["kind"], "sample");
        assert_eq!(frames[0]["timestamp_us"], 77);
        assert_eq!(frames[1]["kind"], "ack");
    }

    #[test]
    fn test_decode_rx_odd_length_is_unknown() {
        let mut frames = Vec::new();
        decode_rx(&event(Direction::Rx, vec![0u8; 20]), &mut frames);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["kind"], "unknown");
    }

    fn crate_test_ack() -> [u8; RECORD_SIZE] {
        let mut rec = [0u8; RECORD_SIZE];
        rec[0] = b'5';
        rec[1] = b'0';
        rec[14] = 0x06;
        rec
    }
}
