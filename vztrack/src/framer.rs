//! Byte-stream-to-record reassembly.
//!
//! The tracker stream is strictly 19-aligned from the first record after
//! START, so the framer never resynchronizes on the fast path; it walks
//! the buffer in strides of 19 and keeps any trailing partial record as
//! residual for the next fetch. Realignment across session boundaries is
//! the session engine's drain logic, not the framer's.

use log::trace;

use crate::error::Result;
use crate::line::Line;
use crate::protocol::record::{classify, RecordKind, Sample, RECORD_SIZE};

/// Short total timeout for streaming reads; the bytes are already queued.
const FETCH_READ_TIMEOUT_MS: u64 = 5;

/// Inter-byte gap for streaming reads.
const FETCH_INTER_BYTE_MS: u64 = 1;

/// Stateful record reassembler.
///
/// The residual buffer never exceeds 18 bytes; a longer residual would
/// mean a complete record was left unparsed.
#[derive(Debug, Default)]
pub struct Framer {
    residual: Vec<u8>,
}

impl Framer {
    /// New framer with an empty residual.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes currently buffered as a partial record.
    pub fn residual_len(&self) -> usize {
        self.residual.len()
    }

    /// Drain the line's input queue and append newly completed samples
    /// to `out`. Non-blocking: returns 0 when no full record is
    /// available.
    pub fn fetch<L: Line>(&mut self, line: &mut L, out: &mut Vec<Sample>) -> Result<usize> {
        let depth = line.input_queue_depth()?;
        if depth == 0 && self.residual.len() < RECORD_SIZE {
            return Ok(0);
        }

        if depth > 0 {
            let mut buf = vec![0u8; depth];
            let got = line.read(&mut buf, FETCH_READ_TIMEOUT_MS, FETCH_INTER_BYTE_MS)?;
            buf.truncate(got);
            Ok(self.push_bytes(&buf, out))
        } else {
            // Residual alone already holds at least one full record.
            Ok(self.push_bytes(&[], out))
        }
    }

    /// Feed raw bytes through the reassembler, appending decoded samples
    /// to `out`. Returns the number of samples appended.
    ///
    /// Non-sample records (boot announcements, stray ACK echoes) are
    /// discarded; records the classifier rejects are skipped rather than
    /// propagated, keeping the stream alive under line noise.
    pub fn push_bytes(&mut self, bytes: &[u8], out: &mut Vec<Sample>) -> usize {
        let mut buf = std::mem::take(&mut self.residual);
        buf.extend_from_slice(bytes);

        let mut appended = 0;
        let mut offset = 0;
        while offset + RECORD_SIZE <= buf.len() {
            let rec = &buf[offset..offset + RECORD_SIZE];
            match classify(rec) {
                RecordKind::Sample => {
                    if let Ok(sample) = Sample::decode(rec) {
                        out.push(sample);
                        appended += 1;
                    }
                }
                kind => trace!("Discarding {kind:?} record in stream"),
            }
            offset += RECORD_SIZE;
        }

        if offset < buf.len() {
            self.residual = buf.split_off(offset);
        }
        debug_assert!(self.residual.len() < RECORD_SIZE);
        appended
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::record::Eye;
    use crate::testutil::ScriptedLine;

    fn sample(timestamp_us: u32, led_id: u8, end_of_frame: bool) -> Sample {
        Sample {
            timestamp_us,
            x: -1234,
            y: 5678,
            z: 0,
            led_id,
            tcm_id: 1,
            end_of_frame,
            right_eye: Eye::default(),
            center_eye: Eye::default(),
            left_eye: Eye::default(),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_queue_returns_zero() {
        let mut line = ScriptedLine::new();
        let mut framer = Framer::new();
        let mut out = Vec::new();
        assert_eq!(framer.fetch(&mut line, &mut out).unwrap(), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn test_whole_records_no_residual() {
        let mut line = ScriptedLine::new();
        line.push_rx(&sample(1, 1, false).encode());
        line.push_rx(&sample(2, 2, true).encode());

        let mut framer = Framer::new();
        let mut out = Vec::new();
        assert_eq!(framer.fetch(&mut line, &mut out).unwrap(), 2);
        assert_eq!(framer.residual_len(), 0);
        assert_eq!(out[0].timestamp_us, 1);
        assert!(!out[0].end_of_frame);
        assert!(out[1].end_of_frame);
    }

    #[test]
    fn test_reassembly_across_reads() {
        // 38 bytes of stream split 10 + 28: two samples, no residual.
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample(10, 3, false).encode());
        stream.extend_from_slice(&sample(11, 4, true).encode());

        let mut framer = Framer::new();
        let mut out = Vec::new();

        let mut line = ScriptedLine::new();
        line.push_rx(&stream[..10]);
        assert_eq!(framer.fetch(&mut line, &mut out).unwrap(), 0);
        assert_eq!(framer.residual_len(), 10);

        line.push_rx(&stream[10..]);
        assert_eq!(framer.fetch(&mut line, &mut out).unwrap(), 2);
        assert_eq!(framer.residual_len(), 0);
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].led_id, 4);
    }

    #[test]
    fn test_trailing_bytes_become_residual() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&sample(1, 1, false).encode());
        stream.extend_from_slice(&[0xAA; 18]);

        let mut framer = Framer::new();
        let mut out = Vec::new();
        assert_eq!(framer.push_bytes(&stream, &mut out), 1);
        assert_eq!(framer.residual_len(), 18);
    }

    #[test]
    fn test_residual_only_completion() {
        // A fetch against an empty queue still completes a record held
        // entirely in residual.
        let rec = sample(7, 7, false).encode();
        let mut framer = Framer::new();
        let mut out = Vec::new();
        framer.push_bytes(&rec[..18], &mut out);
        assert_eq!(framer.residual_len(), 18);

        let mut line = ScriptedLine::new();
        line.push_rx(&rec[18..]);
        assert_eq!(framer.fetch(&mut line, &mut out).unwrap(), 1);
        assert_eq!(framer.residual_len(), 0);
    }

    #[test]
    fn test_non_sample_records_discarded() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&crate::testutil::ack_record('5', '0'));
        stream.extend_from_slice(&sample(3, 9, false).encode());

        let mut framer = Framer::new();
        let mut out = Vec::new();
        assert_eq!(framer.push_bytes(&stream, &mut out), 1);
        assert_eq!(out[0].led_id, 9);
    }

    #[test]
    fn test_framer_bijection_over_chunkings() {
        // Any chunking of a valid record stream emits exactly the
        // decoded records and retains exactly the trailing bytes.
        let mut stream = Vec::new();
        let originals: Vec<Sample> = (0..5).map(|i| sample(i, (i + 1) as u8, i == 4)).collect();
        for s in &originals {
            stream.extend_from_slice(&s.encode());
        }
        stream.extend_from_slice(&originals[0].encode()[..7]); // trailing partial

        for chunk_size in [1usize, 5, 18, 19, 20, 37, 96] {
            let mut framer = Framer::new();
            let mut out = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                framer.push_bytes(chunk, &mut out);
            }
            assert_eq!(out.len(), originals.len(), "chunk size {chunk_size}");
            for (got, want) in out.iter().zip(&originals) {
                assert_eq!(got, want);
            }
            assert_eq!(framer.residual_len(), 7, "chunk size {chunk_size}");
        }
    }
}
