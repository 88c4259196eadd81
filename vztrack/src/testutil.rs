//! Scripted in-memory transport for engine tests.
//!
//! `ScriptedLine` implements [`Line`] over a virtual millisecond clock:
//! `sleep_ms` and read timeouts advance the clock instead of blocking,
//! so timing-sensitive logic (post-reset readiness, ACK pacing, stop
//! drain) runs in microseconds of real time.

use std::collections::VecDeque;

use crate::error::{Error, Result};
use crate::line::{ControlLines, Line, LineSettings, Purge};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<u8>>;

/// A scripted transport with a virtual clock.
#[derive(Default)]
pub struct ScriptedLine {
    /// Bytes currently readable.
    rx: VecDeque<u8>,
    /// Bytes that become readable once the clock reaches their due time.
    pending: Vec<(u64, Vec<u8>)>,
    /// Everything the engine wrote, in order.
    pub tx: Vec<u8>,
    /// Individual write calls, in order.
    pub writes: Vec<Vec<u8>>,
    /// DTR transitions observed, with their virtual timestamps.
    pub dtr_log: Vec<(u64, bool)>,
    /// RTS transitions observed.
    pub rts_log: Vec<bool>,
    /// Settings applied via `configure`, in order.
    pub configs: Vec<LineSettings>,
    /// Number of purges issued.
    pub purges: usize,
    clock_ms: u64,
    responder: Option<Responder>,
    /// When set, control-line operations fail (transport cannot toggle DTR).
    pub fail_control: bool,
}

impl ScriptedLine {
    /// New silent line.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `bytes` readable immediately.
    pub fn push_rx(&mut self, bytes: &[u8]) {
        self.rx.extend(bytes.iter().copied());
    }

    /// Make `bytes` readable once the virtual clock reaches `at_ms`.
    pub fn push_rx_at(&mut self, at_ms: u64, bytes: &[u8]) {
        self.pending.push((at_ms, bytes.to_vec()));
        self.pending.sort_by_key(|(t, _)| *t);
    }

    /// Install a hook invoked on every write; returned bytes become
    /// immediately readable.
    pub fn on_write<F: FnMut(&[u8]) -> Vec<u8> + 'static>(&mut self, f: F) {
        self.responder = Some(Box::new(f));
    }

    /// Current virtual time.
    pub fn clock(&self) -> u64 {
        self.clock_ms
    }

    fn settle(&mut self) {
        let now = self.clock_ms;
        let mut due = Vec::new();
        self.pending.retain(|(t, bytes)| {
            if *t <= now {
                due.push(bytes.clone());
                false
            } else {
                true
            }
        });
        for bytes in due {
            self.rx.extend(bytes);
        }
    }

    fn next_delivery(&self) -> Option<u64> {
        self.pending.first().map(|(t, _)| *t)
    }
}

impl Line for ScriptedLine {
    fn configure(&mut self, settings: &LineSettings) -> Result<()> {
        self.configs.push(settings.clone());
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        if self.fail_control {
            return Err(Error::Unsupported("DTR not supported".into()));
        }
        self.dtr_log.push((self.clock_ms, level));
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        if self.fail_control {
            return Err(Error::Unsupported("RTS not supported".into()));
        }
        self.rts_log.push(level);
        Ok(())
    }

    fn control_lines(&mut self) -> Result<ControlLines> {
        Ok(ControlLines { cts: true, dsr: true })
    }

    fn purge(&mut self, direction: Purge) -> Result<()> {
        self.purges += 1;
        if matches!(direction, Purge::Rx | Purge::All) {
            self.rx.clear();
        }
        Ok(())
    }

    fn input_queue_depth(&mut self) -> Result<usize> {
        self.settle();
        Ok(self.rx.len())
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        total_timeout_ms: u64,
        _inter_byte_ms: u64,
    ) -> Result<usize> {
        self.settle();
        let deadline = self.clock_ms + total_timeout_ms;
        while self.rx.is_empty() && self.clock_ms < deadline {
            match self.next_delivery() {
                Some(t) if t <= deadline => self.clock_ms = t,
                _ => self.clock_ms = deadline,
            }
            self.settle();
        }
        let n = buf.len().min(self.rx.len());
        for slot in buf.iter_mut().take(n) {
            // n is bounded by rx.len() above
            *slot = self.rx.pop_front().unwrap();
        }
        Ok(n)
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.tx.extend_from_slice(buf);
        self.writes.push(buf.to_vec());
        if let Some(mut responder) = self.responder.take() {
            let reply = responder(buf);
            self.rx.extend(reply);
            self.responder = Some(responder);
        }
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.clock_ms
    }

    fn sleep_ms(&mut self, ms: u64) {
        self.clock_ms += ms;
        self.settle();
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Build a 19-byte ACK message record echoing `code` and `index`.
pub fn ack_record(code: char, index: char) -> [u8; 19] {
    let mut rec = [0u8; 19];
    rec[0] = code as u8;
    rec[1] = index as u8;
    rec[14] = crate::protocol::record::MESSAGE_ACK;
    rec
}

/// Install an auto-acknowledging responder: every command that expects
/// an ACK gets its echo queued immediately; reset and START stay silent.
pub fn auto_ack(line: &mut ScriptedLine) {
    line.on_write(|bytes| {
        if bytes.len() < 6 || bytes[0] != b'&' {
            return Vec::new();
        }
        let code = bytes[1] as char;
        match code {
            '`' | '3' | '5' => Vec::new(),
            _ => ack_record(code, bytes[2] as char).to_vec(),
        }
    });
}
