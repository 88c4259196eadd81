//! Native serial line implementation using the `serialport` crate.

use {
    crate::{
        error::{Error, Result},
        line::{ControlLines, FlowControl, Line, LineSettings, Parity, PortEnumerator, PortInfo, Purge},
    },
    log::trace,
    serialport::ClearBuffer,
    std::{
        io::{Read, Write},
        time::{Duration, Instant},
    },
};

/// Default baud rate used when opening before the first configure.
pub const OPEN_BAUD: u32 = 2_000_000;

/// Native serial line.
pub struct NativeLine {
    port: Box<dyn serialport::SerialPort>,
    name: String,
    epoch: Instant,
}

impl NativeLine {
    /// Open the named endpoint.
    ///
    /// The port is opened at a provisional baud rate; call
    /// [`Line::configure`] before any protocol traffic.
    pub fn open(port_name: &str) -> Result<Self> {
        let port = serialport::new(port_name, OPEN_BAUD)
            .timeout(Duration::from_millis(100))
            .open()?;
        Ok(Self {
            port,
            name: port_name.to_string(),
            epoch: Instant::now(),
        })
    }
}

impl Line for NativeLine {
    fn configure(&mut self, settings: &LineSettings) -> Result<()> {
        trace!(
            "Configuring {}: {} baud, flow {:?}, xon {}",
            self.name, settings.baud_rate, settings.flow_control, settings.xon_limit
        );
        self.port.set_baud_rate(settings.baud_rate)?;
        self.port.set_data_bits(match settings.data_bits {
            5 => serialport::DataBits::Five,
            6 => serialport::DataBits::Six,
            7 => serialport::DataBits::Seven,
            _ => serialport::DataBits::Eight,
        })?;
        self.port.set_stop_bits(match settings.stop_bits {
            2 => serialport::StopBits::Two,
            _ => serialport::StopBits::One,
        })?;
        self.port.set_parity(match settings.parity {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        })?;
        self.port.set_flow_control(match settings.flow_control {
            FlowControl::None => serialport::FlowControl::None,
            FlowControl::Hardware => serialport::FlowControl::Hardware,
            FlowControl::Software => serialport::FlowControl::Software,
        })?;
        // XON/XOFF thresholds, DSR sensitivity and XOFF-continue are
        // driver-level knobs the portable serial API does not expose;
        // the driver defaults apply.
        if settings.dtr_enable {
            self.port.write_data_terminal_ready(true)?;
        }
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        trace!("Setting DTR to {level}");
        self.port.write_data_terminal_ready(level)?;
        Ok(())
    }

    fn set_rts(&mut self, level: bool) -> Result<()> {
        trace!("Setting RTS to {level}");
        self.port.write_request_to_send(level)?;
        Ok(())
    }

    fn control_lines(&mut self) -> Result<ControlLines> {
        Ok(ControlLines {
            cts: self.port.read_clear_to_send()?,
            dsr: self.port.read_data_set_ready()?,
        })
    }

    fn purge(&mut self, direction: Purge) -> Result<()> {
        let buffer = match direction {
            Purge::Rx => ClearBuffer::Input,
            Purge::Tx => ClearBuffer::Output,
            Purge::All => ClearBuffer::All,
        };
        self.port.clear(buffer)?;
        Ok(())
    }

    fn input_queue_depth(&mut self) -> Result<usize> {
        Ok(self.port.bytes_to_read()? as usize)
    }

    fn read(
        &mut self,
        buf: &mut [u8],
        total_timeout_ms: u64,
        inter_byte_ms: u64,
    ) -> Result<usize> {
        let deadline = Instant::now() + Duration::from_millis(total_timeout_ms);
        let mut got = 0;

        // First byte: wait up to the total timeout. After that, each gap
        // is bounded by the inter-byte interval.
        self.port
            .set_timeout(Duration::from_millis(total_timeout_ms.max(1)))?;

        while got < buf.len() {
            match self.port.read(&mut buf[got..]) {
                Ok(0) => break,
                Ok(n) => {
                    got += n;
                    if Instant::now() >= deadline {
                        break;
                    }
                    self.port
                        .set_timeout(Duration::from_millis(inter_byte_ms.max(1)))?;
                }
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(got)
    }

    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn sleep_ms(&mut self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Native endpoint enumerator.
pub struct NativeLineEnumerator;

impl PortEnumerator for NativeLineEnumerator {
    fn list_ports() -> Result<Vec<PortInfo>> {
        let ports = serialport::available_ports().map_err(Error::Serial)?;

        Ok(ports
            .into_iter()
            .map(|p| {
                let (vid, pid, manufacturer, product, serial_number) = match &p.port_type {
                    serialport::SerialPortType::UsbPort(info) => (
                        Some(info.vid),
                        Some(info.pid),
                        info.manufacturer.clone(),
                        info.product.clone(),
                        info.serial_number.clone(),
                    ),
                    _ => (None, None, None, None, None),
                };

                PortInfo {
                    name: p.port_name,
                    vid,
                    pid,
                    manufacturer,
                    product,
                    serial_number,
                }
            })
            .collect())
    }
}
