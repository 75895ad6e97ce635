//! Serial link implementation over UART

use super::Link;
use crate::error::{Error, Result};
use crate::packet::{Packet, PACKET_SIZE};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// How long a single port read may block while a receive deadline is
/// being tracked by [`SerialLink::receive`].
const READ_SLICE: Duration = Duration::from_millis(10);

/// Delay between dropping and raising the power pin on a cycle.
const POWER_CYCLE_HOLD: Duration = Duration::from_millis(250);

/// Chain link over a UART serial port.
///
/// The DTR line doubles as the chain power pin; deployments with a
/// controlled hub wire the hub switch to the same contract.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
    label: String,
    powered: bool,
}

impl SerialLink {
    /// Open a serial port.
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Baud rate (e.g., 350000)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let port = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_SLICE)
            .open()?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        Ok(SerialLink {
            port,
            label: path.to_string(),
            powered: true,
        })
    }

    /// Drop any bytes still queued in the OS receive buffer. Stale
    /// response fragments from an aborted exchange would otherwise shift
    /// every subsequent packet boundary.
    fn drain_input(&mut self) -> Result<()> {
        self.port.clear(serialport::ClearBuffer::Input)?;
        Ok(())
    }
}

impl Link for SerialLink {
    fn send(&mut self, packet: &Packet) -> Result<()> {
        let wire = packet.encode()?;
        self.drain_input()?;
        self.port.write_all(&wire)?;
        self.port.flush()?;
        log::debug!("TX {} on {}", packet, self.label);
        Ok(())
    }

    fn receive(&mut self, deadline: Duration) -> Result<Packet> {
        let mut buf = [0u8; PACKET_SIZE];
        let mut filled = 0;
        let started = Instant::now();

        while filled < PACKET_SIZE {
            if started.elapsed() >= deadline {
                if filled > 0 {
                    log::debug!(
                        "RX deadline on {} with {}/{} bytes, discarding",
                        self.label,
                        filled,
                        PACKET_SIZE
                    );
                    self.drain_input()?;
                }
                return Err(Error::TimedOut);
            }

            match self.port.read(&mut buf[filled..]) {
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => continue,
                Err(e) => return Err(e.into()),
            }
        }

        let packet = Packet::decode(&buf)?;
        log::debug!("RX {} on {}", packet, self.label);
        Ok(packet)
    }

    fn power_on(&mut self) -> Result<()> {
        self.port.write_data_terminal_ready(true)?;
        self.powered = true;
        log::info!("Power pin raised on {}", self.label);
        Ok(())
    }

    fn power_off(&mut self) -> Result<()> {
        self.port.write_data_terminal_ready(false)?;
        self.powered = false;
        log::info!("Power pin dropped on {}", self.label);
        Ok(())
    }

    fn power_cycle(&mut self) -> Result<()> {
        self.power_off()?;
        std::thread::sleep(POWER_CYCLE_HOLD);
        self.power_on()?;
        self.drain_input()?;
        Ok(())
    }

    fn powered(&self) -> bool {
        self.powered
    }

    fn label(&self) -> &str {
        &self.label
    }
}
