// Byte transport under the APT bus

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, Read, Write};
use std::time::Duration;
use tracing::debug;

/// Fixed baud rate for APT controllers
pub const APT_BAUDRATE: u32 = 115_200;

/// Per-read timeout; bounded waits poll on top of this
pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// A bidirectional byte stream to one controller
pub trait Link: Read + Write + Send {
    /// Drop bytes the controller sent that nobody has read yet
    fn discard_input(&mut self) -> io::Result<()>;
}

/// A real serial port
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    pub fn open(port_name: &str) -> serialport::Result<Self> {
        Self::open_with_timeout(port_name, READ_TIMEOUT)
    }

    pub fn open_with_timeout(port_name: &str, timeout: Duration) -> serialport::Result<Self> {
        let mut port = serialport::new(port_name, APT_BAUDRATE)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;

        // FTDI bridges in the cubes want RTS asserted; not every driver supports it
        if let Err(e) = port.write_request_to_send(true) {
            debug!("Could not assert RTS on {}: {}", port_name, e);
        }

        Ok(Self { port })
    }
}

impl Read for SerialLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for SerialLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl Link for SerialLink {
    fn discard_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}
