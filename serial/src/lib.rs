use instrument_types::{
    DataBits, Error, FlowControl, LineStream, Parity, Result, SerialAddress, StopBits, Timeouts,
    Transport,
};
use log::{debug, info};
use serialport::SerialPort;

/// SCPI over a serial line, newline terminated like a raw socket.
pub struct SerialTransport {
    port: Option<LineStream<Box<dyn SerialPort>>>,
    name: String,
}

fn data_bits(bits: DataBits) -> serialport::DataBits {
    match bits {
        DataBits::Five => serialport::DataBits::Five,
        DataBits::Six => serialport::DataBits::Six,
        DataBits::Seven => serialport::DataBits::Seven,
        DataBits::Eight => serialport::DataBits::Eight,
    }
}

fn parity(parity: Parity) -> serialport::Parity {
    match parity {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn stop_bits(bits: StopBits) -> serialport::StopBits {
    match bits {
        StopBits::One => serialport::StopBits::One,
        StopBits::Two => serialport::StopBits::Two,
    }
}

fn flow_control(flow: FlowControl) -> serialport::FlowControl {
    match flow {
        FlowControl::None => serialport::FlowControl::None,
        FlowControl::Software => serialport::FlowControl::Software,
        FlowControl::Hardware => serialport::FlowControl::Hardware,
    }
}

/// Translates a failure to open or enumerate ports.
pub fn connection_error(port: &str, error: serialport::Error) -> Error {
    match error.kind() {
        serialport::ErrorKind::NoDevice => {
            Error::connection(format!("Serial port {} not found", port))
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            Error::connection(format!("Permission denied opening {}", port))
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut) => {
            Error::Timeout(format!("opening {}", port))
        }
        _ => Error::connection(format!("Unable to open {}: {}", port, error)),
    }
}

impl SerialTransport {
    pub fn connect(address: &SerialAddress, timeouts: Timeouts) -> Result<Self> {
        let port = serialport::new(address.port(), address.baud_rate())
            .data_bits(data_bits(address.data_bits()))
            .parity(parity(address.parity()))
            .stop_bits(stop_bits(address.stop_bits()))
            .flow_control(flow_control(address.flow_control()))
            .timeout(timeouts.command)
            .open()
            .map_err(|error| connection_error(address.port(), error))?;

        info!(
            "Opened serial port {} at {} baud ({} data bits, parity {}, {} stop bits)",
            address.port(),
            address.baud_rate(),
            address.data_bits(),
            address.parity(),
            address.stop_bits()
        );
        Ok(Self {
            port: Some(LineStream::new(port)),
            name: address.port().to_string(),
        })
    }

    fn port(&mut self) -> Result<&mut LineStream<Box<dyn SerialPort>>> {
        self.port.as_mut().ok_or(Error::NotConnected)
    }

    /// Drops anything the instrument sent which hasn't been read yet.
    pub fn clear(&mut self) -> Result<()> {
        let port = self.port()?;
        port.discard();
        port.get_mut()
            .clear(serialport::ClearBuffer::All)
            .map_err(|error| Error::transfer(-1, error.to_string()))
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        debug!("Sending {} bytes to {}", data.len(), self.name);
        self.port()?.send_line(data)
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.port()?.read_exact(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.port()?.read_line()
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed serial port {}", self.name);
        }
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Names of the serial ports on this machine.
pub fn list_serial_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports().map_err(|error| connection_error("ports", error))?;
    Ok(ports.into_iter().map(|port| port.port_name).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_settings_map_across() {
        assert_eq!(data_bits(DataBits::Seven), serialport::DataBits::Seven);
        assert_eq!(parity(Parity::Even), serialport::Parity::Even);
        assert_eq!(stop_bits(StopBits::Two), serialport::StopBits::Two);
        assert_eq!(
            flow_control(FlowControl::Hardware),
            serialport::FlowControl::Hardware
        );
    }

    #[test]
    fn missing_ports_are_connection_errors() {
        let error = serialport::Error::new(serialport::ErrorKind::NoDevice, "gone");
        let error = connection_error("/dev/ttyUSB9", error);
        assert!(matches!(error, Error::Connection { .. }));
        assert!(error.to_string().contains("/dev/ttyUSB9"));

        let error = serialport::Error::new(
            serialport::ErrorKind::Io(std::io::ErrorKind::TimedOut),
            "slow",
        );
        assert!(connection_error("COM3", error).is_timeout());
    }

    #[test]
    fn opening_a_port_that_does_not_exist_fails() {
        let address = SerialAddress::new("/dev/this-port-does-not-exist");
        let result = SerialTransport::connect(&address, Timeouts::default());
        assert!(matches!(result, Err(Error::Connection { .. })));
    }
}
