use instrument_network::{HiSlip, RawSocket, Vxi11};
use instrument_scpi::{Decode, Idn};
use instrument_serial::SerialTransport;
use instrument_types::{Address, Error, Result, Timeouts, Transport, UsbDeviceInfo};
use instrument_usb::UsbTmc;
use log::debug;
use std::fmt;

/// Opens the transport an address calls for.
pub fn connect_transport(address: &Address, timeouts: Timeouts) -> Result<Box<dyn Transport>> {
    debug!("Connecting to {} ({})", address, address.kind());
    Ok(match address {
        Address::Usb(usb) => Box::new(UsbTmc::connect(usb, timeouts)?),
        Address::Serial(serial) => Box::new(SerialTransport::connect(serial, timeouts)?),
        Address::Vxi11(network) => Box::new(Vxi11::connect(network, timeouts)?),
        Address::HiSlip(network) => Box::new(HiSlip::connect(network, timeouts)?),
        Address::RawSocket(network) => Box::new(RawSocket::connect(network, timeouts)?),
    })
}

/// One instrument, talked to with SCPI over whichever transport it was connected with.
///
/// ```no_run
/// use instrument_client::Instrument;
///
/// let mut scope = Instrument::open(&"TCPIP0::192.168.1.20::INSTR".parse()?)?;
/// scope.send_fmt(format_args!(":TIMEBASE:SCALE {}", 1e-3))?;
/// let scale: f64 = scope.query_as(":TIMEBASE:SCALE?")?;
/// # Ok::<(), instrument_client::Error>(())
/// ```
#[derive(Default)]
pub struct Instrument {
    transport: Option<Box<dyn Transport>>,
    timeouts: Timeouts,
}

impl Instrument {
    pub fn new(timeouts: Timeouts) -> Self {
        Self {
            transport: None,
            timeouts,
        }
    }

    /// Connects straight away, with the default timeouts.
    pub fn open(address: &Address) -> Result<Self> {
        let mut instrument = Self::default();
        instrument.connect(address)?;
        Ok(instrument)
    }

    /// Wraps a transport which has already been connected.
    pub fn with_transport(transport: Box<dyn Transport>) -> Self {
        Self {
            transport: Some(transport),
            timeouts: Timeouts::default(),
        }
    }

    /// Connects to `address`, closing whatever was connected before.
    pub fn connect(&mut self, address: &Address) -> Result<()> {
        self.close();
        self.transport = Some(connect_transport(address, self.timeouts)?);
        Ok(())
    }

    /// [`Instrument::connect`] with new open and command timeouts, kept for later connects.
    pub fn connect_with(&mut self, address: &Address, timeouts: Timeouts) -> Result<()> {
        self.timeouts = timeouts;
        self.connect(address)
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Only applies to the next connect.
    pub fn set_timeouts(&mut self, timeouts: Timeouts) {
        self.timeouts = timeouts;
    }

    fn transport(&mut self) -> Result<&mut Box<dyn Transport>> {
        self.transport.as_mut().ok_or(Error::NotConnected)
    }

    pub fn send(&mut self, command: &str) -> Result<()> {
        self.send_raw(command.as_bytes())
    }

    /// `send` for a command built with `format_args!`.
    pub fn send_fmt(&mut self, command: fmt::Arguments<'_>) -> Result<()> {
        match command.as_str() {
            Some(command) => self.send(command),
            None => self.send(&command.to_string()),
        }
    }

    pub fn send_raw(&mut self, data: &[u8]) -> Result<()> {
        self.transport()?.send(data)
    }

    /// Reads exactly `size` bytes, or to the end of the message if that comes first.
    pub fn read_raw(&mut self, size: usize) -> Result<Vec<u8>> {
        self.transport()?.read(size)
    }

    pub fn read_all(&mut self) -> Result<Vec<u8>> {
        self.transport()?.read_all()
    }

    pub fn query_raw(&mut self, command: &str) -> Result<Vec<u8>> {
        self.send(command)?;
        self.read_all()
    }

    /// Sends `command` and returns the whole response as text.
    pub fn query(&mut self, command: &str) -> Result<String> {
        let response = self.query_raw(command)?;
        Ok(String::from_utf8_lossy(&response).into_owned())
    }

    pub fn query_as<T: Decode>(&mut self, command: &str) -> Result<T> {
        T::decode(&self.query(command)?)
    }

    pub fn idn(&mut self) -> Result<Idn> {
        Ok(Idn::parse(&self.query("*IDN?")?))
    }

    /// Whether the last read stopped before the instrument finished its response.
    pub fn pending(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.pending())
    }

    pub fn is_connected(&self) -> bool {
        self.transport
            .as_ref()
            .is_some_and(|transport| transport.is_connected())
    }

    pub fn close(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.close();
        }
    }

    pub fn list_usb() -> Result<Vec<UsbDeviceInfo>> {
        instrument_usb::list_devices(Timeouts::default().open)
    }

    pub fn list_serial_ports() -> Result<Vec<String>> {
        instrument_serial::list_serial_ports()
    }
}

impl Drop for Instrument {
    fn drop(&mut self) {
        self.close();
    }
}
