//! Endpoint descriptors, one variant per kind of transport.
//!
//! Addresses are plain values: they're built once by the caller, compared structurally,
//! and never change afterwards. They can also be parsed from (and printed as) the VISA
//! resource strings most instrument software uses, for example
//! `USB0::0x1AB1::0x04CE::DS1ZA000000001::INSTR` or `TCPIP0::192.168.1.20::5025::SOCKET`.

use crate::error::{Error, Result};
use crate::{
    DataBits, FlowControl, Parity, StopBits, DEFAULT_BAUD_RATE, DEFAULT_HISLIP_DEVICE,
    DEFAULT_RAW_SOCKET_PORT, DEFAULT_VXI11_DEVICE,
};
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use strum::{Display, EnumIter};

#[derive(Copy, Clone, Debug, Display, EnumIter, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Usb,
    Serial,
    Vxi11,
    HiSlip,
    RawSocket,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Address {
    Usb(UsbAddress),
    Serial(SerialAddress),
    Vxi11(NetworkAddress),
    HiSlip(NetworkAddress),
    RawSocket(NetworkAddress),
}

impl Address {
    pub fn usb(vendor_id: u16, product_id: u16, serial_number: impl Into<String>) -> Self {
        Address::Usb(UsbAddress::new(vendor_id, product_id, serial_number))
    }

    pub fn serial(port: impl Into<String>) -> Self {
        Address::Serial(SerialAddress::new(port))
    }

    pub fn vxi11(host: impl Into<String>) -> Self {
        Address::Vxi11(NetworkAddress::new(host, None))
    }

    pub fn hislip(host: impl Into<String>) -> Self {
        Address::HiSlip(NetworkAddress::new(host, None))
    }

    pub fn raw_socket(host: impl Into<String>, port: u16) -> Self {
        Address::RawSocket(NetworkAddress::new(host, Some(port)))
    }

    pub fn kind(&self) -> TransportKind {
        match self {
            Address::Usb(_) => TransportKind::Usb,
            Address::Serial(_) => TransportKind::Serial,
            Address::Vxi11(_) => TransportKind::Vxi11,
            Address::HiSlip(_) => TransportKind::HiSlip,
            Address::RawSocket(_) => TransportKind::RawSocket,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbAddress {
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) serial_number: String,
}

impl UsbAddress {
    pub fn new(vendor_id: u16, product_id: u16, serial_number: impl Into<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number: serial_number.into(),
        }
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }
}

// Shared by VXI-11, HiSLIP and raw sockets. `device` is the VXI-11 / HiSLIP sub-address
// (inst0, hislip0, ...) and is ignored by raw sockets.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NetworkAddress {
    pub(crate) host: String,
    pub(crate) port: Option<u16>,
    pub(crate) device: Option<String>,
}

impl NetworkAddress {
    pub fn new(host: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            host: host.into(),
            port,
            device: None,
        }
    }

    pub fn with_device(self, device: impl Into<String>) -> Self {
        Self {
            device: Some(device.into()),
            ..self
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }
    pub fn port(&self) -> Option<u16> {
        self.port
    }
    pub fn device(&self) -> Option<&str> {
        self.device.as_deref()
    }

    pub fn port_or(&self, default: u16) -> u16 {
        self.port.unwrap_or(default)
    }

    pub fn device_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.device.as_deref().unwrap_or(default)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct SerialAddress {
    pub(crate) port: String,
    pub(crate) baud_rate: u32,
    pub(crate) data_bits: DataBits,
    pub(crate) parity: Parity,
    pub(crate) stop_bits: StopBits,
    pub(crate) flow_control: FlowControl,
}

impl SerialAddress {
    /// A port running at 9600 baud, 8N1, without flow control.
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            data_bits: DataBits::default(),
            parity: Parity::default(),
            stop_bits: StopBits::default(),
            flow_control: FlowControl::default(),
        }
    }

    pub fn with_baud_rate(self, baud_rate: u32) -> Self {
        Self { baud_rate, ..self }
    }

    pub fn with_data_bits(self, data_bits: DataBits) -> Self {
        Self { data_bits, ..self }
    }

    pub fn with_parity(self, parity: Parity) -> Self {
        Self { parity, ..self }
    }

    pub fn with_stop_bits(self, stop_bits: StopBits) -> Self {
        Self { stop_bits, ..self }
    }

    pub fn with_flow_control(self, flow_control: FlowControl) -> Self {
        Self {
            flow_control,
            ..self
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }
    pub fn data_bits(&self) -> DataBits {
        self.data_bits
    }
    pub fn parity(&self) -> Parity {
        self.parity
    }
    pub fn stop_bits(&self) -> StopBits {
        self.stop_bits
    }
    pub fn flow_control(&self) -> FlowControl {
        self.flow_control
    }
}

impl Display for Address {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Address::Usb(usb) => write!(
                f,
                "USB0::0x{:04X}::0x{:04X}::{}::INSTR",
                usb.vendor_id, usb.product_id, usb.serial_number
            ),
            Address::Serial(serial) => write!(f, "ASRL{}::INSTR", serial.port),
            Address::Vxi11(network) => write!(
                f,
                "TCPIP0::{}::{}::INSTR",
                network.host,
                network.device_or(DEFAULT_VXI11_DEVICE)
            ),
            Address::HiSlip(network) => {
                write!(
                    f,
                    "TCPIP0::{}::{}",
                    network.host,
                    network.device_or(DEFAULT_HISLIP_DEVICE)
                )?;
                if let Some(port) = network.port {
                    write!(f, ",{}", port)?;
                }
                write!(f, "::INSTR")
            }
            Address::RawSocket(network) => write!(
                f,
                "TCPIP0::{}::{}::SOCKET",
                network.host,
                network.port_or(DEFAULT_RAW_SOCKET_PORT)
            ),
        }
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(resource: &str) -> Result<Self> {
        let invalid = || Error::Decode(format!("VISA resource string '{}'", resource));

        let mut parts: Vec<&str> = resource.trim().split("::").collect();
        let interface = parts.remove(0).to_ascii_uppercase();

        // The resource class is optional for INSTR, and only tells us something for SOCKET.
        let class = match parts.last() {
            Some(last) if last.eq_ignore_ascii_case("INSTR") => {
                parts.pop();
                "INSTR"
            }
            Some(last) if last.eq_ignore_ascii_case("SOCKET") => {
                parts.pop();
                "SOCKET"
            }
            _ => "INSTR",
        };

        if let Some(board) = interface.strip_prefix("USB") {
            if !is_board(board) || !(parts.len() == 3 || parts.len() == 4) {
                return Err(invalid());
            }
            let vendor_id = parse_id(parts[0]).ok_or_else(invalid)?;
            let product_id = parse_id(parts[1]).ok_or_else(invalid)?;
            return Ok(Address::usb(vendor_id, product_id, parts[2]));
        }

        if let Some(board) = interface.strip_prefix("TCPIP") {
            if !is_board(board) || parts.is_empty() || parts[0].is_empty() {
                return Err(invalid());
            }
            let host = parts[0];

            if class == "SOCKET" {
                if parts.len() != 2 {
                    return Err(invalid());
                }
                let port = parts[1].parse::<u16>().map_err(|_| invalid())?;
                return Ok(Address::raw_socket(host, port));
            }

            return match parts.get(1) {
                None => Ok(Address::vxi11(host)),
                Some(device) if device.to_ascii_lowercase().starts_with("hislip") => {
                    let (device, port) = match device.split_once(',') {
                        Some((device, port)) => {
                            (device, Some(port.parse::<u16>().map_err(|_| invalid())?))
                        }
                        None => (*device, None),
                    };
                    Ok(Address::HiSlip(
                        NetworkAddress::new(host, port).with_device(device),
                    ))
                }
                Some(device) => Ok(Address::Vxi11(
                    NetworkAddress::new(host, None).with_device(*device),
                )),
            };
        }

        // Keep the original case for the port name, /dev paths are case sensitive.
        if interface.starts_with("ASRL") {
            let trimmed = resource.trim();
            let port = &trimmed[4..trimmed.find("::").unwrap_or(trimmed.len())];
            if port.is_empty() || !parts.is_empty() {
                return Err(invalid());
            }
            let port = match port.parse::<u16>() {
                Ok(number) => format!("COM{}", number),
                Err(_) => port.to_string(),
            };
            return Ok(Address::serial(port));
        }

        Err(invalid())
    }
}

fn is_board(board: &str) -> bool {
    board.chars().all(|c| c.is_ascii_digit())
}

fn parse_id(value: &str) -> Option<u16> {
    let value = value.trim();
    match value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        Some(hex) => u16::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
