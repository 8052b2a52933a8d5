#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use strum::{Display, EnumIter, EnumString};

pub mod address;
pub mod error;
pub mod transport;

pub use address::{Address, NetworkAddress, SerialAddress, TransportKind, UsbAddress};
pub use error::{Error, Result};
pub use transport::{LineStream, Timeouts, Transport};

pub const DEFAULT_RAW_SOCKET_PORT: u16 = 5025;
pub const DEFAULT_HISLIP_PORT: u16 = 4880;
pub const DEFAULT_VXI11_DEVICE: &str = "inst0";
pub const DEFAULT_HISLIP_DEVICE: &str = "hislip0";
pub const DEFAULT_BAUD_RATE: u32 = 9600;

#[derive(Copy, Clone, Debug, Default, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum DataBits {
    #[strum(serialize = "5")]
    Five,
    #[strum(serialize = "6")]
    Six,
    #[strum(serialize = "7")]
    Seven,
    #[default]
    #[strum(serialize = "8")]
    Eight,
}

#[derive(Copy, Clone, Debug, Default, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[strum(ascii_case_insensitive)]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Copy, Clone, Debug, Default, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum StopBits {
    #[default]
    #[strum(serialize = "1")]
    One,
    #[strum(serialize = "2")]
    Two,
}

#[derive(Copy, Clone, Debug, Default, Display, EnumIter, EnumString, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[strum(ascii_case_insensitive)]
pub enum FlowControl {
    #[default]
    None,
    Software,
    Hardware,
}

// A USB device which could be talked to over USBTMC, found without connecting to it.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct UsbDeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub serial_number: String,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub bus_number: u8,
    pub address: u8,
}

impl UsbDeviceInfo {
    pub fn to_address(&self) -> Address {
        Address::Usb(UsbAddress::new(
            self.vendor_id,
            self.product_id,
            self.serial_number.clone(),
        ))
    }
}

impl Display for UsbDeviceInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:04x}:{:04x} {} on bus {}, address {}",
            self.vendor_id, self.product_id, self.serial_number, self.bus_number, self.address
        )?;
        match (&self.manufacturer, &self.product) {
            (Some(manufacturer), Some(product)) => write!(f, " ({} {})", manufacturer, product),
            (None, Some(product)) => write!(f, " ({})", product),
            _ => Ok(()),
        }
    }
}
