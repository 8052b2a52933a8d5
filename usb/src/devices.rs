// Locating USBTMC devices on the bus. Nothing in here talks USBTMC itself, it only walks
// descriptors so the transport (and anyone listing devices) can find what to open.

use crate::error::connection_error;
use crate::{USBTMC_CLASS, USBTMC_SUBCLASS};
use instrument_types::{Error, Result, UsbAddress, UsbDeviceInfo};
use log::{debug, warn};
use rusb::{
    ConfigDescriptor, Device, DeviceDescriptor, DeviceHandle, Direction, GlobalContext,
    TransferType,
};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub address: u8,
    pub max_packet_size: usize,
}

/// The interfaces and endpoints a USBTMC device exposes in its active configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// (interface number, alternate setting) for each USBTMC interface.
    pub interfaces: Vec<(u8, u8)>,
    pub bulk_in: Endpoint,
    pub bulk_out: Endpoint,
    pub interrupt_in: Option<Endpoint>,
}

impl Layout {
    pub fn from_config(config: &ConfigDescriptor) -> Result<Self> {
        let mut interfaces = Vec::new();
        let mut bulk_in = None;
        let mut bulk_out = None;
        let mut interrupt_in = None;

        for interface in config.interfaces() {
            for setting in interface.descriptors() {
                if setting.class_code() != USBTMC_CLASS
                    || setting.sub_class_code() != USBTMC_SUBCLASS
                {
                    continue;
                }

                let number = setting.interface_number();
                if !interfaces.iter().any(|(existing, _)| *existing == number) {
                    interfaces.push((number, setting.setting_number()));
                }

                for endpoint in setting.endpoint_descriptors() {
                    let found = Endpoint {
                        address: endpoint.address(),
                        max_packet_size: usize::from(endpoint.max_packet_size() & 0x7ff),
                    };
                    let slot = match (endpoint.transfer_type(), endpoint.direction()) {
                        (TransferType::Bulk, Direction::In) => &mut bulk_in,
                        (TransferType::Bulk, Direction::Out) => &mut bulk_out,
                        (TransferType::Interrupt, Direction::In) => &mut interrupt_in,
                        _ => continue,
                    };
                    if slot.is_none() {
                        *slot = Some(found);
                    }
                }
            }
        }

        match (bulk_in, bulk_out) {
            (Some(bulk_in), Some(bulk_out)) => Ok(Self {
                interfaces,
                bulk_in,
                bulk_out,
                interrupt_in,
            }),
            _ => Err(Error::connection(
                "Device has no USBTMC interface with bulk endpoints",
            )),
        }
    }
}

fn has_usbtmc_interface(config: &ConfigDescriptor) -> bool {
    config.interfaces().any(|interface| {
        interface.descriptors().any(|setting| {
            setting.class_code() == USBTMC_CLASS && setting.sub_class_code() == USBTMC_SUBCLASS
        })
    })
}

fn config_descriptor(device: &Device<GlobalContext>) -> rusb::Result<ConfigDescriptor> {
    // An unconfigured device has no active configuration, fall back to the first one.
    device
        .active_config_descriptor()
        .or_else(|_| device.config_descriptor(0))
}

/// Reads the serial number, trying the UTF-16 descriptor before the ASCII one.
///
/// A device without a serial number (or one we can't read) reports an empty string.
pub fn read_serial_number(
    handle: &DeviceHandle<GlobalContext>,
    descriptor: &DeviceDescriptor,
    timeout: Duration,
) -> String {
    if descriptor.serial_number_string_index().is_none() {
        return String::new();
    }

    if let Ok(languages) = handle.read_languages(timeout) {
        if let Some(language) = languages.first() {
            match handle.read_serial_number_string(*language, descriptor, timeout) {
                Ok(serial) => return serial,
                Err(error) => debug!("Unable to read serial number string: {}", error),
            }
        }
    }

    handle
        .read_serial_number_string_ascii(descriptor)
        .unwrap_or_else(|error| {
            warn!("Unable to read serial number: {}", error);
            String::new()
        })
}

/// Opens the device matching the vendor id, product id and serial number exactly.
///
/// Every other candidate that had to be opened to read its serial is closed again.
pub fn open_device(
    address: &UsbAddress,
    timeout: Duration,
) -> Result<(Device<GlobalContext>, DeviceHandle<GlobalContext>)> {
    let devices = rusb::devices().map_err(connection_error)?;

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        if descriptor.vendor_id() != address.vendor_id()
            || descriptor.product_id() != address.product_id()
        {
            continue;
        }

        let handle = match device.open() {
            Ok(handle) => handle,
            Err(error) => {
                warn!(
                    "Unable to open {:04x}:{:04x} on bus {} address {}: {}",
                    descriptor.vendor_id(),
                    descriptor.product_id(),
                    device.bus_number(),
                    device.address(),
                    error
                );
                continue;
            }
        };

        let serial = read_serial_number(&handle, &descriptor, timeout);
        if serial == address.serial_number() {
            debug!(
                "Found {:04x}:{:04x} ({}) on bus {}",
                descriptor.vendor_id(),
                descriptor.product_id(),
                serial,
                device.bus_number()
            );
            return Ok((device, handle));
        }
        debug!(
            "Skipping {:04x}:{:04x} with serial {}",
            descriptor.vendor_id(),
            descriptor.product_id(),
            serial
        );
    }

    Err(Error::connection(format!(
        "USB device {:04x}:{:04x} with serial '{}' not found",
        address.vendor_id(),
        address.product_id(),
        address.serial_number()
    )))
}

/// Every device exposing a USBTMC interface.
pub fn list_devices(timeout: Duration) -> Result<Vec<UsbDeviceInfo>> {
    let mut found_devices = Vec::new();

    let devices = rusb::devices().map_err(connection_error)?;
    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };
        match config_descriptor(&device) {
            Ok(config) if has_usbtmc_interface(&config) => {}
            _ => continue,
        }

        let mut info = UsbDeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number: String::new(),
            manufacturer: None,
            product: None,
            bus_number: device.bus_number(),
            address: device.address(),
        };

        // Without permission to open the device we can still list it, just not its strings.
        match device.open() {
            Ok(handle) => {
                info.serial_number = read_serial_number(&handle, &descriptor, timeout);
                info.manufacturer = handle.read_manufacturer_string_ascii(&descriptor).ok();
                info.product = handle.read_product_string_ascii(&descriptor).ok();
            }
            Err(error) => debug!("Unable to open {}: {}", info, error),
        }

        found_devices.push(info);
    }

    Ok(found_devices)
}
