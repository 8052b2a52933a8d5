use crate::devices::{open_device, read_serial_number, Layout};
use crate::error::{connection_error, transfer_error};
use crate::framing::{
    packetize, request_in, InboundParser, Parsed, TagCounter, DEFAULT_MAX_TRANSFER_SIZE,
};
use crate::{
    CHECK_CLEAR_STATUS, INITIATE_CLEAR, READ_STATUS_BYTE, STATUS_PENDING, STATUS_SUCCESS,
};
use instrument_types::{Error, Result, Timeouts, Transport, UsbAddress, UsbDeviceInfo};
use log::{debug, info, warn};
use rusb::{DeviceHandle, Direction, GlobalContext, Recipient, RequestType};
use std::thread::sleep;
use std::time::{Duration, Instant};

/// A USB Test & Measurement Class device, opened and claimed.
///
/// The device is released when this is closed or dropped.
pub struct UsbTmc {
    handle: Option<DeviceHandle<GlobalContext>>,
    info: UsbDeviceInfo,
    layout: Layout,
    exchange: Exchange,
    status_tag: u8,
    timeout: Duration,
}

/// The two bulk endpoints messages travel over.
trait BulkPipe {
    fn write_out(&mut self, data: &[u8]) -> Result<usize>;
    fn read_in(&mut self, buf: &mut [u8]) -> Result<usize>;

    fn out_packet_size(&self) -> usize;
    fn in_packet_size(&self) -> usize;
}

struct DevicePipe<'a> {
    handle: &'a DeviceHandle<GlobalContext>,
    layout: &'a Layout,
    timeout: Duration,
}

impl<'a> DevicePipe<'a> {
    fn new(
        handle: &'a Option<DeviceHandle<GlobalContext>>,
        layout: &'a Layout,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            handle: handle.as_ref().ok_or(Error::NotConnected)?,
            layout,
            timeout,
        })
    }
}

impl BulkPipe for DevicePipe<'_> {
    fn write_out(&mut self, data: &[u8]) -> Result<usize> {
        self.handle
            .write_bulk(self.layout.bulk_out.address, data, self.timeout)
            .map_err(transfer_error)
    }

    fn read_in(&mut self, buf: &mut [u8]) -> Result<usize> {
        self.handle
            .read_bulk(self.layout.bulk_in.address, buf, self.timeout)
            .map_err(transfer_error)
    }

    fn out_packet_size(&self) -> usize {
        self.layout.bulk_out.max_packet_size
    }

    fn in_packet_size(&self) -> usize {
        self.layout.bulk_in.max_packet_size
    }
}

/// Tags, reassembly and the EOM bookkeeping of DEV_DEP_MSG traffic.
struct Exchange {
    tags: TagCounter,
    parser: InboundParser,
    buffer: Vec<u8>,
    max_transfer_size: u32,
    term_char: Option<u8>,
    pending: bool,
}

impl Exchange {
    fn new(max_transfer_size: u32) -> Self {
        Self {
            tags: TagCounter::new(),
            parser: InboundParser::new(max_transfer_size),
            buffer: Vec::new(),
            max_transfer_size,
            term_char: None,
            pending: false,
        }
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.parser.reset();
        self.pending = false;
    }

    fn write(pipe: &mut impl BulkPipe, data: &[u8]) -> Result<()> {
        let written = pipe.write_out(data)?;
        if written != data.len() {
            return Err(Error::transfer(
                -1,
                format!("Short bulk write, {} of {} bytes", written, data.len()),
            ));
        }
        Ok(())
    }

    fn send(&mut self, pipe: &mut impl BulkPipe, data: &[u8]) -> Result<()> {
        let packets = packetize(data, pipe.out_packet_size(), &mut self.tags)?;
        debug!(
            "Sending {} bytes in {} packet(s) with tag {}",
            data.len(),
            packets.len(),
            self.tags.current()
        );
        for packet in packets {
            Self::write(pipe, &packet)?;
        }
        Ok(())
    }

    fn request(&mut self, pipe: &mut impl BulkPipe, remaining: usize) -> Result<()> {
        let size = remaining.min(self.max_transfer_size as usize) as u32;
        let request = request_in(size, self.term_char, &mut self.tags);
        self.parser.expect_tag(self.tags.current());
        debug!("Requesting {} bytes with tag {}", size, self.tags.current());
        Self::write(pipe, &request)
    }

    fn read_message(&mut self, pipe: &mut impl BulkPipe, size: usize) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        let mut scratch = vec![0; pipe.in_packet_size().max(64)];
        self.reset();

        self.request(pipe, size)?;
        loop {
            match self.parser.parse(&mut self.buffer, &mut output, size)? {
                Parsed::Complete => break,
                Parsed::Packet => {
                    // The transfer ended without EOM. Whatever followed it was padding.
                    self.buffer.clear();
                    self.request(pipe, size - output.len())?;
                }
                Parsed::NeedMoreData => {
                    let received = pipe.read_in(&mut scratch)?;
                    self.buffer.extend_from_slice(&scratch[..received]);
                }
            }
        }

        self.pending = !self.parser.eom();
        self.buffer.clear();
        Ok(output)
    }
}

impl UsbTmc {
    pub fn connect(address: &UsbAddress, timeouts: Timeouts) -> Result<Self> {
        Self::connect_with_limit(address, timeouts, DEFAULT_MAX_TRANSFER_SIZE)
    }

    /// Like [`UsbTmc::connect`], but rejecting any inbound transfer larger than
    /// `max_transfer_size`, which is also the most asked for in one request.
    pub fn connect_with_limit(
        address: &UsbAddress,
        timeouts: Timeouts,
        max_transfer_size: u32,
    ) -> Result<Self> {
        let (device, mut handle) = open_device(address, timeouts.open)?;
        let descriptor = device.device_descriptor().map_err(connection_error)?;
        let config = device
            .active_config_descriptor()
            .map_err(connection_error)?;
        let layout = Layout::from_config(&config)?;

        // Not every platform can detach kernel drivers, claiming tells us if it mattered.
        if let Err(error) = handle.set_auto_detach_kernel_driver(true) {
            debug!("Kernel driver auto-detach unavailable: {}", error);
        }

        for (interface, setting) in &layout.interfaces {
            handle.claim_interface(*interface).map_err(|error| Error::Connection {
                code: crate::error::libusb_code(error),
                message: format!("Unable to claim interface {}: {}", interface, error),
            })?;
            if *setting != 0 {
                handle
                    .set_alternate_setting(*interface, *setting)
                    .map_err(connection_error)?;
            }
        }

        let endpoints = [Some(layout.bulk_in), Some(layout.bulk_out), layout.interrupt_in];
        for endpoint in endpoints.iter().flatten() {
            if let Err(error) = handle.clear_halt(endpoint.address) {
                warn!("Unable to clear halt on endpoint {:#04x}: {}", endpoint.address, error);
            }
        }

        let info = UsbDeviceInfo {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            serial_number: read_serial_number(&handle, &descriptor, timeouts.open),
            manufacturer: handle.read_manufacturer_string_ascii(&descriptor).ok(),
            product: handle.read_product_string_ascii(&descriptor).ok(),
            bus_number: device.bus_number(),
            address: device.address(),
        };
        info!("Connected to USBTMC device {}", info);

        Ok(Self {
            handle: Some(handle),
            info,
            layout,
            exchange: Exchange::new(max_transfer_size),
            status_tag: 1,
            timeout: timeouts.command,
        })
    }

    pub fn info(&self) -> &UsbDeviceInfo {
        &self.info
    }

    /// Ask the device to end a read early when it sends this byte. Not every device
    /// supports it, the capabilities say so.
    pub fn set_term_char(&mut self, term_char: Option<u8>) {
        self.exchange.term_char = term_char;
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn handle(&self) -> Result<&DeviceHandle<GlobalContext>> {
        self.handle.as_ref().ok_or(Error::NotConnected)
    }

    fn interface_number(&self) -> u16 {
        self.layout
            .interfaces
            .first()
            .map(|(interface, _)| u16::from(*interface))
            .unwrap_or_default()
    }

    fn read_class_control(&self, request: u8, value: u16, length: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; length];
        let response_length = self
            .handle()?
            .read_control(
                rusb::request_type(Direction::In, RequestType::Class, Recipient::Interface),
                request,
                value,
                self.interface_number(),
                &mut buf,
                self.timeout,
            )
            .map_err(transfer_error)?;
        buf.truncate(response_length);
        Ok(buf)
    }

    fn read_message(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut pipe = DevicePipe::new(&self.handle, &self.layout, self.timeout)?;
        self.exchange.read_message(&mut pipe, size)
    }

    /// Clears the device's input and output buffers (INITIATE_CLEAR), waiting for it to
    /// report the clear has finished.
    pub fn clear(&mut self) -> Result<()> {
        let status = self.read_class_control(INITIATE_CLEAR, 0, 1)?;
        if status.first() != Some(&STATUS_SUCCESS) {
            return Err(Error::Protocol(format!(
                "INITIATE_CLEAR was refused with status {:?}",
                status.first()
            )));
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            let status = self.read_class_control(CHECK_CLEAR_STATUS, 0, 2)?;
            match status.first() {
                Some(&STATUS_SUCCESS) => break,
                Some(&STATUS_PENDING) => {
                    if Instant::now() >= deadline {
                        return Err(Error::Timeout(String::from("USBTMC clear")));
                    }
                    // bmClear bit 0 means the device wants its bulk-in data read first.
                    if status.get(1).is_some_and(|clear| clear & 0x01 != 0) {
                        let mut scratch = vec![0; self.layout.bulk_in.max_packet_size.max(64)];
                        match self.handle()?.read_bulk(
                            self.layout.bulk_in.address,
                            &mut scratch,
                            self.timeout,
                        ) {
                            Ok(_) | Err(rusb::Error::Timeout) => {}
                            Err(error) => return Err(transfer_error(error)),
                        }
                    } else {
                        sleep(Duration::from_millis(10));
                    }
                }
                status => {
                    return Err(Error::Protocol(format!(
                        "CHECK_CLEAR_STATUS failed with status {:?}",
                        status
                    )))
                }
            }
        }

        self.handle()?
            .clear_halt(self.layout.bulk_out.address)
            .map_err(transfer_error)?;
        self.exchange.reset();
        debug!("Cleared device buffers");
        Ok(())
    }

    /// The IEEE 488.2 status byte (USB488 READ_STATUS_BYTE).
    pub fn read_status_byte(&mut self) -> Result<u8> {
        // bTag for this request runs from 2 to 127.
        self.status_tag = if self.status_tag >= 127 { 2 } else { self.status_tag + 1 };
        let tag = self.status_tag;

        let response = self.read_class_control(READ_STATUS_BYTE, u16::from(tag), 3)?;
        if response.first() != Some(&STATUS_SUCCESS) {
            return Err(Error::Protocol(format!(
                "READ_STATUS_BYTE failed with status {:?}",
                response.first()
            )));
        }

        // With an interrupt endpoint the status byte arrives there instead.
        if let Some(interrupt) = self.layout.interrupt_in {
            let mut notification = [0; 2];
            let received = self
                .handle()?
                .read_interrupt(interrupt.address, &mut notification, self.timeout)
                .map_err(transfer_error)?;
            if received < 2 || notification[0] != (0x80 | tag) {
                return Err(Error::Protocol(format!(
                    "Unexpected status notification {:?}",
                    &notification[..received]
                )));
            }
            return Ok(notification[1]);
        }

        response.get(2).copied().ok_or_else(|| {
            Error::Protocol(String::from("READ_STATUS_BYTE response was too short"))
        })
    }
}

impl Transport for UsbTmc {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut pipe = DevicePipe::new(&self.handle, &self.layout, self.timeout)?;
        self.exchange.send(&mut pipe, data)
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.read_message(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.read_message(usize::MAX)
    }

    fn close(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            for (interface, _) in &self.layout.interfaces {
                if let Err(error) = handle.release_interface(*interface) {
                    debug!("Unable to release interface {}: {}", interface, error);
                }
            }
            info!("Closed USBTMC device {}", self.info);
        }
    }

    fn is_connected(&self) -> bool {
        self.handle.is_some()
    }

    fn pending(&self) -> bool {
        self.exchange.pending
    }
}

impl Drop for UsbTmc {
    fn drop(&mut self) {
        self.close();
    }
}
