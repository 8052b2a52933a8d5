//! HiSLIP (IVI-6.1) client, synchronous mode only.
//!
//! A session is two TCP connections to the same port: the synchronous channel carrying
//! commands and responses, and the asynchronous channel used for the handshake, status
//! queries and device clear.

use crate::connect_tcp;
use byteorder::{BigEndian, ByteOrder};
use instrument_types::{
    Error, NetworkAddress, Result, Timeouts, Transport, DEFAULT_HISLIP_DEVICE,
    DEFAULT_HISLIP_PORT,
};
use log::{debug, info};
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use strum::{Display, FromRepr};

pub const HEADER_SIZE: usize = 16;
const PROLOGUE: &[u8; 2] = b"HS";

pub const PROTOCOL_VERSION: u16 = 0x0100;
// Vendor abbreviation "ZZ", reserved for clients without an assigned one.
pub const VENDOR_ID: u16 = 0x5a5a;
pub const INITIAL_MESSAGE_ID: u32 = 0xffff_ff00;

/// The largest message we're prepared to receive.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 1024 * 1024;

// Nothing sane comes back in a single message this big.
const MAX_PAYLOAD: u64 = 64 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, FromRepr)]
#[repr(u8)]
pub enum MessageType {
    Initialize = 0,
    InitializeResponse = 1,
    FatalError = 2,
    Error = 3,
    AsyncLock = 4,
    AsyncLockResponse = 5,
    Data = 6,
    DataEnd = 7,
    DeviceClearComplete = 8,
    DeviceClearAcknowledge = 9,
    AsyncRemoteLocalControl = 10,
    AsyncRemoteLocalResponse = 11,
    Trigger = 12,
    Interrupted = 13,
    AsyncInterrupted = 14,
    AsyncMaximumMessageSize = 15,
    AsyncMaximumMessageSizeResponse = 16,
    AsyncInitialize = 17,
    AsyncInitializeResponse = 18,
    AsyncDeviceClear = 19,
    AsyncServiceRequest = 20,
    AsyncStatusQuery = 21,
    AsyncStatusResponse = 22,
    AsyncDeviceClearAcknowledge = 23,
    AsyncLockInfo = 24,
    AsyncLockInfoResponse = 25,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub control: u8,
    pub parameter: u32,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(kind: MessageType, control: u8, parameter: u32, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            kind,
            control,
            parameter,
            payload: payload.into(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = vec![0; HEADER_SIZE];
        bytes[..2].copy_from_slice(PROLOGUE);
        bytes[2] = self.kind as u8;
        bytes[3] = self.control;
        BigEndian::write_u32(&mut bytes[4..8], self.parameter);
        BigEndian::write_u64(&mut bytes[8..16], self.payload.len() as u64);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    pub fn write_to<W: Write>(&self, stream: &mut W) -> Result<()> {
        stream.write_all(&self.encode())?;
        stream.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(stream: &mut R) -> Result<Self> {
        let mut header = [0; HEADER_SIZE];
        stream.read_exact(&mut header)?;

        if &header[..2] != PROLOGUE {
            return Err(Error::Protocol(format!(
                "HiSLIP header starts with {:02x?}",
                &header[..2]
            )));
        }
        let kind = MessageType::from_repr(header[2]).ok_or_else(|| {
            Error::Protocol(format!("Unknown HiSLIP message type {}", header[2]))
        })?;
        let length = BigEndian::read_u64(&header[8..16]);
        if length > MAX_PAYLOAD {
            return Err(Error::Protocol(format!(
                "Implausible HiSLIP payload of {} bytes",
                length
            )));
        }

        let mut payload = vec![0; length as usize];
        stream.read_exact(&mut payload)?;
        Ok(Self {
            kind,
            control: header[3],
            parameter: BigEndian::read_u32(&header[4..8]),
            payload,
        })
    }
}

// Reads the next message, turning the server's error reports into errors.
fn receive<R: Read>(stream: &mut R) -> Result<Message> {
    let message = Message::read_from(stream)?;
    match message.kind {
        MessageType::FatalError | MessageType::Error => Err(Error::Protocol(format!(
            "HiSLIP {} (code {}): {}",
            message.kind,
            message.control,
            String::from_utf8_lossy(&message.payload)
        ))),
        _ => Ok(message),
    }
}

fn expect<R: Read>(stream: &mut R, kind: MessageType) -> Result<Message> {
    let message = receive(stream)?;
    if message.kind != kind {
        return Err(Error::Protocol(format!(
            "Expected HiSLIP {}, received {}",
            kind, message.kind
        )));
    }
    Ok(message)
}

pub struct HiSlip {
    sync: Option<TcpStream>,
    asynchronous: Option<TcpStream>,
    peer: String,

    session_id: u16,
    max_message_size: u64,
    message_id: u32,
    rmt_delivered: bool,

    buffer: Vec<u8>,
    end_buffered: bool,
    pending: bool,
}

impl HiSlip {
    pub fn connect(address: &NetworkAddress, timeouts: Timeouts) -> Result<Self> {
        let port = address.port_or(DEFAULT_HISLIP_PORT);
        let sub_address = address.device_or(DEFAULT_HISLIP_DEVICE);
        let peer = format!("{}:{} ({})", address.host(), port, sub_address);

        let mut sync = connect_tcp(address.host(), port, timeouts.open, timeouts.command)?;
        let parameter = (u32::from(PROTOCOL_VERSION) << 16) | u32::from(VENDOR_ID);
        Message::new(MessageType::Initialize, 0, parameter, sub_address.as_bytes())
            .write_to(&mut sync)?;
        let response = expect(&mut sync, MessageType::InitializeResponse)?;
        let session_id = (response.parameter & 0xffff) as u16;
        debug!(
            "HiSLIP server version {:#06x}, session {}",
            response.parameter >> 16,
            session_id
        );

        let mut asynchronous =
            connect_tcp(address.host(), port, timeouts.open, timeouts.command)?;
        Message::new(MessageType::AsyncInitialize, 0, u32::from(session_id), Vec::new())
            .write_to(&mut asynchronous)?;
        expect(&mut asynchronous, MessageType::AsyncInitializeResponse)?;

        let mut size = [0; 8];
        BigEndian::write_u64(&mut size, DEFAULT_MAX_MESSAGE_SIZE);
        Message::new(MessageType::AsyncMaximumMessageSize, 0, 0, size)
            .write_to(&mut asynchronous)?;
        let response = expect(&mut asynchronous, MessageType::AsyncMaximumMessageSizeResponse)?;
        if response.payload.len() < 8 {
            return Err(Error::Protocol(String::from(
                "HiSLIP maximum message size response is too short",
            )));
        }
        let max_message_size = BigEndian::read_u64(&response.payload);

        info!("Connected to HiSLIP {}, session {}", peer, session_id);
        Ok(Self {
            sync: Some(sync),
            asynchronous: Some(asynchronous),
            peer,
            session_id,
            max_message_size,
            message_id: INITIAL_MESSAGE_ID,
            rmt_delivered: false,
            buffer: Vec::new(),
            end_buffered: false,
            pending: false,
        })
    }

    pub fn session_id(&self) -> u16 {
        self.session_id
    }

    fn sync(&mut self) -> Result<&mut TcpStream> {
        self.sync.as_mut().ok_or(Error::NotConnected)
    }

    fn asynchronous(&mut self) -> Result<&mut TcpStream> {
        self.asynchronous.as_mut().ok_or(Error::NotConnected)
    }

    fn read_message(&mut self, size: usize) -> Result<Vec<u8>> {
        while self.buffer.len() < size && !self.end_buffered {
            let message = receive(self.sync()?)?;
            match message.kind {
                MessageType::Data => self.buffer.extend_from_slice(&message.payload),
                MessageType::DataEnd => {
                    self.buffer.extend_from_slice(&message.payload);
                    self.end_buffered = true;
                }
                MessageType::Interrupted => {
                    debug!("HiSLIP response was interrupted, discarding it");
                    self.buffer.clear();
                }
                kind => {
                    return Err(Error::Protocol(format!(
                        "Unexpected HiSLIP {} on the synchronous channel",
                        kind
                    )))
                }
            }
        }

        let take = size.min(self.buffer.len());
        let output: Vec<u8> = self.buffer.drain(..take).collect();
        if self.buffer.is_empty() && self.end_buffered {
            self.end_buffered = false;
            self.rmt_delivered = true;
            self.pending = false;
        } else {
            self.pending = true;
        }
        Ok(output)
    }

    /// Device clear, run over both channels.
    pub fn clear(&mut self) -> Result<()> {
        Message::new(MessageType::AsyncDeviceClear, 0, 0, Vec::new())
            .write_to(self.asynchronous()?)?;
        let acknowledge = expect(self.asynchronous()?, MessageType::AsyncDeviceClearAcknowledge)?;

        Message::new(MessageType::DeviceClearComplete, acknowledge.control, 0, Vec::new())
            .write_to(self.sync()?)?;
        loop {
            // Anything still in flight on the synchronous channel is thrown away.
            let message = receive(self.sync()?)?;
            match message.kind {
                MessageType::DeviceClearAcknowledge => break,
                kind => debug!("Discarding HiSLIP {} during device clear", kind),
            }
        }

        self.message_id = INITIAL_MESSAGE_ID;
        self.rmt_delivered = false;
        self.buffer.clear();
        self.end_buffered = false;
        self.pending = false;
        debug!("Cleared HiSLIP {}", self.peer);
        Ok(())
    }

    /// The IEEE 488.2 status byte.
    pub fn read_status_byte(&mut self) -> Result<u8> {
        let control = u8::from(self.rmt_delivered);
        let last_sent = self.message_id.wrapping_sub(2);
        Message::new(MessageType::AsyncStatusQuery, control, last_sent, Vec::new())
            .write_to(self.asynchronous()?)?;
        let response = expect(self.asynchronous()?, MessageType::AsyncStatusResponse)?;
        self.rmt_delivered = false;
        Ok(response.control)
    }
}

impl Transport for HiSlip {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        let limit = self.max_message_size.saturating_sub(HEADER_SIZE as u64).max(1);
        let chunk_size = usize::try_from(limit).unwrap_or(usize::MAX);
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };

        let message_id = self.message_id;
        let control = u8::from(self.rmt_delivered);
        let count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let kind = if index == count - 1 {
                MessageType::DataEnd
            } else {
                MessageType::Data
            };
            Message::new(kind, control, message_id, chunk).write_to(self.sync()?)?;
        }

        debug!("Sent {} bytes to {} as message {:#x}", data.len(), self.peer, message_id);
        self.message_id = self.message_id.wrapping_add(2);
        self.rmt_delivered = false;
        Ok(())
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.read_message(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.read_message(usize::MAX)
    }

    fn close(&mut self) {
        let sync = self.sync.take();
        let asynchronous = self.asynchronous.take();
        if sync.is_none() && asynchronous.is_none() {
            return;
        }
        for stream in sync.iter().chain(asynchronous.iter()) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        info!("Closed HiSLIP {}", self.peer);
    }

    fn is_connected(&self) -> bool {
        self.sync.is_some()
    }

    fn pending(&self) -> bool {
        self.pending
    }
}

impl Drop for HiSlip {
    fn drop(&mut self) {
        self.close();
    }
}
