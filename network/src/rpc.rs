//! Just enough ONC-RPC (version 2, over TCP with record marking) and XDR to drive a
//! VXI-11 instrument, including the portmapper lookup that finds it.

use crate::connect_tcp;
use byteorder::{BigEndian, ByteOrder};
use instrument_types::{Error, Result};
use log::debug;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

pub const PORTMAPPER_PORT: u16 = 111;
pub const PORTMAPPER_PROGRAM: u32 = 100000;
pub const PORTMAPPER_VERSION: u32 = 2;
pub const PORTMAPPER_GETPORT: u32 = 3;
pub const PROTOCOL_TCP: u32 = 6;

const RPC_VERSION: u32 = 2;
const MESSAGE_CALL: u32 = 0;
const MESSAGE_REPLY: u32 = 1;
const REPLY_ACCEPTED: u32 = 0;
const ACCEPT_SUCCESS: u32 = 0;
const LAST_FRAGMENT: u32 = 0x8000_0000;

// Nothing sane comes back in a record this big.
const MAX_RECORD_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Default, Clone)]
pub struct XdrWriter {
    buffer: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, value: u32) -> &mut Self {
        let mut bytes = [0; 4];
        BigEndian::write_u32(&mut bytes, value);
        self.buffer.extend_from_slice(&bytes);
        self
    }

    pub fn put_i32(&mut self, value: i32) -> &mut Self {
        self.put_u32(value as u32)
    }

    pub fn put_bool(&mut self, value: bool) -> &mut Self {
        self.put_u32(u32::from(value))
    }

    /// Variable length opaque data, length prefixed and zero padded to 4 bytes.
    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.put_u32(data.len() as u32);
        self.buffer.extend_from_slice(data);
        self.buffer.resize(self.buffer.len().div_ceil(4) * 4, 0);
        self
    }

    pub fn put_string(&mut self, value: &str) -> &mut Self {
        self.put_opaque(value.as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

#[derive(Debug, Clone)]
pub struct XdrReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self
            .position
            .checked_add(length)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                Error::Protocol(format!(
                    "XDR data ended at {} bytes, wanted {} more from {}",
                    self.data.len(),
                    length,
                    self.position
                ))
            })?;
        let bytes = &self.data[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_bool(&mut self) -> Result<bool> {
        Ok(self.get_u32()? != 0)
    }

    pub fn get_opaque(&mut self) -> Result<&'a [u8]> {
        let length = self.get_u32()? as usize;
        let data = self.take(length)?;
        self.take(length.div_ceil(4) * 4 - length)?;
        Ok(data)
    }

    pub fn get_string(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.get_opaque()?).into_owned())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }
}

/// Sends `data` as a single, final record fragment.
pub fn write_record<W: Write>(stream: &mut W, data: &[u8]) -> Result<()> {
    let mut marker = [0; 4];
    BigEndian::write_u32(&mut marker, LAST_FRAGMENT | data.len() as u32);
    stream.write_all(&marker)?;
    stream.write_all(data)?;
    stream.flush()?;
    Ok(())
}

/// Reads fragments until the one marked last, returning them joined.
pub fn read_record<R: Read>(stream: &mut R) -> Result<Vec<u8>> {
    let mut record = Vec::new();
    loop {
        let mut marker = [0; 4];
        stream.read_exact(&mut marker)?;
        let marker = BigEndian::read_u32(&marker);

        let length = (marker & !LAST_FRAGMENT) as usize;
        if record.len() + length > MAX_RECORD_SIZE {
            return Err(Error::Protocol(format!(
                "RPC record of more than {} bytes",
                MAX_RECORD_SIZE
            )));
        }

        let start = record.len();
        record.resize(start + length, 0);
        stream.read_exact(&mut record[start..])?;

        if marker & LAST_FRAGMENT != 0 {
            return Ok(record);
        }
    }
}

/// A TCP connection to one RPC program.
pub struct RpcClient {
    stream: TcpStream,
    program: u32,
    version: u32,
    xid: u32,
}

impl RpcClient {
    pub fn connect(
        host: &str,
        port: u16,
        program: u32,
        version: u32,
        timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self> {
        let stream = connect_tcp(host, port, timeout, command_timeout)?;
        Ok(Self {
            stream,
            program,
            version,
            xid: 0,
        })
    }

    /// Calls `procedure` with XDR encoded `arguments`, returning the XDR encoded results.
    pub fn call(&mut self, procedure: u32, arguments: &[u8]) -> Result<Vec<u8>> {
        self.xid = self.xid.wrapping_add(1);

        let mut message = XdrWriter::new();
        message
            .put_u32(self.xid)
            .put_u32(MESSAGE_CALL)
            .put_u32(RPC_VERSION)
            .put_u32(self.program)
            .put_u32(self.version)
            .put_u32(procedure)
            // AUTH_NONE credentials and verifier
            .put_u32(0)
            .put_opaque(&[])
            .put_u32(0)
            .put_opaque(&[]);
        let mut message = message.into_bytes();
        message.extend_from_slice(arguments);

        debug!(
            "RPC call {} to program {:#x} (xid {})",
            procedure, self.program, self.xid
        );
        write_record(&mut self.stream, &message)?;

        let reply = read_record(&mut self.stream)?;
        let mut reader = XdrReader::new(&reply);
        let xid = reader.get_u32()?;
        if xid != self.xid {
            return Err(Error::Protocol(format!(
                "RPC reply for xid {}, expected {}",
                xid, self.xid
            )));
        }
        if reader.get_u32()? != MESSAGE_REPLY {
            return Err(Error::Protocol(String::from("RPC message isn't a reply")));
        }
        let status = reader.get_u32()?;
        if status != REPLY_ACCEPTED {
            return Err(Error::Protocol(format!("RPC call denied ({})", status)));
        }
        // Verifier
        reader.get_u32()?;
        reader.get_opaque()?;
        let status = reader.get_u32()?;
        if status != ACCEPT_SUCCESS {
            return Err(Error::Protocol(format!(
                "RPC call to procedure {} failed with status {}",
                procedure, status
            )));
        }

        let consumed = reply.len() - reader.remaining();
        Ok(reply[consumed..].to_vec())
    }

    pub fn shutdown(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// Asks the portmapper on `host` which TCP port `program` listens on.
pub fn get_port(host: &str, program: u32, version: u32, timeout: Duration) -> Result<u16> {
    get_port_from(host, PORTMAPPER_PORT, program, version, timeout)
}

pub fn get_port_from(
    host: &str,
    portmapper_port: u16,
    program: u32,
    version: u32,
    timeout: Duration,
) -> Result<u16> {
    let mut client = RpcClient::connect(
        host,
        portmapper_port,
        PORTMAPPER_PROGRAM,
        PORTMAPPER_VERSION,
        timeout,
        timeout,
    )?;

    let mut arguments = XdrWriter::new();
    arguments
        .put_u32(program)
        .put_u32(version)
        .put_u32(PROTOCOL_TCP)
        .put_u32(0);
    let reply = client.call(PORTMAPPER_GETPORT, arguments.as_bytes())?;
    client.shutdown();

    let port = XdrReader::new(&reply).get_u32()?;
    match u16::try_from(port) {
        Ok(0) | Err(_) => Err(Error::connection(format!(
            "Program {:#x} version {} isn't registered on {}",
            program, version, host
        ))),
        Ok(port) => {
            debug!("Program {:#x} is on port {}", program, port);
            Ok(port)
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::thread::{self, JoinHandle};

    /// Serves RPC calls on one connection, answering each with `handler(procedure, args)`.
    pub(crate) fn serve<F>(listener: TcpListener, mut handler: F) -> JoinHandle<()>
    where
        F: FnMut(u32, &mut XdrReader) -> Vec<u8> + Send + 'static,
    {
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            while let Ok(call) = read_record(&mut stream) {
                let mut reader = XdrReader::new(&call);
                let xid = reader.get_u32().unwrap();
                assert_eq!(reader.get_u32().unwrap(), MESSAGE_CALL);
                assert_eq!(reader.get_u32().unwrap(), RPC_VERSION);
                reader.get_u32().unwrap();
                reader.get_u32().unwrap();
                let procedure = reader.get_u32().unwrap();
                for _ in 0..2 {
                    reader.get_u32().unwrap();
                    reader.get_opaque().unwrap();
                }

                let results = handler(procedure, &mut reader);
                let mut reply = XdrWriter::new();
                reply
                    .put_u32(xid)
                    .put_u32(MESSAGE_REPLY)
                    .put_u32(REPLY_ACCEPTED)
                    .put_u32(0)
                    .put_opaque(&[])
                    .put_u32(ACCEPT_SUCCESS);
                let mut reply = reply.into_bytes();
                reply.extend(results);
                write_record(&mut stream, &reply).unwrap();
            }
        })
    }

    #[test]
    fn opaque_data_is_padded() {
        let mut writer = XdrWriter::new();
        writer.put_opaque(b"abcde").put_i32(-1);
        assert_eq!(
            writer.as_bytes(),
            &[0, 0, 0, 5, b'a', b'b', b'c', b'd', b'e', 0, 0, 0, 0xff, 0xff, 0xff, 0xff]
        );

        let bytes = writer.into_bytes();
        let mut reader = XdrReader::new(&bytes);
        assert_eq!(reader.get_opaque().unwrap(), b"abcde");
        assert_eq!(reader.get_i32().unwrap(), -1);
        assert!(reader.get_u32().is_err());
    }

    #[test]
    fn fragments_are_joined() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&[0, 0, 0, 2, b'a', b'b']);
        stream.extend_from_slice(&[0x80, 0, 0, 1, b'c']);
        let record = read_record(&mut stream.as_slice()).unwrap();
        assert_eq!(record, b"abc");
    }

    #[test]
    fn asks_the_portmapper() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve(listener, |procedure, arguments| {
            assert_eq!(procedure, PORTMAPPER_GETPORT);
            assert_eq!(arguments.get_u32().unwrap(), 0x0607AF);
            assert_eq!(arguments.get_u32().unwrap(), 1);
            assert_eq!(arguments.get_u32().unwrap(), PROTOCOL_TCP);
            let mut reply = XdrWriter::new();
            reply.put_u32(1024);
            reply.into_bytes()
        });

        let found = get_port_from("127.0.0.1", port, 0x0607AF, 1, Duration::from_secs(2));
        assert_eq!(found.unwrap(), 1024);
        server.join().unwrap();
    }

    #[test]
    fn unregistered_programs_fail_to_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = serve(listener, |_, _| {
            let mut reply = XdrWriter::new();
            reply.put_u32(0);
            reply.into_bytes()
        });

        let found = get_port_from("127.0.0.1", port, 0x0607AF, 1, Duration::from_secs(2));
        assert!(matches!(found, Err(Error::Connection { .. })));
        server.join().unwrap();
    }
}
