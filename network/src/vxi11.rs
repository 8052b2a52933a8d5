use crate::rpc::{get_port, RpcClient, XdrReader, XdrWriter};
use instrument_types::{
    Error, NetworkAddress, Result, Timeouts, Transport, DEFAULT_VXI11_DEVICE,
};
use log::{debug, info, warn};
use std::time::Duration;

pub const DEVICE_CORE: u32 = 0x0607AF;
pub const DEVICE_CORE_VERSION: u32 = 1;

// Core channel procedures
pub const CREATE_LINK: u32 = 10;
pub const DEVICE_WRITE: u32 = 11;
pub const DEVICE_READ: u32 = 12;
pub const DEVICE_READSTB: u32 = 13;
pub const DEVICE_CLEAR: u32 = 15;
pub const DESTROY_LINK: u32 = 23;

// Device_Flags
pub const FLAG_END: u32 = 0x08;

// Device_ReadResp reasons
pub const REASON_REQCNT: u32 = 0x01;
pub const REASON_CHR: u32 = 0x02;
pub const REASON_END: u32 = 0x04;

pub const ERROR_IO_TIMEOUT: i32 = 15;

// Asked for per device_read when the caller wants the whole message.
const READ_CHUNK: u32 = 1024 * 1024;

fn device_error(operation: &str, code: i32) -> Error {
    let reason = match code {
        1 => "syntax error",
        3 => "device not accessible",
        4 => "invalid link identifier",
        5 => "parameter error",
        6 => "channel not established",
        8 => "operation not supported",
        9 => "out of resources",
        11 => "device locked by another link",
        12 => "no lock held by this link",
        ERROR_IO_TIMEOUT => return Error::Timeout(format!("VXI-11 {}", operation)),
        17 => "I/O error",
        21 => "invalid address",
        23 => "abort",
        29 => "channel already established",
        _ => "device error",
    };
    Error::transfer(code, format!("VXI-11 {} failed: {}", operation, reason))
}

/// A VXI-11 core channel link to one device (`inst0` unless the address names another).
pub struct Vxi11 {
    client: Option<RpcClient>,
    link: i32,
    max_recv_size: u32,
    io_timeout: u32,
    lock_timeout: u32,
    device: String,
    pending: bool,
}

impl Vxi11 {
    /// Connects to the core channel, on the address's port when it has one, otherwise
    /// wherever the portmapper says.
    pub fn connect(address: &NetworkAddress, timeouts: Timeouts) -> Result<Self> {
        let port = match address.port() {
            Some(port) => port,
            None => get_port(address.host(), DEVICE_CORE, DEVICE_CORE_VERSION, timeouts.open)?,
        };

        let mut client = RpcClient::connect(
            address.host(),
            port,
            DEVICE_CORE,
            DEVICE_CORE_VERSION,
            timeouts.open,
            // The instrument gets io_timeout to answer in, leave some slack on top.
            timeouts.command + Duration::from_secs(1),
        )?;

        let device = address.device_or(DEFAULT_VXI11_DEVICE).to_string();
        let mut arguments = XdrWriter::new();
        arguments
            .put_i32(std::process::id() as i32)
            .put_bool(false)
            .put_u32(0)
            .put_string(&device);
        let reply = client.call(CREATE_LINK, arguments.as_bytes())?;

        let mut reader = XdrReader::new(&reply);
        let error = reader.get_i32()?;
        if error != 0 {
            let cause = device_error("create_link", error);
            return Err(Error::Connection {
                code: error,
                message: cause.to_string(),
            });
        }
        let link = reader.get_i32()?;
        let _abort_port = reader.get_u32()?;
        let max_recv_size = reader.get_u32()?;

        info!(
            "Created VXI-11 link {} to {} on {}:{}",
            link,
            device,
            address.host(),
            port
        );
        Ok(Self {
            client: Some(client),
            link,
            max_recv_size,
            io_timeout: timeouts.command.as_millis().min(u32::MAX as u128) as u32,
            lock_timeout: 0,
            device,
            pending: false,
        })
    }

    fn call(&mut self, procedure: u32, arguments: &XdrWriter) -> Result<Vec<u8>> {
        let client = self.client.as_mut().ok_or(Error::NotConnected)?;
        client.call(procedure, arguments.as_bytes())
    }

    // Device_GenericParms, shared by clear and readstb.
    fn generic(&self) -> XdrWriter {
        let mut arguments = XdrWriter::new();
        arguments
            .put_i32(self.link)
            .put_u32(0)
            .put_u32(self.lock_timeout)
            .put_u32(self.io_timeout);
        arguments
    }

    fn read_message(&mut self, size: usize) -> Result<Vec<u8>> {
        let mut output = Vec::new();
        loop {
            let request_size = (size - output.len()).min(READ_CHUNK as usize) as u32;
            let mut arguments = XdrWriter::new();
            arguments
                .put_i32(self.link)
                .put_u32(request_size)
                .put_u32(self.io_timeout)
                .put_u32(self.lock_timeout)
                .put_u32(0)
                .put_u32(0);
            let reply = self.call(DEVICE_READ, &arguments)?;

            let mut reader = XdrReader::new(&reply);
            let error = reader.get_i32()?;
            if error != 0 {
                return Err(device_error("device_read", error));
            }
            let reason = reader.get_u32()?;
            output.extend_from_slice(reader.get_opaque()?);
            debug!("device_read returned {} bytes, reason {:#x}", output.len(), reason);

            if reason & (REASON_END | REASON_CHR) != 0 {
                self.pending = false;
                return Ok(output);
            }
            if output.len() >= size {
                self.pending = true;
                return Ok(output);
            }
        }
    }

    /// device_clear: the instrument drops its input and output buffers.
    pub fn clear(&mut self) -> Result<()> {
        let arguments = self.generic();
        let reply = self.call(DEVICE_CLEAR, &arguments)?;
        match XdrReader::new(&reply).get_i32()? {
            0 => {
                self.pending = false;
                Ok(())
            }
            error => Err(device_error("device_clear", error)),
        }
    }

    /// The IEEE 488.2 status byte.
    pub fn read_status_byte(&mut self) -> Result<u8> {
        let arguments = self.generic();
        let reply = self.call(DEVICE_READSTB, &arguments)?;
        let mut reader = XdrReader::new(&reply);
        match reader.get_i32()? {
            0 => Ok(reader.get_u32()? as u8),
            error => Err(device_error("device_readstb", error)),
        }
    }
}

impl Transport for Vxi11 {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        // An empty command still goes out, as a single END chunk.
        let chunk_size = self.max_recv_size.max(1) as usize;
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![data]
        } else {
            data.chunks(chunk_size).collect()
        };

        let count = chunks.len();
        for (index, chunk) in chunks.into_iter().enumerate() {
            let flags = if index == count - 1 { FLAG_END } else { 0 };
            let mut arguments = XdrWriter::new();
            arguments
                .put_i32(self.link)
                .put_u32(self.io_timeout)
                .put_u32(self.lock_timeout)
                .put_u32(flags)
                .put_opaque(chunk);
            let reply = self.call(DEVICE_WRITE, &arguments)?;

            let mut reader = XdrReader::new(&reply);
            let error = reader.get_i32()?;
            if error != 0 {
                return Err(device_error("device_write", error));
            }
            let written = reader.get_u32()? as usize;
            if written != chunk.len() {
                return Err(Error::transfer(
                    -1,
                    format!("device_write took {} of {} bytes", written, chunk.len()),
                ));
            }
        }
        debug!("Sent {} bytes to {}", data.len(), self.device);
        Ok(())
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.read_message(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.read_message(usize::MAX)
    }

    fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            let mut arguments = XdrWriter::new();
            arguments.put_i32(self.link);
            if let Err(error) = client.call(DESTROY_LINK, arguments.as_bytes()) {
                warn!("Unable to destroy VXI-11 link {}: {}", self.link, error);
            }
            client.shutdown();
            info!("Closed VXI-11 link {} to {}", self.link, self.device);
        }
    }

    fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn pending(&self) -> bool {
        self.pending
    }
}

impl Drop for Vxi11 {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::tests::serve;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    fn reply(values: &[u32], data: Option<&[u8]>) -> Vec<u8> {
        let mut writer = XdrWriter::new();
        for value in values {
            writer.put_u32(*value);
        }
        if let Some(data) = data {
            writer.put_opaque(data);
        }
        writer.into_bytes()
    }

    #[test]
    fn queries_through_a_link() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let procedures = Arc::new(Mutex::new(Vec::new()));
        let seen = procedures.clone();

        let server = serve(listener, move |procedure, arguments| {
            seen.lock().unwrap().push(procedure);
            match procedure {
                CREATE_LINK => {
                    arguments.get_i32().unwrap();
                    assert!(!arguments.get_bool().unwrap());
                    arguments.get_u32().unwrap();
                    assert_eq!(arguments.get_string().unwrap(), "inst0");
                    // error, lid, abort port, max receive size
                    reply(&[0, 7, 0, 4], None)
                }
                DEVICE_WRITE => {
                    assert_eq!(arguments.get_i32().unwrap(), 7);
                    arguments.get_u32().unwrap();
                    arguments.get_u32().unwrap();
                    let flags = arguments.get_u32().unwrap();
                    let data = arguments.get_opaque().unwrap();
                    // "*IDN?\n" is split into chunks of 4, END on the last.
                    match data {
                        b"*IDN" => assert_eq!(flags & FLAG_END, 0),
                        b"?\n" => assert_eq!(flags & FLAG_END, FLAG_END),
                        other => panic!("unexpected chunk {:?}", other),
                    }
                    reply(&[0, data.len() as u32], None)
                }
                DEVICE_READ => reply(&[0, REASON_END], Some(b"ACME,VX,1,2\n")),
                DEVICE_READSTB => reply(&[0, 0x50], None),
                DEVICE_CLEAR => reply(&[0], None),
                DESTROY_LINK => reply(&[0], None),
                other => panic!("unexpected procedure {}", other),
            }
        });

        let address = NetworkAddress::new("127.0.0.1", Some(port));
        let mut link = Vxi11::connect(&address, Timeouts::default()).unwrap();
        link.send(b"*IDN?\n").unwrap();
        assert_eq!(link.read_all().unwrap(), b"ACME,VX,1,2\n");
        assert!(!link.pending());
        assert_eq!(link.read_status_byte().unwrap(), 0x50);
        link.clear().unwrap();
        link.close();
        assert!(!link.is_connected());

        server.join().unwrap();
        assert_eq!(
            *procedures.lock().unwrap(),
            vec![
                CREATE_LINK,
                DEVICE_WRITE,
                DEVICE_WRITE,
                DEVICE_READ,
                DEVICE_READSTB,
                DEVICE_CLEAR,
                DESTROY_LINK
            ]
        );
    }

    #[test]
    fn reads_continue_until_end() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut reads = 0;

        let server = serve(listener, move |procedure, _| match procedure {
            CREATE_LINK => reply(&[0, 1, 0, 1024], None),
            DEVICE_READ => {
                reads += 1;
                if reads == 1 {
                    reply(&[0, REASON_REQCNT], Some(b"1,2,"))
                } else {
                    reply(&[0, REASON_END], Some(b"3\n"))
                }
            }
            _ => reply(&[0], None),
        });

        let address = NetworkAddress::new("127.0.0.1", Some(port));
        let mut link = Vxi11::connect(&address, Timeouts::default()).unwrap();
        assert_eq!(link.read_all().unwrap(), b"1,2,3\n");
        drop(link);
        server.join().unwrap();
    }

    #[test]
    fn device_timeouts_become_timeouts() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = serve(listener, move |procedure, _| match procedure {
            CREATE_LINK => reply(&[0, 1, 0, 1024], None),
            DEVICE_READ => reply(&[ERROR_IO_TIMEOUT as u32, 0], Some(b"")),
            DEVICE_WRITE => reply(&[17, 0], None),
            _ => reply(&[0], None),
        });

        let address = NetworkAddress::new("127.0.0.1", Some(port));
        let mut link = Vxi11::connect(&address, Timeouts::default()).unwrap();
        assert!(link.read_all().unwrap_err().is_timeout());
        assert_eq!(link.send(b"*RST").unwrap_err().code(), 17);
        drop(link);
        server.join().unwrap();
    }
}
