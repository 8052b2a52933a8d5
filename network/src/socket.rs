use crate::connect_tcp;
use instrument_types::{
    Error, LineStream, NetworkAddress, Result, Timeouts, Transport, DEFAULT_RAW_SOCKET_PORT,
};
use log::{debug, info};
use std::net::{Shutdown, TcpStream};

/// SCPI over a plain TCP socket (usually port 5025). Messages are newline terminated.
pub struct RawSocket {
    stream: Option<LineStream<TcpStream>>,
    peer: String,
}

impl RawSocket {
    pub fn connect(address: &NetworkAddress, timeouts: Timeouts) -> Result<Self> {
        let port = address.port_or(DEFAULT_RAW_SOCKET_PORT);
        let stream = connect_tcp(address.host(), port, timeouts.open, timeouts.command)?;

        let peer = format!("{}:{}", address.host(), port);
        info!("Connected to raw socket {}", peer);
        Ok(Self {
            stream: Some(LineStream::new(stream)),
            peer,
        })
    }

    fn stream(&mut self) -> Result<&mut LineStream<TcpStream>> {
        self.stream.as_mut().ok_or(Error::NotConnected)
    }
}

impl Transport for RawSocket {
    fn send(&mut self, data: &[u8]) -> Result<()> {
        debug!("Sending {} bytes to {}", data.len(), self.peer);
        self.stream()?.send_line(data)
    }

    fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        self.stream()?.read_exact(size)
    }

    fn read_all(&mut self) -> Result<Vec<u8>> {
        self.stream()?.read_line()
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.get_ref().shutdown(Shutdown::Both);
            info!("Closed raw socket {}", self.peer);
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for RawSocket {
    fn drop(&mut self) {
        self.close();
    }
}
