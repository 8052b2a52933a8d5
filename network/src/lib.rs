use instrument_types::{Error, Result};
use log::debug;
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

pub mod hislip;
pub mod rpc;
pub mod socket;
pub mod vxi11;

pub use hislip::HiSlip;
pub use socket::RawSocket;
pub use vxi11::Vxi11;

/// Connects to the first address `host` resolves to which accepts within `timeout`, with
/// `command_timeout` applied to every read and write afterwards.
pub(crate) fn connect_tcp(
    host: &str,
    port: u16,
    timeout: Duration,
    command_timeout: Duration,
) -> Result<TcpStream> {
    let addresses = (host, port).to_socket_addrs().map_err(|error| Error::Connection {
        code: error.raw_os_error().unwrap_or(-1),
        message: format!("Unable to resolve {}: {}", host, error),
    })?;

    let mut last_error = None;
    for address in addresses {
        debug!("Connecting to {}", address);
        match TcpStream::connect_timeout(&address, timeout) {
            Ok(stream) => {
                // A zero timeout means block forever.
                let command_timeout = Some(command_timeout).filter(|t| !t.is_zero());
                stream.set_read_timeout(command_timeout)?;
                stream.set_write_timeout(command_timeout)?;
                stream.set_nodelay(true)?;
                return Ok(stream);
            }
            Err(error) => last_error = Some(error),
        }
    }

    Err(match last_error {
        Some(error) => Error::Connection {
            code: error.raw_os_error().unwrap_or(-1),
            message: format!("Unable to connect to {}:{}: {}", host, port, error),
        },
        None => Error::connection(format!("{} has no addresses", host)),
    })
}
