use std::io::ErrorKind;

/// Every failure that can come out of a transport, a decoder or the facade.
///
/// Native error codes (libusb, errno, VXI-11 device errors) are kept alongside the
/// message so callers can still tell the lower layers apart.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Connection error: {message} (code {code})")]
    Connection { code: i32, message: String },

    #[error("Transfer error: {message} (code {code})")]
    Transfer { code: i32, message: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Unable to decode {0}")]
    Decode(String),

    #[error("No transport is connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub fn connection(message: impl Into<String>) -> Self {
        Error::Connection {
            code: 0,
            message: message.into(),
        }
    }

    pub fn transfer(code: i32, message: impl Into<String>) -> Self {
        Error::Transfer {
            code,
            message: message.into(),
        }
    }

    /// The native code this error was translated from, or 0 when there wasn't one.
    pub fn code(&self) -> i32 {
        match self {
            Error::Connection { code, .. } | Error::Transfer { code, .. } => *code,
            _ => 0,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        match error.kind() {
            ErrorKind::TimedOut | ErrorKind::WouldBlock => Error::Timeout(error.to_string()),
            _ => Error::Transfer {
                code: error.raw_os_error().unwrap_or(-1),
                message: error.to_string(),
            },
        }
    }
}
