use instrument_types::Error;

/// The libusb error code behind a rusb error.
pub fn libusb_code(error: rusb::Error) -> i32 {
    match error {
        rusb::Error::Io => -1,
        rusb::Error::InvalidParam => -2,
        rusb::Error::Access => -3,
        rusb::Error::NoDevice => -4,
        rusb::Error::NotFound => -5,
        rusb::Error::Busy => -6,
        rusb::Error::Timeout => -7,
        rusb::Error::Overflow => -8,
        rusb::Error::Pipe => -9,
        rusb::Error::Interrupted => -10,
        rusb::Error::NoMem => -11,
        rusb::Error::NotSupported => -12,
        _ => -99,
    }
}

/// For failures while locating, opening or claiming a device.
pub fn connection_error(error: rusb::Error) -> Error {
    Error::Connection {
        code: libusb_code(error),
        message: error.to_string(),
    }
}

/// For failures once the device is open. A libusb timeout becomes [`Error::Timeout`].
pub fn transfer_error(error: rusb::Error) -> Error {
    match error {
        rusb::Error::Timeout => Error::Timeout(String::from("USB transfer")),
        error => Error::Transfer {
            code: libusb_code(error),
            message: error.to_string(),
        },
    }
}
