pub use rusb;

pub mod devices;
pub mod error;
pub mod framing;
mod usbtmc;

pub use devices::list_devices;
pub use usbtmc::UsbTmc;

pub const USBTMC_CLASS: u8 = 0xfe;
pub const USBTMC_SUBCLASS: u8 = 0x03;

// Class specific control requests
pub const INITIATE_CLEAR: u8 = 5;
pub const CHECK_CLEAR_STATUS: u8 = 6;
pub const READ_STATUS_BYTE: u8 = 128;

// USBTMC_status values
pub const STATUS_SUCCESS: u8 = 0x01;
pub const STATUS_PENDING: u8 = 0x02;
pub const STATUS_FAILED: u8 = 0x80;
