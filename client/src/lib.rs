mod cli;
mod instrument;
pub mod runner;
pub mod settings;

pub use instrument::{connect_transport, Instrument};
pub use instrument_scpi as scpi;
pub use instrument_types::{Address, Error, Result, Timeouts, Transport};
