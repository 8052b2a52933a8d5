//! Turns raw SCPI replies into typed values.
//!
//! None of this touches a transport, everything here works on the bytes or text that a
//! `query` returned.

pub use byteorder;
pub use num_complex::Complex;

pub mod ascii;
pub mod binary;
pub mod decode;
pub mod idn;

pub use ascii::{AsciiArray, AsciiNumber};
pub use binary::{block_payload, BinaryArray, BlockElement};
pub use decode::{decode, decode_enum, Decode, Mnemonic};
pub use idn::Idn;
pub use instrument_types::{Error, Result};
