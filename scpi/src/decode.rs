//! Scalar replies: booleans, numbers, strings and instrument specific mnemonics.
//!
//! Every decoder first drops the trailing `\r` / `\n` the instrument terminated its reply
//! with, so the raw text from a query can be passed straight in.

use instrument_types::{Error, Result};

pub trait Decode: Sized {
    fn decode(response: &str) -> Result<Self>;
}

pub fn decode<T: Decode>(response: &str) -> Result<T> {
    T::decode(response)
}

fn strip(response: &str) -> &str {
    response.trim_end_matches(['\r', '\n'])
}

fn decode_error<T>(response: &str) -> Error {
    Error::Decode(format!(
        "'{}' as {}",
        strip(response),
        std::any::type_name::<T>()
    ))
}

impl Decode for bool {
    fn decode(response: &str) -> Result<Self> {
        let value = strip(response).trim();
        if ["ON", "1", "+1"].iter().any(|v| v.eq_ignore_ascii_case(value)) {
            return Ok(true);
        }
        if ["OFF", "0"].iter().any(|v| v.eq_ignore_ascii_case(value)) {
            return Ok(false);
        }
        Err(decode_error::<bool>(response))
    }
}

// [+-]digits, nothing after the first character which can't be part of that.
fn integer_prefix(value: &str) -> &str {
    let bytes = value.as_bytes();
    let mut end = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return "";
    }
    &value[..end]
}

// [+-]digits[.digits][(e|E)[+-]digits], where either side of the point may be empty (but
// not both). An exponent marker without digits behind it isn't part of the number.
fn float_prefix(value: &str) -> &str {
    let bytes = value.as_bytes();
    let digits = |mut index: usize| {
        while index < bytes.len() && bytes[index].is_ascii_digit() {
            index += 1;
        }
        index
    };

    let start = usize::from(matches!(bytes.first(), Some(b'+' | b'-')));
    let mut end = digits(start);
    let mut mantissa_digits = end - start;

    if bytes.get(end) == Some(&b'.') {
        let fraction_end = digits(end + 1);
        mantissa_digits += fraction_end - (end + 1);
        end = fraction_end;
    }

    if mantissa_digits == 0 {
        return "";
    }

    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let exponent_end = digits(exponent);
        if exponent_end > exponent {
            end = exponent_end;
        }
    }

    &value[..end]
}

macro_rules! decode_integer {
    ($($ty:ty),*) => {
        $(
            impl Decode for $ty {
                fn decode(response: &str) -> Result<Self> {
                    let prefix = integer_prefix(strip(response).trim_start());
                    prefix.parse().map_err(|_| decode_error::<$ty>(response))
                }
            }
        )*
    };
}

macro_rules! decode_float {
    ($($ty:ty),*) => {
        $(
            impl Decode for $ty {
                fn decode(response: &str) -> Result<Self> {
                    let prefix = float_prefix(strip(response).trim_start());
                    prefix.parse().map_err(|_| decode_error::<$ty>(response))
                }
            }
        )*
    };
}

decode_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);
decode_float!(f32, f64);

// String replies are usually quoted, "like this".
impl Decode for String {
    fn decode(response: &str) -> Result<Self> {
        let value = strip(response);
        let value = value
            .strip_prefix('"')
            .and_then(|inner| inner.strip_suffix('"'))
            .unwrap_or(value);
        Ok(value.to_string())
    }
}

/// Ties an enum to the short mnemonics an instrument uses for it, for example a trace
/// format reported as `MLIN`, `MLOG` or `PHAS`.
///
/// The table is looked up in order, matching is case insensitive. Use the [`mnemonics!`]
/// macro to implement this together with [`Decode`].
///
/// [`mnemonics!`]: crate::mnemonics
pub trait Mnemonic: Copy + PartialEq + 'static {
    fn mnemonics() -> &'static [(&'static str, Self)];

    /// The mnemonic to send for this value, the first table entry wins.
    fn mnemonic(&self) -> Option<&'static str> {
        Self::mnemonics()
            .iter()
            .find(|(_, value)| value == self)
            .map(|(mnemonic, _)| *mnemonic)
    }
}

pub fn decode_enum<T: Mnemonic>(response: &str) -> Result<T> {
    let token = strip(response).trim();
    T::mnemonics()
        .iter()
        .find(|(mnemonic, _)| mnemonic.eq_ignore_ascii_case(token))
        .map(|(_, value)| *value)
        .ok_or_else(|| decode_error::<T>(response))
}

#[macro_export]
macro_rules! mnemonics {
    ($ty:ty { $($text:literal => $value:expr),+ $(,)? }) => {
        impl $crate::Mnemonic for $ty {
            fn mnemonics() -> &'static [(&'static str, Self)] {
                const MNEMONICS: &[(&str, $ty)] = &[$(($text, $value)),+];
                MNEMONICS
            }
        }

        impl $crate::Decode for $ty {
            fn decode(response: &str) -> $crate::Result<Self> {
                $crate::decode_enum(response)
            }
        }
    };
}
