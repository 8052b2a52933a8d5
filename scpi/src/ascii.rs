use num_complex::Complex;
use std::ops::Deref;

/// Numbers which can appear in a comma separated SCPI reply.
///
/// Parsing never depends on the locale, and a leading `+` is accepted.
pub trait AsciiNumber: Sized + Copy {
    fn parse_token(token: &str) -> Option<Self>;
}

macro_rules! ascii_number {
    ($($ty:ty),*) => {
        $(
            impl AsciiNumber for $ty {
                fn parse_token(token: &str) -> Option<Self> {
                    token.parse().ok()
                }
            }
        )*
    };
}

ascii_number!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

/// A list of numbers decoded from a reply like `"1.5,+2.0,-3E-3\n"`.
///
/// Tokens which don't parse as `T` are left out rather than failing the whole array,
/// which is what makes trailing commas and the odd bit of garbage harmless.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct AsciiArray<T>(Vec<T>);

impl<T: AsciiNumber> AsciiArray<T> {
    pub fn decode(data: &[u8]) -> Self {
        Self::decode_at(data, 0)
    }

    /// Decodes everything after the first `offset` bytes, useful for skipping a header
    /// some instruments put in front of their data.
    pub fn decode_at(data: &[u8], offset: usize) -> Self {
        Self(tokens(data, offset).collect())
    }
}

impl<T: AsciiNumber> AsciiArray<Complex<T>> {
    /// Pairs up alternating real and imaginary values, a dangling real part is dropped.
    pub fn decode_complex(data: &[u8]) -> Self {
        Self::decode_complex_at(data, 0)
    }

    pub fn decode_complex_at(data: &[u8], offset: usize) -> Self {
        let values: Vec<T> = tokens(data, offset).collect();
        Self(
            values
                .chunks_exact(2)
                .map(|pair| Complex::new(pair[0], pair[1]))
                .collect(),
        )
    }
}

impl<T> AsciiArray<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for AsciiArray<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> From<AsciiArray<T>> for Vec<T> {
    fn from(array: AsciiArray<T>) -> Self {
        array.0
    }
}

fn tokens<'a, T: AsciiNumber + 'a>(data: &'a [u8], offset: usize) -> impl Iterator<Item = T> + 'a {
    data.get(offset..)
        .unwrap_or_default()
        .split(|byte| *byte == b',')
        .filter_map(|token| std::str::from_utf8(token).ok())
        .map(|token| token.trim_matches(|c: char| c.is_ascii_whitespace() || c == '\0'))
        .filter_map(T::parse_token)
}
