use byteorder::{ByteOrder, LittleEndian};
use instrument_types::{Error, Result};
use std::marker::PhantomData;

/// Values which can be read straight out of a binary block.
pub trait BlockElement: Sized + Copy {
    const SIZE: usize;

    /// `bytes` is always exactly `SIZE` long.
    fn read<B: ByteOrder>(bytes: &[u8]) -> Self;
}

impl BlockElement for u8 {
    const SIZE: usize = 1;
    fn read<B: ByteOrder>(bytes: &[u8]) -> Self {
        bytes[0]
    }
}

impl BlockElement for i8 {
    const SIZE: usize = 1;
    fn read<B: ByteOrder>(bytes: &[u8]) -> Self {
        bytes[0] as i8
    }
}

macro_rules! block_element {
    ($($ty:ty => $size:expr, $read:ident);* $(;)?) => {
        $(
            impl BlockElement for $ty {
                const SIZE: usize = $size;
                fn read<B: ByteOrder>(bytes: &[u8]) -> Self {
                    B::$read(bytes)
                }
            }
        )*
    };
}

block_element! {
    u16 => 2, read_u16;
    i16 => 2, read_i16;
    u32 => 4, read_u32;
    i32 => 4, read_i32;
    u64 => 8, read_u64;
    i64 => 8, read_i64;
    f32 => 4, read_f32;
    f64 => 8, read_f64;
}

/// A typed view over the payload of a SCPI definite length block (`#<n><length><bytes>`).
///
/// Nothing is copied until [`to_vec`](BinaryArray::to_vec) is called, elements are read
/// out of the reply buffer on demand using the byte order `B` (little endian unless told
/// otherwise, which is what most instruments send by default).
#[derive(Debug, Clone, Copy)]
pub struct BinaryArray<'a, T, B = LittleEndian> {
    data: &'a [u8],
    _marker: PhantomData<fn() -> (T, B)>,
}

impl<'a, T: BlockElement + 'a, B: ByteOrder + 'a> BinaryArray<'a, T, B> {
    /// Decodes a block at the very start of `buffer`.
    ///
    /// A buffer that doesn't start with `#` isn't a block at all and gives an empty array,
    /// but anything that starts like a block and then doesn't add up is an error.
    pub fn decode(buffer: &'a [u8]) -> Result<Self> {
        let data = block_payload(buffer)?.unwrap_or_default();

        if data.len() % T::SIZE != 0 {
            return Err(Error::Decode(format!(
                "binary block of {} bytes, which isn't a multiple of the {} byte element size",
                data.len(),
                T::SIZE
            )));
        }

        Ok(Self {
            data,
            _marker: PhantomData,
        })
    }

    /// Decodes a block which starts `offset` bytes into `buffer`, for replies which put a
    /// textual header in front of the block.
    pub fn decode_at(buffer: &'a [u8], offset: usize) -> Result<Self> {
        Self::decode(buffer.get(offset..).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.data.len() / T::SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<T> {
        let start = index.checked_mul(T::SIZE)?;
        let bytes = self.data.get(start..start.checked_add(T::SIZE)?)?;
        Some(T::read::<B>(bytes))
    }

    pub fn iter(&self) -> impl Iterator<Item = T> + 'a {
        self.data.chunks_exact(T::SIZE).map(T::read::<B>)
    }

    pub fn to_vec(&self) -> Vec<T> {
        self.iter().collect()
    }

    /// The raw payload, without the `#<n><length>` header.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.data
    }
}

/// Finds the payload of the block at the start of `buffer`.
///
/// Returns `None` when the buffer doesn't start with `#`. Both definite length blocks and
/// the `#0` indefinite form (payload runs to the terminating newline) are understood.
pub fn block_payload(buffer: &[u8]) -> Result<Option<&[u8]>> {
    if buffer.first() != Some(&b'#') {
        return Ok(None);
    }

    let digit_count = match buffer.get(1) {
        Some(digit @ b'0'..=b'9') => (digit - b'0') as usize,
        Some(other) => {
            return Err(Error::Decode(format!(
                "binary block header, '{}' is not a length digit",
                *other as char
            )))
        }
        None => return Err(Error::Decode("binary block header, buffer too short".into())),
    };

    if digit_count == 0 {
        let mut payload = &buffer[2..];
        if let Some(stripped) = payload.strip_suffix(b"\n") {
            payload = stripped.strip_suffix(b"\r").unwrap_or(stripped);
        }
        return Ok(Some(payload));
    }

    let digits = buffer.get(2..2 + digit_count).ok_or_else(|| {
        Error::Decode(format!(
            "binary block header, expected {} length digits",
            digit_count
        ))
    })?;

    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(Error::Decode(format!(
            "binary block length '{}'",
            String::from_utf8_lossy(digits)
        )));
    }

    // Nine ASCII digits always fit, checked above.
    let length: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| Error::Decode("binary block length".into()))?;

    let start = 2 + digit_count;
    let available = buffer.len() - start;
    if available < length {
        return Err(Error::Decode(format!(
            "binary block declaring {} bytes, only {} received",
            length, available
        )));
    }

    Ok(Some(&buffer[start..start + length]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use byteorder::BigEndian;

    fn block(header: &str, payload: &[u8]) -> Vec<u8> {
        let mut buffer = header.as_bytes().to_vec();
        buffer.extend_from_slice(payload);
        buffer
    }

    #[test]
    fn decodes_little_endian_integers() {
        let mut payload = vec![];
        payload.extend_from_slice(&1i32.to_le_bytes());
        payload.extend_from_slice(&2i32.to_le_bytes());
        let buffer = block("#18", &payload);

        let array = BinaryArray::<i32>::decode(&buffer).unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array.to_vec(), vec![1, 2]);
        assert_eq!(array.get(1), Some(2));
        assert_eq!(array.get(2), None);
    }

    #[test]
    fn the_view_borrows_the_reply() {
        let buffer = block("#14", &[1, 2, 3, 4]);
        let array = BinaryArray::<u8>::decode(&buffer).unwrap();
        assert_eq!(array.as_bytes().as_ptr(), buffer[3..].as_ptr());
    }

    #[test]
    fn honours_the_byte_order() {
        let mut payload = vec![];
        payload.extend_from_slice(&0x0102u16.to_be_bytes());
        payload.extend_from_slice(&(-2i16).to_be_bytes());
        let buffer = block("#14", &payload);

        let array = BinaryArray::<i16, BigEndian>::decode(&buffer).unwrap();
        assert_eq!(array.to_vec(), vec![0x0102, -2]);
    }

    #[test]
    fn multi_digit_lengths_and_trailing_newline() {
        let payload: Vec<u8> = (0..12).collect();
        let mut buffer = block("#212", &payload);
        buffer.push(b'\n');

        let array = BinaryArray::<u8>::decode(&buffer).unwrap();
        assert_eq!(array.to_vec(), payload);
    }

    #[test]
    fn floats() {
        let mut payload = vec![];
        payload.extend_from_slice(&0.5f32.to_le_bytes());
        payload.extend_from_slice(&(-1.25f32).to_le_bytes());
        let buffer = block("#18", &payload);

        let array = BinaryArray::<f32>::decode(&buffer).unwrap();
        assert_eq!(array.iter().collect::<Vec<_>>(), vec![0.5, -1.25]);
    }

    #[test]
    fn out_of_range_indices_are_none() {
        let buffer = block("#18", &[1, 0, 0, 0, 2, 0, 0, 0]);
        let array = BinaryArray::<i32>::decode(&buffer).unwrap();
        assert_eq!(array.get(1), Some(2));
        assert_eq!(array.get(2), None);
        assert_eq!(array.get(usize::MAX / 4), None);
        assert_eq!(array.get(usize::MAX), None);
    }

    #[test]
    fn not_a_block_is_empty() {
        let array = BinaryArray::<i32>::decode(b"1,2,3\n").unwrap();
        assert!(array.is_empty());
        assert!(BinaryArray::<i32>::decode(b"").unwrap().is_empty());
    }

    #[test]
    fn skips_a_textual_prefix() {
        let buffer = block("DAT2,#13", &[7, 8, 9]);
        let array = BinaryArray::<u8>::decode_at(&buffer, 5).unwrap();
        assert_eq!(array.to_vec(), vec![7, 8, 9]);
    }

    #[test]
    fn indefinite_blocks_run_to_the_newline() {
        let buffer = block("#0", &[5, 6, 7, 8, b'\n']);
        let array = BinaryArray::<u8>::decode(&buffer).unwrap();
        assert_eq!(array.to_vec(), vec![5, 6, 7, 8]);
    }

    #[test]
    fn truncated_blocks_fail() {
        let buffer = block("#18", &[1, 0, 0, 0]);
        assert!(matches!(
            BinaryArray::<i32>::decode(&buffer),
            Err(Error::Decode(_))
        ));
        assert!(BinaryArray::<u8>::decode(b"#").is_err());
        assert!(BinaryArray::<u8>::decode(b"#3").is_err());
    }

    #[test]
    fn malformed_headers_fail() {
        assert!(BinaryArray::<u8>::decode(b"#x12").is_err());
        assert!(BinaryArray::<u8>::decode(b"#2a4xxxx").is_err());
    }

    #[test]
    fn partial_elements_fail() {
        let buffer = block("#13", &[1, 2, 3]);
        assert!(BinaryArray::<u16>::decode(&buffer).is_err());
    }
}
