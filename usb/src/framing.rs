//! The USBTMC bulk framing, with no USB I/O involved.
//!
//! Every bulk message starts with a 12 byte header:
//!
//! ```text
//! 0       1    2     3     4..8           8           9          10..12
//! msg id  tag  !tag  0x00  transfer size  attributes  term char  reserved
//! ```
//!
//! and every packet sent to the device is zero padded to a multiple of 4 bytes.

use byteorder::{ByteOrder, LittleEndian};
use instrument_types::{Error, Result};

pub const HEADER_SIZE: usize = 12;

pub const DEV_DEP_MSG_OUT: u8 = 1;
pub const REQUEST_DEV_DEP_MSG_IN: u8 = 2;
pub const DEV_DEP_MSG_IN: u8 = 2;

// bmTransferAttributes
pub const ATTRIBUTE_EOM: u8 = 0x01;
pub const ATTRIBUTE_TERM_CHAR: u8 = 0x02;

/// Anything claiming to be larger than this is treated as a corrupt header.
pub const DEFAULT_MAX_TRANSFER_SIZE: u32 = 64 * 1024 * 1024;

/// Hands out bTag values, 1 to 255 and round again. 0 is never used.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TagCounter(u8);

impl TagCounter {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn current(&self) -> u8 {
        self.0
    }

    pub fn next(&mut self) -> u8 {
        self.0 = match self.0.wrapping_add(1) {
            0 => 1,
            tag => tag,
        };
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub message_id: u8,
    pub tag: u8,
    pub transfer_size: u32,
    pub attributes: u8,
    pub term_char: u8,
}

impl Header {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0; HEADER_SIZE];
        bytes[0] = self.message_id;
        bytes[1] = self.tag;
        bytes[2] = !self.tag;
        LittleEndian::write_u32(&mut bytes[4..8], self.transfer_size);
        bytes[8] = self.attributes;
        bytes[9] = self.term_char;
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::Protocol(format!(
                "USBTMC header needs {} bytes, got {}",
                HEADER_SIZE,
                bytes.len()
            )));
        }
        if bytes[2] != !bytes[1] {
            return Err(Error::Protocol(format!(
                "USBTMC tag {:#04x} doesn't match its inverse {:#04x}",
                bytes[1], bytes[2]
            )));
        }

        Ok(Self {
            message_id: bytes[0],
            tag: bytes[1],
            transfer_size: LittleEndian::read_u32(&bytes[4..8]),
            attributes: bytes[8],
            term_char: bytes[9],
        })
    }

    pub fn eom(&self) -> bool {
        self.attributes & ATTRIBUTE_EOM != 0
    }
}

fn padded_length(length: usize) -> usize {
    length.div_ceil(4) * 4
}

/// Splits a command into DEV_DEP_MSG_OUT packets no larger than `max_packet_size`.
///
/// Each packet carries its own header, all of them share the single tag taken from
/// `tags`, and only the last one has EOM set. An empty command still produces one
/// (empty) packet.
pub fn packetize(data: &[u8], max_packet_size: usize, tags: &mut TagCounter) -> Result<Vec<Vec<u8>>> {
    if max_packet_size <= HEADER_SIZE {
        return Err(Error::Protocol(format!(
            "endpoint packet size of {} bytes leaves no room after the header",
            max_packet_size
        )));
    }

    let tag = tags.next();
    let payload_size = max_packet_size - HEADER_SIZE;
    let chunk_count = data.len().div_ceil(payload_size).max(1);

    let mut packets = Vec::with_capacity(chunk_count);
    for index in 0..chunk_count {
        let start = index * payload_size;
        let chunk = &data[start..data.len().min(start + payload_size)];
        let last = index == chunk_count - 1;

        let header = Header {
            message_id: DEV_DEP_MSG_OUT,
            tag,
            transfer_size: chunk.len() as u32,
            attributes: if last { ATTRIBUTE_EOM } else { 0 },
            term_char: 0,
        };

        let mut packet = Vec::with_capacity(padded_length(HEADER_SIZE + chunk.len()));
        packet.extend_from_slice(&header.encode());
        packet.extend_from_slice(chunk);
        packet.resize(padded_length(packet.len()), 0);
        packets.push(packet);
    }

    Ok(packets)
}

/// Builds the REQUEST_DEV_DEP_MSG_IN header asking the device for up to `transfer_size`
/// bytes, optionally stopping early at `term_char`.
pub fn request_in(transfer_size: u32, term_char: Option<u8>, tags: &mut TagCounter) -> [u8; HEADER_SIZE] {
    Header {
        message_id: REQUEST_DEV_DEP_MSG_IN,
        tag: tags.next(),
        transfer_size,
        attributes: if term_char.is_some() {
            ATTRIBUTE_TERM_CHAR
        } else {
            0
        },
        term_char: term_char.unwrap_or(0),
    }
    .encode()
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Parsed {
    /// The buffer doesn't hold a whole header and payload yet.
    NeedMoreData,

    /// A whole transfer was consumed, but the message carries on in another transfer.
    Packet,

    /// EOM was seen, or as many bytes as were asked for have arrived.
    Complete,
}

/// Reassembles DEV_DEP_MSG_IN transfers which arrive over any number of bulk reads.
#[derive(Debug, Clone)]
pub struct InboundParser {
    max_transfer_size: u32,
    expected_tag: Option<u8>,
    eom: bool,
}

impl InboundParser {
    pub fn new(max_transfer_size: u32) -> Self {
        Self {
            max_transfer_size,
            expected_tag: None,
            eom: false,
        }
    }

    /// Only accept a transfer answering the request sent with this tag.
    pub fn expect_tag(&mut self, tag: u8) {
        self.expected_tag = Some(tag);
    }

    pub fn reset(&mut self) {
        self.expected_tag = None;
        self.eom = false;
    }

    /// Whether the last consumed transfer ended the message.
    pub fn eom(&self) -> bool {
        self.eom
    }

    /// Moves the next complete transfer from the front of `input` onto `output`.
    ///
    /// Exactly the header and payload are removed from `input`, so transfers sent back to
    /// back parse one after another. Alignment padding is left for the transport to drop.
    /// `expected` is the total message size the caller asked for.
    pub fn parse(&mut self, input: &mut Vec<u8>, output: &mut Vec<u8>, expected: usize) -> Result<Parsed> {
        if input.len() < HEADER_SIZE {
            return Ok(Parsed::NeedMoreData);
        }

        let header = Header::decode(&input[..HEADER_SIZE])?;
        if header.message_id != DEV_DEP_MSG_IN {
            return Err(Error::Protocol(format!(
                "Expected DEV_DEP_MSG_IN, received message id {}",
                header.message_id
            )));
        }
        if let Some(tag) = self.expected_tag {
            if header.tag != tag {
                return Err(Error::Protocol(format!(
                    "Expected a response to tag {}, received tag {}",
                    tag, header.tag
                )));
            }
        }
        if header.transfer_size > self.max_transfer_size {
            return Err(Error::Protocol(format!(
                "Implausible transfer size of {} bytes (limit is {})",
                header.transfer_size, self.max_transfer_size
            )));
        }

        let total = HEADER_SIZE + header.transfer_size as usize;
        if input.len() < total {
            return Ok(Parsed::NeedMoreData);
        }

        output.extend_from_slice(&input[HEADER_SIZE..total]);
        input.drain(..total);
        self.eom = header.eom();

        if self.eom || output.len() >= expected {
            Ok(Parsed::Complete)
        } else {
            Ok(Parsed::Packet)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbound(tag: u8, payload: &[u8], eom: bool) -> Vec<u8> {
        let header = Header {
            message_id: DEV_DEP_MSG_IN,
            tag,
            transfer_size: payload.len() as u32,
            attributes: if eom { ATTRIBUTE_EOM } else { 0 },
            term_char: 0,
        };
        let mut packet = header.encode().to_vec();
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn tags_never_use_zero() {
        let mut tags = TagCounter::new();
        let mut seen = Vec::new();
        for _ in 0..256 {
            let tag = tags.next();
            assert_ne!(tag, 0);
            seen.push(tag);
        }
        assert_eq!(seen[0], 1);
        assert_eq!(seen[254], 255);
        assert_eq!(seen[255], 1);
    }

    #[test]
    fn header_layout() {
        let header = Header {
            message_id: DEV_DEP_MSG_OUT,
            tag: 0x05,
            transfer_size: 0x0102_0304,
            attributes: ATTRIBUTE_EOM,
            term_char: 0,
        };
        assert_eq!(
            header.encode(),
            [0x01, 0x05, 0xfa, 0x00, 0x04, 0x03, 0x02, 0x01, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(Header::decode(&header.encode()).unwrap(), header);
    }

    #[test]
    fn corrupt_tag_inverse_is_rejected() {
        let mut bytes = inbound(3, b"", true);
        bytes[2] = 0;
        assert!(matches!(Header::decode(&bytes), Err(Error::Protocol(_))));
    }

    #[test]
    fn small_commands_fit_one_packet() {
        let mut tags = TagCounter::new();
        let packets = packetize(b"*IDN?\n", 64, &mut tags).unwrap();
        assert_eq!(packets.len(), 1);

        let packet = &packets[0];
        assert_eq!(packet.len(), 20);
        assert_eq!(&packet[..4], &[DEV_DEP_MSG_OUT, 1, 0xfe, 0]);
        assert_eq!(LittleEndian::read_u32(&packet[4..8]), 6);
        assert_eq!(packet[8], ATTRIBUTE_EOM);
        assert_eq!(&packet[12..18], b"*IDN?\n");
        assert_eq!(&packet[18..], &[0, 0]);
    }

    #[test]
    fn large_commands_are_fragmented() {
        let max_packet_size = 64;
        for size in [0usize, 1, 51, 52, 53, 104, 150, 500, 1000] {
            let data: Vec<u8> = (0..size).map(|i| i as u8).collect();
            let mut tags = TagCounter::new();
            let packets = packetize(&data, max_packet_size, &mut tags).unwrap();

            let payload_size = max_packet_size - HEADER_SIZE;
            assert_eq!(packets.len(), size.div_ceil(payload_size).max(1), "size {}", size);

            let mut reassembled = Vec::new();
            for (index, packet) in packets.iter().enumerate() {
                assert_eq!(packet.len() % 4, 0);
                assert!(packet.len() <= max_packet_size);

                let header = Header::decode(packet).unwrap();
                assert_eq!(header.tag, 1);
                assert_eq!(header.eom(), index == packets.len() - 1);

                let end = HEADER_SIZE + header.transfer_size as usize;
                reassembled.extend_from_slice(&packet[HEADER_SIZE..end]);
                assert!(packet[end..].iter().all(|b| *b == 0));
            }
            assert_eq!(reassembled, data);
        }
    }

    #[test]
    fn each_command_takes_a_new_tag() {
        let mut tags = TagCounter::new();
        let first = packetize(&[0; 200], 64, &mut tags).unwrap();
        let second = packetize(b"X", 64, &mut tags).unwrap();
        assert!(first.iter().all(|packet| packet[1] == 1));
        assert_eq!(second[0][1], 2);
    }

    #[test]
    fn tiny_endpoints_are_refused() {
        let mut tags = TagCounter::new();
        assert!(packetize(b"*RST", 8, &mut tags).is_err());
    }

    #[test]
    fn request_in_layout() {
        let mut tags = TagCounter::new();
        let request = request_in(1024, None, &mut tags);
        assert_eq!(request.len(), HEADER_SIZE);
        assert_eq!(&request[..4], &[REQUEST_DEV_DEP_MSG_IN, 1, 0xfe, 0]);
        assert_eq!(LittleEndian::read_u32(&request[4..8]), 1024);
        assert_eq!(request[8], 0);

        let request = request_in(0, Some(b'\n'), &mut tags);
        assert_eq!(request[1], 2);
        assert_eq!(request[8], ATTRIBUTE_TERM_CHAR);
        assert_eq!(request[9], b'\n');
    }

    #[test]
    fn parses_a_single_packet() {
        let payload = b"1.234E+00\n\0\0";
        let mut input = inbound(1, payload, true);
        input.extend_from_slice(&[0xAA, 0xBB]);
        let mut output = Vec::new();

        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        let parsed = parser.parse(&mut input, &mut output, usize::MAX).unwrap();
        assert_eq!(parsed, Parsed::Complete);
        assert_eq!(output, payload);
        assert_eq!(input, vec![0xAA, 0xBB]);
        assert!(parser.eom());
    }

    #[test]
    fn waits_for_the_rest_of_a_packet() {
        let payload: Vec<u8> = (0..100).collect();
        let packet = inbound(7, &payload, true);
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        parser.expect_tag(7);

        let mut input = Vec::new();
        let mut output = Vec::new();
        let mut parsed = Parsed::NeedMoreData;
        for chunk in packet.chunks(32) {
            assert_eq!(parsed, Parsed::NeedMoreData);
            input.extend_from_slice(chunk);
            parsed = parser.parse(&mut input, &mut output, usize::MAX).unwrap();
        }

        assert_eq!(parsed, Parsed::Complete);
        assert_eq!(output, payload);
        assert!(input.is_empty());
    }

    #[test]
    fn a_transfer_without_eom_is_not_the_end() {
        let mut input = inbound(1, b"abcd", false);
        let mut output = Vec::new();
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);

        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Packet);
        assert!(!parser.eom());

        input.extend(inbound(1, b"efg", true));
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Complete);
        assert_eq!(output, b"abcdefg");
    }

    #[test]
    fn reaching_the_expected_size_completes() {
        let mut input = inbound(1, b"abcdefgh", false);
        let mut output = Vec::new();
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);

        assert_eq!(parser.parse(&mut input, &mut output, 8).unwrap(), Parsed::Complete);
        assert!(!parser.eom());
    }

    #[test]
    fn back_to_back_transfers_in_one_read() {
        let mut input = inbound(1, b"abc", false);
        input.extend(inbound(1, b"defg", true));

        let mut output = Vec::new();
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Packet);
        assert_eq!(input.len(), HEADER_SIZE + 4);
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Complete);
        assert_eq!(output, b"abcdefg");
        assert!(input.is_empty());
    }

    #[test]
    fn unpadded_transfers_arriving_later() {
        let mut input = inbound(1, b"abc", false);
        let mut output = Vec::new();
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Packet);
        assert!(input.is_empty());
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::NeedMoreData);

        parser.expect_tag(2);
        input.extend(inbound(2, b"defg", true));
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Complete);
        assert_eq!(output, b"abcdefg");
    }

    #[test]
    fn padding_is_left_in_the_input() {
        // 12 + 3 bytes, so one byte of padding follows.
        let mut input = inbound(1, b"abc", false);
        input.push(0);

        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        let mut output = Vec::new();
        assert_eq!(parser.parse(&mut input, &mut output, 100).unwrap(), Parsed::Packet);
        assert_eq!(input, vec![0]);
    }

    #[test]
    fn implausible_sizes_are_protocol_errors() {
        let mut input = Header {
            message_id: DEV_DEP_MSG_IN,
            tag: 1,
            transfer_size: 0x7fff_ffff,
            attributes: ATTRIBUTE_EOM,
            term_char: 0,
        }
        .encode()
        .to_vec();

        let mut parser = InboundParser::new(1024);
        let result = parser.parse(&mut input, &mut Vec::new(), usize::MAX);
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[test]
    fn mismatched_tags_and_ids_are_protocol_errors() {
        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        parser.expect_tag(4);
        let mut input = inbound(5, b"x", true);
        assert!(parser.parse(&mut input, &mut Vec::new(), 1).is_err());

        let mut parser = InboundParser::new(DEFAULT_MAX_TRANSFER_SIZE);
        let mut input = inbound(5, b"x", true);
        input[0] = DEV_DEP_MSG_OUT + 10;
        assert!(parser.parse(&mut input, &mut Vec::new(), 1).is_err());
    }
}
