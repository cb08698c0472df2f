//! Modbus-style frame codec.
//!
//! Requests are fixed 8-byte frames:
//!
//! ```text
//! [address][function][start_hi][start_lo][value_hi][value_lo][crc_lo][crc_hi]
//! ```
//!
//! and travel as 16 upper-case hex characters. Controller replies carry
//! their start register after the byte count:
//!
//! ```text
//! [address][function][byte_count][start_hi][start_lo][data..][crc_lo crc_hi]?
//! ```
//!
//! while plain sensors answer with the standard read reply
//! `[address][0x03][byte_count][data..][crc_lo crc_hi]`.

use crc::{CRC_16_MODBUS, Crc};

use crate::registry::RegisterWidth;

/// Read holding registers.
pub const FC_READ: u8 = 0x03;

/// Write single register.
pub const FC_WRITE: u8 = 0x06;

/// Replies starting at or above this register carry two-byte values.
pub const WIDE_REGISTER_START: u16 = 512;

/// Length of an encoded request in bytes.
pub const REQUEST_LEN: usize = 8;

const MODBUS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Error type for frame encoding and decoding.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FrameError {
    #[error("Invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("Frame too short: need {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("Unexpected frame length {0}")]
    Length(usize),
    #[error("CRC mismatch: frame says {received:#06x}, computed {computed:#06x}")]
    Crc { received: u16, computed: u16 },
    #[error("Unsupported function code {0:#04x}")]
    Function(u8),
    #[error("Device exception {code:#04x} for function {function:#04x}")]
    Exception { function: u8, code: u8 },
}

/// CRC-16/MODBUS of `data`.
pub fn crc16(data: &[u8]) -> u16 {
    MODBUS_CRC.checksum(data)
}

/// Decode a hex string (either case) into bytes.
pub fn decode_hex(text: &str) -> Result<Vec<u8>, FrameError> {
    Ok(hex::decode(text.trim())?)
}

/// Request function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    /// Read `count` registers from `start`.
    Read,
    /// Write one value to a channel.
    Write,
}

impl Function {
    pub fn code(self) -> u8 {
        match self {
            Self::Read => FC_READ,
            Self::Write => FC_WRITE,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, FrameError> {
        match code {
            FC_READ => Ok(Self::Read),
            FC_WRITE => Ok(Self::Write),
            other => Err(FrameError::Function(other)),
        }
    }
}

/// A read or write request to a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestFrame {
    pub address: u8,
    pub function: Function,
    /// Start register (read) or channel (write).
    pub register: u16,
    /// Register count (read) or value (write).
    pub value: u16,
}

impl RequestFrame {
    pub fn read(address: u8, start: u16, count: u16) -> Self {
        Self {
            address,
            function: Function::Read,
            register: start,
            value: count,
        }
    }

    pub fn write(address: u8, channel: u16, value: u16) -> Self {
        Self {
            address,
            function: Function::Write,
            register: channel,
            value,
        }
    }

    /// Binary frame including the trailing CRC (low byte first).
    pub fn to_bytes(&self) -> [u8; REQUEST_LEN] {
        let [reg_hi, reg_lo] = self.register.to_be_bytes();
        let [val_hi, val_lo] = self.value.to_be_bytes();
        let mut frame = [
            self.address,
            self.function.code(),
            reg_hi,
            reg_lo,
            val_hi,
            val_lo,
            0,
            0,
        ];
        let [crc_lo, crc_hi] = crc16(&frame[..6]).to_le_bytes();
        frame[6] = crc_lo;
        frame[7] = crc_hi;
        frame
    }

    /// Upper-case hex form sent over the relay.
    pub fn encode_hex(&self) -> String {
        hex::encode_upper(self.to_bytes())
    }

    /// Parse a binary request, checking its CRC.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() != REQUEST_LEN {
            return Err(FrameError::Length(bytes.len()));
        }
        check_crc(&bytes[..6], &bytes[6..])?;

        Ok(Self {
            address: bytes[0],
            function: Function::from_code(bytes[1])?,
            register: u16::from_be_bytes([bytes[2], bytes[3]]),
            value: u16::from_be_bytes([bytes[4], bytes[5]]),
        })
    }

    /// Parse the hex form of a request.
    pub fn decode_hex(text: &str) -> Result<Self, FrameError> {
        Self::from_bytes(&decode_hex(text)?)
    }
}

/// Register width a controller uses for replies starting at `start`.
pub fn infer_width(start: u16) -> RegisterWidth {
    if start < WIDE_REGISTER_START {
        RegisterWidth::Single
    } else {
        RegisterWidth::Double
    }
}

/// A controller's reply to a read request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyFrame {
    pub address: u8,
    pub function: u8,
    /// First register covered by `data`.
    pub start: u16,
    /// Register payload.
    pub data: Vec<u8>,
}

impl ReplyFrame {
    /// Parse a controller reply. A trailing CRC is optional; when present
    /// and `verify_crc` is set it must match.
    pub fn parse(bytes: &[u8], verify_crc: bool) -> Result<Self, FrameError> {
        let (address, function, body) = split_reply(bytes, verify_crc)?;
        if body.len() < 2 {
            return Err(FrameError::Truncated {
                expected: 5,
                actual: bytes.len(),
            });
        }

        let start = u16::from_be_bytes([body[0], body[1]]);
        let data = &body[2..];
        if infer_width(start) == RegisterWidth::Double && data.len() % 2 != 0 {
            return Err(FrameError::Length(data.len()));
        }

        Ok(Self {
            address,
            function,
            start,
            data: data.to_vec(),
        })
    }

    pub fn width(&self) -> RegisterWidth {
        infer_width(self.start)
    }

    /// `(channel, raw value)` pairs covered by the reply.
    pub fn values(&self) -> Vec<(u16, u16)> {
        let raw: Vec<u16> = match self.width() {
            RegisterWidth::Single => self.data.iter().map(|&b| u16::from(b)).collect(),
            RegisterWidth::Double => self
                .data
                .chunks_exact(2)
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .collect(),
        };

        raw.into_iter()
            .enumerate()
            .map(|(offset, value)| (self.start.wrapping_add(offset as u16), value))
            .collect()
    }
}

/// A standard Modbus read reply without a start-register field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub address: u8,
    pub data: Vec<u8>,
}

impl ReadReply {
    pub fn parse(bytes: &[u8], verify_crc: bool) -> Result<Self, FrameError> {
        let (address, function, body) = split_reply(bytes, verify_crc)?;
        if function != FC_READ {
            return Err(FrameError::Function(function));
        }

        Ok(Self {
            address,
            data: body.to_vec(),
        })
    }

    /// Big-endian 16-bit word at word index `index`.
    pub fn word(&self, index: usize) -> Option<u16> {
        let at = index * 2;
        self.data
            .get(at..at + 2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}

/// Split `[address][function][count][body..][crc]?` into its parts.
fn split_reply(bytes: &[u8], verify_crc: bool) -> Result<(u8, u8, &[u8]), FrameError> {
    if bytes.len() < 3 {
        return Err(FrameError::Truncated {
            expected: 3,
            actual: bytes.len(),
        });
    }

    let (address, function) = (bytes[0], bytes[1]);
    if function & 0x80 != 0 {
        return Err(FrameError::Exception {
            function: function & 0x7F,
            code: bytes[2],
        });
    }

    let end = 3 + bytes[2] as usize;
    if bytes.len() < end {
        return Err(FrameError::Truncated {
            expected: end,
            actual: bytes.len(),
        });
    }

    match bytes.len() - end {
        0 => {}
        2 if verify_crc => check_crc(&bytes[..end], &bytes[end..])?,
        2 => {}
        _ => return Err(FrameError::Length(bytes.len())),
    }

    Ok((address, function, &bytes[3..end]))
}

fn check_crc(body: &[u8], trailer: &[u8]) -> Result<(), FrameError> {
    let received = u16::from_le_bytes([trailer[0], trailer[1]]);
    let computed = crc16(body);
    if received != computed {
        return Err(FrameError::Crc { received, computed });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_crc(body: &[u8]) -> Vec<u8> {
        let mut frame = body.to_vec();
        frame.extend_from_slice(&crc16(body).to_le_bytes());
        frame
    }

    #[test]
    fn test_crc_check_value() {
        assert_eq!(crc16(b"123456789"), 0x4B37);
    }

    #[test]
    fn test_crc_known_request() {
        // Read 10 holding registers from address 0 of slave 1.
        let frame = RequestFrame::read(0x01, 0x0000, 0x000A);
        assert_eq!(frame.encode_hex(), "01030000000AC5CD");
    }

    #[test]
    fn test_write_frame_layout() {
        let bytes = RequestFrame::write(0x01, 0x0005, 0x0001).to_bytes();
        assert_eq!(&bytes[..6], &[0x01, 0x06, 0x00, 0x05, 0x00, 0x01]);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), crc16(&bytes[..6]));
    }

    #[test]
    fn test_hex_round_trip() {
        let frame = RequestFrame::write(0x02, 0x0204, 0xFFEC);
        let text = frame.encode_hex();
        assert_eq!(text.len(), 16);
        assert!(text.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_eq!(RequestFrame::decode_hex(&text).unwrap(), frame);
        assert_eq!(RequestFrame::decode_hex(&text.to_lowercase()).unwrap(), frame);
    }

    #[test]
    fn test_request_rejects_bad_crc() {
        assert!(matches!(
            RequestFrame::decode_hex("01030000000AC5CE"),
            Err(FrameError::Crc { .. })
        ));
        assert!(matches!(
            RequestFrame::decode_hex("01030000000AC5"),
            Err(FrameError::Length(7))
        ));
        assert!(matches!(
            RequestFrame::decode_hex("01030000000AC5C"),
            Err(FrameError::Hex(_))
        ));
    }

    #[test]
    fn test_reply_single_width() {
        let bytes = decode_hex("01030400075801FFFF").unwrap();
        let reply = ReplyFrame::parse(&bytes, false).unwrap();

        assert_eq!(reply.address, 0x01);
        assert_eq!(reply.start, 0x0007);
        assert_eq!(reply.width(), RegisterWidth::Single);
        assert_eq!(reply.values(), vec![(7, 0x58), (8, 0x01)]);

        assert!(matches!(
            ReplyFrame::parse(&bytes, true),
            Err(FrameError::Crc { received: 0xFFFF, .. })
        ));
    }

    #[test]
    fn test_reply_double_width() {
        let bytes = with_crc(&[0x01, 0x03, 0x06, 0x02, 0x04, 0x00, 0xEB, 0x01, 0x2C]);
        let reply = ReplyFrame::parse(&bytes, true).unwrap();

        assert_eq!(reply.width(), RegisterWidth::Double);
        assert_eq!(reply.values(), vec![(0x204, 235), (0x205, 300)]);
    }

    #[test]
    fn test_double_width_reply_with_odd_payload() {
        let bytes = with_crc(&[0x01, 0x03, 0x05, 0x02, 0x04, 0x00, 0xEB, 0x01]);
        assert_eq!(ReplyFrame::parse(&bytes, true), Err(FrameError::Length(3)));
    }

    #[test]
    fn test_reply_without_crc() {
        let reply = ReplyFrame::parse(&[0x01, 0x03, 0x03, 0x00, 0x05, 0x01], true).unwrap();
        assert_eq!(reply.values(), vec![(5, 1)]);
    }

    #[test]
    fn test_reply_truncated() {
        assert!(matches!(
            ReplyFrame::parse(&[0x01, 0x03, 0x06, 0x00, 0x05], false),
            Err(FrameError::Truncated { expected: 9, .. })
        ));
        assert!(ReplyFrame::parse(&[0x01, 0x03], false).is_err());
    }

    #[test]
    fn test_exception_reply() {
        assert_eq!(
            ReplyFrame::parse(&[0x01, 0x83, 0x02], false),
            Err(FrameError::Exception {
                function: 0x03,
                code: 0x02
            })
        );
    }

    #[test]
    fn test_width_boundary() {
        assert_eq!(infer_width(0), RegisterWidth::Single);
        assert_eq!(infer_width(511), RegisterWidth::Single);
        assert_eq!(infer_width(512), RegisterWidth::Double);
    }

    #[test]
    fn test_read_reply_words() {
        let bytes = with_crc(&[0x01, 0x03, 0x04, 0x01, 0x18, 0x00, 0xF5]);
        let reply = ReadReply::parse(&bytes, true).unwrap();
        assert_eq!(reply.word(0), Some(0x0118));
        assert_eq!(reply.word(1), Some(0x00F5));
        assert_eq!(reply.word(2), None);
    }
}
