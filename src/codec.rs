//! The CoAP binary message format (RFC 7252 Section 3).
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |Ver| T |  TKL  |      Code     |          Message ID           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Token (if any, TKL bytes) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |   Options (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |1 1 1 1 1 1 1 1|    Payload (if any) ...
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```

use std::io;

use bytes::BytesMut;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::message::header::{MessageType, VERSION};
use crate::message::{Message, OptionMap};

pub const MAX_TOKEN_LENGTH: usize = 8;
pub const PAYLOAD_MARKER: u8 = 0xFF;

const HEADER_LENGTH: usize = 4;
const EXTEND_8BIT: u8 = 13;
const EXTEND_16BIT: u8 = 14;
const RESERVED_NIBBLE: u8 = 15;
const OFFSET_8BIT: usize = 13;
const OFFSET_16BIT: usize = 269;
/// Largest delta or length the two byte extension can carry.
pub const MAX_EXTENDED_VALUE: usize = OFFSET_16BIT + 0xFFFF;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("token of {0} bytes exceeds the 8 byte maximum")]
    InvalidTokenLength(usize),
    #[error("option delta {0} cannot be encoded")]
    OptionDeltaTooLarge(usize),
    #[error("option value of {0} bytes cannot be encoded")]
    OptionValueTooLong(usize),
    #[error("option header would use the reserved nibble")]
    ReservedNibble,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("datagram shorter than the 4 byte header")]
    InvalidHeader,
    #[error("unsupported CoAP version {0}")]
    InvalidVersion(u8),
    #[error("invalid token length {0}")]
    InvalidTokenLength(u8),
    #[error("reserved option delta")]
    InvalidOptionDelta,
    #[error("reserved option length")]
    InvalidOptionLength,
    #[error("option runs past the end of the datagram")]
    TruncatedOption,
    #[error("option number {0} exceeds 65535")]
    OptionNumberOverflow(u32),
    #[error("payload marker without payload")]
    EmptyPayload,
}

/// Splits a delta or length into its header nibble and extension bytes.
fn extend(value: usize, ext: &mut Vec<u8>) -> Option<u8> {
    if value < OFFSET_8BIT {
        Some(value as u8)
    } else if value < OFFSET_16BIT {
        ext.push((value - OFFSET_8BIT) as u8);
        Some(EXTEND_8BIT)
    } else if value <= MAX_EXTENDED_VALUE {
        let fix = (value - OFFSET_16BIT) as u16;
        ext.extend_from_slice(&fix.to_be_bytes());
        Some(EXTEND_16BIT)
    } else {
        None
    }
}

fn encode_options(options: &OptionMap, buf: &mut Vec<u8>) -> Result<(), EncodeError> {
    let mut previous: usize = 0;
    let mut ext = Vec::with_capacity(4);

    for (number, value) in options.iter() {
        let number = number as usize;
        let delta = number - previous;
        ext.clear();

        let delta_nibble = extend(delta, &mut ext).ok_or(EncodeError::OptionDeltaTooLarge(delta))?;
        let length_nibble =
            extend(value.len(), &mut ext).ok_or(EncodeError::OptionValueTooLong(value.len()))?;
        if delta_nibble >= RESERVED_NIBBLE || length_nibble >= RESERVED_NIBBLE {
            return Err(EncodeError::ReservedNibble);
        }

        buf.push(delta_nibble << 4 | length_nibble);
        buf.extend_from_slice(&ext);
        buf.extend_from_slice(value);
        previous = number;
    }
    Ok(())
}

/// Returns the bytes representing `message` on the wire.
pub fn encode(message: &Message) -> Result<Vec<u8>, EncodeError> {
    let token_length = message.token.len();
    if token_length > MAX_TOKEN_LENGTH {
        return Err(EncodeError::InvalidTokenLength(token_length));
    }

    let mut buf = Vec::with_capacity(HEADER_LENGTH + token_length + message.payload.len() + 16);
    buf.push(VERSION << 6 | message.message_type.to_bits() << 4 | token_length as u8);
    buf.push(message.code);
    buf.extend_from_slice(&message.message_id.to_be_bytes());
    buf.extend_from_slice(&message.token);

    encode_options(&message.options, &mut buf)?;

    if !message.payload.is_empty() {
        buf.push(PAYLOAD_MARKER);
        buf.extend_from_slice(&message.payload);
    }
    Ok(buf)
}

/// Reads the extension bytes announced by a delta or length nibble.
fn read_extended(nibble: u8, buf: &[u8], idx: &mut usize) -> Result<usize, DecodeError> {
    match nibble {
        EXTEND_8BIT => {
            let byte = *buf.get(*idx).ok_or(DecodeError::TruncatedOption)?;
            *idx += 1;
            Ok(byte as usize + OFFSET_8BIT)
        }
        EXTEND_16BIT => {
            let bytes = buf.get(*idx..*idx + 2).ok_or(DecodeError::TruncatedOption)?;
            *idx += 2;
            Ok(u16::from_be_bytes([bytes[0], bytes[1]]) as usize + OFFSET_16BIT)
        }
        n => Ok(n as usize),
    }
}

/// Decodes a datagram into a message.
///
/// Unknown option numbers are kept as opaque values; interpreting them is
/// left to the layers above.
pub fn decode(buf: &[u8]) -> Result<Message, DecodeError> {
    if buf.len() < HEADER_LENGTH {
        return Err(DecodeError::InvalidHeader);
    }

    let version = buf[0] >> 6;
    if version != VERSION {
        return Err(DecodeError::InvalidVersion(version));
    }
    let message_type = MessageType::from_bits(buf[0] >> 4);
    let token_length = buf[0] & 0x0F;
    let code = buf[1];
    let message_id = u16::from_be_bytes([buf[2], buf[3]]);

    let options_start = HEADER_LENGTH + token_length as usize;
    if token_length as usize > MAX_TOKEN_LENGTH || options_start > buf.len() {
        return Err(DecodeError::InvalidTokenLength(token_length));
    }
    let token = buf[HEADER_LENGTH..options_start].to_vec();

    let mut idx = options_start;
    let mut number: u32 = 0;
    let mut options = OptionMap::new();
    let mut payload = Vec::new();

    while idx < buf.len() {
        let byte = buf[idx];
        idx += 1;

        if byte == PAYLOAD_MARKER {
            if idx == buf.len() {
                return Err(DecodeError::EmptyPayload);
            }
            payload = buf[idx..].to_vec();
            break;
        }

        let delta_nibble = byte >> 4;
        let length_nibble = byte & 0x0F;
        if delta_nibble == RESERVED_NIBBLE {
            return Err(DecodeError::InvalidOptionDelta);
        }
        if length_nibble == RESERVED_NIBBLE {
            return Err(DecodeError::InvalidOptionLength);
        }

        let delta = read_extended(delta_nibble, buf, &mut idx)?;
        let length = read_extended(length_nibble, buf, &mut idx)?;

        number += delta as u32;
        let option_number =
            u16::try_from(number).map_err(|_| DecodeError::OptionNumberOverflow(number))?;

        let end = idx + length;
        if end > buf.len() {
            return Err(DecodeError::TruncatedOption);
        }
        options.add(option_number, buf[idx..end].to_vec());
        idx = end;
    }

    Ok(Message {
        message_type,
        code,
        message_id,
        token,
        options,
        payload,
        ..Message::default()
    })
}

/// Frames whole datagrams as messages, for use with `UdpFramed`.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl MessageCodec {
    pub fn new() -> MessageCodec {
        MessageCodec
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, io::Error> {
        if buf.is_empty() {
            return Ok(None);
        }
        let datagram = buf.split_to(buf.len());
        decode(&datagram)
            .map(Some)
            .map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), io::Error> {
        let bytes = encode(&message).map_err(|cause| io::Error::new(io::ErrorKind::InvalidData, cause))?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}
