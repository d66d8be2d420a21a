use log::debug;
use thiserror::Error;

use crate::message::options::{decode_uint, encode_uint};

/// Largest block number representable in a three byte block option.
pub const MAX_BLOCK_NUMBER: u32 = (1 << 20) - 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidBlockValue {
    #[error("block option value is {0} bytes long, at most 3 are allowed")]
    TooLong(usize),
    #[error("block number {0} does not fit in 20 bits")]
    NumberOutOfRange(u32),
    #[error("reserved block size exponent {0}")]
    ReservedSizeExponent(u8),
    #[error("block size {0} is not a power of two between 16 and 1024")]
    InvalidSize(usize),
}

/// A decoded Block1/Block2 option value.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct BlockValue {
    pub num: u32,
    pub more: bool,
    pub size_exponent: u8,
}

impl BlockValue {
    pub fn new(num: u32, more: bool, size: usize) -> Result<Self, InvalidBlockValue> {
        if num > MAX_BLOCK_NUMBER {
            return Err(InvalidBlockValue::NumberOutOfRange(num));
        }
        if !size.is_power_of_two() || !(16..=1024).contains(&size) {
            return Err(InvalidBlockValue::InvalidSize(size));
        }
        let size_exponent = (size.trailing_zeros() - 4) as u8;
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }

    pub fn size(&self) -> usize {
        1 << (self.size_exponent + 4)
    }

    /// The value asking for the block after this one at the same size.
    pub fn next(&self) -> Result<BlockValue, InvalidBlockValue> {
        let num = self.num + 1;
        if num > MAX_BLOCK_NUMBER {
            return Err(InvalidBlockValue::NumberOutOfRange(num));
        }
        Ok(BlockValue {
            num,
            more: false,
            size_exponent: self.size_exponent,
        })
    }
}

impl From<BlockValue> for Vec<u8> {
    fn from(block_value: BlockValue) -> Vec<u8> {
        let scalar = block_value.num << 4
            | u32::from(block_value.more) << 3
            | u32::from(block_value.size_exponent & 0x7);
        encode_uint(scalar)
    }
}

impl TryFrom<&[u8]> for BlockValue {
    type Error = InvalidBlockValue;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        if value.len() > 3 {
            return Err(InvalidBlockValue::TooLong(value.len()));
        }
        let scalar = decode_uint(value).ok_or(InvalidBlockValue::TooLong(value.len()))?;

        let num = scalar >> 4;
        let more = scalar >> 3 & 0x1 == 0x1;
        let size_exponent = (scalar & 0x7) as u8;
        if size_exponent == 7 {
            return Err(InvalidBlockValue::ReservedSizeExponent(size_exponent));
        }
        Ok(Self {
            num,
            more,
            size_exponent,
        })
    }
}

/// What the exchange should do after a block was added to a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockProgress {
    /// Ask the peer for this block next.
    Request(BlockValue),
    /// The body is complete.
    Complete(Vec<u8>),
    /// The block was not the one expected and was dropped.
    OutOfSequence,
}

/// Reassembly state of a Block2 response body.
#[derive(Debug, Clone)]
pub struct BlockTransfer {
    buffer: Vec<u8>,
    next_num: u32,
    size_exponent: u8,
}

impl BlockTransfer {
    /// Starts a transfer from the first block of a response.
    pub fn start(block: BlockValue, payload: &[u8]) -> Result<(BlockTransfer, BlockProgress), InvalidBlockValue> {
        let mut transfer = BlockTransfer {
            buffer: Vec::new(),
            next_num: block.num,
            size_exponent: block.size_exponent,
        };
        let progress = transfer.push(block, payload)?;
        Ok((transfer, progress))
    }

    /// Adds one block. Blocks must arrive in order; anything else is dropped.
    pub fn push(&mut self, block: BlockValue, payload: &[u8]) -> Result<BlockProgress, InvalidBlockValue> {
        if block.num != self.next_num {
            debug!(
                "dropping block {} while waiting for block {}",
                block.num, self.next_num
            );
            return Ok(BlockProgress::OutOfSequence);
        }

        self.buffer.extend_from_slice(payload);
        self.size_exponent = block.size_exponent;

        if block.more {
            let next = block.next()?;
            self.next_num = next.num;
            Ok(BlockProgress::Request(next))
        } else {
            Ok(BlockProgress::Complete(std::mem::take(&mut self.buffer)))
        }
    }

    pub fn next_num(&self) -> u32 {
        self.next_num
    }

    pub fn size_exponent(&self) -> u8 {
        self.size_exponent
    }

    pub fn received(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_value_packing() {
        let block = BlockValue::new(2, true, 64).unwrap();
        assert_eq!(block.size_exponent, 2);
        assert_eq!(Vec::from(block), vec![0x2A]);

        let block = BlockValue::new(20, false, 1024).unwrap();
        let bytes: Vec<u8> = block.into();
        assert_eq!(bytes, vec![0x01, 0x46]);
        assert_eq!(BlockValue::try_from(&bytes[..]).unwrap(), block);

        assert_eq!(
            BlockValue::try_from(&[][..]).unwrap(),
            BlockValue { num: 0, more: false, size_exponent: 0 }
        );
    }

    #[test]
    fn test_invalid_block_values() {
        assert_eq!(
            BlockValue::new(1 << 20, false, 64),
            Err(InvalidBlockValue::NumberOutOfRange(1 << 20))
        );
        assert_eq!(BlockValue::new(0, false, 100), Err(InvalidBlockValue::InvalidSize(100)));
        assert_eq!(BlockValue::new(0, false, 2048), Err(InvalidBlockValue::InvalidSize(2048)));
        assert_eq!(
            BlockValue::try_from(&[0x0F][..]),
            Err(InvalidBlockValue::ReservedSizeExponent(7))
        );
        assert_eq!(BlockValue::try_from(&[0, 0, 0, 1][..]), Err(InvalidBlockValue::TooLong(4)));
    }

    #[test]
    fn test_reassembly() {
        let first = BlockValue::new(0, true, 16).unwrap();
        let (mut transfer, progress) = BlockTransfer::start(first, &[1; 16]).unwrap();
        assert_eq!(progress, BlockProgress::Request(BlockValue::new(1, false, 16).unwrap()));

        // a retransmitted first block is ignored
        assert_eq!(transfer.push(first, &[1; 16]).unwrap(), BlockProgress::OutOfSequence);

        let second = BlockValue::new(1, true, 16).unwrap();
        assert_eq!(
            transfer.push(second, &[2; 16]).unwrap(),
            BlockProgress::Request(BlockValue::new(2, false, 16).unwrap())
        );
        assert_eq!(transfer.received(), 32);

        let last = BlockValue::new(2, false, 16).unwrap();
        match transfer.push(last, &[3; 5]).unwrap() {
            BlockProgress::Complete(body) => {
                assert_eq!(body.len(), 37);
                assert_eq!(&body[..16], &[1; 16]);
                assert_eq!(&body[16..32], &[2; 16]);
                assert_eq!(&body[32..], &[3; 5]);
            }
            other => panic!("unexpected progress {:?}", other),
        }
    }
}
