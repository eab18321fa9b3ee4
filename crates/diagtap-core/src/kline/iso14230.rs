//! ISO14230 (KWP2000) frame recognition
//!
//! Frame layout: `FMT [TGT SRC] [LEN] DATA... CS`
//!
//! - `FMT & 0x80` set: two address bytes follow the format byte
//! - `FMT & 0x3F` non-zero: data length, otherwise an explicit LEN byte
//!   follows the (optional) address bytes
//! - `CS` is the 8-bit wrapping sum of every byte from FMT to the last data byte

/// Format-byte flag announcing target/source address bytes
pub const FMT_ADDRESS_MASK: u8 = 0x80;

/// Format-byte bits carrying the data length
pub const FMT_LENGTH_MASK: u8 = 0x3F;

/// Shortest buffer worth examining
const MIN_FRAME_LEN: usize = 3;

/// Outcome of looking for an ISO14230 frame at the start of the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Iso14230Parse {
    /// Complete frame occupying `buffer[start..end]`
    Good { start: usize, end: usize },
    /// Header announces more bytes than received so far
    NotEnoughData,
    /// Frame complete but checksum byte does not match
    InvalidChecksum { expected: u8, found: u8 },
    /// Parser reached a state it cannot continue from
    InvalidState,
}

/// Wrapping additive checksum over `bytes`
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Try to parse one ISO14230 frame starting at offset 0
pub fn parse_frame(buffer: &[u8]) -> Iso14230Parse {
    if buffer.len() < MIN_FRAME_LEN {
        return Iso14230Parse::NotEnoughData;
    }

    let fmt = buffer[0];
    let mut header_len = 1;
    if fmt & FMT_ADDRESS_MASK != 0 {
        header_len += 2;
    }

    let data_len = match fmt & FMT_LENGTH_MASK {
        0 => {
            let Some(&len) = buffer.get(header_len) else {
                return Iso14230Parse::NotEnoughData;
            };
            header_len += 1;
            len as usize
        }
        len => len as usize,
    };

    let cs_pos = header_len + data_len;
    let Some(&found) = buffer.get(cs_pos) else {
        return Iso14230Parse::NotEnoughData;
    };

    let expected = checksum(&buffer[..cs_pos]);
    if expected == found {
        Iso14230Parse::Good {
            start: 0,
            end: cs_pos + 1,
        }
    } else {
        Iso14230Parse::InvalidChecksum { expected, found }
    }
}
