//! KW1281 block recognition
//!
//! Every byte of a KW1281 block except the final ETX is echoed back as its
//! complement by the receiving side:
//!
//! ```text
//! 0F F0   block length (counts itself)
//! 01 FE   block counter
//! F6 09   block title
//! B4 4B   data...
//! 03      ETX, no complement
//! ```

/// Block terminator
pub const ETX: u8 = 0x03;

/// Block title that ends the session
pub const END_COMMUNICATION: u8 = 0x06;

/// Payload index of the block title
const TITLE_POS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    Complement,
    Etx,
}

/// Search the buffer for one complete block
///
/// Returns `(start, end)` of the block including the trailing ETX. A failed
/// complement restarts pair counting at the next byte without backtracking.
pub fn find_block(buffer: &[u8]) -> Option<(usize, usize)> {
    let mut state = State::Data;
    let mut data = 0u8;
    let mut pairs = 0usize;
    let mut expected = 0usize;
    let mut start = 0usize;

    for (i, &byte) in buffer.iter().enumerate() {
        match state {
            State::Data => {
                data = byte;
                if pairs == 0 {
                    start = i;
                }
                state = State::Complement;
            }
            State::Complement => {
                if !byte == data {
                    pairs += 1;
                    if pairs == 1 {
                        expected = data as usize;
                    }
                    state = if pairs == expected {
                        State::Etx
                    } else {
                        State::Data
                    };
                } else {
                    pairs = 0;
                    state = State::Data;
                }
            }
            State::Etx => {
                if byte == ETX {
                    return Some((start, i + 1));
                }
            }
        }
    }
    None
}

/// Strip complements from a recognized block, keeping data bytes and ETX
pub fn strip_complements(block: &[u8]) -> Vec<u8> {
    block.iter().step_by(2).copied().collect()
}

/// True when the stripped payload carries the end-communication title
pub fn is_end_communication(payload: &[u8]) -> bool {
    payload.get(TITLE_POS) == Some(&END_COMMUNICATION)
}

#[cfg(test)]
pub(crate) fn encode_block(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 2 + 1);
    for &b in data {
        out.push(b);
        out.push(!b);
    }
    out.push(ETX);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_identification_block() {
        // Length 0x0F, counter 1, title 0xF6 (ASCII data), 12 data bytes
        let data = [
            0x0F, 0x01, 0xF6, 0xB4, 0x5A, 0x37, 0x39, 0x30, 0x37, 0x35, 0x35, 0x31, 0x41, 0x41,
            0x20,
        ];
        let block = encode_block(&data);
        assert_eq!(find_block(&block), Some((0, block.len())));

        let payload = strip_complements(&block);
        assert_eq!(&payload[..data.len()], &data);
        assert_eq!(payload.last(), Some(&ETX));
    }

    #[test]
    fn test_incomplete_block() {
        let block = encode_block(&[0x03, 0x02, 0x09]);
        assert_eq!(find_block(&block[..block.len() - 1]), None);
    }

    #[test]
    fn test_complement_mismatch_restarts_counting() {
        // Noise pair (0x11, 0x00) then a valid ACK block
        let mut buffer = vec![0x11, 0x00];
        let block = encode_block(&[0x03, 0x05, 0x09]);
        buffer.extend_from_slice(&block);
        assert_eq!(find_block(&buffer), Some((2, buffer.len())));
    }

    #[test]
    fn test_end_communication_title() {
        let block = encode_block(&[0x03, 0x07, 0x06]);
        let payload = strip_complements(&block);
        assert!(is_end_communication(&payload));
        assert!(!is_end_communication(&[0x03, 0x07, 0x09, 0x03]));
    }
}
