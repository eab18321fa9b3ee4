//! Baud rate announced by ISO14230 StartDiagnosticSession responses

use crate::frame::{DecodedDatagram, ProtocolTag};

use super::iso14230::{FMT_ADDRESS_MASK, FMT_LENGTH_MASK};
use super::keybytes::SYNC;

/// Positive response SID to StartDiagnosticSession
const START_DIAGNOSTIC_SESSION_RESPONSE: u8 = 0x50;

/// Decode the KWP2000 baud rate byte: `2^x * (y + 32) * 6400 / 32`
///
/// `x` is bits 7..5, `y` bits 4..0.
pub fn baud_rate_from_byte(byte: u8) -> u32 {
    let exponent = (byte >> 5) & 0x07;
    let mantissa = (byte & 0x1F) as u32;
    ((1u32 << exponent) * (mantissa + 32) * 6400) / 32
}

/// Baud rate requested by a decoded ISO14230 frame, if it carries one
///
/// Only physically addressed frames (`FMT & 0xC0 == 0x80`) skip address
/// bytes here; 5-baud key byte frames never match.
pub fn announced_baud_rate(datagram: &DecodedDatagram) -> Option<u32> {
    if datagram.protocol != ProtocolTag::Iso14230 {
        return None;
    }
    let frame = &datagram.payload;
    let fmt = *frame.first()?;
    if fmt == SYNC {
        return None;
    }

    let mut pos = 1;
    if fmt & 0xC0 == FMT_ADDRESS_MASK {
        pos += 2;
    }

    let length = match fmt & FMT_LENGTH_MASK {
        0 => {
            let len = *frame.get(pos)?;
            pos += 1;
            len as usize
        }
        len => len as usize,
    };

    if length == 3 && *frame.get(pos)? == START_DIAGNOSTIC_SESSION_RESPONSE {
        frame.get(pos + 2).map(|&b| baud_rate_from_byte(b))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kline::iso14230::checksum;

    fn datagram(bytes: &[u8]) -> DecodedDatagram {
        let mut frame = bytes.to_vec();
        frame.push(checksum(bytes));
        DecodedDatagram::new(ProtocolTag::Iso14230, 0, 0, frame)
    }

    #[test]
    fn test_baud_rate_byte_table() {
        assert_eq!(baud_rate_from_byte(0x14), 10400);
        assert_eq!(baud_rate_from_byte(0x10), 9600);
        assert_eq!(baud_rate_from_byte(0x64), 57600);
        assert_eq!(baud_rate_from_byte(0x00), 6400);
    }

    #[test]
    fn test_start_diagnostic_session_response() {
        // 83 F1 10 50 86 64 CS: session 0x86, baud byte 0x64
        let d = datagram(&[0x83, 0xF1, 0x10, 0x50, 0x86, 0x64]);
        assert_eq!(announced_baud_rate(&d), Some(57600));
    }

    #[test]
    fn test_other_frames_announce_nothing() {
        let d = datagram(&[0x82, 0xF1, 0x10, 0x50, 0x86]);
        assert_eq!(announced_baud_rate(&d), None);

        let d = datagram(&[0x83, 0xF1, 0x10, 0x62, 0xF1, 0x90]);
        assert_eq!(announced_baud_rate(&d), None);

        let d = DecodedDatagram::new(
            ProtocolTag::Iso14230,
            0,
            0,
            vec![0x55, 0xEF, 0x8F, 0x70, 0xEE],
        );
        assert_eq!(announced_baud_rate(&d), None);

        let mut kw = datagram(&[0x83, 0xF1, 0x10, 0x50, 0x86, 0x64]);
        kw.protocol = ProtocolTag::Kw1281;
        assert_eq!(announced_baud_rate(&kw), None);
    }
}
