//! 5-baud initialization recognition
//!
//! After the tester clocks the ECU address out at 5 baud the ECU answers
//! `55 KB1 KB2`, the tester echoes `~KB2`, and an ISO14230 ECU finally
//! echoes its inverted address. KW1281 ECUs skip the address echo.

use tracing::warn;

use super::KLineBusState;

/// Synchronization byte opening the ECU answer
pub const SYNC: u8 = 0x55;

/// Key byte 2 announcing KW1281
pub const KB2_KW1281: u8 = 0x8A;

/// Key byte 2 announcing ISO14230
pub const KB2_ISO14230: u8 = 0x8F;

/// A recognized init handshake occupying `buffer[start..end]`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyBytesMatch {
    pub start: usize,
    pub end: usize,
    /// Bus protocol selected by the key bytes
    pub protocol: KLineBusState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Sync,
    Kb1,
    Kb2,
    NotKb2,
    EcuAddress,
}

/// Scan `buffer` forward once for a 5-baud handshake
///
/// A failed complement check or unknown KB2 drops back to sync search at
/// the next position; the window is never re-scanned.
pub fn find_key_bytes(buffer: &[u8]) -> Option<KeyBytesMatch> {
    let mut state = State::Sync;
    let mut start = 0usize;
    let mut kb2 = 0u8;

    for (i, &byte) in buffer.iter().enumerate() {
        match state {
            State::Sync => {
                if byte == SYNC {
                    start = i;
                    state = State::Kb1;
                }
            }
            State::Kb1 => state = State::Kb2,
            State::Kb2 => {
                kb2 = byte;
                state = State::NotKb2;
            }
            State::NotKb2 => {
                if !byte != kb2 {
                    state = State::Sync;
                    continue;
                }
                match kb2 {
                    KB2_KW1281 => {
                        return Some(KeyBytesMatch {
                            start,
                            end: i + 1,
                            protocol: KLineBusState::Kw1281,
                        });
                    }
                    KB2_ISO14230 => state = State::EcuAddress,
                    other => {
                        warn!(kb2 = format!("0x{:02X}", other), "Unknown K-Line key byte");
                        state = State::Sync;
                    }
                }
            }
            State::EcuAddress => {
                return Some(KeyBytesMatch {
                    start,
                    end: i + 1,
                    protocol: KLineBusState::Iso14230,
                });
            }
        }
    }
    None
}
