//! Passive K-Line decoder
//!
//! Consumes the raw byte stream seen on the K-Line, one byte at a time, and
//! reconstructs 5-baud init handshakes, ISO14230 frames and KW1281 blocks.
//!
//! ```text
//!            5-baud 0x8F / ISO14230 frame
//!   ┌──────┐ ─────────────────────────────▶ ┌──────────┐
//!   │ Idle │                                │ Iso14230 │
//!   └──────┘ ◀───────────────────────────── └──────────┘
//!     │  ▲      checksum error / idle 3 s
//!     │  │
//!     │  │ end-communication block / idle 3 s
//!     ▼  │
//!   ┌────────┐
//!   │ Kw1281 │ ◀── 5-baud 0x8A
//!   └────────┘
//! ```
//!
//! Every successful decode empties the accumulation buffer; bytes in front
//! of a recognized frame are logged as noise.

mod baud;
pub mod iso14230;
pub mod keybytes;
pub mod kw1281;
mod watchdog;

pub use baud::{announced_baud_rate, baud_rate_from_byte};
pub use watchdog::{IdleWatchdog, SharedKLineDecoder, WATCHDOG_POLL_INTERVAL};

use tracing::{debug, info, warn};

use crate::clock::{Clock, MonotonicClock};
use crate::frame::{DecodedDatagram, ProtocolTag};
use iso14230::Iso14230Parse;

/// Capacity of the accumulation buffer
pub const KLINE_BUFFER_SIZE: usize = 0x200;

/// Bus silence after which the decoder falls back to Idle
pub const KLINE_IDLE_TIMEOUT_MS: u64 = 3000;

/// Protocol the decoder currently expects on the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KLineBusState {
    /// Nothing recognized yet, or the bus went quiet
    #[default]
    Idle,
    /// Parse bytes as ISO14230 frames
    Iso14230,
    /// Parse bytes as KW1281 blocks (only entered through 5-baud init)
    Kw1281,
}

/// Byte-at-a-time K-Line reconstruction state machine
///
/// Not thread safe on its own; share it through [`SharedKLineDecoder`] when
/// the idle watchdog runs on another task.
pub struct KLineDecoder<C: Clock = MonotonicClock> {
    buffer: [u8; KLINE_BUFFER_SIZE],
    cursor: usize,
    state: KLineBusState,
    last_activity_ms: u64,
    frames: u64,
    clock: C,
}

impl KLineDecoder<MonotonicClock> {
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock::new())
    }
}

impl Default for KLineDecoder<MonotonicClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> KLineDecoder<C> {
    pub fn with_clock(clock: C) -> Self {
        let now = clock.now_ms();
        Self {
            buffer: [0; KLINE_BUFFER_SIZE],
            cursor: 0,
            state: KLineBusState::Idle,
            last_activity_ms: now,
            frames: 0,
            clock,
        }
    }

    pub fn state(&self) -> KLineBusState {
        self.state
    }

    /// Bytes accumulated since the last decode or reset
    pub fn buffered(&self) -> &[u8] {
        &self.buffer[..self.cursor]
    }

    /// Number of frames emitted since construction
    pub fn frames_decoded(&self) -> u64 {
        self.frames
    }

    /// Feed one byte from the bus
    ///
    /// Returns the datagram completed by this byte, if any.
    pub fn push_byte(&mut self, byte: u8) -> Option<DecodedDatagram> {
        self.buffer[self.cursor] = byte;
        self.cursor += 1;

        if self.cursor == KLINE_BUFFER_SIZE {
            warn!(
                buffer = %hex::encode(&self.buffer[..self.cursor - 1]),
                "K-Line buffer overflow, frame lost"
            );
            self.reset_bus();
            return None;
        }

        self.last_activity_ms = self.clock.now_ms();

        match self.state {
            KLineBusState::Idle => self.process_idle(),
            KLineBusState::Iso14230 => self.process_iso14230(),
            KLineBusState::Kw1281 => self.process_kw1281(),
        }
    }

    /// Feed a burst of bytes, collecting every completed datagram in order
    pub fn push_bytes(&mut self, bytes: &[u8]) -> Vec<DecodedDatagram> {
        bytes.iter().filter_map(|&b| self.push_byte(b)).collect()
    }

    /// Fall back to Idle when the bus has been silent long enough
    ///
    /// Returns `true` when a reset happened. Called periodically by the
    /// [`IdleWatchdog`].
    pub fn check_idle(&mut self) -> bool {
        let now = self.clock.now_ms();
        if now.saturating_sub(self.last_activity_ms) < KLINE_IDLE_TIMEOUT_MS {
            return false;
        }
        if self.cursor == 0 && self.state == KLineBusState::Idle {
            return false;
        }

        if self.cursor != 0 {
            warn!(
                buffer = %hex::encode(self.buffered()),
                "Unmatched K-Line bytes at idle timeout"
            );
        }
        self.reset_bus();
        info!(timestamp_ms = now, "K-Line reset back to idle");
        true
    }

    /// Drop buffered bytes and return to Idle
    ///
    /// Used when bytes were lost upstream and the buffer no longer matches
    /// the wire.
    pub fn reset(&mut self) {
        if self.cursor != 0 || self.state != KLineBusState::Idle {
            warn!(
                state = ?self.state,
                buffer = %hex::encode(self.buffered()),
                "K-Line decoder reset"
            );
        }
        self.reset_bus();
    }

    fn process_idle(&mut self) -> Option<DecodedDatagram> {
        if let Some(m) = keybytes::find_key_bytes(self.buffered()) {
            debug!(protocol = ?m.protocol, "K-Line 5-baud init recognized");
            self.state = m.protocol;
            return Some(self.dequeue_iso14230(m.start, m.end));
        }

        match iso14230::parse_frame(self.buffered()) {
            Iso14230Parse::Good { start, end } => {
                // Monitoring started after the init handshake
                self.state = KLineBusState::Iso14230;
                Some(self.dequeue_iso14230(start, end))
            }
            Iso14230Parse::NotEnoughData => None,
            Iso14230Parse::InvalidChecksum { .. } | Iso14230Parse::InvalidState => {
                debug!(
                    buffer = %hex::encode(self.buffered()),
                    "Discarding bytes that do not form an ISO14230 frame"
                );
                self.clear_buffer();
                None
            }
        }
    }

    fn process_iso14230(&mut self) -> Option<DecodedDatagram> {
        match iso14230::parse_frame(self.buffered()) {
            Iso14230Parse::Good { start, end } => Some(self.dequeue_iso14230(start, end)),
            Iso14230Parse::NotEnoughData => None,
            Iso14230Parse::InvalidChecksum { expected, found } => {
                warn!(
                    expected = format!("0x{:02X}", expected),
                    found = format!("0x{:02X}", found),
                    buffer = %hex::encode(self.buffered()),
                    "ISO14230 checksum mismatch, discarding buffer"
                );
                self.reset_bus();
                None
            }
            Iso14230Parse::InvalidState => {
                warn!("ISO14230 parser in invalid state, discarding buffer");
                self.reset_bus();
                None
            }
        }
    }

    fn process_kw1281(&mut self) -> Option<DecodedDatagram> {
        let (start, end) = kw1281::find_block(self.buffered())?;
        Some(self.dequeue_kw1281(start, end))
    }

    fn dequeue_iso14230(&mut self, start: usize, end: usize) -> DecodedDatagram {
        self.log_noise(ProtocolTag::Iso14230, start);
        let payload = self.buffer[start..end].to_vec();
        self.emit(ProtocolTag::Iso14230, payload)
    }

    fn dequeue_kw1281(&mut self, start: usize, end: usize) -> DecodedDatagram {
        self.log_noise(ProtocolTag::Kw1281, start);
        let payload = kw1281::strip_complements(&self.buffer[start..end]);
        if kw1281::is_end_communication(&payload) {
            info!("K-Line reset by KW1281 end communication");
            self.state = KLineBusState::Idle;
        }
        self.emit(ProtocolTag::Kw1281, payload)
    }

    fn log_noise(&self, protocol: ProtocolTag, start: usize) {
        if start != 0 {
            warn!(
                %protocol,
                noise = %hex::encode(&self.buffer[..start]),
                "K-Line noise bytes before frame"
            );
        }
    }

    fn emit(&mut self, protocol: ProtocolTag, payload: Vec<u8>) -> DecodedDatagram {
        self.clear_buffer();
        self.frames += 1;
        let datagram = DecodedDatagram::new(protocol, self.clock.now_ms(), 0, payload);
        debug!(%datagram, "K-Line frame decoded");
        datagram
    }

    fn clear_buffer(&mut self) {
        self.buffer[..self.cursor].fill(0);
        self.cursor = 0;
    }

    fn reset_bus(&mut self) {
        self.clear_buffer();
        self.state = KLineBusState::Idle;
    }
}
