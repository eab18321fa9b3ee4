//! Passive VW TP2.0 reconstruction
//!
//! Channel setup happens on the broadcast range `0x200..=0x2FF`: the tester
//! asks on `0x200`, the ECU answers on `0x200 + address` with opcode `0xD0`
//! and the pair of CAN IDs both sides will use. Data then flows on that
//! unicast pair, each frame opened by a transport control byte (TCPI).
//!
//! A datagram starts with a 2-byte big-endian length header that is
//! stripped before emission.

use tracing::{debug, info, warn};

use crate::frame::{CanMessage, DecodedDatagram, FrameOutcome, ProtocolTag};

/// Accumulator capacity
pub const VWTP20_BUFFER_SIZE: usize = 0x100;

/// Marker for an address not learned yet
const UNSET: u32 = 0xFFFF_FFFF;

const BROADCAST_REQUEST_ID: u32 = 0x200;
const BROADCAST_DLC: usize = 7;
const OPCODE_SETUP_POSITIVE: u8 = 0xD0;

/// Length-header bit some ECUs set on a correctly sized datagram
const LENGTH_QUIRK_BIT: u16 = 0x8000;

const TCPI_DISCONNECT: u8 = 0xA8;

/// Broadcast frame seen on `0x200..=0x2FF`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelSetup {
    /// Tester request on `0x200`; any open channel is being replaced
    Request,
    /// Positive ECU answer naming the unicast pair
    Accepted { tester_id: u32, ecu_id: u32 },
    /// Any other answer
    Rejected,
}

/// Interpret `msg` as a channel setup frame
///
/// Returns `None` outside the broadcast range or when the DLC is not 7.
pub fn channel_setup(msg: &CanMessage) -> Option<ChannelSetup> {
    if (msg.id() & !0xFF) != BROADCAST_REQUEST_ID || msg.dlc() != BROADCAST_DLC {
        return None;
    }
    let data = msg.data();
    let setup = if msg.id() == BROADCAST_REQUEST_ID {
        ChannelSetup::Request
    } else if data[1] == OPCODE_SETUP_POSITIVE {
        ChannelSetup::Accepted {
            tester_id: u16::from_le_bytes([data[2], data[3]]) as u32,
            ecu_id: u16::from_le_bytes([data[4], data[5]]) as u32,
        }
    } else {
        ChannelSetup::Rejected
    };
    Some(setup)
}

/// True for a unicast frame closing the channel
pub fn is_disconnect(msg: &CanMessage) -> bool {
    msg.data().first() == Some(&TCPI_DISCONNECT)
}

/// Transport control byte meaning
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tcpi {
    /// `3x`: last frame, no ACK expected
    LastMessageNoAck,
    /// `2x`: more frames follow, no ACK expected
    Flow,
    /// `1x`: last frame, ACK expected
    LastMessageAck,
    /// `0x`: block size reached, ACK expected
    BlockSizeReachedAck,
    /// `Bx`: ACK
    Ack,
    ParamRequest,
    ParamResponse,
    /// Channel keep-alive
    Test,
    /// Receiver discards data since the last ACK
    Break,
    Disconnect,
    Unknown,
}

impl Tcpi {
    fn classify(byte: u8) -> Self {
        if byte & 0xF0 == 0xA0 {
            return match byte {
                0xA0 => Tcpi::ParamRequest,
                0xA1 => Tcpi::ParamResponse,
                0xA3 => Tcpi::Test,
                0xA4 => Tcpi::Break,
                TCPI_DISCONNECT => Tcpi::Disconnect,
                _ => Tcpi::Unknown,
            };
        }
        match byte >> 4 {
            0x3 => Tcpi::LastMessageNoAck,
            0x2 => Tcpi::Flow,
            0x1 => Tcpi::LastMessageAck,
            0x0 => Tcpi::BlockSizeReachedAck,
            0xB => Tcpi::Ack,
            _ => Tcpi::Unknown,
        }
    }
}

/// Connection and reassembly state of one TP2.0 channel
#[derive(Debug)]
pub struct Vwtp20Decoder {
    tester_id: u32,
    ecu_id: u32,
    buffer: Vec<u8>,
    datagram_complete: bool,
    ack_pending: bool,
}

impl Default for Vwtp20Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Vwtp20Decoder {
    pub fn new() -> Self {
        Self {
            tester_id: UNSET,
            ecu_id: UNSET,
            buffer: Vec::with_capacity(VWTP20_BUFFER_SIZE),
            datagram_complete: false,
            ack_pending: false,
        }
    }

    /// CAN ID the tester transmits on, once learned
    pub fn tester_id(&self) -> Option<u32> {
        (self.tester_id != UNSET).then_some(self.tester_id)
    }

    /// CAN ID the ECU transmits on, once learned
    pub fn ecu_id(&self) -> Option<u32> {
        (self.ecu_id != UNSET).then_some(self.ecu_id)
    }

    /// True between an ACK-requesting frame and the observed ACK
    pub fn ack_pending(&self) -> bool {
        self.ack_pending
    }

    /// Bytes accumulated for the pending datagram, length header included
    pub fn buffered(&self) -> &[u8] {
        &self.buffer
    }

    /// Offer one CAN frame
    pub fn process(&mut self, msg: &CanMessage) -> FrameOutcome {
        if let Some(setup) = channel_setup(msg) {
            self.broadcast_channel(msg, setup);
            return FrameOutcome::Consumed;
        }
        if msg.id() == self.tester_id || msg.id() == self.ecu_id {
            return self.unicast_channel(msg);
        }
        FrameOutcome::NotHandled
    }

    fn broadcast_channel(&mut self, msg: &CanMessage, setup: ChannelSetup) {
        let data = msg.data();
        let ecu_address = data[0];
        let opcode = data[1];
        let tx_id = u16::from_le_bytes([data[2], data[3]]);
        let rx_id = u16::from_le_bytes([data[4], data[5]]);
        info!(
            ecu_address = format!("0x{:02X}", ecu_address),
            opcode = format!("0x{:02X}", opcode),
            tx_id = format!("0x{:X}", tx_id),
            rx_id = format!("0x{:X}", rx_id),
            "VWTP2.0 channel setup"
        );

        match setup {
            ChannelSetup::Request => self.forget_channel(),
            ChannelSetup::Accepted { tester_id, ecu_id } => {
                self.tester_id = tester_id;
                self.ecu_id = ecu_id;
                self.buffer.clear();
                self.datagram_complete = false;
            }
            ChannelSetup::Rejected => {}
        }
    }

    fn unicast_channel(&mut self, msg: &CanMessage) -> FrameOutcome {
        let Some((&tcpi, payload)) = msg.data().split_first() else {
            return FrameOutcome::Consumed;
        };

        match Tcpi::classify(tcpi) {
            Tcpi::LastMessageNoAck => {
                self.append(payload);
                self.datagram_complete = true;
                self.ack_pending = false;
            }
            Tcpi::Flow => self.append(payload),
            Tcpi::LastMessageAck => {
                self.append(payload);
                self.datagram_complete = true;
                self.ack_pending = true;
            }
            Tcpi::BlockSizeReachedAck => {
                self.append(payload);
                self.ack_pending = true;
            }
            Tcpi::Ack => self.ack_pending = false,
            Tcpi::Disconnect => {
                debug!(id = format!("0x{:X}", msg.id()), "VWTP2.0 disconnect");
                self.forget_channel();
            }
            // Accumulated bytes are kept across a break
            Tcpi::Break => debug!(id = format!("0x{:X}", msg.id()), "VWTP2.0 break"),
            Tcpi::ParamRequest | Tcpi::ParamResponse | Tcpi::Test | Tcpi::Unknown => {}
        }

        if !self.datagram_complete {
            return FrameOutcome::Consumed;
        }

        let outcome = match self.validate(msg) {
            Some(datagram) => FrameOutcome::Complete(datagram),
            None => FrameOutcome::Consumed,
        };
        self.buffer.clear();
        self.datagram_complete = false;
        outcome
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.buffer.len() + bytes.len() > VWTP20_BUFFER_SIZE {
            warn!(
                buffered = self.buffer.len(),
                incoming = bytes.len(),
                "VWTP2.0 datagram exceeds buffer, discarding"
            );
            self.buffer.clear();
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    fn validate(&self, msg: &CanMessage) -> Option<DecodedDatagram> {
        if self.buffer.len() < 3 {
            warn!(len = self.buffer.len(), "VWTP2.0 datagram shorter than 3 bytes");
            return None;
        }

        let declared = u16::from_be_bytes([self.buffer[0], self.buffer[1]]);
        let actual = self.buffer.len() - 2;
        if declared as usize != actual {
            if (declared ^ LENGTH_QUIRK_BIT) as usize == actual {
                warn!(declared, actual, "VWTP2.0 datagram header starts on 0x8000");
            } else {
                warn!(
                    declared,
                    actual,
                    buffer = %hex::encode(&self.buffer),
                    "VWTP2.0 datagram has invalid header"
                );
                return None;
            }
        }

        let datagram = DecodedDatagram::new(
            ProtocolTag::Vwtp20,
            msg.timestamp_ms(),
            msg.id(),
            self.buffer[2..].to_vec(),
        );
        debug!(%datagram, "VWTP2.0 datagram complete");
        Some(datagram)
    }

    fn forget_channel(&mut self) {
        self.tester_id = UNSET;
        self.ecu_id = UNSET;
    }
}
