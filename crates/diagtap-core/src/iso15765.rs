//! Passive ISO15765-2 (ISO-TP) reassembly
//!
//! Frame type is selected by the high nibble of the first data byte (PCI):
//!
//! | PCI | frame             | layout                              |
//! |-----|-------------------|-------------------------------------|
//! | 0x0 | single frame      | `0L d0..dL-1`                       |
//! | 0x1 | first frame       | `1L LL d0..d5` (12-bit total length)|
//! | 0x2 | consecutive frame | `2N d..` (N = 4-bit sequence)       |
//! | 0x3 | flow control      | ignored, the monitor never answers  |
//!
//! Only one reassembly runs at a time; a new single or first frame abandons
//! whatever was pending.

use tracing::{debug, warn};

use crate::frame::{CanMessage, DecodedDatagram, FrameOutcome, ProtocolTag};

/// Largest length a first frame can announce
pub const ISO15765_MAX_LENGTH: usize = 0xFFF;

const PCI_SINGLE_FRAME: u8 = 0x0;
const PCI_FIRST_FRAME: u8 = 0x1;
const PCI_CONSECUTIVE_FRAME: u8 = 0x2;
const PCI_FLOW_CONTROL: u8 = 0x3;

/// ISO-TP reassembly context
#[derive(Debug)]
pub struct Iso15765Decoder {
    buffer: Vec<u8>,
    remaining: usize,
    expected_sn: u8,
}

impl Default for Iso15765Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Iso15765Decoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(ISO15765_MAX_LENGTH),
            remaining: 0,
            expected_sn: 0,
        }
    }

    /// Sequence number the next consecutive frame should carry
    pub fn expected_sequence(&self) -> u8 {
        self.expected_sn
    }

    /// Bytes still missing from the pending datagram
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn is_reassembling(&self) -> bool {
        self.remaining != 0
    }

    /// Offer one frame already classified as ISO-TP bearing
    pub fn process(&mut self, msg: &CanMessage) -> FrameOutcome {
        let Some(&pci) = msg.data().first() else {
            return FrameOutcome::NotHandled;
        };

        match pci >> 4 {
            PCI_SINGLE_FRAME => self.single_frame(msg),
            PCI_FIRST_FRAME => self.first_frame(msg),
            PCI_CONSECUTIVE_FRAME => self.consecutive_frame(msg),
            PCI_FLOW_CONTROL => FrameOutcome::Consumed,
            _ => {
                warn!(
                    id = format!("0x{:X}", msg.id()),
                    pci = format!("0x{:02X}", pci),
                    "Invalid ISO15765 PCI byte"
                );
                FrameOutcome::NotHandled
            }
        }
    }

    fn single_frame(&mut self, msg: &CanMessage) -> FrameOutcome {
        self.abandon_pending();
        let data = msg.data();
        let length = (data[0] & 0x0F) as usize;
        if length > data.len() - 1 {
            warn!(
                id = format!("0x{:X}", msg.id()),
                length,
                dlc = data.len(),
                "ISO15765 single frame longer than its CAN frame"
            );
            return FrameOutcome::Consumed;
        }

        self.buffer.extend_from_slice(&data[1..1 + length]);
        FrameOutcome::Complete(self.complete(msg))
    }

    fn first_frame(&mut self, msg: &CanMessage) -> FrameOutcome {
        self.abandon_pending();
        let data = msg.data();
        if data.len() < 2 {
            warn!(id = format!("0x{:X}", msg.id()), "Truncated ISO15765 first frame");
            return FrameOutcome::Consumed;
        }

        let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
        if total == 0 {
            warn!(id = format!("0x{:X}", msg.id()), "ISO15765 first frame with zero length");
            return FrameOutcome::Consumed;
        }

        self.remaining = total;
        self.expected_sn = 1;
        debug!(id = format!("0x{:X}", msg.id()), total, "ISO15765 first frame");
        self.append(msg, &data[2..])
    }

    fn consecutive_frame(&mut self, msg: &CanMessage) -> FrameOutcome {
        if self.remaining == 0 {
            debug!(
                id = format!("0x{:X}", msg.id()),
                "ISO15765 consecutive frame without first frame"
            );
            return FrameOutcome::Consumed;
        }

        let data = msg.data();
        let sn = data[0] & 0x0F;
        if sn != self.expected_sn {
            warn!(
                id = format!("0x{:X}", msg.id()),
                expected = self.expected_sn,
                received = sn,
                "ISO15765 sequence number mismatch, resynchronizing"
            );
        }
        self.expected_sn = (sn + 1) & 0x0F;
        self.append(msg, &data[1..])
    }

    fn append(&mut self, msg: &CanMessage, bytes: &[u8]) -> FrameOutcome {
        let take = bytes.len().min(self.remaining);
        self.buffer.extend_from_slice(&bytes[..take]);
        self.remaining -= take;

        if self.remaining == 0 {
            FrameOutcome::Complete(self.complete(msg))
        } else {
            FrameOutcome::Consumed
        }
    }

    fn complete(&mut self, msg: &CanMessage) -> DecodedDatagram {
        let payload = std::mem::replace(
            &mut self.buffer,
            Vec::with_capacity(ISO15765_MAX_LENGTH),
        );
        self.remaining = 0;
        let datagram =
            DecodedDatagram::new(ProtocolTag::Iso15765, msg.timestamp_ms(), msg.id(), payload);
        debug!(%datagram, "ISO15765 datagram complete");
        datagram
    }

    fn abandon_pending(&mut self) {
        if !self.buffer.is_empty() || self.remaining != 0 {
            warn!(
                buffered = self.buffer.len(),
                missing = self.remaining,
                "Abandoning incomplete ISO15765 datagram"
            );
            self.buffer.clear();
            self.remaining = 0;
        }
    }
}
