//! Frame value types shared by decoders and sinks

use std::fmt;

/// Maximum payload of a classic CAN frame
pub const CAN_MAX_DLC: usize = 8;

/// Largest identifier a CAN frame can carry (29-bit extended)
pub const CAN_MAX_ID: u32 = 0x1FFF_FFFF;

/// Largest 11-bit (standard) identifier
pub const CAN_MAX_STANDARD_ID: u32 = 0x7FF;

/// Raw CAN frame as delivered by a hardware backend
///
/// Payloads longer than 8 bytes are truncated on construction; the frame is
/// read-only afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanMessage {
    id: u32,
    data: [u8; CAN_MAX_DLC],
    dlc: u8,
    timestamp_ms: u64,
}

impl CanMessage {
    pub fn new(id: u32, data: &[u8], timestamp_ms: u64) -> Self {
        let dlc = data.len().min(CAN_MAX_DLC);
        let mut buf = [0u8; CAN_MAX_DLC];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id: id & CAN_MAX_ID,
            data: buf,
            dlc: dlc as u8,
            timestamp_ms,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    /// Payload bytes, `dlc()` long
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    pub fn dlc(&self) -> usize {
        self.dlc as usize
    }

    pub fn timestamp_ms(&self) -> u64 {
        self.timestamp_ms
    }

    /// True when the identifier needs 29-bit addressing
    pub fn is_extended(&self) -> bool {
        self.id > CAN_MAX_STANDARD_ID
    }
}

impl fmt::Display for CanMessage {
    /// `7F1 [0D 3F 0D 2A]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03X} [", self.id)?;
        for (i, b) in self.data().iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            write!(f, "{:02X}", b)?;
        }
        f.write_str("]")
    }
}

/// Protocol a datagram was reconstructed from
///
/// The discriminant is written into the IPv4 protocol field of the raw pcap
/// stream so that dissectors can select on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ProtocolTag {
    Iso14230 = 0x91,
    Kw1281 = 0x92,
    Vwtp20 = 0x93,
    Iso15765 = 0x94,
}

impl ProtocolTag {
    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ProtocolTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProtocolTag::Iso14230 => "ISO14230",
            ProtocolTag::Kw1281 => "KW1281",
            ProtocolTag::Vwtp20 => "VWTP20",
            ProtocolTag::Iso15765 => "ISO15765",
        };
        f.write_str(name)
    }
}

/// Application payload reconstructed by one of the decoders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedDatagram {
    pub protocol: ProtocolTag,
    pub timestamp_ms: u64,
    /// CAN identifier of the completing frame, 0 for K-Line
    pub source_id: u32,
    pub payload: Vec<u8>,
}

impl DecodedDatagram {
    pub fn new(protocol: ProtocolTag, timestamp_ms: u64, source_id: u32, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            timestamp_ms,
            source_id,
            payload,
        }
    }
}

impl fmt::Display for DecodedDatagram {
    /// `ISO15765 @ 1234ms [62f190...]`
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ {}ms [{}]",
            self.protocol,
            self.timestamp_ms,
            hex::encode(&self.payload)
        )
    }
}

/// Result of offering one CAN frame to a transport decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame does not belong to this protocol
    NotHandled,
    /// The frame was taken, no datagram completed yet
    Consumed,
    /// The frame completed a datagram
    Complete(DecodedDatagram),
}

impl FrameOutcome {
    pub fn is_handled(&self) -> bool {
        !matches!(self, FrameOutcome::NotHandled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_can_message_truncates_payload() {
        let msg = CanMessage::new(0x7E8, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], 5);
        assert_eq!(msg.dlc(), 8);
        assert_eq!(msg.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_can_message_display() {
        let msg = CanMessage::new(0x7F1, &[0x0D, 0x3F], 0);
        assert_eq!(msg.to_string(), "7F1 [0D 3F]");
    }

    #[test]
    fn test_extended_flag() {
        assert!(!CanMessage::new(0x7FF, &[], 0).is_extended());
        assert!(CanMessage::new(0x800, &[], 0).is_extended());
        assert!(CanMessage::new(0x18DAF110, &[], 0).is_extended());
    }

    #[test]
    fn test_protocol_tag_wire_values() {
        assert_eq!(ProtocolTag::Iso14230.as_u8(), 0x91);
        assert_eq!(ProtocolTag::Kw1281.as_u8(), 0x92);
        assert_eq!(ProtocolTag::Vwtp20.as_u8(), 0x93);
        assert_eq!(ProtocolTag::Iso15765.as_u8(), 0x94);
    }
}
