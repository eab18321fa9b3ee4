//! pcap stream encoding
//!
//! Global header, sent once per client (24 bytes, little-endian):
//!
//! ```text
//! ┌────────────┬─────────┬─────────┬──────────┬─────────┬─────────┬──────────┐
//! │ magic (4B) │ major 2 │ minor 4 │ zone (4) │ sigfigs │ snaplen │ linktype │
//! │ A1B2C3D4   │ (2B)    │ (2B)    │ 0        │ (4B) 0  │ 0xFFFF  │ (4B)     │
//! └────────────┴─────────┴─────────┴──────────┴─────────┴─────────┴──────────┘
//! ```
//!
//! Every record then carries a 16-byte header: seconds, microseconds,
//! captured length and original length (always equal).

use bytes::{BufMut, BytesMut};
use diagtap_core::frame::CAN_MAX_DLC;
use diagtap_core::{CanMessage, DecodedDatagram};

pub const PCAP_MAGIC: u32 = 0xA1B2_C3D4;
pub const PCAP_VERSION_MAJOR: u16 = 2;
pub const PCAP_VERSION_MINOR: u16 = 4;
pub const PCAP_SNAPLEN: u32 = 0xFFFF;

pub const GLOBAL_HEADER_SIZE: usize = 24;
pub const RECORD_HEADER_SIZE: usize = 16;

/// Raw IPv4, no link-layer header
pub const LINKTYPE_RAW: u32 = 101;
/// SocketCAN `can_frame`
pub const LINKTYPE_CAN_SOCKETCAN: u32 = 227;

pub const IPV4_HEADER_SIZE: usize = 20;
/// Source address stamped on every synthetic IPv4 header
pub const RAW_SOURCE_ADDRESS: [u8; 4] = [192, 168, 0, 1];

pub const SOCKETCAN_RECORD_SIZE: usize = 16;
const SOCKETCAN_EXTENDED_FLAG: u32 = 0x8000_0000;

/// Turns one queued item into a pcap record payload
pub trait RecordEncoder: Send + Sync + 'static {
    type Item: Send + 'static;

    /// Link type written in the global header
    const LINK_TYPE: u32;

    fn timestamp_ms(item: &Self::Item) -> u64;

    fn payload_len(item: &Self::Item) -> usize;

    fn encode_payload(item: &Self::Item, dst: &mut BytesMut);
}

pub fn encode_global_header(link_type: u32, dst: &mut BytesMut) {
    dst.reserve(GLOBAL_HEADER_SIZE);
    dst.put_u32_le(PCAP_MAGIC);
    dst.put_u16_le(PCAP_VERSION_MAJOR);
    dst.put_u16_le(PCAP_VERSION_MINOR);
    dst.put_i32_le(0);
    dst.put_u32_le(0);
    dst.put_u32_le(PCAP_SNAPLEN);
    dst.put_u32_le(link_type);
}

/// Timestamps are relative milliseconds, split into seconds and microseconds
pub fn encode_record_header(timestamp_ms: u64, len: usize, dst: &mut BytesMut) {
    dst.reserve(RECORD_HEADER_SIZE);
    dst.put_u32_le((timestamp_ms / 1000) as u32);
    dst.put_u32_le(((timestamp_ms % 1000) * 1000) as u32);
    dst.put_u32_le(len as u32);
    dst.put_u32_le(len as u32);
}

/// Record header followed by the encoded payload
pub fn encode_record<E: RecordEncoder>(item: &E::Item, dst: &mut BytesMut) {
    let len = E::payload_len(item);
    dst.reserve(RECORD_HEADER_SIZE + len);
    encode_record_header(E::timestamp_ms(item), len, dst);
    E::encode_payload(item, dst);
}

/// Decoded datagrams behind a synthetic, non-routable IPv4 header
///
/// Destination address is the datagram's source CAN ID and the protocol
/// field carries the protocol tag. Checksum stays zero.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawIpEncoder;

impl RecordEncoder for RawIpEncoder {
    type Item = DecodedDatagram;

    const LINK_TYPE: u32 = LINKTYPE_RAW;

    fn timestamp_ms(item: &DecodedDatagram) -> u64 {
        item.timestamp_ms
    }

    fn payload_len(item: &DecodedDatagram) -> usize {
        IPV4_HEADER_SIZE + item.payload.len()
    }

    fn encode_payload(item: &DecodedDatagram, dst: &mut BytesMut) {
        let total = Self::payload_len(item);
        dst.put_u8(0x45); // version 4, IHL 5
        dst.put_u8(0x00);
        dst.put_u16(total as u16);
        dst.put_u16(0); // identification
        dst.put_u16(0x4000); // don't fragment
        dst.put_u8(0x80); // TTL
        dst.put_u8(item.protocol.as_u8());
        dst.put_u16(0);
        dst.put_slice(&RAW_SOURCE_ADDRESS);
        dst.put_u32(item.source_id);
        dst.put_slice(&item.payload);
    }
}

/// Raw CAN frames as SocketCAN records
///
/// ID big-endian with bit 31 set above 0x7FF, DLC, 3 padding bytes, then
/// data zero-padded to 8 bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SocketCanEncoder;

impl RecordEncoder for SocketCanEncoder {
    type Item = CanMessage;

    const LINK_TYPE: u32 = LINKTYPE_CAN_SOCKETCAN;

    fn timestamp_ms(item: &CanMessage) -> u64 {
        item.timestamp_ms()
    }

    fn payload_len(_item: &CanMessage) -> usize {
        SOCKETCAN_RECORD_SIZE
    }

    fn encode_payload(item: &CanMessage, dst: &mut BytesMut) {
        let id = if item.is_extended() {
            item.id() | SOCKETCAN_EXTENDED_FLAG
        } else {
            item.id()
        };
        dst.put_u32(id);
        dst.put_u8(item.dlc() as u8);
        dst.put_bytes(0, 3);
        dst.put_slice(item.data());
        dst.put_bytes(0, CAN_MAX_DLC - item.dlc());
    }
}
