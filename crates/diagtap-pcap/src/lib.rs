//! diagtap-pcap - live pcap streams over TCP
//!
//! Two encodings are provided:
//!
//! - [`RawIpEncoder`]: decoded datagrams wrapped in a synthetic IPv4 header
//!   (link type 101). The IP protocol field carries the [`ProtocolTag`].
//! - [`SocketCanEncoder`]: raw CAN frames as 16-byte SocketCAN records
//!   (link type 227).
//!
//! A [`PcapStreamSink`] serves one of them to a single TCP client at a time,
//! fed through cloneable [`SinkHandle`]s.
//!
//! [`ProtocolTag`]: diagtap_core::ProtocolTag

pub mod error;
pub mod format;
pub mod sink;

pub use error::SinkError;
pub use format::{
    encode_global_header, encode_record, encode_record_header, RawIpEncoder, RecordEncoder,
    SocketCanEncoder, LINKTYPE_CAN_SOCKETCAN, LINKTYPE_RAW,
};
pub use sink::{PcapStreamSink, SinkHandle};

/// Sink serving decoded datagrams
pub type RawSink = PcapStreamSink<RawIpEncoder>;

/// Sink serving raw CAN frames
pub type CanSink = PcapStreamSink<SocketCanEncoder>;
