//! diagtap-core - passive reconstruction of automotive diagnostic traffic
//!
//! This crate turns raw K-Line bytes and raw CAN frames into application
//! layer datagrams without ever transmitting on the bus.
//!
//! # Architecture
//!
//! ```text
//!   raw K-Line bytes                      raw CAN frames
//!         │                                     │
//!  ┌──────┴───────┐                    ┌────────┴────────┐
//!  │ KLineDecoder │                    │ CanFrameRouter  │──── CanMessage ───▶ can sink
//!  │ (+ watchdog) │                    │  ├ classifier   │
//!  └──────┬───────┘                    │  ├ Iso15765     │
//!         │                            │  └ Vwtp20       │
//!         │                            └────────┬────────┘
//!         └──────── DecodedDatagram ────────────┴──────────────────────────▶ raw sink
//! ```
//!
//! Decoders are plain single-threaded state machines. Hand-off to the
//! streaming side goes through [`FrameSink`].

pub mod clock;
pub mod error;
pub mod filter;
pub mod frame;
pub mod iso15765;
pub mod kline;
pub mod router;
pub mod sink;
pub mod vwtp20;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use error::CoreError;
pub use filter::{parse_can_id, AcceptAll, AutoDetect, CanIdClassifier, CanIdFilter, FilterRules};
pub use frame::{CanMessage, DecodedDatagram, FrameOutcome, ProtocolTag};
pub use iso15765::Iso15765Decoder;
pub use kline::{baud_rate_from_byte, KLineBusState, KLineDecoder};
pub use router::{CanFrameRouter, RouteOutcome};
pub use sink::FrameSink;
pub use vwtp20::{ChannelSetup, Vwtp20Decoder};
