//! Per-frame dispatch of CAN traffic to the transport decoders

use tracing::debug;

use crate::filter::CanIdClassifier;
use crate::frame::{CanMessage, DecodedDatagram, FrameOutcome, ProtocolTag};
use crate::iso15765::Iso15765Decoder;
use crate::sink::FrameSink;
use crate::vwtp20::Vwtp20Decoder;

/// What happened to one routed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Dropped by the classifier, nothing forwarded
    Ignored,
    /// Forwarded to the CAN sink, no datagram completed
    Forwarded,
    /// Forwarded and completed a datagram
    Decoded(ProtocolTag),
}

/// Routes raw CAN frames through classification, forwarding and decoding
///
/// Every frame the classifier does not ignore goes to the CAN sink first.
/// ISO15765 gets the first try on frames classified as ISO-TP; whatever it
/// does not handle is offered to VWTP2.0.
pub struct CanFrameRouter<F, D, R>
where
    F: CanIdClassifier,
    D: FrameSink<DecodedDatagram>,
    R: FrameSink<CanMessage>,
{
    classifier: F,
    iso15765: Iso15765Decoder,
    vwtp20: Vwtp20Decoder,
    datagrams: D,
    frames: R,
    routed: u64,
    decoded: u64,
}

impl<F, D, R> CanFrameRouter<F, D, R>
where
    F: CanIdClassifier,
    D: FrameSink<DecodedDatagram>,
    R: FrameSink<CanMessage>,
{
    pub fn new(classifier: F, datagrams: D, frames: R) -> Self {
        Self {
            classifier,
            iso15765: Iso15765Decoder::new(),
            vwtp20: Vwtp20Decoder::new(),
            datagrams,
            frames,
            routed: 0,
            decoded: 0,
        }
    }

    pub fn classifier(&self) -> &F {
        &self.classifier
    }

    pub fn vwtp20(&self) -> &Vwtp20Decoder {
        &self.vwtp20
    }

    pub fn iso15765(&self) -> &Iso15765Decoder {
        &self.iso15765
    }

    /// Frames forwarded to the CAN sink so far
    pub fn frames_routed(&self) -> u64 {
        self.routed
    }

    /// Datagrams handed to the datagram sink so far
    pub fn datagrams_decoded(&self) -> u64 {
        self.decoded
    }

    pub fn route(&mut self, msg: CanMessage) -> RouteOutcome {
        if self.classifier.ignore(&msg) {
            return RouteOutcome::Ignored;
        }

        self.frames.submit(msg);
        self.routed += 1;

        if self.classifier.is_iso15765(&msg) {
            match self.iso15765.process(&msg) {
                FrameOutcome::NotHandled => {}
                FrameOutcome::Consumed => return RouteOutcome::Forwarded,
                FrameOutcome::Complete(datagram) => return self.emit(datagram),
            }
        }

        match self.vwtp20.process(&msg) {
            FrameOutcome::Complete(datagram) => self.emit(datagram),
            FrameOutcome::NotHandled | FrameOutcome::Consumed => RouteOutcome::Forwarded,
        }
    }

    fn emit(&mut self, datagram: DecodedDatagram) -> RouteOutcome {
        let protocol = datagram.protocol;
        debug!(
            protocol = %protocol,
            id = format!("0x{:X}", datagram.source_id),
            timestamp_ms = datagram.timestamp_ms,
            "Datagram decoded"
        );
        self.datagrams.submit(datagram);
        self.decoded += 1;
        RouteOutcome::Decoded(protocol)
    }
}
