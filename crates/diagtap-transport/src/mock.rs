//! Mock interfaces for testing

use async_trait::async_trait;
use bytes::Bytes;
use diagtap_core::CanMessage;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::interface::ReceiveChannel;
use crate::{CanInterface, KLineInterface, TransportError};

/// CAN interface fed by [`MockCanInterface::inject`]
pub struct MockCanInterface {
    name: String,
    channel: ReceiveChannel<CanMessage>,
}

impl Default for MockCanInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCanInterface {
    pub fn new() -> Self {
        Self {
            name: "mock-can".to_string(),
            channel: ReceiveChannel::new(),
        }
    }

    /// Deliver a frame as if read from the bus; false once closed
    pub fn inject(&self, msg: CanMessage) -> bool {
        self.channel.send(msg)
    }
}

#[async_trait]
impl CanInterface for MockCanInterface {
    fn subscribe(&self) -> broadcast::Receiver<CanMessage> {
        self.channel.subscribe()
    }

    async fn close(&self) {
        self.channel.close();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// K-Line interface fed by [`MockKLineInterface::inject`]
pub struct MockKLineInterface {
    name: String,
    channel: ReceiveChannel<Bytes>,
    baud_rates: Mutex<Vec<u32>>,
}

impl Default for MockKLineInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl MockKLineInterface {
    pub fn new() -> Self {
        Self {
            name: "mock-kline".to_string(),
            channel: ReceiveChannel::new(),
            baud_rates: Mutex::new(Vec::new()),
        }
    }

    pub fn inject(&self, bytes: impl Into<Bytes>) -> bool {
        self.channel.send(bytes.into())
    }

    /// Every rate passed to `set_baud_rate`, oldest first
    pub fn baud_rate_history(&self) -> Vec<u32> {
        self.baud_rates.lock().clone()
    }
}

#[async_trait]
impl KLineInterface for MockKLineInterface {
    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.channel.subscribe()
    }

    async fn set_baud_rate(&self, baud_rate: u32) -> Result<(), TransportError> {
        if self.channel.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        tracing::debug!(baud_rate, "Mock K-Line: baud rate changed");
        self.baud_rates.lock().push(baud_rate);
        Ok(())
    }

    async fn close(&self) {
        self.channel.close();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_can_delivers_and_closes() {
        let can = MockCanInterface::new();
        let mut rx = can.subscribe();
        assert!(can.inject(CanMessage::new(0x7E8, &[0x01, 0x3E], 5)));
        assert_eq!(rx.recv().await.unwrap().id(), 0x7E8);

        can.close().await;
        assert!(!can.inject(CanMessage::new(0x7E8, &[], 6)));
        assert!(rx.recv().await.is_err());
    }

    #[tokio::test]
    async fn test_mock_kline_records_baud_rates() {
        let kline = MockKLineInterface::new();
        let mut rx = kline.subscribe();
        kline.inject(vec![0x55, 0x01, 0x8A]);
        assert_eq!(&rx.recv().await.unwrap()[..], &[0x55, 0x01, 0x8A]);

        kline.set_baud_rate(57600).await.unwrap();
        kline.set_baud_rate(10400).await.unwrap();
        assert_eq!(kline.baud_rate_history(), vec![57600, 10400]);

        kline.close().await;
        assert!(matches!(
            kline.set_baud_rate(9600).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
