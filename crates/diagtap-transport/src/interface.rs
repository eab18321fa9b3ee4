//! Receive-only hardware interfaces

use async_trait::async_trait;
use bytes::Bytes;
use diagtap_core::CanMessage;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use crate::TransportError;

/// Per-subscriber backlog before a slow consumer starts lagging
pub const SUBSCRIBER_CAPACITY: usize = 1024;

/// A bus delivering raw CAN frames
///
/// Frames carry the ID, up to 8 data bytes and a millisecond timestamp
/// relative to the moment the interface was opened.
#[async_trait]
pub trait CanInterface: Send + Sync {
    /// Receive every frame read from now on
    ///
    /// The receiver reports `Closed` once the interface stops.
    fn subscribe(&self) -> broadcast::Receiver<CanMessage>;

    /// Stop reading and release the device
    async fn close(&self);

    fn name(&self) -> &str;
}

/// A K-Line delivering raw bytes in whatever chunks the device returns
#[async_trait]
pub trait KLineInterface: Send + Sync {
    fn subscribe(&self) -> broadcast::Receiver<Bytes>;

    /// Follow a baud rate negotiated on the bus
    async fn set_baud_rate(&self, baud_rate: u32) -> Result<(), TransportError>;

    /// False when `set_baud_rate` cannot reach the line
    fn follows_baud_rate(&self) -> bool {
        true
    }

    async fn close(&self);

    fn name(&self) -> &str;
}

/// Broadcast sender that can be closed from either side
///
/// Once closed, existing receivers drain and then see `Closed`; later
/// subscribers get an already closed receiver.
pub(crate) struct ReceiveChannel<T: Clone> {
    tx: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone> ReceiveChannel<T> {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(SUBSCRIBER_CAPACITY);
        Self {
            tx: Mutex::new(Some(tx)),
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<T> {
        match self.tx.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// False once closed; having no subscribers is not an error
    pub(crate) fn send(&self, item: T) -> bool {
        match self.tx.lock().as_ref() {
            Some(tx) => {
                let _ = tx.send(item);
                true
            }
            None => false,
        }
    }

    pub(crate) fn close(&self) {
        self.tx.lock().take();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.tx.lock().is_none()
    }
}
