//! Hand-off from decoders to the streaming side

use tokio::sync::mpsc;

/// Destination for decoded datagrams or raw frames
///
/// Implementations must not block; items that cannot be delivered are
/// dropped by the implementation.
pub trait FrameSink<T>: Send + Sync {
    fn submit(&self, item: T);
}

impl<T: Send> FrameSink<T> for mpsc::UnboundedSender<T> {
    fn submit(&self, item: T) {
        // Receiver gone means nobody is listening anymore
        let _ = self.send(item);
    }
}

impl<T, S: FrameSink<T> + ?Sized> FrameSink<T> for std::sync::Arc<S> {
    fn submit(&self, item: T) {
        (**self).submit(item)
    }
}
