//! Receive loops driving the decoders

mod can;
mod kline;

pub use can::CanMonitor;
pub use kline::KLineMonitor;

use std::time::Duration;

use diagtap_core::{DecodedDatagram, FrameSink};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How long a monitor waits for input before checking the running flag
pub const MONITOR_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Counters reported when a monitor stops
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorStats {
    /// CAN frames or K-Line chunks received
    pub received: u64,
    pub datagrams: u64,
    /// Items lost because a monitor fell behind its interface
    pub lagged: u64,
}

/// Logs each datagram on its way to the wrapped sink
pub struct LogDatagrams<S>(pub S);

impl<S: FrameSink<DecodedDatagram>> FrameSink<DecodedDatagram> for LogDatagrams<S> {
    fn submit(&self, datagram: DecodedDatagram) {
        info!("{}", datagram);
        self.0.submit(datagram);
    }
}

/// Wait for background tasks once the running flag is cleared
///
/// Returns how many of them failed or outlived `timeout`.
pub async fn join_background_tasks(tasks: Vec<JoinHandle<()>>, timeout: Duration) -> usize {
    let mut unclean = 0;
    for task in tasks {
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => debug!(error = %e, "Background task failed during shutdown"),
            Err(_) => debug!(?timeout, "Background task did not stop in time"),
        }
        unclean += 1;
    }
    unclean
}
