use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use diagtap_core::{
    CanFrameRouter, CanIdClassifier, CanMessage, DecodedDatagram, FrameSink, RouteOutcome,
};
use diagtap_transport::CanInterface;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{info, warn};

use super::{MonitorStats, MONITOR_POLL_INTERVAL};

/// Feeds every frame of a CAN interface through a [`CanFrameRouter`]
pub struct CanMonitor {
    interface: Arc<dyn CanInterface>,
    rx: broadcast::Receiver<CanMessage>,
    poll_interval: Duration,
}

impl CanMonitor {
    /// Subscribes right away so no frame read after this call is missed
    pub fn new(interface: Arc<dyn CanInterface>) -> Self {
        let rx = interface.subscribe();
        Self {
            interface,
            rx,
            poll_interval: MONITOR_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Route frames until `running` is cleared or the interface closes
    pub async fn run<F, D, R>(
        mut self,
        mut router: CanFrameRouter<F, D, R>,
        running: Arc<AtomicBool>,
    ) -> MonitorStats
    where
        F: CanIdClassifier,
        D: FrameSink<DecodedDatagram>,
        R: FrameSink<CanMessage>,
    {
        info!(interface = %self.interface.name(), "CAN monitor started");
        let mut stats = MonitorStats::default();

        while running.load(Ordering::SeqCst) {
            let received = match tokio::time::timeout(self.poll_interval, self.rx.recv()).await {
                Ok(received) => received,
                Err(_) => continue,
            };
            match received {
                Ok(msg) => {
                    stats.received += 1;
                    if let RouteOutcome::Decoded(_) = router.route(msg) {
                        stats.datagrams += 1;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "CAN monitor fell behind, frames lost");
                    stats.lagged += skipped;
                }
                Err(RecvError::Closed) => {
                    info!(interface = %self.interface.name(), "CAN interface closed");
                    break;
                }
            }
        }

        info!(
            frames = stats.received,
            datagrams = stats.datagrams,
            routed = router.frames_routed(),
            "CAN monitor stopped"
        );
        stats
    }
}
