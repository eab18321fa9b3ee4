//! Idle watchdog returning the K-Line decoder to Idle on bus silence

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use super::KLineDecoder;
use crate::clock::Clock;

/// Decoder shared between the byte reader and the watchdog
pub type SharedKLineDecoder<C> = Arc<Mutex<KLineDecoder<C>>>;

/// How often the watchdog looks at the bus
pub const WATCHDOG_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Periodic idle check running on its own task
pub struct IdleWatchdog<C: Clock + 'static> {
    decoder: SharedKLineDecoder<C>,
    interval: Duration,
    resets: Option<mpsc::UnboundedSender<()>>,
}

impl<C: Clock + 'static> IdleWatchdog<C> {
    pub fn new(decoder: SharedKLineDecoder<C>) -> Self {
        Self {
            decoder,
            interval: WATCHDOG_POLL_INTERVAL,
            resets: None,
        }
    }

    /// Report every idle reset on `tx`
    pub fn notify_resets(mut self, tx: mpsc::UnboundedSender<()>) -> Self {
        self.resets = Some(tx);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One watchdog pass
    pub fn tick(&self) -> bool {
        let reset = self.decoder.lock().check_idle();
        if reset {
            if let Some(tx) = &self.resets {
                let _ = tx.send(());
            }
        }
        reset
    }

    /// Run until `running` is cleared
    pub fn spawn(self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            while running.load(Ordering::SeqCst) {
                ticker.tick().await;
                self.tick();
            }
            debug!("K-Line idle watchdog stopped");
        })
    }
}
