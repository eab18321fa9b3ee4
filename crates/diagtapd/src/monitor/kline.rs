use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use diagtap_core::kline::{
    announced_baud_rate, IdleWatchdog, SharedKLineDecoder, WATCHDOG_POLL_INTERVAL,
};
use diagtap_core::{Clock, DecodedDatagram, FrameSink, KLineBusState, KLineDecoder};
use diagtap_transport::KLineInterface;
use parking_lot::Mutex;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{MonitorStats, MONITOR_POLL_INTERVAL};

/// Drives a [`KLineDecoder`] from a K-Line interface
///
/// Runs the idle watchdog next to the byte loop and keeps the interface
/// baud rate in step with StartDiagnosticSession responses seen on the bus.
pub struct KLineMonitor<C: Clock + 'static, S> {
    interface: Arc<dyn KLineInterface>,
    rx: broadcast::Receiver<Bytes>,
    decoder: SharedKLineDecoder<C>,
    sink: S,
    default_baud: u32,
    current_baud: u32,
    poll_interval: Duration,
    watchdog_interval: Duration,
}

impl<C, S> KLineMonitor<C, S>
where
    C: Clock + 'static,
    S: FrameSink<DecodedDatagram>,
{
    pub fn new(
        interface: Arc<dyn KLineInterface>,
        decoder: KLineDecoder<C>,
        sink: S,
        default_baud: u32,
    ) -> Self {
        let rx = interface.subscribe();
        Self {
            interface,
            rx,
            decoder: Arc::new(Mutex::new(decoder)),
            sink,
            default_baud,
            current_baud: default_baud,
            poll_interval: MONITOR_POLL_INTERVAL,
            watchdog_interval: WATCHDOG_POLL_INTERVAL,
        }
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn decoder(&self) -> SharedKLineDecoder<C> {
        Arc::clone(&self.decoder)
    }

    /// Decode bytes until `running` is cleared or the interface closes
    pub async fn run(mut self, running: Arc<AtomicBool>) -> MonitorStats {
        info!(
            interface = %self.interface.name(),
            baud_rate = self.default_baud,
            "K-Line monitor started"
        );
        if !self.interface.follows_baud_rate() {
            warn!(
                interface = %self.interface.name(),
                "Fixed-rate K-Line source, frames after a baud rate switch will not decode"
            );
        }
        let mut stats = MonitorStats::default();

        let watchdog_running = Arc::new(AtomicBool::new(true));
        let (reset_tx, mut resets) = mpsc::unbounded_channel();
        let watchdog = IdleWatchdog::new(self.decoder())
            .with_interval(self.watchdog_interval)
            .notify_resets(reset_tx)
            .spawn(watchdog_running.clone());

        while running.load(Ordering::SeqCst) {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Ok(bytes) => {
                        stats.received += 1;
                        stats.datagrams += self.handle_bytes(&bytes).await;
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "K-Line monitor fell behind, byte chunks lost");
                        stats.lagged += skipped;
                        self.resynchronize().await;
                    }
                    Err(RecvError::Closed) => {
                        info!(interface = %self.interface.name(), "K-Line interface closed");
                        break;
                    }
                },
                Some(()) = resets.recv() => self.restore_default_baud().await,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        watchdog_running.store(false, Ordering::SeqCst);
        if let Err(e) = watchdog.await {
            warn!(error = %e, "K-Line watchdog task failed");
        }

        info!(
            chunks = stats.received,
            datagrams = stats.datagrams,
            "K-Line monitor stopped"
        );
        stats
    }

    async fn handle_bytes(&mut self, bytes: &[u8]) -> u64 {
        let (datagrams, state) = {
            let mut decoder = self.decoder.lock();
            let datagrams = decoder.push_bytes(bytes);
            (datagrams, decoder.state())
        };

        let count = datagrams.len() as u64;
        for datagram in datagrams {
            let announced = announced_baud_rate(&datagram);
            self.sink.submit(datagram);
            if let Some(baud_rate) = announced {
                self.switch_baud(baud_rate).await;
            }
        }

        // KW1281 end communication
        if state == KLineBusState::Idle {
            self.restore_default_baud().await;
        }
        count
    }

    /// Lost chunks leave the buffer out of step with the wire
    async fn resynchronize(&mut self) {
        self.decoder.lock().reset();
        self.restore_default_baud().await;
    }

    async fn restore_default_baud(&mut self) {
        self.switch_baud(self.default_baud).await;
    }

    async fn switch_baud(&mut self, baud_rate: u32) {
        if baud_rate == self.current_baud {
            return;
        }
        match self.interface.set_baud_rate(baud_rate).await {
            Ok(()) => {
                info!(from = self.current_baud, to = baud_rate, "K-Line baud rate changed");
                self.current_baud = baud_rate;
            }
            Err(e) => warn!(baud_rate, error = %e, "Failed to change K-Line baud rate"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagtap_core::kline::iso14230::checksum;
    use diagtap_core::kline::KLINE_IDLE_TIMEOUT_MS;
    use diagtap_core::{ManualClock, ProtocolTag};
    use diagtap_transport::mock::MockKLineInterface;

    fn iso_frame(bytes: &[u8]) -> Vec<u8> {
        let mut frame = bytes.to_vec();
        frame.push(checksum(bytes));
        frame
    }

    async fn wait_for_history(kline: &MockKLineInterface, len: usize) -> Vec<u32> {
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                let history = kline.baud_rate_history();
                if history.len() >= len {
                    return history;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("baud rate never changed")
    }

    #[tokio::test]
    async fn test_datagrams_forwarded_in_order() {
        let kline = Arc::new(MockKLineInterface::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = KLineMonitor::new(
            kline.clone(),
            KLineDecoder::with_clock(ManualClock::new(0)),
            tx,
            10400,
        );
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(monitor.run(running));

        let request = iso_frame(&[0x81, 0x10, 0xF1, 0x81]);
        let response = iso_frame(&[0x83, 0xF1, 0x10, 0xC1, 0xEF, 0x8F]);
        kline.inject(vec![0x55, 0xEF, 0x8F, 0x70, 0xEE]);
        kline.inject(request.clone());
        kline.inject(response[..3].to_vec());
        kline.inject(response[3..].to_vec());
        kline.close().await;

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(stats.received, 4);
        assert_eq!(stats.datagrams, 3);

        let payloads: Vec<Vec<u8>> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| {
                assert_eq!(d.protocol, ProtocolTag::Iso14230);
                d.payload
            })
            .collect();
        assert_eq!(
            payloads,
            vec![vec![0x55, 0xEF, 0x8F, 0x70, 0xEE], request, response]
        );
        assert!(kline.baud_rate_history().is_empty());
    }

    #[tokio::test]
    async fn test_baud_rate_follows_session_and_idle() {
        let kline = Arc::new(MockKLineInterface::new());
        let clock = ManualClock::new(0);
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = KLineMonitor::new(
            kline.clone(),
            KLineDecoder::with_clock(clock.clone()),
            tx,
            10400,
        )
        .with_watchdog_interval(Duration::from_millis(5));
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(monitor.run(running.clone()));

        // StartDiagnosticSession positive response announcing 0x64
        kline.inject(iso_frame(&[0x83, 0xF1, 0x10, 0x50, 0x86, 0x64]));
        assert_eq!(wait_for_history(&kline, 1).await, vec![57600]);

        clock.advance(KLINE_IDLE_TIMEOUT_MS);
        assert_eq!(wait_for_history(&kline, 2).await, vec![57600, 10400]);

        running.store(false, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn test_kw1281_end_communication_restores_default() {
        let kline = Arc::new(MockKLineInterface::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let monitor = KLineMonitor::new(
            kline.clone(),
            KLineDecoder::with_clock(ManualClock::new(0)),
            tx,
            10400,
        );
        let decoder = monitor.decoder();
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(monitor.run(running));

        // ISO14230 session switches to 9600, then the bus re-inits into KW1281
        kline.inject(iso_frame(&[0x83, 0xF1, 0x10, 0x50, 0x81, 0x10]));
        assert_eq!(wait_for_history(&kline, 1).await, vec![9600]);

        // Checksum mismatch drops back to Idle, which restores the default
        let mut bad = iso_frame(&[0x81, 0x10, 0xF1, 0x3E]);
        bad[4] ^= 0xFF;
        kline.inject(bad);
        assert_eq!(wait_for_history(&kline, 2).await, vec![9600, 10400]);

        // KW1281 init, one block, end communication (block title 0x06)
        kline.inject(vec![0x55, 0x01, 0x8A, 0x75]);
        kline.inject(vec![0x03, 0xFC, 0x01, 0xFE, 0x06, 0xF9, 0x03]);
        kline.close().await;

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(decoder.lock().state(), KLineBusState::Idle);
        assert_eq!(kline.baud_rate_history(), vec![9600, 10400]);

        let protocols: Vec<ProtocolTag> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|d| d.protocol)
            .collect();
        assert_eq!(
            protocols,
            vec![ProtocolTag::Iso14230, ProtocolTag::Iso14230, ProtocolTag::Kw1281]
        );
    }

    #[tokio::test]
    async fn test_lost_chunks_reset_decoder() {
        let kline = Arc::new(MockKLineInterface::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let monitor = KLineMonitor::new(
            kline.clone(),
            KLineDecoder::with_clock(ManualClock::new(0)),
            tx,
            10400,
        );
        let decoder = monitor.decoder();
        let running = Arc::new(AtomicBool::new(true));
        let task = tokio::spawn(monitor.run(running));

        kline.inject(iso_frame(&[0x83, 0xF1, 0x10, 0x50, 0x86, 0x64]));
        assert_eq!(wait_for_history(&kline, 1).await, vec![57600]);
        assert_eq!(decoder.lock().state(), KLineBusState::Iso14230);

        // Outrun the subscriber without yielding to it
        let overrun = diagtap_transport::SUBSCRIBER_CAPACITY + 76;
        for _ in 0..overrun {
            kline.inject(Vec::<u8>::new());
        }
        assert_eq!(wait_for_history(&kline, 2).await, vec![57600, 10400]);
        kline.close().await;

        let stats = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("monitor did not stop")
            .unwrap();
        assert_eq!(stats.lagged, 76);
        assert_eq!(decoder.lock().state(), KLineBusState::Idle);
        assert!(decoder.lock().buffered().is_empty());
    }
}
