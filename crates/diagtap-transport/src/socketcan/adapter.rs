//! Raw SocketCAN reader
//!
//! The socket is opened non-blocking and polled from a blocking task, so a
//! cleared running flag stops the reader within one poll interval.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use diagtap_core::CanMessage;
use parking_lot::Mutex;
use socketcan::{CanFrame, CanSocket, EmbeddedFrame, Frame, Socket};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::SocketCanConfig;
use crate::interface::ReceiveChannel;
use crate::{CanInterface, TransportError};

const IDLE_POLL: Duration = Duration::from_millis(1);
const ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Receive-only raw CAN socket
pub struct SocketCanInterface {
    interface: String,
    channel: Arc<ReceiveChannel<CanMessage>>,
    running: Arc<AtomicBool>,
    listener_handle: Mutex<Option<JoinHandle<()>>>,
}

impl SocketCanInterface {
    pub async fn new(config: &SocketCanConfig) -> Result<Self, TransportError> {
        let socket = Self::create_socket(config)?;

        let adapter = Self {
            interface: config.interface.clone(),
            channel: Arc::new(ReceiveChannel::new()),
            running: Arc::new(AtomicBool::new(true)),
            listener_handle: Mutex::new(None),
        };
        adapter.start_listener(socket);

        tracing::info!(interface = %config.interface, "SocketCAN interface opened");
        Ok(adapter)
    }

    fn create_socket(config: &SocketCanConfig) -> Result<CanSocket, TransportError> {
        let socket = CanSocket::open(&config.interface).map_err(|e| {
            TransportError::ConnectionFailed(format!(
                "Failed to open CAN interface {}: {}",
                config.interface, e
            ))
        })?;

        socket.set_nonblocking(true).map_err(|e| {
            TransportError::InvalidConfig(format!("Failed to set non-blocking: {}", e))
        })?;

        Ok(socket)
    }

    fn start_listener(&self, socket: CanSocket) {
        let channel = self.channel.clone();
        let running = self.running.clone();
        let interface = self.interface.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let opened = Instant::now();
            while running.load(Ordering::SeqCst) {
                match socket.read_frame() {
                    Ok(CanFrame::Data(frame)) => {
                        let msg = CanMessage::new(
                            frame.raw_id(),
                            frame.data(),
                            opened.elapsed().as_millis() as u64,
                        );
                        if !channel.send(msg) {
                            break;
                        }
                    }
                    Ok(CanFrame::Remote(_)) => {}
                    Ok(CanFrame::Error(frame)) => {
                        tracing::warn!(interface = %interface, ?frame, "CAN error frame");
                    }
                    Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        std::thread::sleep(IDLE_POLL);
                    }
                    Err(e) => {
                        tracing::error!(interface = %interface, ?e, "SocketCAN read error");
                        std::thread::sleep(ERROR_BACKOFF);
                    }
                }
            }
            channel.close();
            tracing::debug!(interface = %interface, "SocketCAN listener stopped");
        });

        *self.listener_handle.lock() = Some(handle);
    }
}

#[async_trait]
impl CanInterface for SocketCanInterface {
    fn subscribe(&self) -> broadcast::Receiver<CanMessage> {
        self.channel.subscribe()
    }

    async fn close(&self) {
        self.running.store(false, Ordering::SeqCst);
        let handle = self.listener_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::debug!(interface = %self.interface, error = %e, "SocketCAN listener task failed");
            }
        }
    }

    fn name(&self) -> &str {
        &self.interface
    }
}

impl Drop for SocketCanInterface {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}
