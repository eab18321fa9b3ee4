//! K-Line over a plain byte stream
//!
//! Either a serial device file whose line settings were applied beforehand
//! (`stty`, udev rule, adapter firmware) or a TCP bridge forwarding the raw
//! serial bytes.
//!
//! This backend is fixed-rate: neither source exposes line settings, so a
//! baud rate switch seen on the bus is recorded and logged but never
//! applied. Decoding past such a switch needs an adapter that follows it on
//! its own.

use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::KLineConfig;
use crate::interface::ReceiveChannel;
use crate::{KLineInterface, TransportError};

const READ_CHUNK: usize = 512;

type ByteSource = Pin<Box<dyn AsyncRead + Send>>;

/// Fixed-rate K-Line interface reading a device file or TCP stream
pub struct StreamKLineInterface {
    name: String,
    baud_rate: AtomicU32,
    channel: Arc<ReceiveChannel<Bytes>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamKLineInterface {
    pub async fn open(config: &KLineConfig) -> Result<Self, TransportError> {
        let (name, source) = Self::connect(config).await?;
        info!(interface = %name, baud_rate = config.baud_rate, "K-Line stream opened");

        let channel = Arc::new(ReceiveChannel::new());
        let reader = Self::start_reader(name.clone(), source, channel.clone());

        Ok(Self {
            name,
            baud_rate: AtomicU32::new(config.baud_rate),
            channel,
            reader: Mutex::new(Some(reader)),
        })
    }

    async fn connect(config: &KLineConfig) -> Result<(String, ByteSource), TransportError> {
        match (&config.path, &config.tcp) {
            (Some(path), None) => {
                let file = tokio::fs::File::open(path).await.map_err(|e| {
                    TransportError::ConnectionFailed(format!(
                        "Failed to open {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Ok((path.display().to_string(), Box::pin(file)))
            }
            (None, Some(addr)) => {
                let stream = tokio::net::TcpStream::connect(addr.as_str())
                    .await
                    .map_err(|e| {
                        TransportError::ConnectionFailed(format!(
                            "Failed to connect to {}: {}",
                            addr, e
                        ))
                    })?;
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(error = %e, "Failed to set TCP_NODELAY on K-Line bridge");
                }
                Ok((format!("tcp://{}", addr), Box::pin(stream)))
            }
            (Some(_), Some(_)) => Err(TransportError::InvalidConfig(
                "K-Line source takes either 'path' or 'tcp', not both".to_string(),
            )),
            (None, None) => Err(TransportError::InvalidConfig(
                "K-Line source needs 'path' or 'tcp'".to_string(),
            )),
        }
    }

    fn start_reader(
        name: String,
        mut source: ByteSource,
        channel: Arc<ReceiveChannel<Bytes>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut buf = BytesMut::with_capacity(READ_CHUNK);
            loop {
                buf.reserve(READ_CHUNK);
                match source.read_buf(&mut buf).await {
                    Ok(0) => {
                        info!(interface = %name, "K-Line stream ended");
                        break;
                    }
                    Ok(n) => {
                        debug!(interface = %name, bytes = n, "K-Line bytes received");
                        if !channel.send(buf.split().freeze()) {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(interface = %name, error = %e, "K-Line read failed");
                        break;
                    }
                }
            }
            channel.close();
        })
    }

    /// Last rate requested through `set_baud_rate`
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KLineInterface for StreamKLineInterface {
    fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.channel.subscribe()
    }

    /// Records the request; the line itself keeps its configured rate
    async fn set_baud_rate(&self, baud_rate: u32) -> Result<(), TransportError> {
        if self.channel.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }
        let previous = self.baud_rate.swap(baud_rate, Ordering::SeqCst);
        if previous != baud_rate {
            warn!(
                interface = %self.name,
                from = previous,
                to = baud_rate,
                "Bus switched baud rate; reconfigure the serial line to keep up"
            );
        }
        Ok(())
    }

    fn follows_baud_rate(&self) -> bool {
        false
    }

    async fn close(&self) {
        self.channel.close();
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for StreamKLineInterface {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}
