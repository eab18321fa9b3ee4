//! Single-client pcap-over-TCP server
//!
//! Producers push through a [`SinkHandle`]; the sink task pops one record at
//! a time and writes it to the connected client. Nothing is buffered while no
//! client is connected, and whatever is still queued when a client drops is
//! discarded.

use std::collections::VecDeque;
use std::marker::PhantomData;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use diagtap_core::FrameSink;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::SinkError;
use crate::format::{encode_global_header, encode_record, RecordEncoder};

/// Idle wait when the queue is empty
pub const SEND_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Longest wait in accept before the running flag is checked again
pub const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Pushes and connection changes serialize on this lock
struct Shared<T> {
    queue: Mutex<Queue<T>>,
}

struct Queue<T> {
    items: VecDeque<T>,
    connected: bool,
}

impl<T> Shared<T> {
    fn new() -> Self {
        Self {
            queue: Mutex::new(Queue {
                items: VecDeque::new(),
                connected: false,
            }),
        }
    }

    fn set_connected(&self, connected: bool) {
        let mut queue = self.queue.lock();
        queue.connected = connected;
        queue.items.clear();
    }

    fn pop(&self) -> Option<T> {
        self.queue.lock().items.pop_front()
    }
}

/// Producer side of a [`PcapStreamSink`]
pub struct SinkHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for SinkHandle<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> SinkHandle<T> {
    /// Queue `item` for the connected client; dropped when nobody listens
    pub fn push(&self, item: T) -> bool {
        let mut queue = self.shared.queue.lock();
        if !queue.connected {
            return false;
        }
        queue.items.push_back(item);
        true
    }

    pub fn is_connected(&self) -> bool {
        self.shared.queue.lock().connected
    }

    /// Records waiting to be written
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().items.len()
    }
}

impl<T: Send> FrameSink<T> for SinkHandle<T> {
    fn submit(&self, item: T) {
        self.push(item);
    }
}

/// TCP server streaming one pcap encoding
pub struct PcapStreamSink<E: RecordEncoder> {
    name: &'static str,
    listener: TcpListener,
    shared: Arc<Shared<E::Item>>,
    _encoder: PhantomData<E>,
}

impl<E: RecordEncoder> PcapStreamSink<E> {
    /// Bind the listening socket; `name` labels log output
    pub async fn bind(name: &'static str, addr: SocketAddr) -> Result<Self, SinkError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| SinkError::Bind { addr, source })?;
        info!(sink = name, addr = %listener.local_addr()?, "Waiting for pcap client");

        Ok(Self {
            name,
            listener,
            shared: Arc::new(Shared::new()),
            _encoder: PhantomData,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SinkError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn handle(&self) -> SinkHandle<E::Item> {
        SinkHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Accept and serve clients until `running` is cleared
    pub fn spawn(self, running: Arc<AtomicBool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(running).await })
    }

    async fn run(self, running: Arc<AtomicBool>) {
        while running.load(Ordering::SeqCst) {
            let accepted =
                match tokio::time::timeout(ACCEPT_POLL_INTERVAL, self.listener.accept()).await {
                    Ok(accepted) => accepted,
                    Err(_) => continue,
                };

            match accepted {
                Ok((stream, peer)) => {
                    info!(sink = self.name, %peer, "Client connected");
                    self.shared.set_connected(true);
                    if let Err(e) = self.serve(stream, peer, &running).await {
                        debug!(sink = self.name, error = %e, "Client session ended");
                    }
                    self.shared.set_connected(false);
                    info!(sink = self.name, %peer, "Client disconnected");
                }
                Err(e) => {
                    warn!(sink = self.name, error = %e, "Accept failed");
                    tokio::time::sleep(ACCEPT_POLL_INTERVAL).await;
                }
            }
        }
        debug!(sink = self.name, "pcap sink stopped");
    }

    async fn serve(
        &self,
        mut stream: TcpStream,
        peer: SocketAddr,
        running: &AtomicBool,
    ) -> Result<(), SinkError> {
        let write_err = |source| SinkError::ClientWrite { peer, source };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
        }

        let mut buf = BytesMut::new();
        encode_global_header(E::LINK_TYPE, &mut buf);
        stream.write_all(&buf).await.map_err(write_err)?;

        while running.load(Ordering::SeqCst) {
            match self.shared.pop() {
                Some(item) => {
                    buf.clear();
                    encode_record::<E>(&item, &mut buf);
                    stream.write_all(&buf).await.map_err(write_err)?;
                }
                None => {
                    tokio::select! {
                        _ = tokio::time::sleep(SEND_POLL_INTERVAL) => {}
                        ready = stream.readable() => {
                            ready?;
                            if peer_closed(&stream) {
                                return Ok(());
                            }
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Drain anything the client sent; true once it hung up
fn peer_closed(stream: &TcpStream) -> bool {
    let mut scratch = [0u8; 64];
    match stream.try_read(&mut scratch) {
        Ok(0) => true,
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::{
        RawIpEncoder, SocketCanEncoder, GLOBAL_HEADER_SIZE, RECORD_HEADER_SIZE,
        SOCKETCAN_RECORD_SIZE,
    };
    use diagtap_core::{CanMessage, DecodedDatagram, ProtocolTag};
    use tokio::io::AsyncReadExt;

    async fn start<E: RecordEncoder>() -> (SocketAddr, SinkHandle<E::Item>, Arc<AtomicBool>) {
        let sink = PcapStreamSink::<E>::bind("test", "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = sink.local_addr().unwrap();
        let handle = sink.handle();
        let running = Arc::new(AtomicBool::new(true));
        sink.spawn(running.clone());
        (addr, handle, running)
    }

    async fn connect<T>(addr: SocketAddr, handle: &SinkHandle<T>) -> TcpStream {
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut header = [0u8; GLOBAL_HEADER_SIZE];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut header))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&header[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
        assert!(handle.is_connected());
        client
    }

    async fn wait_disconnected<T>(handle: &SinkHandle<T>) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while handle.is_connected() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("sink never noticed the disconnect");
    }

    #[tokio::test]
    async fn test_push_without_client_drops() {
        let (_addr, handle, running) = start::<SocketCanEncoder>().await;
        assert!(!handle.push(CanMessage::new(0x100, &[1], 0)));
        assert_eq!(handle.queued(), 0);
        running.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_records_streamed_in_order() {
        let (addr, handle, running) = start::<SocketCanEncoder>().await;
        let mut client = connect(addr, &handle).await;

        for i in 0..5u32 {
            assert!(handle.push(CanMessage::new(0x700 + i, &[i as u8], 1000 * i as u64)));
        }

        let record_len = RECORD_HEADER_SIZE + SOCKETCAN_RECORD_SIZE;
        let mut data = vec![0u8; record_len * 5];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut data))
            .await
            .unwrap()
            .unwrap();

        for (i, record) in data.chunks(record_len).enumerate() {
            assert_eq!(&record[0..4], &(i as u32).to_le_bytes());
            let id = u32::from_be_bytes([record[16], record[17], record[18], record[19]]);
            assert_eq!(id, 0x700 + i as u32);
        }
        running.store(false, Ordering::SeqCst);
    }

    #[tokio::test]
    async fn test_disconnect_then_new_client() {
        let (addr, handle, running) = start::<RawIpEncoder>().await;
        let client = connect(addr, &handle).await;
        drop(client);
        wait_disconnected(&handle).await;

        // Nothing survives into the next session
        assert!(!handle.push(DecodedDatagram::new(ProtocolTag::Kw1281, 0, 0, vec![1])));

        let mut client = connect(addr, &handle).await;
        handle.push(DecodedDatagram::new(ProtocolTag::Iso14230, 2, 0, vec![0x81, 0x10]));
        let mut record = [0u8; RECORD_HEADER_SIZE + 22];
        tokio::time::timeout(Duration::from_secs(2), client.read_exact(&mut record))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record[RECORD_HEADER_SIZE + 9], ProtocolTag::Iso14230.as_u8());
        assert_eq!(&record[RECORD_HEADER_SIZE + 20..], &[0x81, 0x10]);
        running.store(false, Ordering::SeqCst);
    }
}
