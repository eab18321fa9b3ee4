//! End-to-end tests for the diagtap monitor
//!
//! Every test runs the real pipeline against a loopback TCP client:
//! mock bus interface → monitor → decoders → pcap sink → `TcpStream`.
//! No CAN hardware or serial device is needed.
//!
//! ```bash
//! cargo test -p diagtap-tests
//! ```
//!
//! # Test Structure
//!
//! - `kline_pipeline_test.rs` - K-Line bytes to the raw-IP stream
//! - `can_pipeline_test.rs` - CAN frames to both streams, filter file included

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use diagtap_pcap::format::{GLOBAL_HEADER_SIZE, IPV4_HEADER_SIZE, RECORD_HEADER_SIZE};
use diagtap_pcap::{PcapStreamSink, RecordEncoder, SinkHandle};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

/// Upper bound for anything a test waits on
pub const TEST_TIMEOUT: Duration = Duration::from_secs(2);

/// A sink bound to an ephemeral loopback port and already serving
pub struct RunningSink<T> {
    pub addr: SocketAddr,
    pub handle: SinkHandle<T>,
    running: Arc<AtomicBool>,
}

impl<T> RunningSink<T> {
    pub async fn start<E: RecordEncoder<Item = T>>() -> Self {
        let sink = PcapStreamSink::<E>::bind("e2e", "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = sink.local_addr().unwrap();
        let handle = sink.handle();
        let running = Arc::new(AtomicBool::new(true));
        sink.spawn(running.clone());
        Self {
            addr,
            handle,
            running,
        }
    }

    /// Connect a client and wait until the sink accepts records for it
    pub async fn connect(&self) -> PcapClient {
        let client = PcapClient::connect(self.addr).await;
        assert!(self.handle.is_connected());
        client
    }
}

impl<T> Drop for RunningSink<T> {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// One pcap record as read off the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PcapRecord {
    pub ts_sec: u32,
    pub ts_usec: u32,
    pub data: Vec<u8>,
}

impl PcapRecord {
    pub fn timestamp_ms(&self) -> u64 {
        self.ts_sec as u64 * 1000 + self.ts_usec as u64 / 1000
    }

    /// IPv4 protocol field of a raw-IP record
    pub fn ip_protocol(&self) -> u8 {
        self.data[9]
    }

    /// IPv4 destination address of a raw-IP record, the datagram source id
    pub fn ip_destination(&self) -> u32 {
        u32::from_be_bytes([self.data[16], self.data[17], self.data[18], self.data[19]])
    }

    /// Bytes behind the IPv4 header of a raw-IP record
    pub fn ip_payload(&self) -> &[u8] {
        &self.data[IPV4_HEADER_SIZE..]
    }

    /// CAN id of a SocketCAN record, flags included
    pub fn can_id(&self) -> u32 {
        u32::from_be_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }

    /// Data bytes of a SocketCAN record, cut to its DLC
    pub fn can_data(&self) -> &[u8] {
        let dlc = self.data[4] as usize;
        &self.data[8..8 + dlc]
    }
}

/// Reads a pcap stream the way a capture tool would
pub struct PcapClient {
    stream: TcpStream,
    pub link_type: u32,
}

impl PcapClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut header = [0u8; GLOBAL_HEADER_SIZE];
        tokio::time::timeout(TEST_TIMEOUT, stream.read_exact(&mut header))
            .await
            .expect("no pcap global header")
            .unwrap();
        assert_eq!(&header[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);
        let link_type = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        Self { stream, link_type }
    }

    pub async fn read_record(&mut self) -> PcapRecord {
        tokio::time::timeout(TEST_TIMEOUT, self.read_record_inner())
            .await
            .expect("no pcap record")
    }

    /// Expect silence on the stream for `wait`
    pub async fn assert_idle(&mut self, wait: Duration) {
        let mut byte = [0u8; 1];
        if let Ok(read) = tokio::time::timeout(wait, self.stream.read(&mut byte)).await {
            panic!("unexpected data on pcap stream: {:?}", read);
        }
    }

    async fn read_record_inner(&mut self) -> PcapRecord {
        let mut header = [0u8; RECORD_HEADER_SIZE];
        self.stream.read_exact(&mut header).await.unwrap();
        let field = |i: usize| {
            u32::from_le_bytes([header[i], header[i + 1], header[i + 2], header[i + 3]])
        };
        let (ts_sec, ts_usec, incl_len, orig_len) = (field(0), field(4), field(8), field(12));
        assert_eq!(incl_len, orig_len);

        let mut data = vec![0u8; incl_len as usize];
        self.stream.read_exact(&mut data).await.unwrap();
        PcapRecord {
            ts_sec,
            ts_usec,
            data,
        }
    }
}

/// Poll `condition` until it holds or [`TEST_TIMEOUT`] runs out
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(TEST_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never held");
}
