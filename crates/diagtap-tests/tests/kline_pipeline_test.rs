//! K-Line bytes through the monitor to the raw-IP pcap stream

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use diagtap_core::kline::iso14230::checksum;
use diagtap_core::{DecodedDatagram, KLineDecoder, ManualClock, ProtocolTag};
use diagtap_pcap::{RawIpEncoder, LINKTYPE_RAW};
use diagtap_tests::{wait_until, RunningSink, TEST_TIMEOUT};
use diagtap_transport::mock::MockKLineInterface;
use diagtap_transport::KLineInterface;
use diagtapd::{KLineMonitor, LogDatagrams};

fn iso_frame(bytes: &[u8]) -> Vec<u8> {
    let mut frame = bytes.to_vec();
    frame.push(checksum(bytes));
    frame
}

#[tokio::test]
async fn test_kline_session_streamed_as_raw_ip() {
    let sink = RunningSink::<DecodedDatagram>::start::<RawIpEncoder>().await;
    let mut client = sink.connect().await;
    assert_eq!(client.link_type, LINKTYPE_RAW);

    let kline = Arc::new(MockKLineInterface::new());
    let monitor = KLineMonitor::new(
        kline.clone(),
        KLineDecoder::with_clock(ManualClock::new(1500)),
        LogDatagrams(sink.handle.clone()),
        10400,
    );
    let task = tokio::spawn(monitor.run(Arc::new(AtomicBool::new(true))));

    let init = vec![0x55, 0xEF, 0x8F, 0x70, 0xEE];
    let request = iso_frame(&[0x81, 0x10, 0xF1, 0x81]);
    let response = iso_frame(&[0x83, 0xF1, 0x10, 0xC1, 0xEF, 0x8F]);
    let mut stream = init.clone();
    stream.extend_from_slice(&request);
    stream.extend_from_slice(&response);
    // Arbitrary chunking, as a serial adapter would deliver it
    for chunk in stream.chunks(4) {
        kline.inject(chunk.to_vec());
    }

    for expected in [&init, &request, &response] {
        let record = client.read_record().await;
        assert_eq!(record.ip_protocol(), ProtocolTag::Iso14230.as_u8());
        assert_eq!(record.ip_destination(), 0);
        assert_eq!(record.ip_payload(), expected.as_slice());
        assert_eq!((record.ts_sec, record.ts_usec), (1, 500_000));
        assert_eq!(record.timestamp_ms(), 1500);
    }

    kline.close().await;
    let stats = tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
    assert_eq!(stats.datagrams, 3);
}

#[tokio::test]
async fn test_datagrams_before_connect_are_not_replayed() {
    let sink = RunningSink::<DecodedDatagram>::start::<RawIpEncoder>().await;

    let kline = Arc::new(MockKLineInterface::new());
    let monitor = KLineMonitor::new(
        kline.clone(),
        KLineDecoder::with_clock(ManualClock::new(0)),
        sink.handle.clone(),
        10400,
    );
    let decoder = monitor.decoder();
    let task = tokio::spawn(monitor.run(Arc::new(AtomicBool::new(true))));

    kline.inject(iso_frame(&[0x81, 0x10, 0xF1, 0x3E]));
    wait_until(|| decoder.lock().frames_decoded() == 1).await;
    assert_eq!(sink.handle.queued(), 0);

    let mut client = sink.connect().await;
    let second = iso_frame(&[0x82, 0xF1, 0x10, 0x7E, 0x00]);
    kline.inject(second.clone());

    let record = client.read_record().await;
    assert_eq!(record.ip_payload(), second.as_slice());
    client.assert_idle(Duration::from_millis(100)).await;

    kline.close().await;
    tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
}

#[tokio::test]
async fn test_kw1281_blocks_tagged_on_the_wire() {
    let sink = RunningSink::<DecodedDatagram>::start::<RawIpEncoder>().await;
    let mut client = sink.connect().await;

    let kline = Arc::new(MockKLineInterface::new());
    let monitor = KLineMonitor::new(
        kline.clone(),
        KLineDecoder::with_clock(ManualClock::new(0)),
        sink.handle.clone(),
        10400,
    );
    let task = tokio::spawn(monitor.run(Arc::new(AtomicBool::new(true))));

    kline.inject(vec![0x55, 0x01, 0x8A, 0x75]);
    // Length 3, counter 1, title 0x09 (ACK), ETX
    kline.inject(vec![0x03, 0xFC, 0x01, 0xFE, 0x09, 0xF6, 0x03]);

    let init = client.read_record().await;
    assert_eq!(init.ip_protocol(), ProtocolTag::Iso14230.as_u8());
    let block = client.read_record().await;
    assert_eq!(block.ip_protocol(), ProtocolTag::Kw1281.as_u8());
    assert_eq!(block.ip_payload(), &[0x03, 0x01, 0x09, 0x03]);

    kline.close().await;
    tokio::time::timeout(TEST_TIMEOUT, task).await.unwrap().unwrap();
}
