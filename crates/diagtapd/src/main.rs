//! diagtapd - passive K-Line/CAN diagnostic monitor
//!
//! Listens on a CAN interface or a K-Line byte stream without transmitting,
//! decodes the diagnostic traffic and serves two live pcap streams:
//! decoded datagrams (raw IP) and raw CAN frames (SocketCAN).
//!
//! # Usage
//!
//! ```bash
//! ./diagtapd --can can0 --canids canids.toml
//! ./diagtapd --kline /dev/ttyUSB0 --baud-rate 10400
//! wireshark -k -i TCP@127.0.0.1:19000
//! ```

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use diagtap_core::filter::RELOAD_POLL_INTERVAL;
use diagtap_core::{
    AutoDetect, CanFrameRouter, CanIdClassifier, CanIdFilter, CanMessage, DecodedDatagram,
    KLineDecoder,
};
use diagtap_pcap::{CanSink, RawSink, SinkHandle};
use diagtap_transport::{create_can_interface, create_kline_interface, BusKind};
use diagtapd::{
    join_background_tasks, CanMonitor, CliOverrides, DaemonConfig, KLineMonitor, LogDatagrams,
    MonitorStats,
};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Grace period for each task after shutdown was requested
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "diagtapd", version)]
#[command(about = "Passive K-Line/CAN diagnostic monitor streaming pcap over TCP")]
struct Args {
    /// Configuration file (TOML); flags below take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Monitor this SocketCAN interface
    #[arg(long, value_name = "IFACE")]
    can: Option<String>,

    /// Monitor a K-Line serial device
    #[arg(long, value_name = "PATH")]
    kline: Option<PathBuf>,

    /// Monitor a K-Line serial-over-TCP bridge
    #[arg(long, value_name = "ADDR")]
    kline_tcp: Option<String>,

    /// Default K-Line baud rate
    #[arg(short, long)]
    baud_rate: Option<u32>,

    /// CAN-ID filter file, reloaded on change
    #[arg(short = 'i', long, value_name = "FILE")]
    canids: Option<PathBuf>,

    /// TCP port of the decoded datagram stream
    #[arg(long)]
    raw_port: Option<u16>,

    /// TCP port of the raw CAN frame stream
    #[arg(long)]
    can_port: Option<u16>,

    /// Log decoder activity
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            can: self.can.clone(),
            kline: self.kline.clone(),
            kline_tcp: self.kline_tcp.clone(),
            baud_rate: self.baud_rate,
            canids: self.canids.clone(),
            raw_port: self.raw_port,
            can_port: self.can_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose {
        "diagtapd=debug,diagtap_core=debug,diagtap_pcap=info,diagtap_transport=debug"
    } else {
        "diagtapd=info,diagtap_core=info,diagtap_pcap=info,diagtap_transport=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = match &args.config {
        Some(path) => {
            info!("Loading config from: {}", path.display());
            DaemonConfig::load_from(path)?
        }
        None => DaemonConfig::default(),
    }
    .merge_with_args(&args.overrides())?;

    info!(source = %config.source.describe(), "Starting diagtapd");

    let running = Arc::new(AtomicBool::new(true));
    let mut tasks = Vec::new();

    let raw_sink = RawSink::bind("raw", config.sinks.raw_addr())
        .await
        .context("Failed to start the datagram stream")?;
    let datagrams = LogDatagrams(raw_sink.handle());
    tasks.push(raw_sink.spawn(running.clone()));

    let result = match config.source.bus() {
        BusKind::Can => {
            let can_sink = CanSink::bind("can", config.sinks.can_addr())
                .await
                .context("Failed to start the CAN frame stream")?;
            let frames = can_sink.handle();
            tasks.push(can_sink.spawn(running.clone()));
            monitor_can(&config, datagrams, frames, &running, &mut tasks).await
        }
        BusKind::KLine => monitor_kline(&config, datagrams, &running).await,
    };

    running.store(false, Ordering::SeqCst);
    let unclean = join_background_tasks(tasks, SHUTDOWN_TIMEOUT).await;
    if unclean > 0 {
        warn!(tasks = unclean, "Background tasks did not shut down cleanly");
    }

    let stats = result?;
    info!(
        received = stats.received,
        datagrams = stats.datagrams,
        lagged = stats.lagged,
        "diagtapd stopped"
    );
    Ok(())
}

async fn monitor_can(
    config: &DaemonConfig,
    datagrams: LogDatagrams<SinkHandle<DecodedDatagram>>,
    frames: SinkHandle<CanMessage>,
    running: &Arc<AtomicBool>,
    tasks: &mut Vec<JoinHandle<()>>,
) -> Result<MonitorStats> {
    let classifier: Arc<dyn CanIdClassifier> = match &config.filter.path {
        Some(path) => {
            let filter = CanIdFilter::load(path.clone())
                .with_context(|| format!("Failed to load CAN-ID filter {}", path.display()))?;
            tasks.push(filter.spawn_reload_task(RELOAD_POLL_INTERVAL, running.clone()));
            Arc::new(filter)
        }
        None => {
            info!("No CAN-ID filter, VWTP2.0 channels are detected from their setup frames");
            Arc::new(AutoDetect::new())
        }
    };

    let interface = create_can_interface(&config.source)
        .await
        .context("Failed to open CAN interface")?;
    let router = CanFrameRouter::new(classifier, datagrams, frames);
    let monitor = tokio::spawn(CanMonitor::new(interface.clone()).run(router, running.clone()));

    let stats = wait_for_shutdown(monitor, running).await;
    interface.close().await;
    stats
}

async fn monitor_kline(
    config: &DaemonConfig,
    datagrams: LogDatagrams<SinkHandle<DecodedDatagram>>,
    running: &Arc<AtomicBool>,
) -> Result<MonitorStats> {
    let interface = create_kline_interface(&config.source)
        .await
        .context("Failed to open K-Line interface")?;
    let monitor = KLineMonitor::new(
        interface.clone(),
        KLineDecoder::new(),
        datagrams,
        config.source.baud_rate(),
    );
    let monitor = tokio::spawn(monitor.run(running.clone()));

    let stats = wait_for_shutdown(monitor, running).await;
    interface.close().await;
    stats
}

/// Run until Ctrl+C or until the monitor ends on its own
async fn wait_for_shutdown(
    mut monitor: JoinHandle<MonitorStats>,
    running: &Arc<AtomicBool>,
) -> Result<MonitorStats> {
    let finished = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                error!(error = %e, "Failed to listen for Ctrl+C");
            }
            info!("Shutting down...");
            None
        }
        joined = &mut monitor => {
            warn!("Bus source ended");
            Some(joined)
        }
    };
    running.store(false, Ordering::SeqCst);

    let joined = match finished {
        Some(joined) => joined,
        None => tokio::time::timeout(SHUTDOWN_TIMEOUT, monitor)
            .await
            .context("Monitor did not stop in time")?,
    };
    joined.context("Monitor task failed")
}
