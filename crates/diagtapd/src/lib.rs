//! diagtapd - passive diagnostic bus monitor
//!
//! Wires a bus backend to the protocol decoders and streams the result as
//! two live pcap feeds:
//!
//! ```text
//!  CanInterface ──▶ CanMonitor ──▶ CanFrameRouter ──┬──▶ can sink (raw frames)
//!                                                   └──▶ raw sink (datagrams)
//!  KLineInterface ─▶ KLineMonitor ─▶ KLineDecoder ──────▶ raw sink (datagrams)
//! ```

pub mod config;
pub mod monitor;

pub use config::{CliOverrides, DaemonConfig};
pub use monitor::{join_background_tasks, CanMonitor, KLineMonitor, LogDatagrams, MonitorStats};
