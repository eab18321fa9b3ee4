//! Source configuration

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Standard K-Line rate before any StartDiagnosticSession renegotiation
pub const DEFAULT_KLINE_BAUD_RATE: u32 = 10400;

/// Which bus a source delivers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    #[default]
    Can,
    KLine,
}

/// Traffic source configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceConfig {
    /// Raw SocketCAN interface (Linux only)
    SocketCan(SocketCanConfig),
    /// K-Line byte stream from a serial device or a TCP serial bridge
    KLine(KLineConfig),
    /// Injected traffic for testing
    Mock(MockConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

impl SourceConfig {
    pub fn bus(&self) -> BusKind {
        match self {
            SourceConfig::SocketCan(_) => BusKind::Can,
            SourceConfig::KLine(_) => BusKind::KLine,
            SourceConfig::Mock(cfg) => cfg.bus,
        }
    }

    /// Configured K-Line rate, restored whenever the bus goes idle
    pub fn baud_rate(&self) -> u32 {
        match self {
            SourceConfig::KLine(cfg) => cfg.baud_rate,
            _ => DEFAULT_KLINE_BAUD_RATE,
        }
    }

    /// Short label for logs
    pub fn describe(&self) -> String {
        match self {
            SourceConfig::SocketCan(cfg) => format!("socketcan:{}", cfg.interface),
            SourceConfig::KLine(cfg) => match (&cfg.path, &cfg.tcp) {
                (Some(path), _) => format!("kline:{}", path.display()),
                (None, Some(addr)) => format!("kline:tcp://{}", addr),
                (None, None) => "kline:<unset>".to_string(),
            },
            SourceConfig::Mock(cfg) => format!("mock:{:?}", cfg.bus).to_lowercase(),
        }
    }
}

/// SocketCAN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketCanConfig {
    /// CAN interface name (e.g., "can0")
    pub interface: String,
}

/// K-Line byte stream configuration; exactly one of `path` and `tcp`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KLineConfig {
    /// Serial device, line settings already applied by the OS
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// `host:port` of a serial-over-TCP bridge
    #[serde(default)]
    pub tcp: Option<String>,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
}

fn default_baud_rate() -> u32 {
    DEFAULT_KLINE_BAUD_RATE
}

/// Mock source configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    #[serde(default)]
    pub bus: BusKind,
}
