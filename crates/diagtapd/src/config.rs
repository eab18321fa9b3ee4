//! Daemon configuration: TOML file merged under command-line flags

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use diagtap_transport::{KLineConfig, SocketCanConfig, SourceConfig};
use serde::{Deserialize, Serialize};

pub const DEFAULT_RAW_PORT: u16 = 19000;
pub const DEFAULT_CAN_PORT: u16 = 19001;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub sinks: SinkConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub filter: FilterConfig,
}

/// Listening sockets of the two pcap streams
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    /// Decoded datagrams, raw-IP link type
    #[serde(default = "default_raw_port")]
    pub raw_port: u16,
    /// Raw CAN frames, SocketCAN link type
    #[serde(default = "default_can_port")]
    pub can_port: u16,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            raw_port: DEFAULT_RAW_PORT,
            can_port: DEFAULT_CAN_PORT,
        }
    }
}

impl SinkConfig {
    pub fn raw_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.raw_port)
    }

    pub fn can_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.can_port)
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_raw_port() -> u16 {
    DEFAULT_RAW_PORT
}

fn default_can_port() -> u16 {
    DEFAULT_CAN_PORT
}

/// Optional CAN-ID filter file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// Command-line values that take precedence over the file
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub can: Option<String>,
    pub kline: Option<PathBuf>,
    pub kline_tcp: Option<String>,
    pub baud_rate: Option<u32>,
    pub canids: Option<PathBuf>,
    pub raw_port: Option<u16>,
    pub can_port: Option<u16>,
}

impl DaemonConfig {
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Apply command-line flags over the file values
    pub fn merge_with_args(mut self, args: &CliOverrides) -> Result<Self> {
        let sources = [
            args.can.is_some(),
            args.kline.is_some(),
            args.kline_tcp.is_some(),
        ];
        if sources.iter().filter(|&&set| set).count() > 1 {
            bail!("--can, --kline and --kline-tcp are mutually exclusive");
        }

        let baud_rate = args.baud_rate.unwrap_or_else(|| self.source.baud_rate());
        if let Some(interface) = &args.can {
            self.source = SourceConfig::SocketCan(SocketCanConfig {
                interface: interface.clone(),
            });
        } else if let Some(path) = &args.kline {
            self.source = SourceConfig::KLine(KLineConfig {
                path: Some(path.clone()),
                tcp: None,
                baud_rate,
            });
        } else if let Some(addr) = &args.kline_tcp {
            self.source = SourceConfig::KLine(KLineConfig {
                path: None,
                tcp: Some(addr.clone()),
                baud_rate,
            });
        } else if let SourceConfig::KLine(cfg) = &mut self.source {
            cfg.baud_rate = baud_rate;
        }

        if let Some(path) = &args.canids {
            self.filter.path = Some(path.clone());
        }
        if let Some(port) = args.raw_port {
            self.sinks.raw_port = port;
        }
        if let Some(port) = args.can_port {
            self.sinks.can_port = port;
        }
        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use diagtap_transport::BusKind;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let cfg = DaemonConfig::default();
        assert_eq!(cfg.sinks.raw_addr().port(), 19000);
        assert_eq!(cfg.sinks.can_addr().port(), 19001);
        assert_eq!(cfg.source.bus(), BusKind::Can);
        assert!(cfg.filter.path.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
[sinks]
bind = "127.0.0.1"
raw_port = 29000

[source]
type = "kline"
path = "/dev/ttyUSB0"
baud_rate = 9600

[filter]
path = "canids.toml"
"#
        )
        .unwrap();

        let cfg = DaemonConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.sinks.raw_addr(), "127.0.0.1:29000".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.sinks.can_port, DEFAULT_CAN_PORT);
        assert_eq!(cfg.source.bus(), BusKind::KLine);
        assert_eq!(cfg.source.baud_rate(), 9600);
        assert_eq!(cfg.filter.path, Some(PathBuf::from("canids.toml")));
    }

    #[test]
    fn test_load_errors_carry_path() {
        let err = DaemonConfig::load_from(Path::new("/nonexistent/diagtapd.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/diagtapd.toml"));
    }

    #[test]
    fn test_args_override_file() {
        let file_cfg: DaemonConfig =
            toml::from_str("[source]\ntype = \"socketcan\"\ninterface = \"can0\"").unwrap();

        let merged = file_cfg
            .merge_with_args(&CliOverrides {
                kline_tcp: Some("10.0.0.2:4000".to_string()),
                baud_rate: Some(4800),
                canids: Some(PathBuf::from("ids.toml")),
                can_port: Some(20001),
                ..Default::default()
            })
            .unwrap();

        match &merged.source {
            SourceConfig::KLine(k) => {
                assert_eq!(k.tcp.as_deref(), Some("10.0.0.2:4000"));
                assert_eq!(k.baud_rate, 4800);
            }
            other => panic!("Expected K-Line source, got {:?}", other),
        }
        assert_eq!(merged.filter.path, Some(PathBuf::from("ids.toml")));
        assert_eq!(merged.sinks.can_port, 20001);
        assert_eq!(merged.sinks.raw_port, DEFAULT_RAW_PORT);
    }

    #[test]
    fn test_baud_rate_applies_to_file_kline_source() {
        let file_cfg: DaemonConfig =
            toml::from_str("[source]\ntype = \"kline\"\npath = \"/dev/ttyS0\"").unwrap();
        let merged = file_cfg
            .merge_with_args(&CliOverrides {
                baud_rate: Some(9600),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(merged.source.baud_rate(), 9600);
    }

    #[test]
    fn test_conflicting_sources_rejected() {
        let result = DaemonConfig::default().merge_with_args(&CliOverrides {
            can: Some("can0".to_string()),
            kline: Some(PathBuf::from("/dev/ttyUSB0")),
            ..Default::default()
        });
        assert!(result.is_err());
    }
}
