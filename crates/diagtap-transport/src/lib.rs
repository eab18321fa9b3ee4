//! diagtap-transport - receive-only bus backends
//!
//! Backends are selected from configuration at startup:
//! - SocketCAN raw socket (Linux, `socketcan` feature)
//! - K-Line byte stream from a serial device or TCP bridge
//! - Mock interfaces for testing
//!
//! # Example
//!
//! ```ignore
//! use diagtap_transport::{create_can_interface, SourceConfig};
//!
//! let can = create_can_interface(&config.source).await?;
//! let mut frames = can.subscribe();
//! while let Ok(frame) = frames.recv().await {
//!     router.route(frame);
//! }
//! ```

pub mod config;
pub mod error;
mod interface;
pub mod mock;
pub mod stream;

#[cfg(all(target_os = "linux", feature = "socketcan"))]
pub mod socketcan;

pub use config::{
    BusKind, KLineConfig, MockConfig, SocketCanConfig, SourceConfig, DEFAULT_KLINE_BAUD_RATE,
};
pub use error::TransportError;
pub use interface::{CanInterface, KLineInterface, SUBSCRIBER_CAPACITY};

use std::sync::Arc;

/// Open the CAN backend named by `config`
pub async fn create_can_interface(
    config: &SourceConfig,
) -> Result<Arc<dyn CanInterface>, TransportError> {
    match config {
        #[cfg(all(target_os = "linux", feature = "socketcan"))]
        SourceConfig::SocketCan(cfg) => {
            let interface = socketcan::SocketCanInterface::new(cfg).await?;
            Ok(Arc::new(interface))
        }
        #[cfg(not(all(target_os = "linux", feature = "socketcan")))]
        SourceConfig::SocketCan(_) => Err(TransportError::Unsupported(
            "SocketCAN requires Linux and the 'socketcan' feature".to_string(),
        )),
        SourceConfig::Mock(cfg) if cfg.bus == BusKind::Can => {
            Ok(Arc::new(mock::MockCanInterface::new()))
        }
        other => Err(TransportError::InvalidConfig(format!(
            "{} does not deliver CAN frames",
            other.describe()
        ))),
    }
}

/// Open the K-Line backend named by `config`
pub async fn create_kline_interface(
    config: &SourceConfig,
) -> Result<Arc<dyn KLineInterface>, TransportError> {
    match config {
        SourceConfig::KLine(cfg) => {
            let interface = stream::StreamKLineInterface::open(cfg).await?;
            Ok(Arc::new(interface))
        }
        SourceConfig::Mock(cfg) if cfg.bus == BusKind::KLine => {
            Ok(Arc::new(mock::MockKLineInterface::new()))
        }
        other => Err(TransportError::InvalidConfig(format!(
            "{} does not deliver K-Line bytes",
            other.describe()
        ))),
    }
}
