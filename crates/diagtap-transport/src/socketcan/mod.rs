//! SocketCAN backend (Linux only)

mod adapter;

pub use adapter::SocketCanInterface;
