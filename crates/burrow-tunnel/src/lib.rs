//! Tunnel routing engine.
//!
//! A tunnel client dials the per-client port handed out by the registry and
//! opens a pool of plain TCP connections. Public requests borrow one pooled
//! socket at a time; WebSocket upgrades consume one outright. This crate
//! owns that machinery: the [`SocketPool`] with its FIFO waiter queue, the
//! [`ClientTunnel`] listener and lifecycle, and the process-wide
//! [`ClientRegistry`].

pub mod pool;
pub mod registry;
pub mod socket;
pub mod tunnel;

pub use pool::{SocketPool, SocketWaiter};
pub use registry::{ClientRegistry, RegistryStats};
pub use socket::TunnelSocket;
pub use tunnel::{ClientTunnel, TunnelInfo, TunnelOptions};
