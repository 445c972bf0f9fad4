//! Server configuration

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Default cap on pooled tunnel sockets per client.
pub const DEFAULT_MAX_SOCKETS: usize = 10;

/// How long a tunnel may sit with zero pooled sockets before it destroys
/// itself.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Tunnel server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the public listener and per-client listeners bind to
    pub address: IpAddr,
    /// Port for the public HTTP listener
    pub port: u16,
    /// Apex domain tunnels are exposed under. When unset, any hostname with
    /// three or more labels routes by its leftmost label.
    pub domain: Option<String>,
    /// Advertise `https://` urls in API responses
    pub secure: bool,
    /// Per-client cap on pooled tunnel sockets
    pub max_sockets: usize,
    /// Zero-socket lifetime before a tunnel is reclaimed
    pub idle_timeout: Duration,
    /// Where `GET /` without `?new` redirects to
    pub landing_url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            domain: None,
            secure: false,
            max_sockets: DEFAULT_MAX_SOCKETS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            landing_url: "https://burrow.dev".to_string(),
        }
    }
}

impl ServerConfig {
    /// URL scheme matching the `secure` flag.
    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }
}
