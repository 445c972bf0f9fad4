//! Shared management API state

use std::sync::Arc;

use burrow_core::ServerConfig;
use burrow_tunnel::ClientRegistry;

/// State threaded through every management handler.
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<ClientRegistry>,
    pub config: Arc<ServerConfig>,
}
