//! Public-facing tunnel server

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{debug, info, warn};

use crate::dispatch::RequestDispatcher;

/// Accept loop for the public HTTP listener. Every connection is handed to
/// the dispatcher on its own task.
pub struct TunnelServer {
    listener: TcpListener,
    dispatcher: Arc<RequestDispatcher>,
}

impl TunnelServer {
    /// Bind the public listener.
    pub async fn bind(addr: SocketAddr, dispatcher: Arc<RequestDispatcher>) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            dispatcher,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Run the accept loop forever.
    pub async fn run(self) {
        self.run_until(std::future::pending()).await
    }

    /// Run the accept loop until `shutdown` completes.
    pub async fn run_until(self, shutdown: impl std::future::Future<Output = ()>) {
        if let Ok(addr) = self.listener.local_addr() {
            info!(addr = %addr, "public tunnel server listening");
        }
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("public tunnel server shutting down");
                    return;
                }
                result = self.listener.accept() => match result {
                    Ok((stream, peer_addr)) => {
                        debug!(peer = %peer_addr, "accepted public connection");
                        let dispatcher = Arc::clone(&self.dispatcher);
                        tokio::spawn(dispatcher.handle_connection(stream, peer_addr));
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to accept public connection");
                    }
                },
            }
        }
    }
}
