//! Per-client tunnel: ephemeral listener, socket pool and lifecycle
//!
//! A tunnel moves through `created -> started -> active -> ended`. Start
//! binds an OS-chosen port and spawns three workers: the accept loop feeding
//! the pool, the idle timer that reclaims a tunnel sitting at zero sockets,
//! and a sweeper that evicts idle sockets whose client hung up. `close`
//! drains the pool's waiters before the terminal end signal fires, so every
//! queued handler observes its `None` first.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use burrow_core::{ClientId, Error, Result, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_SOCKETS};

use crate::pool::SocketPool;
use crate::socket::TunnelSocket;

/// How often idle sockets are probed for client hangups.
const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Knobs shared by every tunnel a registry creates.
#[derive(Debug, Clone)]
pub struct TunnelOptions {
    /// Address the per-client listener binds to
    pub bind_addr: IpAddr,
    /// Cap on concurrently pooled sockets
    pub max_sockets: usize,
    /// Zero-socket lifetime before the tunnel destroys itself
    pub idle_timeout: Duration,
}

impl Default for TunnelOptions {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_sockets: DEFAULT_MAX_SOCKETS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }
}

/// Connection details returned to the client that requested the tunnel.
#[derive(Debug, Clone)]
pub struct TunnelInfo {
    pub id: ClientId,
    pub port: u16,
    pub max_conn_count: usize,
}

/// One client's tunnel endpoint.
pub struct ClientTunnel {
    id: ClientId,
    opts: TunnelOptions,
    pool: Arc<SocketPool>,
    port: AtomicU16,
    started: AtomicBool,
    closing: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    ended_tx: watch::Sender<bool>,
}

impl ClientTunnel {
    pub fn new(id: ClientId, opts: TunnelOptions) -> Arc<Self> {
        let (shutdown_tx, _) = watch::channel(false);
        let (ended_tx, _) = watch::channel(false);
        Arc::new(Self {
            id,
            opts,
            pool: Arc::new(SocketPool::new()),
            port: AtomicU16::new(0),
            started: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            shutdown_tx,
            ended_tx,
        })
    }

    pub fn id(&self) -> &ClientId {
        &self.id
    }

    pub fn pool(&self) -> &Arc<SocketPool> {
        &self.pool
    }

    /// Port the listener bound; stable from `start` until the tunnel ends.
    pub fn port(&self) -> u16 {
        self.port.load(Ordering::Acquire)
    }

    /// Bind the per-client listener and spawn the tunnel's workers.
    ///
    /// Calling twice is a programmer error and fails with `AlreadyStarted`.
    pub async fn start(self: &Arc<Self>) -> Result<TunnelInfo> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(Error::AlreadyStarted {
                id: self.id.to_string(),
            });
        }

        let listener = TcpListener::bind((self.opts.bind_addr, 0))
            .await
            .map_err(|source| Error::ListenerBind { source })?;
        let port = listener
            .local_addr()
            .map_err(|source| Error::ListenerBind { source })?
            .port();
        self.port.store(port, Ordering::Release);

        info!(
            id = %self.id,
            port = port,
            max_sockets = self.opts.max_sockets,
            "tunnel listening"
        );

        tokio::spawn(Arc::clone(self).accept_loop(listener));
        tokio::spawn(Arc::clone(self).idle_watch());
        tokio::spawn(Arc::clone(self).sweep_loop());

        Ok(TunnelInfo {
            id: self.id.clone(),
            port,
            max_conn_count: self.opts.max_sockets,
        })
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                result = listener.accept() => match result {
                    Ok((stream, peer_addr)) => self.on_accept(stream, peer_addr).await,
                    // Per-peer noise; the listener itself is fine.
                    Err(e) if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::TimedOut
                    ) => {}
                    Err(e) => {
                        warn!(id = %self.id, error = %e, "tunnel listener error");
                    }
                },
            }
        }
        // The listener drops here; any teardown error is indistinguishable
        // from an already-closed listener and is ignored.
        debug!(id = %self.id, "tunnel accept loop stopped");
    }

    async fn on_accept(&self, stream: TcpStream, peer_addr: SocketAddr) {
        if self.pool.size() >= self.opts.max_sockets {
            debug!(
                id = %self.id,
                peer = %peer_addr,
                cap = self.opts.max_sockets,
                "tunnel at socket cap, ending connection"
            );
            return;
        }
        let _ = stream.set_nodelay(true);
        if let Err(sock) = self.pool.admit(TunnelSocket::new(stream, peer_addr)).await {
            // Raced with shutdown.
            drop(sock);
        }
    }

    /// Destroy the tunnel after `idle_timeout` at zero pooled sockets.
    /// Armed at start, cancelled by any admit, re-armed when the pool drains
    /// back to zero.
    async fn idle_watch(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut size_rx = self.pool.subscribe_size();
        loop {
            let size = *size_rx.borrow_and_update();
            if size == 0 {
                tokio::select! {
                    _ = sleep(self.opts.idle_timeout) => {
                        info!(id = %self.id, "tunnel idle, closing");
                        self.close().await;
                        return;
                    }
                    changed = size_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            } else {
                tokio::select! {
                    changed = size_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        // Skip the immediate first tick.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let removed = self.pool.sweep_idle().await;
                    if removed > 0 {
                        debug!(id = %self.id, removed = removed, "swept closed idle sockets");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// Stop accepting, drain queued waiters with `None`, then emit the
    /// terminal end signal. Idempotent: the idle timer and an external close
    /// may race here.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(true);
        self.pool.shutdown().await;
        let _ = self.ended_tx.send(true);
        info!(id = %self.id, "tunnel ended");
    }

    /// Resolves once the tunnel has ended. The registry uses this to drop
    /// its entry.
    pub async fn closed(&self) {
        let mut rx = self.ended_tx.subscribe();
        let _ = rx.wait_for(|ended| *ended).await;
    }

    /// Whether the end signal has fired.
    pub fn is_closed(&self) -> bool {
        *self.ended_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    fn test_opts(idle_timeout: Duration) -> TunnelOptions {
        TunnelOptions {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            max_sockets: 10,
            idle_timeout,
        }
    }

    fn id(s: &str) -> ClientId {
        ClientId::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_start_is_idempotency_guarded() {
        let tunnel = ClientTunnel::new(id("abcd"), test_opts(Duration::from_secs(30)));
        let info = tunnel.start().await.unwrap();
        assert!(info.port > 0);
        assert_eq!(info.max_conn_count, 10);

        let second = tunnel.start().await;
        assert!(matches!(second, Err(Error::AlreadyStarted { .. })));
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_socket_cap_ends_excess_connections() {
        let mut opts = test_opts(Duration::from_secs(30));
        opts.max_sockets = 1;
        let tunnel = ClientTunnel::new(id("abcd"), opts);
        let info = tunnel.start().await.unwrap();

        let _first = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tunnel.pool().size(), 1);

        let mut second = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();
        // The over-cap socket is ended by the server.
        let mut buf = [0u8; 1];
        let n = timeout(Duration::from_secs(2), second.read(&mut buf))
            .await
            .expect("server should close the over-cap socket")
            .unwrap_or(0);
        assert_eq!(n, 0);
        assert_eq!(tunnel.pool().size(), 1);
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_idle_tunnel_destroys_itself() {
        let tunnel = ClientTunnel::new(id("abcd"), test_opts(Duration::from_millis(100)));
        tunnel.start().await.unwrap();

        timeout(Duration::from_secs(2), tunnel.closed())
            .await
            .expect("tunnel should close after the idle timeout");
        assert!(tunnel.is_closed());
    }

    #[tokio::test]
    async fn test_admitted_socket_cancels_idle_timer() {
        let tunnel = ClientTunnel::new(id("abcd"), test_opts(Duration::from_millis(200)));
        let info = tunnel.start().await.unwrap();

        let _client = TcpStream::connect(("127.0.0.1", info.port)).await.unwrap();

        // Well past the idle timeout, the tunnel is still alive because a
        // socket is pooled.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!tunnel.is_closed());
        tunnel.close().await;
    }

    #[tokio::test]
    async fn test_close_notifies_waiters_before_end() {
        let tunnel = ClientTunnel::new(id("abcd"), test_opts(Duration::from_secs(30)));
        tunnel.start().await.unwrap();

        let mut waiter = tunnel.pool().next_socket().await;
        tunnel.close().await;

        // close() drains waiters before the end signal fires, so by the
        // time closed() resolves the waiter must already hold its None.
        timeout(Duration::from_secs(1), tunnel.closed())
            .await
            .unwrap();
        assert!(waiter.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let tunnel = ClientTunnel::new(id("abcd"), test_opts(Duration::from_secs(30)));
        tunnel.start().await.unwrap();
        tunnel.close().await;
        tunnel.close().await;
        assert!(tunnel.is_closed());
    }
}
