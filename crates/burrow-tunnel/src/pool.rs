//! Idle-socket pool with a FIFO waiter queue
//!
//! One pool per client tunnel. Sockets accepted on the tunnel listener sit
//! in `idle` until a request handler borrows one; handlers that arrive while
//! the pool is empty queue as waiters and are woken oldest-first. The total
//! socket count (idle + lent out) is published on a watch channel so the
//! owning tunnel can arm its idle-destroy timer when the pool drains.

use std::collections::VecDeque;
use std::pin::Pin;

use tokio::sync::{oneshot, watch, Mutex};
use tracing::{debug, trace};

use crate::socket::TunnelSocket;

// TODO: bound how long a waiter may sit in the queue; today waiter lifetime
// is limited only by peer disconnect and pool shutdown.

/// FIFO pool of tunnel sockets plus the queue of handlers waiting for one.
pub struct SocketPool {
    state: Mutex<PoolState>,
    size_tx: watch::Sender<usize>,
}

struct PoolState {
    idle: VecDeque<TunnelSocket>,
    waiters: VecDeque<oneshot::Sender<Option<TunnelSocket>>>,
    in_flight: usize,
    shut_down: bool,
}

impl PoolState {
    fn size(&self) -> usize {
        self.idle.len() + self.in_flight
    }

    /// Hand idle sockets to waiters, oldest waiter and oldest socket first.
    /// Runs under the pool lock, so a socket admitted while waiters queue
    /// cannot be stolen by a handler that arrives afterwards.
    fn serve_waiters(&mut self) {
        while !self.idle.is_empty() {
            let Some(waiter) = self.waiters.pop_front() else {
                return;
            };
            let Some(sock) = self.idle.pop_front() else {
                return;
            };
            self.in_flight += 1;
            if let Err(Some(sock)) = waiter.send(Some(sock)) {
                // Receiver already dropped; the socket stays at the idle
                // head for the next waiter.
                self.in_flight -= 1;
                self.idle.push_front(sock);
            }
        }
    }
}

impl SocketPool {
    pub fn new() -> Self {
        let (size_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                waiters: VecDeque::new(),
                in_flight: 0,
                shut_down: false,
            }),
            size_tx,
        }
    }

    /// Total sockets tracked by the pool: idle plus lent out.
    pub fn size(&self) -> usize {
        *self.size_tx.borrow()
    }

    /// Observe size transitions. The owning tunnel arms its idle timer when
    /// the published size reaches zero and cancels it when a socket arrives.
    pub fn subscribe_size(&self) -> watch::Receiver<usize> {
        self.size_tx.subscribe()
    }

    fn publish(&self, state: &PoolState) {
        self.size_tx.send_replace(state.size());
    }

    /// Admit a freshly accepted tunnel socket.
    ///
    /// The socket joins the idle tail and is immediately lent to the oldest
    /// waiter if one is queued. After shutdown the socket is handed back to
    /// the caller.
    pub async fn admit(&self, sock: TunnelSocket) -> Result<(), TunnelSocket> {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return Err(sock);
        }
        trace!(peer = %sock.peer_addr(), "admitting tunnel socket");
        state.idle.push_back(sock);
        state.serve_waiters();
        self.publish(&state);
        Ok(())
    }

    /// Borrow a socket.
    ///
    /// Resolves immediately from the idle head when possible; otherwise the
    /// returned waiter joins the FIFO queue. Each waiter is answered at most
    /// once, with `Some(socket)` or with `None` when the pool shuts down.
    pub async fn next_socket(&self) -> SocketWaiter {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return SocketWaiter::ready(None);
        }
        if let Some(sock) = state.idle.pop_front() {
            state.in_flight += 1;
            self.publish(&state);
            return SocketWaiter::ready(Some(sock));
        }
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(tx);
        SocketWaiter::queued(rx)
    }

    /// Return a healthy borrowed socket to the idle tail and serve waiters.
    /// After shutdown the socket is dropped instead.
    pub async fn release(&self, sock: TunnelSocket) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        if !state.shut_down {
            state.idle.push_back(sock);
            state.serve_waiters();
        }
        self.publish(&state);
    }

    /// Account for a borrowed socket that died or was consumed by an
    /// upgrade. The stream itself is dropped by the caller.
    pub async fn retire(&self) {
        let mut state = self.state.lock().await;
        state.in_flight = state.in_flight.saturating_sub(1);
        state.serve_waiters();
        self.publish(&state);
    }

    /// Drop idle sockets whose client hung up. Returns how many were
    /// removed.
    pub async fn sweep_idle(&self) -> usize {
        let mut state = self.state.lock().await;
        let before = state.idle.len();
        let mut kept = VecDeque::with_capacity(before);
        while let Some(mut sock) = state.idle.pop_front() {
            if sock.is_closed().await {
                debug!(peer = %sock.peer_addr(), "idle tunnel socket closed by client");
            } else {
                kept.push_back(sock);
            }
        }
        state.idle = kept;
        let removed = before - state.idle.len();
        if removed > 0 {
            self.publish(&state);
        }
        removed
    }

    /// Drain waiters in FIFO order with `None`, drop idle sockets and refuse
    /// further admissions. Idempotent.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        if state.shut_down {
            return;
        }
        state.shut_down = true;
        while let Some(waiter) = state.waiters.pop_front() {
            let _ = waiter.send(None);
        }
        state.idle.clear();
        self.publish(&state);
    }
}

impl Default for SocketPool {
    fn default() -> Self {
        Self::new()
    }
}

enum WaiterInner {
    Ready(Option<TunnelSocket>),
    Queued(oneshot::Receiver<Option<TunnelSocket>>),
    Done,
}

/// A pending borrow from the pool.
///
/// Resolves at most once: `Some(socket)` when a socket is lent, `None` when
/// the pool shut down first. `recv` is cancel safe; dropping the future
/// keeps this waiter's place in the queue. Dropping the waiter itself
/// after a socket was lent to it loses that socket, so hold it until it
/// resolves.
pub struct SocketWaiter(WaiterInner);

impl SocketWaiter {
    fn ready(sock: Option<TunnelSocket>) -> Self {
        Self(WaiterInner::Ready(sock))
    }

    fn queued(rx: oneshot::Receiver<Option<TunnelSocket>>) -> Self {
        Self(WaiterInner::Queued(rx))
    }

    /// Wait for the pool's answer. Returns `None` on every call after the
    /// first resolution.
    pub async fn recv(&mut self) -> Option<TunnelSocket> {
        match &mut self.0 {
            WaiterInner::Ready(sock) => {
                let sock = sock.take();
                self.0 = WaiterInner::Done;
                sock
            }
            WaiterInner::Queued(rx) => {
                // Poll the receiver in place so cancellation keeps our spot
                // in the queue.
                let answer = Pin::new(rx).await;
                self.0 = WaiterInner::Done;
                answer.unwrap_or(None)
            }
            WaiterInner::Done => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn socket_pair() -> (TunnelSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer_addr) = accepted.unwrap();
        (TunnelSocket::new(stream, peer_addr), client.unwrap())
    }

    #[tokio::test]
    async fn test_immediate_lend_from_idle() {
        let pool = SocketPool::new();
        let (sock, _client) = socket_pair().await;
        let peer = sock.peer_addr();

        pool.admit(sock).await.unwrap();
        assert_eq!(pool.size(), 1);

        let mut waiter = pool.next_socket().await;
        let lent = waiter.recv().await.expect("socket should be lent");
        assert_eq!(lent.peer_addr(), peer);
        // Lent sockets still count toward the pool size.
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_fifo_lending_order() {
        let pool = SocketPool::new();

        let mut w1 = pool.next_socket().await;
        let mut w2 = pool.next_socket().await;
        let mut w3 = pool.next_socket().await;

        let (s1, _c1) = socket_pair().await;
        let (s2, _c2) = socket_pair().await;
        let (s3, _c3) = socket_pair().await;
        let (p1, p2, p3) = (s1.peer_addr(), s2.peer_addr(), s3.peer_addr());

        pool.admit(s1).await.unwrap();
        pool.admit(s2).await.unwrap();
        pool.admit(s3).await.unwrap();

        // k-th admit wakes the k-th waiter.
        assert_eq!(w1.recv().await.unwrap().peer_addr(), p1);
        assert_eq!(w2.recv().await.unwrap().peer_addr(), p2);
        assert_eq!(w3.recv().await.unwrap().peer_addr(), p3);
    }

    #[tokio::test]
    async fn test_waiter_resolves_at_most_once() {
        let pool = SocketPool::new();
        let (sock, _client) = socket_pair().await;
        pool.admit(sock).await.unwrap();

        let mut waiter = pool.next_socket().await;
        assert!(waiter.recv().await.is_some());
        assert!(waiter.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_conservation_across_release_and_retire() {
        let pool = SocketPool::new();
        let (s1, _c1) = socket_pair().await;
        let (s2, _c2) = socket_pair().await;
        pool.admit(s1).await.unwrap();
        pool.admit(s2).await.unwrap();
        assert_eq!(pool.size(), 2);

        let mut w = pool.next_socket().await;
        let lent = w.recv().await.unwrap();
        assert_eq!(pool.size(), 2);

        pool.release(lent).await;
        assert_eq!(pool.size(), 2);

        let mut w = pool.next_socket().await;
        let _lent = w.recv().await.unwrap();
        pool.retire().await;
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_drains_waiters_with_none() {
        let pool = SocketPool::new();
        let mut waiters = Vec::new();
        for _ in 0..5 {
            waiters.push(pool.next_socket().await);
        }

        pool.shutdown().await;

        for waiter in &mut waiters {
            assert!(waiter.recv().await.is_none());
        }
        // Admissions are refused after shutdown.
        let (sock, _client) = socket_pair().await;
        assert!(pool.admit(sock).await.is_err());
        // And new borrows resolve to None immediately.
        let mut waiter = pool.next_socket().await;
        assert!(waiter.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_release_after_shutdown_drops_socket() {
        let pool = SocketPool::new();
        let (sock, _client) = socket_pair().await;
        pool.admit(sock).await.unwrap();

        let mut w = pool.next_socket().await;
        let lent = w.recv().await.unwrap();

        pool.shutdown().await;
        pool.release(lent).await;
        assert_eq!(pool.size(), 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_closed_idle_sockets() {
        let pool = SocketPool::new();
        let (s1, c1) = socket_pair().await;
        let (s2, _c2) = socket_pair().await;
        pool.admit(s1).await.unwrap();
        pool.admit(s2).await.unwrap();

        drop(c1);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert_eq!(pool.sweep_idle().await, 1);
        assert_eq!(pool.size(), 1);
    }

    #[tokio::test]
    async fn test_admit_hands_socket_to_oldest_waiter() {
        let pool = SocketPool::new();
        let mut old = pool.next_socket().await;
        let mut young = pool.next_socket().await;

        let (sock, _client) = socket_pair().await;
        pool.admit(sock).await.unwrap();

        assert!(old.recv().await.is_some());

        // The younger waiter is still queued.
        let answered =
            tokio::time::timeout(std::time::Duration::from_millis(50), young.recv()).await;
        assert!(answered.is_err());

        pool.shutdown().await;
        assert!(young.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_abandoned_waiter_does_not_lose_socket() {
        let pool = SocketPool::new();

        // Waiter queued, then its receiver dropped before any admit.
        let waiter = pool.next_socket().await;
        drop(waiter);

        let (sock, _client) = socket_pair().await;
        pool.admit(sock).await.unwrap();

        // The socket survived the dead waiter and serves the next one.
        let mut live = pool.next_socket().await;
        assert!(live.recv().await.is_some());
    }
}
