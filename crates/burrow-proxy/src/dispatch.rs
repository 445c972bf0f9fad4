//! Front door for every public connection
//!
//! One dispatcher instance serves the whole process. Each inbound connection
//! gets its head parsed raw, then routes by Host subdomain: known subdomains
//! borrow a tunnel socket (HTTP injection or upgrade bridging), unknown ones
//! get a 502, and everything else falls through to the management app served
//! over the replayed head bytes.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use bytes::{Buf, Bytes, BytesMut};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use burrow_core::ServerConfig;
use burrow_tunnel::{ClientRegistry, ClientTunnel, SocketPool, SocketWaiter, TunnelSocket};

use crate::bridge;
use crate::head::{read_request_head, BodyFraming, HeadError, RequestHead};
use crate::inject::{self, Flow};
use crate::rewind::Rewind;

/// Routes inbound public connections to tunnels or the management app.
pub struct RequestDispatcher {
    registry: Arc<ClientRegistry>,
    config: Arc<ServerConfig>,
    app: Router,
}

impl RequestDispatcher {
    pub fn new(registry: Arc<ClientRegistry>, config: Arc<ServerConfig>, app: Router) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            app,
        })
    }

    /// Drive one public connection to completion.
    pub async fn handle_connection(self: Arc<Self>, mut stream: TcpStream, peer_addr: SocketAddr) {
        let mut buf = BytesMut::with_capacity(1024);
        loop {
            let (head, head_len) = match read_request_head(&mut stream, &mut buf).await {
                Ok(parsed) => parsed,
                Err(HeadError::Closed) => return,
                Err(HeadError::Io(e)) => {
                    trace!(peer = %peer_addr, error = %e, "peer read error");
                    return;
                }
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "rejecting unparseable request");
                    let _ = stream
                        .write_all(&simple_response(400, "Bad Request", "bad request"))
                        .await;
                    return;
                }
            };

            let client_id = head
                .hostname()
                .and_then(|h| subdomain(&h, self.config.domain.as_deref()).map(str::to_owned));

            if head.is_upgrade() {
                // No response is owed on the upgrade path; a bad target just
                // loses the peer socket.
                let Some(id) = client_id else { return };
                let Some(tunnel) = self.registry.lookup(&id) else {
                    debug!(peer = %peer_addr, id = %id, "upgrade for unknown client");
                    return;
                };
                buf.advance(head_len);
                self.run_upgrade(stream, buf.freeze(), head, tunnel).await;
                return;
            }

            let Some(id) = client_id else {
                // Management traffic: hand the connection to the app's HTTP
                // server with every buffered byte replayed in front of it.
                self.serve_app(stream, buf.freeze()).await;
                return;
            };

            let Some(tunnel) = self.registry.lookup(&id) else {
                debug!(peer = %peer_addr, id = %id, "no active client");
                let body = format!("no active client for '{id}'");
                let _ = stream
                    .write_all(&simple_response(502, "Bad Gateway", &body))
                    .await;
                let _ = stream.shutdown().await;
                return;
            };

            buf.advance(head_len);
            match self.run_inject(&mut stream, &mut buf, &head, tunnel).await {
                Flow::KeepAlive => continue,
                Flow::Close => {
                    let _ = stream.shutdown().await;
                    return;
                }
                Flow::Abandoned => return,
            }
        }
    }

    /// Borrow a socket and inject the request, racing the borrow against the
    /// peer hanging up. A socket lent after the peer left goes back to the
    /// pool untouched so the next waiter can use it.
    async fn run_inject(
        &self,
        stream: &mut TcpStream,
        buf: &mut BytesMut,
        head: &RequestHead,
        tunnel: Arc<ClientTunnel>,
    ) -> Flow {
        let pool = Arc::clone(tunnel.pool());
        let mut waiter = pool.next_socket().await;

        // A liveness probe is indistinguishable from request body data, so
        // only watch the peer when no body can be in flight.
        let watch_peer = buf.is_empty() && head.body_framing() == BodyFraming::None;
        let outcome = tokio::select! {
            sock = waiter.recv() => Some(sock),
            _ = peer_vanished(stream, watch_peer) => None,
        };

        let sock = match outcome {
            Some(sock) => sock,
            None => {
                trace!(id = %tunnel.id(), "peer left before a socket was lent");
                reclaim_later(waiter, pool);
                return Flow::Abandoned;
            }
        };

        let Some(sock) = sock else {
            // Pool shut down while the request was queued.
            let _ = stream
                .write_all(&simple_response(
                    504,
                    "Gateway Timeout",
                    "tunnel closed while the request was queued",
                ))
                .await;
            return Flow::Close;
        };

        inject::exchange(stream, buf, head, sock, &pool).await
    }

    /// Borrow a socket and splice the upgraded connection onto it. The
    /// borrowed socket is consumed either way.
    async fn run_upgrade(
        &self,
        mut stream: TcpStream,
        leftover: Bytes,
        head: RequestHead,
        tunnel: Arc<ClientTunnel>,
    ) {
        let pool = Arc::clone(tunnel.pool());
        let mut waiter = pool.next_socket().await;

        let watch_peer = leftover.is_empty();
        let outcome = tokio::select! {
            sock = waiter.recv() => Some(sock),
            _ = peer_vanished(&mut stream, watch_peer) => None,
        };

        let sock = match outcome {
            Some(sock) => sock,
            None => {
                trace!(id = %tunnel.id(), "upgrade peer left before a socket was lent");
                reclaim_later(waiter, pool);
                return;
            }
        };

        // Pool drained: the upgrade peer is dropped without a response.
        let Some(sock) = sock else { return };

        bridge::run(stream, leftover, &head, sock).await;
        pool.retire().await;
    }

    async fn serve_app(&self, stream: TcpStream, buffered: Bytes) {
        let io = TokioIo::new(Rewind::new(buffered, stream));
        let service = TowerToHyperService::new(self.app.clone());
        if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
            debug!(error = %e, "management connection error");
        }
    }
}

/// Release a socket that arrives after its requester is gone.
fn reclaim_later(mut waiter: SocketWaiter, pool: Arc<SocketPool>) {
    tokio::spawn(async move {
        if let Some(sock) = waiter.recv().await {
            release_unused(&pool, sock).await;
        }
    });
}

async fn release_unused(pool: &SocketPool, sock: TunnelSocket) {
    trace!(peer = %sock.peer_addr(), "releasing socket lent to a vanished peer");
    pool.release(sock).await;
}

/// Resolves when the peer hangs up before any socket was lent. With
/// `watch` off (or once data shows up) it never resolves; the borrow side
/// of the race wins.
async fn peer_vanished(stream: &mut TcpStream, watch: bool) {
    if !watch {
        return std::future::pending().await;
    }
    let mut probe = [0u8; 1];
    match stream.peek(&mut probe).await {
        Ok(0) | Err(_) => {}
        Ok(_) => std::future::pending().await,
    }
}

/// Minimal HTTP/1.1 error response. The dispatcher closes the connection
/// after writing one, so `Connection: close` is always advertised.
fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {status} {reason}\r\n\
         content-type: text/plain; charset=utf-8\r\n\
         content-length: {}\r\n\
         connection: close\r\n\
         \r\n\
         {body}",
        body.len()
    )
    .into_bytes()
}

/// Leftmost dot label of `hostname` when it names a tunnel.
///
/// With a configured apex, only hostnames strictly under it route to
/// tunnels. Without one, any hostname with three or more labels routes by
/// its leftmost label; shorter names fall through to the management app.
pub fn subdomain<'a>(hostname: &'a str, domain: Option<&str>) -> Option<&'a str> {
    match domain {
        Some(domain) => {
            let prefix = hostname
                .strip_suffix(domain)?
                .strip_suffix('.')?;
            prefix.split('.').next().filter(|label| !label.is_empty())
        }
        None => {
            let mut labels = hostname.split('.');
            let first = labels.next()?;
            if labels.count() >= 2 && !first.is_empty() {
                Some(first)
            } else {
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdomain_with_apex() {
        let apex = Some("example.com");
        assert_eq!(subdomain("abcd.example.com", apex), Some("abcd"));
        assert_eq!(subdomain("a.b.example.com", apex), Some("a"));
        assert_eq!(subdomain("example.com", apex), None);
        assert_eq!(subdomain("other.net", apex), None);
        assert_eq!(subdomain("abcdexample.com", apex), None);
        assert_eq!(subdomain(".example.com", apex), None);
    }

    #[test]
    fn test_subdomain_without_apex() {
        assert_eq!(subdomain("abcd.example.com", None), Some("abcd"));
        assert_eq!(subdomain("example.com", None), None);
        assert_eq!(subdomain("localhost", None), None);
        assert_eq!(subdomain("a.b.c.d", None), Some("a"));
    }

    #[test]
    fn test_simple_response_shape() {
        let bytes = simple_response(502, "Bad Gateway", "no active client for 'ghost'");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"));
        assert!(text.contains("connection: close\r\n"));
        assert!(text.ends_with("no active client for 'ghost'"));
    }
}
