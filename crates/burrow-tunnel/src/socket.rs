//! Pooled tunnel sockets

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

/// A TCP connection originated by a tunnel client and accepted on the
/// tunnel's listener.
///
/// The pool owns the socket while it is idle; a request handler owns it for
/// the duration of one exchange and either returns it, retires it, or (for
/// upgrades) consumes it.
#[derive(Debug)]
pub struct TunnelSocket {
    stream: TcpStream,
    peer_addr: SocketAddr,
}

impl TunnelSocket {
    pub fn new(stream: TcpStream, peer_addr: SocketAddr) -> Self {
        Self { stream, peer_addr }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn stream_mut(&mut self) -> &mut TcpStream {
        &mut self.stream
    }

    pub fn into_stream(self) -> TcpStream {
        self.stream
    }

    /// Liveness probe for idle sockets.
    ///
    /// A zero-duration timeout polls the peek exactly once without blocking
    /// or consuming data: EOF or a transport error means the client hung up,
    /// anything else counts as alive.
    pub(crate) async fn is_closed(&mut self) -> bool {
        let mut probe = [0u8; 1];
        match tokio::time::timeout(Duration::ZERO, self.stream.peek(&mut probe)).await {
            Ok(Ok(0)) => true,
            Ok(Ok(_)) => false,
            Ok(Err(_)) => true,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TunnelSocket, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (stream, peer_addr) = accepted.unwrap();
        (TunnelSocket::new(stream, peer_addr), client.unwrap())
    }

    #[tokio::test]
    async fn test_is_closed_detects_hangup() {
        let (mut sock, client) = socket_pair().await;
        assert!(!sock.is_closed().await);

        drop(client);
        // Give the loopback a moment to deliver the FIN.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sock.is_closed().await);
    }

    #[tokio::test]
    async fn test_is_closed_ignores_pending_data() {
        use tokio::io::AsyncWriteExt;

        let (mut sock, mut client) = socket_pair().await;
        client.write_all(b"x").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!sock.is_closed().await);
    }
}
