//! Raw duplex bridging for upgraded connections
//!
//! Upgrade requests never touch an HTTP client: the 101 and everything after
//! it come from the tunnel client, byte for byte. The preamble is rebuilt
//! from the parsed raw headers so order and duplicates survive, then the two
//! sockets are spliced full duplex; a half-close on one side still lets the
//! other direction drain.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use burrow_tunnel::TunnelSocket;

use crate::head::RequestHead;

/// Write the upgrade preamble plus any bytes the peer already sent past the
/// head, then pipe both directions until both sides have ended. The tunnel
/// socket is consumed: once opaque bytes have flowed, its HTTP framing is
/// unrecoverable and the caller must retire it from the pool.
pub async fn run<S>(mut peer: S, leftover: Bytes, head: &RequestHead, mut sock: TunnelSocket)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut preamble = Vec::with_capacity(256 + leftover.len());
    head.write_preamble(&mut preamble);
    preamble.extend_from_slice(&leftover);

    let tunnel = sock.stream_mut();
    if let Err(e) = tunnel.write_all(&preamble).await {
        debug!(error = %e, "tunnel socket rejected upgrade preamble");
        return;
    }

    match tokio::io::copy_bidirectional(&mut peer, tunnel).await {
        Ok((to_tunnel, to_peer)) => {
            debug!(to_tunnel, to_peer, "upgrade bridge closed");
        }
        // Connection reset is a normal way for either side to leave.
        Err(e) if e.kind() == std::io::ErrorKind::ConnectionReset => {
            debug!("upgrade bridge reset");
        }
        Err(e) => {
            warn!(error = %e, "upgrade bridge error");
        }
    }
}
