//! HTTP request injection onto a borrowed tunnel socket
//!
//! Drives one HTTP/1.x exchange directly on the pooled socket: the request
//! preamble and body go down verbatim, the response streams back to the
//! external peer unchanged. No connection is dialed and nothing here pools
//! the socket behind the engine's back: a cleanly delimited exchange hands
//! it straight back, anything else retires it.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use burrow_tunnel::{SocketPool, TunnelSocket};

use crate::head::{read_response_head, BodyFraming, RequestHead};

/// What the dispatcher should do with the peer connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Exchange finished cleanly; the peer may send another request
    KeepAlive,
    /// Shut the peer connection down
    Close,
    /// The peer is already gone; nothing further to write
    Abandoned,
}

const COPY_BUF: usize = 8 * 1024;
const MAX_CHUNK_LINE: usize = 8 * 1024;

/// Run one exchange over `sock`. `peer_buf` holds any request bytes read
/// past the head; more body is pulled from `peer` as needed.
pub async fn exchange<S>(
    peer: &mut S,
    peer_buf: &mut BytesMut,
    head: &RequestHead,
    mut sock: TunnelSocket,
    pool: &SocketPool,
) -> Flow
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Request preamble, original header order and case.
    let mut preamble = Vec::with_capacity(256);
    head.write_preamble(&mut preamble);
    if let Err(e) = sock.stream_mut().write_all(&preamble).await {
        debug!(error = %e, peer = %sock.peer_addr(), "tunnel socket rejected request preamble");
        pool.retire().await;
        return Flow::Close;
    }

    // Request body, when the head announces one.
    let body_sent = match head.body_framing() {
        BodyFraming::None | BodyFraming::Eof => Ok(()),
        BodyFraming::Length(n) => relay_exact(peer, peer_buf, sock.stream_mut(), n).await,
        BodyFraming::Chunked => relay_chunked(peer, peer_buf, sock.stream_mut()).await,
    };
    if let Err(e) = body_sent {
        debug!(error = %e, "request body relay failed");
        pool.retire().await;
        return Flow::Close;
    }

    // The response arrives on the same socket. Its raw head bytes pass
    // through untouched so header order survives.
    let mut resp_buf = BytesMut::with_capacity(1024);
    let (resp, head_len) = match read_response_head(sock.stream_mut(), &mut resp_buf).await {
        Ok(parsed) => parsed,
        Err(e) => {
            debug!(error = %e, "failed reading response from tunnel");
            pool.retire().await;
            return Flow::Close;
        }
    };
    let head_bytes = resp_buf.split_to(head_len);
    if peer.write_all(&head_bytes).await.is_err() {
        // Peer left mid-exchange; the socket now carries a half-read
        // response and cannot be reused.
        pool.retire().await;
        return Flow::Abandoned;
    }

    let framing = resp.body_framing(&head.method);
    let body_result = match framing {
        BodyFraming::None => Ok(()),
        BodyFraming::Length(n) => relay_exact(sock.stream_mut(), &mut resp_buf, peer, n).await,
        BodyFraming::Chunked => relay_chunked(sock.stream_mut(), &mut resp_buf, peer).await,
        BodyFraming::Eof => relay_until_eof(sock.stream_mut(), &mut resp_buf, peer).await,
    };

    match body_result {
        Err(e) => {
            debug!(error = %e, "response stream error after headers were sent");
            pool.retire().await;
            Flow::Close
        }
        Ok(()) if framing == BodyFraming::Eof => {
            // The client closed its side to delimit the body.
            pool.retire().await;
            Flow::Close
        }
        Ok(()) if !resp_buf.is_empty() => {
            // Bytes past the announced body mean the framing is broken.
            debug!(extra = resp_buf.len(), "tunnel sent bytes past the response body");
            pool.retire().await;
            Flow::Close
        }
        Ok(()) => {
            trace!(status = resp.status, "exchange complete");
            pool.release(sock).await;
            if head.wants_close() || resp.wants_close() {
                Flow::Close
            } else {
                Flow::KeepAlive
            }
        }
    }
}

/// Copy exactly `n` bytes from `buf` + `src` into `dst`.
async fn relay_exact<R, W>(
    src: &mut R,
    buf: &mut BytesMut,
    dst: &mut W,
    mut n: u64,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while n > 0 {
        if buf.is_empty() && src.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        let take = buf.len().min(usize::try_from(n).unwrap_or(usize::MAX));
        let chunk = buf.split_to(take);
        dst.write_all(&chunk).await?;
        n -= take as u64;
    }
    Ok(())
}

/// Relay a chunked body verbatim, chunk framing included, through the
/// terminal chunk and trailer section.
async fn relay_chunked<R, W>(src: &mut R, buf: &mut BytesMut, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let line = read_line(src, buf).await?;
        dst.write_all(&line).await?;
        let size = parse_chunk_size(&line)?;
        if size == 0 {
            break;
        }
        // Chunk data plus its trailing CRLF.
        relay_exact(src, buf, dst, size + 2).await?;
    }
    // Trailer section runs through the terminating blank line.
    loop {
        let line = read_line(src, buf).await?;
        dst.write_all(&line).await?;
        if line.as_ref() == b"\r\n" || line.as_ref() == b"\n" {
            return Ok(());
        }
    }
}

/// Pump the remaining bytes until the source closes.
async fn relay_until_eof<R, W>(src: &mut R, buf: &mut BytesMut, dst: &mut W) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if !buf.is_empty() {
        let chunk = buf.split();
        dst.write_all(&chunk).await?;
    }
    let mut scratch = [0u8; COPY_BUF];
    loop {
        let n = src.read(&mut scratch).await?;
        if n == 0 {
            return Ok(());
        }
        dst.write_all(&scratch[..n]).await?;
    }
}

/// Read through the next LF, returning the line including its terminator.
async fn read_line<R>(src: &mut R, buf: &mut BytesMut) -> io::Result<Bytes>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
            return Ok(buf.split_to(pos + 1).freeze());
        }
        if buf.len() > MAX_CHUNK_LINE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "chunk line too long",
            ));
        }
        if src.read_buf(buf).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> io::Result<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-ascii chunk size"))?;
    let digits = text
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .split(';')
        .next()
        .unwrap_or("")
        .trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad chunk size"))
}
