//! AsyncRead/AsyncWrite wrapper for iroh QUIC streams.

use std::io::ErrorKind;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::peer::PeerId;

fn to_io<E: std::error::Error + Send + Sync + 'static>(e: E, kind: ErrorKind) -> std::io::Error {
    std::io::Error::new(kind, e)
}

/// Peer information for an iroh stream.
#[derive(Debug, Clone)]
pub struct IrohStreamInfo {
    /// The remote peer.
    pub remote: PeerId,
    /// Protocol id negotiated for the connection.
    pub protocol: String,
    /// When the stream was opened or accepted.
    pub established_at: Instant,
}

/// AsyncRead/AsyncWrite wrapper around a bidirectional QUIC stream.
#[derive(Debug)]
pub struct IrohStream {
    send: iroh::endpoint::SendStream,
    recv: iroh::endpoint::RecvStream,
    info: IrohStreamInfo,
}

impl Unpin for IrohStream {}

impl IrohStream {
    /// Wrap send/recv halves of one QUIC stream.
    pub fn new(
        send: iroh::endpoint::SendStream,
        recv: iroh::endpoint::RecvStream,
        info: IrohStreamInfo,
    ) -> Self {
        Self { send, recv, info }
    }

    /// Stream metadata.
    pub fn info(&self) -> &IrohStreamInfo {
        &self.info
    }
}

impl AsyncRead for IrohStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.recv)
            .poll_read(cx, buf)
            .map_err(|e| to_io(e, ErrorKind::UnexpectedEof))
    }
}

impl AsyncWrite for IrohStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.send)
            .poll_write(cx, buf)
            .map_err(|e| to_io(e, ErrorKind::BrokenPipe))
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_flush(cx)
            .map_err(|e| to_io(e, ErrorKind::BrokenPipe))
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.send)
            .poll_shutdown(cx)
            .map_err(|e| to_io(e, ErrorKind::BrokenPipe))
    }
}
