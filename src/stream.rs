use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// unified transport under a connection, plaintext or tls
#[derive(Debug)]
pub enum WsStream<S> {
    /// plaintext transport
    Plain(S),
    /// tls transport, either side of the handshake
    Tls(tokio_rustls::TlsStream<S>),
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_read(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsStream<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, std::io::Error>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_write(cx, buf),
            WsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_flush(cx),
            WsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), std::io::Error>> {
        match self.get_mut() {
            WsStream::Plain(stream) => Pin::new(stream).poll_shutdown(cx),
            WsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
