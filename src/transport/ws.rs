// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! WebSocket transport: each binary frame is opaque bytes, concatenated into the read
//! stream; writes are emitted as binary frames. A close frame maps to EOF.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use futures_util::sink::Sink;
use futures_util::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::session::ConnectionInfo;

/// Wraps a [`WebSocketStream`], presenting it as a plain byte duplex.
pub struct WsDuplex<S> {
    inner: WebSocketStream<S>,
    read_buf: Bytes,
    closed: bool,
}

impl<S> WsDuplex<S> {
    pub fn new(inner: WebSocketStream<S>) -> Self {
        WsDuplex {
            inner,
            read_buf: Bytes::new(),
            closed: false,
        }
    }
}

impl<S> AsyncRead for WsDuplex<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf = this.read_buf.split_off(n);
                return Poll::Ready(Ok(()));
            }
            if this.closed {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    this.read_buf = Bytes::from(data);
                }
                Some(Ok(Message::Close(_))) | None => {
                    this.closed = true;
                }
                Some(Ok(_)) => {
                    // ping/pong/text: not part of this protocol, ignore and keep reading.
                }
                Some(Err(e)) => {
                    this.closed = true;
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e)));
                }
            }
        }
    }
}

impl<S> AsyncWrite for WsDuplex<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner)
            .poll_ready(cx)
            .map_err(to_io_error))?;
        Pin::new(&mut this.inner)
            .start_send(Message::Binary(buf.to_vec()))
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_flush(cx)
            .map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner)
            .poll_close(cx)
            .map_err(to_io_error)
    }
}

impl<S: ConnectionInfo> ConnectionInfo for WsDuplex<S> {
    fn local_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.get_ref().local_addr()
    }

    fn remote_addr(&self) -> io::Result<std::net::SocketAddr> {
        self.inner.get_ref().remote_addr()
    }
}

fn to_io_error(e: tokio_tungstenite::tungstenite::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}
