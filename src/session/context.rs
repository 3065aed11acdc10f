// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Where to send a connection that never completed Trojan authentication.
#[derive(Debug, Clone, serde::Deserialize)]
pub enum Fallback {
    /// Hand the connection (and the bytes already read from it) to a local HTTP server.
    #[serde(rename = "connect")]
    Connect(SocketAddr),
    /// **Not recommended**: close the connection outright.
    #[serde(rename = "reject")]
    Reject,
}

impl Default for Fallback {
    fn default() -> Self {
        Self::Reject
    }
}

impl Fallback {
    pub async fn dispatch<S>(&self, stream: &mut S, prefix: &[u8]) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self {
            Fallback::Connect(addr) => {
                let mut downstream = TcpStream::connect(addr).await?;
                if !prefix.is_empty() {
                    downstream.write_all(prefix).await?;
                }
                tokio::io::copy_bidirectional(stream, &mut downstream).await?;
            }
            Fallback::Reject => {}
        }
        Ok(())
    }
}

/// Accumulates byte counts for a session and reports the accrued totals once it is
/// consumed, so the credential directory's `consume` call only happens after both
/// relay directions have finished.
pub trait TrafficSink {
    fn record_up(&mut self, bytes: usize);
    fn record_down(&mut self, bytes: usize);
}

/// Wraps a duplex stream, accumulating read (`up`, client-to-server) and write
/// (`down`, server-to-client) byte counts into a [`TrafficSink`] as data flows through.
pub struct StreamWrapper<IO, C> {
    stream: IO,
    pub sink: C,
}

impl<IO, C> StreamWrapper<IO, C>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: TrafficSink + Unpin,
{
    pub fn new(stream: IO, sink: C) -> Self {
        StreamWrapper { stream, sink }
    }

    pub fn into_inner(self) -> (IO, C) {
        (self.stream, self.sink)
    }
}

impl<IO, C> AsyncRead for StreamWrapper<IO, C>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: TrafficSink + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let ret = Pin::new(&mut this.stream).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = ret {
            this.sink.record_up(buf.filled().len() - before);
        }
        ret
    }
}

impl<IO, C> AsyncWrite for StreamWrapper<IO, C>
where
    IO: AsyncRead + AsyncWrite + Unpin,
    C: TrafficSink + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ret = Pin::new(&mut this.stream).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = ret {
            this.sink.record_down(n);
        }
        ret
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let ret = Pin::new(&mut this.stream).poll_write_vectored(cx, bufs);
        if let Poll::Ready(Ok(n)) = ret {
            this.sink.record_down(n);
        }
        ret
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Local/remote endpoints of a connection, needed by [`Fallback`] and admin surfaces.
pub trait ConnectionInfo {
    fn local_addr(&self) -> io::Result<SocketAddr>;
    fn remote_addr(&self) -> io::Result<SocketAddr>;
}

impl ConnectionInfo for TcpStream {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpStream::local_addr(self)
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.peer_addr()
    }
}

impl<S> ConnectionInfo for TlsStream<S>
where
    S: ConnectionInfo,
{
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.get_ref().0.remote_addr()
    }
}
