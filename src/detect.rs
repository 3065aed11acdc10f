// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Protocol detection: a wrapping listener that peeks the authentication preamble off
//! every accepted connection and only ever yields connections that failed to
//! authenticate, for the host server to treat as plain HTTP. Connections that
//! authenticate are handed straight to the relay engine without ever reaching here.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::directory::Directory;
use crate::proto::{Request, Token};
use crate::session::ConnectionInfo;

/// Capacity of the passthrough queue, matching the original's `conns chan *rawConn, 8`.
const PASSTHROUGH_QUEUE: usize = 8;

/// A connection that did not authenticate, with the bytes already read from it
/// restored to the front of its read side.
pub struct RewoundStream<S> {
    prefix: Vec<u8>,
    prefix_pos: usize,
    inner: S,
}

impl<S> RewoundStream<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        RewoundStream {
            prefix,
            prefix_pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for RewoundStream<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.prefix_pos < this.prefix.len() {
            let remaining = &this.prefix[this.prefix_pos..];
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            this.prefix_pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for RewoundStream<S> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl<S: ConnectionInfo> ConnectionInfo for RewoundStream<S> {
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn remote_addr(&self) -> io::Result<SocketAddr> {
        self.inner.remote_addr()
    }
}

/// A connection whose authentication preamble has already been consumed and
/// validated, handed off to the relay engine together with its token.
pub struct Authenticated<S> {
    pub stream: S,
    pub token: Token,
}

/// Outcome of peeking one accepted connection.
pub enum Detected<S> {
    Trojan(Authenticated<S>),
    Passthrough(RewoundStream<S>),
}

/// Peek up to [`Request::AUTH_PREFIX_LEN`] bytes from `stream` one byte at a time,
/// looking for a validated token terminated by `CRLF`. Rewinds on a bare `0x0A` seen
/// before the full prefix arrives, since a standalone `\r` with no following `\n`
/// inside the window can never itself terminate an HTTP request line — scanning for
/// `\n` alone is simpler than a strict CRLF check and equally safe.
pub async fn detect<S>(mut stream: S, directory: &dyn Directory) -> io::Result<Detected<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut prefix = Vec::with_capacity(Request::AUTH_PREFIX_LEN);
    let mut byte = [0u8; 1];

    while prefix.len() < Request::AUTH_PREFIX_LEN {
        // Any read error before the full preamble arrives — including a premature
        // EOF — closes the connection silently. It must never reach the passthrough
        // queue: an incomplete, newline-free prefix is neither a validated Trojan
        // session nor recognizable as plain HTTP.
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            prefix.push(byte[0]);
            return Ok(Detected::Passthrough(RewoundStream::new(prefix, stream)));
        }
        prefix.push(byte[0]);
    }

    let token = match Token::from_hex(&prefix[..56]) {
        Ok(t) if &prefix[56..58] == b"\r\n" && directory.validate(&t) => t,
        _ => return Ok(Detected::Passthrough(RewoundStream::new(prefix, stream))),
    };

    Ok(Detected::Trojan(Authenticated { stream, token }))
}

/// Wraps a [`TcpListener`], surfacing only the connections that failed authentication
/// for the host server to answer as plain HTTP. Authenticated connections are consumed
/// internally and dispatched directly; they never reach [`DetectingListener::accept`].
pub struct DetectingListener<S> {
    rx: mpsc::Receiver<io::Result<(RewoundStream<S>, SocketAddr)>>,
}

impl DetectingListener<TcpStream> {
    /// Spawn the detection loop directly over raw TCP, with no TLS termination in
    /// front of it. Mainly useful for tests and for embedding behind a TLS terminator
    /// that is itself the "host server" (in which case that host calls [`detect`]
    /// itself rather than going through this listener).
    pub fn spawn<F, Fut>(inner: TcpListener, directory: Arc<dyn Directory>, dispatch: F) -> Self
    where
        F: Fn(TcpStream, SocketAddr, Token) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Self::spawn_with(inner, directory, |stream| async { Ok(stream) }, dispatch)
    }
}

impl DetectingListener<tokio_rustls::server::TlsStream<TcpStream>> {
    /// Spawn the detection loop behind a TLS terminator: every accepted TCP socket is
    /// first upgraded to TLS, and detection runs on the decrypted plaintext. This is
    /// the normal deployment shape — the port looks like any other HTTPS listener.
    pub fn spawn_tls<F, Fut>(
        inner: TcpListener,
        tls: Arc<tokio_rustls::rustls::ServerConfig>,
        directory: Arc<dyn Directory>,
        dispatch: F,
    ) -> Self
    where
        F: Fn(tokio_rustls::server::TlsStream<TcpStream>, SocketAddr, Token) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let acceptor = tokio_rustls::TlsAcceptor::from(tls);
        Self::spawn_with(
            inner,
            directory,
            move |stream| {
                let acceptor = acceptor.clone();
                async move { acceptor.accept(stream).await }
            },
            dispatch,
        )
    }
}

impl<S> DetectingListener<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// Spawn the detection loop over `inner`, upgrading each accepted `TcpStream` via
    /// `upgrade` (identity for raw TCP, a TLS handshake for the normal deployment)
    /// before running [`detect`] on the result. Authenticated connections go straight
    /// to `dispatch`; everything else is surfaced through the returned listener.
    pub fn spawn_with<U, UFut, F, Fut>(
        inner: TcpListener,
        directory: Arc<dyn Directory>,
        upgrade: U,
        dispatch: F,
    ) -> Self
    where
        U: Fn(TcpStream) -> UFut + Send + Sync + 'static,
        UFut: std::future::Future<Output = io::Result<S>> + Send + 'static,
        F: Fn(S, SocketAddr, Token) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(PASSTHROUGH_QUEUE);
        let dispatch = Arc::new(dispatch);
        let upgrade = Arc::new(upgrade);

        tokio::spawn(async move {
            loop {
                let (stream, peer) = match inner.accept().await {
                    Ok(x) => x,
                    Err(e) => {
                        log::error!("tcp accept: {e}");
                        continue;
                    }
                };

                let directory = directory.clone();
                let dispatch = dispatch.clone();
                let upgrade = upgrade.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let stream = match upgrade(stream).await {
                        Ok(s) => s,
                        Err(e) => {
                            log::debug!("upgrade from {peer}: {e}");
                            return;
                        }
                    };
                    match detect(stream, directory.as_ref()).await {
                        Ok(Detected::Trojan(authed)) => {
                            dispatch(authed.stream, peer, authed.token).await;
                        }
                        Ok(Detected::Passthrough(rewound)) => {
                            if tx.send(Ok((rewound, peer))).await.is_err() {
                                log::debug!("detecting listener closed, dropping passthrough from {peer}");
                            }
                        }
                        Err(e) => {
                            log::debug!("detect from {peer}: {e}");
                        }
                    }
                });
            }
        });

        DetectingListener { rx }
    }

    /// Await the next connection that did not authenticate as Trojan.
    pub async fn accept(&mut self) -> io::Result<(RewoundStream<S>, SocketAddr)> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::from(crate::error::Error::ListenerClosed))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use tokio::io::duplex;

    #[tokio::test]
    async fn passthrough_on_bare_newline() {
        let (client, server) = duplex(256);
        let directory = MemoryDirectory::new();

        let handle = tokio::spawn(async move { detect(server, &directory).await });

        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"GET / HTTP/1.1\n").await.unwrap();
        drop(client);

        let result = handle.await.unwrap().unwrap();
        assert!(matches!(result, Detected::Passthrough(_)));
    }

    #[tokio::test]
    async fn premature_close_before_prefix_closes_silently() {
        let (client, server) = duplex(256);
        let directory = MemoryDirectory::new();

        let handle = tokio::spawn(async move { detect(server, &directory).await });

        // Fewer than AUTH_PREFIX_LEN bytes, no 0x0A anywhere in them, then the peer
        // hangs up before the preamble ever completes.
        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"GET / HTTP/1.1").await.unwrap();
        drop(client);

        let result = handle.await.unwrap();
        assert!(result.is_err(), "truncated preamble must close, not pass through");
    }

    #[tokio::test]
    async fn premature_close_does_not_mutate_directory() {
        let (client, server) = duplex(256);
        let directory = MemoryDirectory::new();
        directory.add("hunter2").await;

        let handle = tokio::spawn(async move {
            let result = detect(server, &directory).await;
            (result, directory)
        });

        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(b"short, no newline").await.unwrap();
        drop(client);

        let (result, directory) = handle.await.unwrap();
        assert!(result.is_err());
        let token = Token::from_password("hunter2");
        assert!(directory.validate(&token));
        let mut seen = Vec::new();
        directory.range(&mut |_t, c| seen.push(c));
        assert_eq!(seen, vec![crate::directory::TrafficCounter::default()]);
    }

    #[tokio::test]
    async fn authenticates_known_token() {
        let (client, server) = duplex(4096);
        let directory = MemoryDirectory::new();
        directory.add("hunter2").await;
        let token = Token::from_password("hunter2");

        let handle = tokio::spawn(async move { detect(server, &directory).await });

        let req = Request {
            token,
            cmd: crate::proto::Command::Connect,
            addr: crate::proto::AddressSpec::Domain("example.com".into(), 80),
            payload: b"hi",
        };
        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(&req.to_bytes()).await.unwrap();

        let result = handle.await.unwrap().unwrap();
        match result {
            Detected::Trojan(authed) => assert_eq!(authed.token, token),
            Detected::Passthrough(_) => panic!("expected authenticated session"),
        }
    }

    #[tokio::test]
    async fn unknown_token_is_rewound_in_full() {
        let (client, server) = duplex(4096);
        let directory = MemoryDirectory::new();
        let token = Token::from_password("nope");

        let handle = tokio::spawn(async move { detect(server, &directory).await });

        let req = Request {
            token,
            cmd: crate::proto::Command::Connect,
            addr: crate::proto::AddressSpec::Domain("example.com".into(), 80),
            payload: b"hi",
        };
        let bytes = req.to_bytes();
        let mut client = client;
        use tokio::io::AsyncWriteExt;
        client.write_all(&bytes).await.unwrap();

        let result = handle.await.unwrap().unwrap();
        match result {
            Detected::Passthrough(mut rewound) => {
                let mut out = vec![0u8; bytes.len()];
                AsyncReadExt::read_exact(&mut rewound, &mut out).await.unwrap();
                assert_eq!(out, bytes[..bytes.len()]);
            }
            Detected::Trojan(_) => panic!("token should not have validated"),
        }
    }
}
