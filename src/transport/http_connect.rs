// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! HTTP CONNECT transport, over an HTTP/2 (or HTTP/3) request: the token rides in
//! `Proxy-Authorization: Basic <base64>`, and once validated, the request body and
//! response writer together form the duplex the session engine relays over.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use hyper::body::HttpBody;
use hyper::{Body, Response};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::directory::Directory;
use crate::proto::Token;

use super::token_from_proxy_authorization;

/// A connected HTTP CONNECT request: `req.into_body()` paired with the sender feeding
/// the response body, presented as a plain byte duplex.
pub struct HttpConnectDuplex {
    body: Body,
    sender: Option<hyper::body::Sender>,
    read_buf: Bytes,
}

impl HttpConnectDuplex {
    pub fn new(body: Body, sender: hyper::body::Sender) -> Self {
        HttpConnectDuplex {
            body,
            sender: Some(sender),
            read_buf: Bytes::new(),
        }
    }
}

impl AsyncRead for HttpConnectDuplex {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if !this.read_buf.is_empty() {
            let n = this.read_buf.len().min(buf.remaining());
            buf.put_slice(&this.read_buf[..n]);
            this.read_buf = this.read_buf.split_off(n);
            return Poll::Ready(Ok(()));
        }

        match ready!(Pin::new(&mut this.body).poll_data(cx)) {
            Some(Ok(chunk)) => {
                this.read_buf = chunk;
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf = this.read_buf.split_off(n);
                Poll::Ready(Ok(()))
            }
            Some(Err(e)) => Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
            None => Poll::Ready(Ok(())),
        }
    }
}

impl AsyncWrite for HttpConnectDuplex {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let sender = match this.sender.as_mut() {
            Some(sender) => sender,
            None => return Poll::Ready(Ok(buf.len())),
        };
        ready!(sender.poll_ready(cx)).map_err(to_io_error)?;
        sender
            .try_send_data(Bytes::copy_from_slice(buf))
            .map_err(|_| io::Error::new(io::ErrorKind::WouldBlock, "response body receiver gone"))?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // Dropping the sender ends the response body cleanly, with no trailing error
        // the client would otherwise see from an explicit `abort`.
        self.get_mut().sender.take();
        Poll::Ready(Ok(()))
    }
}

fn to_io_error(e: hyper::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Validate an incoming HTTP CONNECT request's `Proxy-Authorization` header and, if
/// it carries a registered token, hand `dispatch` the resulting duplex. The HTTP
/// response is returned immediately with a streaming body; the duplex is only torn
/// down once `dispatch` completes.
pub async fn handle<F, Fut>(
    req: http::Request<Body>,
    directory: &dyn Directory,
    dispatch: F,
) -> Response<Body>
where
    F: FnOnce(HttpConnectDuplex, Token) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let token = req
        .headers()
        .get(http::header::PROXY_AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| token_from_proxy_authorization(v).ok());

    let token = match token {
        Some(t) if directory.validate(&t) => t,
        _ => {
            return Response::builder()
                .status(http::StatusCode::FORBIDDEN)
                .body(Body::empty())
                .expect("static response is well-formed");
        }
    };

    let (sender, body) = Body::channel();
    let duplex = HttpConnectDuplex::new(req.into_body(), sender);
    tokio::spawn(dispatch(duplex, token));

    Response::builder()
        .status(http::StatusCode::OK)
        .body(body)
        .expect("static response is well-formed")
}
