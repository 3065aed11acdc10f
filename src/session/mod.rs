// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The relay engine: once a `Request` has been parsed and its token validated, a
//! session dials the requested destination and shuttles bytes until one side closes.

mod context;
pub use context::*;

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::time::{Instant, Sleep};

use crate::dialer::Dialer;
use crate::directory::Directory;
use crate::proto::{AddressSpec, Command, Request, Token, UdpPacket, UdpPacketAssembler, MAX_ADDR_LEN};

/// How long a UDP association may sit idle before the relay gives up on it.
const UDP_IDLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Read buffer size for the TCP and UDP relay loops.
const PAYLOAD_LEN: usize = 65536;

/// Read the command byte and [`AddressSpec`] that follow the 58-byte authentication
/// preamble [`crate::detect::detect`] already consumed, plus the trailing `CRLF`. The
/// initial payload, if the client sent any in the same record, is left unread on
/// `stream` for the relay loop to pick up — there is never a reason to buffer it here.
pub async fn read_request_tail<S>(stream: &mut S) -> io::Result<(Command, AddressSpec)>
where
    S: AsyncRead + Unpin,
{
    let mut cmd_byte = [0u8; 1];
    stream.read_exact(&mut cmd_byte).await?;
    let cmd = Command::from_byte(cmd_byte[0])?;

    let mut atyp = [0u8; 1];
    stream.read_exact(&mut atyp).await?;

    let mut addr_buf = vec![atyp[0]];
    match atyp[0] {
        0x01 => addr_buf.resize(1 + 6, 0),
        0x04 => addr_buf.resize(1 + 18, 0),
        0x03 => {
            let mut len_byte = [0u8; 1];
            stream.read_exact(&mut len_byte).await?;
            addr_buf.push(len_byte[0]);
            addr_buf.resize(2 + len_byte[0] as usize + 2, 0);
        }
        other => return Err(crate::error::Error::InvalidAddressType(other).into()),
    }
    let fixed_start = if atyp[0] == 0x03 { 2 } else { 1 };
    stream.read_exact(&mut addr_buf[fixed_start..]).await?;
    let addr = AddressSpec::from_bytes(&addr_buf)?;

    let mut crlf = [0u8; 2];
    stream.read_exact(&mut crlf).await?;
    if &crlf != crate::proto::CRLF {
        return Err(crate::error::Error::MalformedRequest.into());
    }

    Ok((cmd, addr))
}

#[derive(Default)]
struct SessionCounters {
    up: u64,
    down: u64,
}

impl TrafficSink for SessionCounters {
    fn record_up(&mut self, bytes: usize) {
        self.up += bytes as u64;
    }

    fn record_down(&mut self, bytes: usize) {
        self.down += bytes as u64;
    }
}

/// A validated request dispatched into the relay appropriate for its [`Command`].
pub enum RelaySession {
    Tcp(TcpSession),
    Udp(UdpSession),
}

impl RelaySession {
    /// Dial the destination named by `req` and build the session, without touching the
    /// client stream yet.
    pub async fn new(req: &Request<'_>, dialer: Arc<dyn Dialer>) -> io::Result<RelaySession> {
        match req.cmd {
            Command::Connect => {
                let socket = dialer.dial_tcp(&req.addr).await?;
                Ok(RelaySession::Tcp(TcpSession {
                    socket,
                    payload: req.payload.to_vec(),
                }))
            }
            Command::UdpAssociate => {
                let socket = dialer.listen_udp(&req.addr).await?;
                let mut assembler = UdpPacketAssembler::with_initial(req.payload);
                Ok(RelaySession::Udp(UdpSession { socket, assembler }))
            }
        }
    }

    /// Run the relay to completion, then report accrued traffic to `directory`.
    pub async fn run<S>(self, stream: S, directory: Arc<dyn Directory>, token: Token) -> io::Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let counters = match self {
            RelaySession::Tcp(session) => session.run(stream).await?,
            RelaySession::Udp(session) => session.run(stream).await?,
        };
        directory
            .consume(&token, counters.up as i64, counters.down as i64)
            .await;
        Ok(())
    }
}

pub struct TcpSession {
    socket: tokio::net::TcpStream,
    payload: Vec<u8>,
}

impl TcpSession {
    async fn run<S>(mut self, stream: S) -> io::Result<SessionCounters>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        use tokio::io::AsyncWriteExt;

        let mut counters = SessionCounters::default();
        if !self.payload.is_empty() {
            self.socket.write_all(&self.payload).await?;
            counters.record_up(self.payload.len());
        }

        let mut wrapped = StreamWrapper::new(stream, counters);
        tokio::io::copy_bidirectional(&mut wrapped, &mut self.socket).await?;
        let (_, counters) = wrapped.into_inner();
        Ok(counters)
    }
}

pub struct UdpSession {
    socket: UdpSocket,
    assembler: UdpPacketAssembler,
}

impl UdpSession {
    async fn run<S>(self, stream: S) -> io::Result<SessionCounters>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        UdpSessionFut {
            read_buf: vec![0u8; PAYLOAD_LEN],
            send_buf: vec![0u8; MAX_ADDR_LEN + 4 + PAYLOAD_LEN],
            status: UdpStatus::Recv,
            assembler: self.assembler,
            socket: self.socket,
            address_cache: None,
            deadline: Box::pin(tokio::time::sleep(UDP_IDLE_TIMEOUT)),
            stream,
            counters: SessionCounters::default(),
        }
        .await
    }
}

/// A single cached `(AddressSpec, SocketAddr)` pair, avoiding a fresh DNS resolution
/// for every outbound packet when consecutive packets target the same destination.
struct AddressCache {
    addr: AddressSpec,
    resolved: SocketAddr,
}

type ResolveFut = Pin<Box<dyn Future<Output = io::Result<SocketAddr>> + Send>>;

enum UdpStatus {
    /// Waiting on either the client stream or the UDP socket.
    Recv,
    /// Sending the next assembled frame to the UDP socket.
    Send,
    /// Resolving an uncached destination before it can be sent to.
    Resolve(ResolveFut, AddressSpec, Vec<u8>),
    /// Writing a reply frame back to the client stream.
    Reply(Vec<u8>, usize),
    Shutdown,
}

struct UdpSessionFut<S> {
    read_buf: Vec<u8>,
    send_buf: Vec<u8>,
    status: UdpStatus,
    assembler: UdpPacketAssembler,
    socket: UdpSocket,
    address_cache: Option<AddressCache>,
    deadline: Pin<Box<Sleep>>,
    stream: S,
    counters: SessionCounters,
}

impl<S> Future for UdpSessionFut<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<SessionCounters>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        loop {
            if this.deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Ok(std::mem::take(&mut this.counters)));
            }

            match &mut this.status {
                UdpStatus::Recv => {
                    let mut buf = ReadBuf::new(&mut this.read_buf);
                    if Pin::new(&mut this.stream).poll_read(cx, &mut buf)?.is_ready() {
                        let filled_len = buf.filled().len();
                        if filled_len == 0 {
                            this.status = UdpStatus::Shutdown;
                        } else {
                            this.assembler.extend(&this.read_buf[..filled_len]);
                            this.status = UdpStatus::Send;
                        }
                        reset_deadline(this);
                        continue;
                    }

                    let mut recv_buf = ReadBuf::new(&mut this.read_buf);
                    if let Poll::Ready(Ok(from)) = this.socket.poll_recv_from(cx, &mut recv_buf) {
                        let source = AddressSpec::from_socket_addr(from);
                        let payload_len = recv_buf.filled().len();
                        let range =
                            UdpPacket::encode_into(&mut this.send_buf, &source, &this.read_buf[..payload_len]);
                        this.status = UdpStatus::Reply(this.send_buf[range.clone()].to_vec(), 0);
                        reset_deadline(this);
                        continue;
                    }

                    return Poll::Pending;
                }
                UdpStatus::Send => match this.assembler.next_frame() {
                    Ok(Some((addr, payload))) => match &this.address_cache {
                        Some(cache) if cache.addr == addr => {
                            this.status = UdpStatus::Resolve(
                                Box::pin(std::future::ready(Ok(cache.resolved))),
                                addr,
                                payload,
                            );
                        }
                        _ => {
                            let resolve_addr = addr.clone();
                            let fut: ResolveFut = Box::pin(async move {
                                resolve_addr.resolve().await.map_err(io::Error::from)
                            });
                            this.status = UdpStatus::Resolve(fut, addr, payload);
                        }
                    },
                    Ok(None) => {
                        this.status = UdpStatus::Recv;
                    }
                    Err(e) => return Poll::Ready(Err(e.into())),
                },
                UdpStatus::Resolve(fut, addr, payload) => match fut.as_mut().poll(cx) {
                    Poll::Ready(Ok(target)) => {
                        this.address_cache = Some(AddressCache {
                            addr: addr.clone(),
                            resolved: target,
                        });
                        let frame_len = addr.encoded_len() + 4 + payload.len();
                        let payload = std::mem::take(payload);
                        match this.socket.poll_send_to(cx, &payload, target) {
                            Poll::Ready(Ok(_)) => {
                                this.counters.record_up(frame_len);
                                this.status = UdpStatus::Send;
                                continue;
                            }
                            Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                            Poll::Pending => {
                                this.status = UdpStatus::Resolve(
                                    Box::pin(std::future::ready(Ok(target))),
                                    addr.clone(),
                                    payload,
                                );
                                return Poll::Pending;
                            }
                        }
                    }
                    Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                    Poll::Pending => return Poll::Pending,
                },
                UdpStatus::Reply(buf, written) => {
                    let n = ready!(Pin::new(&mut this.stream).poll_write(cx, &buf[*written..]))?;
                    *written += n;
                    this.counters.record_down(n);
                    if *written == buf.len() {
                        this.status = UdpStatus::Recv;
                    }
                }
                UdpStatus::Shutdown => {
                    ready!(Pin::new(&mut this.stream).poll_shutdown(cx))?;
                    return Poll::Ready(Ok(std::mem::take(&mut this.counters)));
                }
            }
        }
    }
}

fn reset_deadline<S>(this: &mut UdpSessionFut<S>) {
    this.deadline
        .as_mut()
        .reset(Instant::now() + UDP_IDLE_TIMEOUT);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, UdpSocket};

    use crate::dialer::DirectDialer;
    use crate::directory::MemoryDirectory;

    async fn spawn_echo_tcp() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut sock, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        let n = match sock.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        if sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                    let _ = sock.shutdown().await;
                });
            }
        });
        addr
    }

    async fn spawn_echo_udp() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            while let Ok((n, src)) = socket.recv_from(&mut buf).await {
                let _ = socket.send_to(&buf[..n], src).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn tcp_relay_echoes_and_reports_traffic_after_half_close() {
        let echo_addr = spawn_echo_tcp().await;
        let echo_ip = match echo_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        directory.add("relay-user").await;
        let token = Token::from_password("relay-user");

        let req = Request {
            token,
            cmd: Command::Connect,
            addr: AddressSpec::Ipv4(echo_ip, echo_addr.port()),
            payload: b"",
        };
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer);
        let session = RelaySession::new(&req, dialer).await.unwrap();

        let (mut client, server) = tokio::io::duplex(4096);
        let directory_for_run = directory.clone();
        let handle = tokio::spawn(async move { session.run(server, directory_for_run, token).await });

        client.write_all(b"hello").await.unwrap();
        // Half-close: the target must see EOF and stop echoing, and the reverse
        // direction must still drain and complete.
        client.shutdown().await.unwrap();

        let mut echoed = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut echoed))
            .await
            .expect("reverse direction did not complete within the liveness bound")
            .unwrap();
        assert_eq!(echoed, b"hello");

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("session task did not finish")
            .unwrap()
            .unwrap();

        let mut seen = None;
        directory.range(&mut |_, c| seen = Some(c));
        let counters = seen.expect("consume should have recorded a counter for this token");
        assert_eq!(counters.up, 5);
        assert_eq!(counters.down, 5);
    }

    #[tokio::test]
    async fn udp_tunnel_round_trips_one_frame() {
        let echo_addr = spawn_echo_udp().await;
        let echo_ip = match echo_addr.ip() {
            std::net::IpAddr::V4(v4) => v4,
            _ => unreachable!(),
        };

        let directory: Arc<dyn Directory> = Arc::new(MemoryDirectory::new());
        directory.add("udp-user").await;
        let token = Token::from_password("udp-user");

        let req = Request {
            token,
            cmd: Command::UdpAssociate,
            addr: AddressSpec::Ipv4(Ipv4Addr::UNSPECIFIED, 0),
            payload: b"",
        };
        let dialer: Arc<dyn Dialer> = Arc::new(DirectDialer);
        let session = RelaySession::new(&req, dialer).await.unwrap();

        let (mut client, server) = tokio::io::duplex(8192);
        let directory_for_run = directory.clone();
        let handle = tokio::spawn(async move { session.run(server, directory_for_run, token).await });

        let target = AddressSpec::Ipv4(echo_ip, echo_addr.port());
        let frame = UdpPacket::encode(&target, b"ping");
        client.write_all(&frame).await.unwrap();

        let mut resp = vec![0u8; 4096];
        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut resp))
            .await
            .expect("no reply frame within the liveness bound")
            .unwrap();
        let (packet, consumed) = UdpPacket::parse(&resp[..n]).unwrap().unwrap();
        assert_eq!(consumed, n);
        assert_eq!(packet.payload, b"ping");
        assert_eq!(packet.addr, target);

        // The UDP association has no explicit close short of the 10-minute idle
        // deadline; the round trip above is what this test cares about.
        handle.abort();
    }
}
