// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Outbound connectivity, abstracted behind a trait so alternative proxy chains
//! (SOCKS5, HTTP CONNECT, WireGuard, Shadowsocks) can plug in without touching the
//! session engine. Only the direct OS dialer ships.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use tokio::net::{TcpStream, UdpSocket};

use crate::proto::AddressSpec;

/// Outbound connectivity a session engine needs: dial a TCP stream, or open a UDP
/// socket free to send to arbitrary destinations.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a TCP connection to `addr`.
    async fn dial_tcp(&self, addr: &AddressSpec) -> io::Result<TcpStream>;

    /// Open a UDP socket suitable for sending to (and receiving from) arbitrary peers.
    ///
    /// `hint` is the address the client first associated with, which some dialers use
    /// to pick an address family for the local bind; it is not a destination.
    async fn listen_udp(&self, hint: &AddressSpec) -> io::Result<UdpSocket>;
}

/// The default [`Dialer`]: resolves via the OS resolver and dials directly.
#[derive(Default, Clone, Copy)]
pub struct DirectDialer;

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, addr: &AddressSpec) -> io::Result<TcpStream> {
        let sa = addr.resolve().await.map_err(io::Error::from)?;
        TcpStream::connect(sa).await
    }

    async fn listen_udp(&self, hint: &AddressSpec) -> io::Result<UdpSocket> {
        let bind: IpAddr = match hint {
            AddressSpec::Ipv6(..) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            _ => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        UdpSocket::bind(SocketAddr::new(bind, 0)).await
    }
}
