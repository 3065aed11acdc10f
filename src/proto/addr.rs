// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

use std::fmt::{self, Display, Formatter};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use crate::error::Error;

/// SOCKS5-like address field.
///
/// | ATYP | DST.ADDR | DST.PORT |
/// | ---- | -------- | -------- |
/// |  1   | variable |    2     |
///
/// - `0x01` IPv4: 4-octet address.
/// - `0x03` Domain: one length-prefix octet followed by that many bytes, no NUL.
/// - `0x04` IPv6: 16-octet address.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AddressSpec {
    Ipv4(Ipv4Addr, u16),
    Ipv6(Ipv6Addr, u16),
    Domain(String, u16),
}

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

impl AddressSpec {
    /// Parse an [`AddressSpec`] from the front of `bytes`. Trailing bytes are ignored;
    /// use [`AddressSpec::encoded_len`] to find where it ends.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidAddressType`] if the type byte is unknown,
    /// [`Error::InvalidAddressLength`] if `bytes` is shorter than the declared shape.
    #[inline]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let atyp = *bytes.first().ok_or(Error::InvalidAddressLength)?;
        match atyp {
            ATYP_IPV4 => {
                let b = bytes.get(1..7).ok_or(Error::InvalidAddressLength)?;
                let ip = Ipv4Addr::new(b[0], b[1], b[2], b[3]);
                let port = u16::from_be_bytes([b[4], b[5]]);
                Ok(AddressSpec::Ipv4(ip, port))
            }
            ATYP_IPV6 => {
                let b = bytes.get(1..19).ok_or(Error::InvalidAddressLength)?;
                let octets: [u8; 16] = b[..16].try_into().unwrap();
                let ip = Ipv6Addr::from(octets);
                let port = u16::from_be_bytes([b[16], b[17]]);
                Ok(AddressSpec::Ipv6(ip, port))
            }
            ATYP_DOMAIN => {
                let len = *bytes.get(1).ok_or(Error::InvalidAddressLength)? as usize;
                let b = bytes.get(2..2 + len + 2).ok_or(Error::InvalidAddressLength)?;
                let name = std::str::from_utf8(&b[..len]).map_err(|_| Error::InvalidAddressLength)?;
                let port = u16::from_be_bytes([b[len], b[len + 1]]);
                Ok(AddressSpec::Domain(name.to_owned(), port))
            }
            other => Err(Error::InvalidAddressType(other)),
        }
    }

    /// Append the wire encoding of this address to `buf`.
    #[inline]
    pub fn encode_to(&self, buf: &mut Vec<u8>) {
        match self {
            AddressSpec::Ipv4(ip, port) => {
                buf.push(ATYP_IPV4);
                buf.extend(ip.octets());
                buf.extend(port.to_be_bytes());
            }
            AddressSpec::Ipv6(ip, port) => {
                buf.push(ATYP_IPV6);
                buf.extend(ip.octets());
                buf.extend(port.to_be_bytes());
            }
            AddressSpec::Domain(name, port) => {
                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend(name.as_bytes());
                buf.extend(port.to_be_bytes());
            }
        }
    }

    /// The number of bytes this address takes on the wire.
    #[inline]
    pub fn encoded_len(&self) -> usize {
        match self {
            AddressSpec::Ipv4(..) => 7,
            AddressSpec::Ipv6(..) => 19,
            AddressSpec::Domain(name, _) => 1 + 1 + name.len() + 2,
        }
    }

    /// Build an [`AddressSpec`] that represents `sa`.
    ///
    /// IPv4 sockets always encode as `AddrTypeIPv4`, even when represented internally
    /// as an IPv4-mapped IPv6 address.
    #[inline]
    pub fn from_socket_addr(sa: SocketAddr) -> Self {
        match sa {
            SocketAddr::V4(v4) => AddressSpec::Ipv4(*v4.ip(), v4.port()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(mapped) => AddressSpec::Ipv4(mapped, v6.port()),
                None => AddressSpec::Ipv6(*v6.ip(), v6.port()),
            },
        }
    }

    /// Resolve to a concrete [`SocketAddr`]. `Domain` performs DNS resolution via the
    /// Tokio blocking resolver pool.
    ///
    /// # Errors
    ///
    /// [`Error::ResolutionFailed`] if a `Domain` fails to resolve to any address.
    pub async fn resolve(&self) -> Result<SocketAddr, Error> {
        match self {
            AddressSpec::Ipv4(ip, port) => Ok(SocketAddr::V4(SocketAddrV4::new(*ip, *port))),
            AddressSpec::Ipv6(ip, port) => Ok(SocketAddr::V6(SocketAddrV6::new(*ip, *port, 0, 0))),
            AddressSpec::Domain(host, port) => {
                let query = format!("{}:{}", host, port);
                tokio::net::lookup_host(&query)
                    .await
                    .ok()
                    .and_then(|mut it| it.next())
                    .ok_or_else(|| Error::ResolutionFailed(host.clone()))
            }
        }
    }
}

impl Display for AddressSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpec::Ipv4(ip, port) => write!(f, "{}:{}", ip, port),
            AddressSpec::Ipv6(ip, port) => write!(f, "[{}]:{}", ip, port),
            AddressSpec::Domain(name, port) => write!(f, "{}:{}", name, port),
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::ResolutionFailed(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(addr: AddressSpec, expect_len: usize) {
        let mut buf = Vec::new();
        addr.encode_to(&mut buf);
        assert_eq!(buf.len(), expect_len);
        assert_eq!(addr.encoded_len(), expect_len);
        let decoded = AddressSpec::from_bytes(&buf).unwrap();
        assert_eq!(decoded, addr);
    }

    #[test]
    fn ipv4_round_trip() {
        round_trip(AddressSpec::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 8080), 7);
    }

    #[test]
    fn ipv6_round_trip() {
        round_trip(AddressSpec::Ipv6(Ipv6Addr::LOCALHOST, 443), 19);
    }

    #[test]
    fn domain_round_trip() {
        round_trip(AddressSpec::Domain("example.com".into(), 443), 4 + 11);
    }

    #[test]
    fn rejects_unknown_type() {
        let bytes = [0x02, 0, 0];
        assert!(matches!(
            AddressSpec::from_bytes(&bytes),
            Err(Error::InvalidAddressType(0x02))
        ));
    }

    #[test]
    fn rejects_truncated_ipv4() {
        let bytes = [0x01, 1, 2, 3];
        assert!(matches!(
            AddressSpec::from_bytes(&bytes),
            Err(Error::InvalidAddressLength)
        ));
    }

    #[test]
    fn mapped_ipv4_socket_encodes_as_ipv4() {
        let v4 = Ipv4Addr::new(1, 2, 3, 4);
        let mapped = v4.to_ipv6_mapped();
        let sa = SocketAddr::V6(SocketAddrV6::new(mapped, 53, 0, 0));
        match AddressSpec::from_socket_addr(sa) {
            AddressSpec::Ipv4(ip, port) => {
                assert_eq!(ip, v4);
                assert_eq!(port, 53);
            }
            other => panic!("expected ipv4, got {:?}", other),
        }
    }
}
