// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! Trojan Protocol
//!
//! Trojan is designed to build a tunnel through firewalls to bypass blocking and
//! censorship, using TLS just like modern browsers and web servers to reduce the
//! potential for detection.
//!
//! # Wire format
//!
//! ```text
//! [ 56 bytes hex token ] [ CRLF ] [ 1 byte cmd ] [ AddressSpec ] [ CRLF ] [ payload ]
//! ```
//!
//! If the server fails to parse the request or fails to verify the presented token, it
//! must not emit any protocol-level error. The only observable behavior is that the
//! connection is handed to the fallback endpoint instead. See [`crate::detect`].

use std::fmt::{self, Display, Formatter};
use std::hash::{Hash, Hasher};

mod addr;
mod udp_packet;

pub use addr::*;
pub use udp_packet::*;

use crate::error::Error;

pub(crate) const CRLF: &[u8] = b"\r\n";

/// SHA-224 password digest.
///
/// In a Trojan request this is presented as 56 bytes of lowercase hexadecimal ASCII.
#[derive(Copy, Clone, Debug, Eq)]
pub struct Token {
    pub raw: [u8; 28],
}

impl Token {
    /// Hash a UTF-8 password into its token.
    #[inline]
    pub fn from_password(password: &str) -> Self {
        use sha2::{Digest, Sha224};
        let digest = Sha224::digest(password.as_bytes());
        Token { raw: digest.into() }
    }

    /// Parse from 56 bytes of hexadecimal ASCII.
    ///
    /// # Errors
    ///
    /// If `bytes` is not exactly 56 bytes, or contains non-hexadecimal characters.
    #[inline]
    pub fn from_hex(bytes: &[u8]) -> Result<Self, Error> {
        if bytes.len() != 56 {
            return Err(Error::MalformedRequest);
        }
        let mut raw = [0u8; 28];
        for (i, b) in raw.iter_mut().enumerate() {
            *b = hex_to_u8(bytes[i * 2], bytes[i * 2 + 1]).ok_or(Error::MalformedRequest)?;
        }
        Ok(Token { raw })
    }

    /// Convert to lowercase hexadecimal ASCII.
    #[inline]
    pub fn to_hex(&self) -> [u8; 56] {
        let mut raw = [0u8; 56];
        for (i, b) in self.raw.iter().enumerate() {
            let (h0, h1) = u8_to_hex(*b);
            raw[2 * i] = h0;
            raw[2 * i + 1] = h1;
        }
        raw
    }
}

impl Display for Token {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        // SAFETY: to_hex only ever emits ASCII hex digits.
        let str = unsafe { std::str::from_utf8_unchecked(&hex) };
        f.write_str(str)
    }
}

impl Hash for Token {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write(&self.raw);
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

/// Trojan (SOCKS5-like) command.
///
/// `Bind` is not part of Trojan and therefore has no variant here.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// `0x01`: Connect / TCP stream.
    Connect = 0x01,
    /// `0x03`: UDP associate / UDP packet stream.
    UdpAssociate = 0x03,
}

impl Command {
    #[inline]
    pub fn from_byte(byte: u8) -> Result<Self, Error> {
        match byte {
            0x01 => Ok(Command::Connect),
            0x03 => Ok(Command::UdpAssociate),
            other => Err(Error::InvalidCommand(other)),
        }
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let s = match self {
            Command::Connect => "tcp",
            Command::UdpAssociate => "udp",
        };
        f.write_str(s)
    }
}

/// A parsed Trojan request header.
///
/// | Token | CRLF | Command | [`AddressSpec`] | CRLF | payload |
/// | ----- | ---- | ------- | ---------------- | ---- | ------- |
/// |  56   |  2   |    1    |  variable         |  2   | variable |
pub struct Request<'a> {
    pub token: Token,
    pub cmd: Command,
    pub addr: AddressSpec,
    pub payload: &'a [u8],
}

impl<'a> Request<'a> {
    /// The length of the fixed authentication preamble: 56-byte token + CRLF.
    pub const AUTH_PREFIX_LEN: usize = 58;

    /// Parse a complete Trojan request out of `bytes`.
    ///
    /// The caller is expected to have already authenticated the first
    /// [`Request::AUTH_PREFIX_LEN`] bytes (see [`crate::detect`]); this still
    /// re-validates them so the parser is self-contained and testable in isolation.
    #[inline]
    pub fn from_bytes(bytes: &'a [u8]) -> Result<Self, Error> {
        if bytes.len() < Self::AUTH_PREFIX_LEN + 1 {
            return Err(Error::MalformedRequest);
        }
        let token = Token::from_hex(&bytes[..56])?;
        if &bytes[56..58] != CRLF {
            return Err(Error::MalformedRequest);
        }
        let cmd = Command::from_byte(bytes[58])?;

        let rest = &bytes[59..];
        let addr = AddressSpec::from_bytes(rest)?;
        let addr_len = addr.encoded_len();

        let tail = rest
            .get(addr_len..addr_len + 2)
            .ok_or(Error::InvalidAddressLength)?;
        if tail != CRLF {
            return Err(Error::MalformedRequest);
        }

        Ok(Request {
            token,
            cmd,
            addr,
            payload: &rest[addr_len + 2..],
        })
    }

    /// Serialize this request back to bytes (used by tests and by outbound tooling).
    #[inline]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(56 + 2 + 1 + self.addr.encoded_len() + 2 + self.payload.len());
        buf.extend(self.token.to_hex());
        buf.extend(CRLF);
        buf.push(self.cmd as u8);
        self.addr.encode_to(&mut buf);
        buf.extend(CRLF);
        buf.extend(self.payload);
        buf
    }
}

#[inline]
fn hex_to_u8(h0: u8, h1: u8) -> Option<u8> {
    let n0 = hex_nibble(h0)?;
    let n1 = hex_nibble(h1)?;
    Some(n0 << 4 | n1)
}

#[inline]
fn hex_nibble(h: u8) -> Option<u8> {
    match h {
        b'0'..=b'9' => Some(h - b'0'),
        b'a'..=b'f' => Some(h - b'a' + 0x0a),
        b'A'..=b'F' => Some(h - b'A' + 0x0a),
        _ => None,
    }
}

#[inline]
fn u8_to_hex(n: u8) -> (u8, u8) {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    (HEX[(n >> 4) as usize], HEX[(n & 0x0f) as usize])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_determinism() {
        let a = Token::from_password("test1234");
        let b = Token::from_password("test1234");
        assert_eq!(a, b);
        let hex = a.to_hex();
        assert_eq!(hex.len(), 56);
        assert!(hex.iter().all(|b| b.is_ascii_hexdigit() && !b.is_ascii_uppercase()));
    }

    #[test]
    fn token_hex_round_trip() {
        let t = Token::from_password("hello world");
        let hex = t.to_hex();
        let back = Token::from_hex(&hex).unwrap();
        assert_eq!(t, back);
    }

    #[test]
    fn request_round_trip() {
        let addr = AddressSpec::Domain("example.com".into(), 443);
        let req = Request {
            token: Token::from_password("p@ss"),
            cmd: Command::Connect,
            addr,
            payload: b"hello",
        };
        let bytes = req.to_bytes();
        let parsed = Request::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.token, req.token);
        assert_eq!(parsed.cmd, req.cmd);
        assert_eq!(parsed.addr, req.addr);
        assert_eq!(parsed.payload, req.payload);
    }

    #[test]
    fn rejects_bad_command() {
        let mut bytes = Request {
            token: Token::from_password("p"),
            cmd: Command::Connect,
            addr: AddressSpec::Domain("x".into(), 1),
            payload: b"",
        }
        .to_bytes();
        bytes[58] = 0x05;
        assert!(matches!(
            Request::from_bytes(&bytes),
            Err(Error::InvalidCommand(0x05))
        ));
    }
}
