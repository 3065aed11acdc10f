// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

use crate::error::Error;

use super::{AddressSpec, CRLF};

/// Maximum bytes an [`AddressSpec`] can take on the wire (domain name of length 255).
pub const MAX_ADDR_LEN: usize = 1 + 1 + 255 + 2;

/// Maximum UDP payload a single frame can carry.
pub const MAX_PAYLOAD_LEN: usize = 65535;

/// UDP packet framing used to multiplex datagrams over the Trojan TCP stream.
///
/// | [`AddressSpec`] | length (u16 BE) | CRLF | payload |
/// | ---------------- | ---------------- | ---- | ------- |
/// | variable          | 2                | 2    | variable |
///
/// The same shape is used in both directions: client-to-server frames carry the
/// destination, server-to-client frames carry the inbound packet's source.
pub struct UdpPacket<'a> {
    pub addr: AddressSpec,
    pub payload: &'a [u8],
}

impl<'a> UdpPacket<'a> {
    /// Parse one frame from the front of `bytes`.
    ///
    /// Returns `Ok(None)` when `bytes` does not yet contain a complete frame (more
    /// data is expected to arrive on the stream); `Err` only for frames that are
    /// already malformed given what has arrived so far.
    pub fn parse(bytes: &'a [u8]) -> Result<Option<(Self, usize)>, Error> {
        let addr = match AddressSpec::from_bytes(bytes) {
            Ok(addr) => addr,
            Err(Error::InvalidAddressLength) => return Ok(None),
            Err(e) => return Err(e),
        };
        let addr_len = addr.encoded_len();

        let Some(header) = bytes.get(addr_len..addr_len + 4) else {
            return Ok(None);
        };
        let len = u16::from_be_bytes([header[0], header[1]]) as usize;
        if &header[2..4] != CRLF {
            return Err(Error::MalformedRequest);
        }

        let total = addr_len + 4 + len;
        let Some(frame) = bytes.get(..total) else {
            return Ok(None);
        };
        Ok(Some((
            UdpPacket {
                addr,
                payload: &frame[addr_len + 4..],
            },
            total,
        )))
    }

    /// Serialize this frame. `payload.len()` must fit in a `u16`.
    pub fn encode(addr: &AddressSpec, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(addr.encoded_len() + 4 + payload.len());
        addr.encode_to(&mut buf);
        buf.extend((payload.len() as u16).to_be_bytes());
        buf.extend(CRLF);
        buf.extend(payload);
        buf
    }

    /// Encode directly into a fixed buffer so the address sits immediately before the
    /// length field, letting the caller issue a single contiguous write regardless of
    /// address family. Returns the byte range of the populated envelope within `buf`.
    ///
    /// `buf` must be at least [`MAX_ADDR_LEN`] `+ 4 +` `payload.len()` bytes.
    pub fn encode_into(buf: &mut [u8], addr: &AddressSpec, payload: &[u8]) -> std::ops::Range<usize> {
        let addr_len = addr.encoded_len();
        let start = MAX_ADDR_LEN - addr_len;

        let mut addr_bytes = Vec::with_capacity(addr_len);
        addr.encode_to(&mut addr_bytes);
        buf[start..MAX_ADDR_LEN].copy_from_slice(&addr_bytes);

        let len_end = MAX_ADDR_LEN + 2;
        buf[MAX_ADDR_LEN..len_end].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        buf[len_end..len_end + 2].copy_from_slice(CRLF);
        buf[len_end + 2..len_end + 2 + payload.len()].copy_from_slice(payload);

        start..(len_end + 2 + payload.len())
    }
}

/// Incremental assembler for a stream of [`UdpPacket`] frames.
///
/// A single `AsyncRead` poll can deliver a partial frame, multiple frames, or a
/// frame plus the start of the next one, so frames must be assembled from a growing
/// buffer rather than parsed off one read at a time.
#[derive(Default)]
pub struct UdpPacketAssembler {
    buf: Vec<u8>,
}

impl UdpPacketAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the assembler with bytes already read (e.g. the Trojan request's trailing
    /// payload, which may itself begin a UDP frame).
    pub fn with_initial(bytes: &[u8]) -> Self {
        UdpPacketAssembler { buf: bytes.to_vec() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete frame out of the buffer, if any, discarding its bytes.
    pub fn next_frame(&mut self) -> Result<Option<(AddressSpec, Vec<u8>)>, Error> {
        match UdpPacket::parse(&self.buf)? {
            Some((packet, consumed)) => {
                let addr = packet.addr.clone();
                let payload = packet.payload.to_vec();
                self.buf.drain(..consumed);
                Ok(Some((addr, payload)))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn udp_frame_round_trip() {
        let addr = AddressSpec::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 5353);
        let payload = b"ping".to_vec();
        let bytes = UdpPacket::encode(&addr, &payload);
        let (packet, consumed) = UdpPacket::parse(&bytes).unwrap().unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(packet.addr, addr);
        assert_eq!(packet.payload, &payload[..]);
    }

    #[test]
    fn incomplete_frame_is_not_ready() {
        let addr = AddressSpec::Domain("x.test".into(), 80);
        let bytes = UdpPacket::encode(&addr, b"hello world");
        let partial = &bytes[..bytes.len() - 3];
        assert!(UdpPacket::parse(partial).unwrap().is_none());
    }

    #[test]
    fn assembler_handles_fragmented_and_coalesced_frames() {
        let addr = AddressSpec::Ipv4(Ipv4Addr::new(10, 0, 0, 1), 53);
        let f1 = UdpPacket::encode(&addr, b"one");
        let f2 = UdpPacket::encode(&addr, b"two");

        let mut asm = UdpPacketAssembler::new();
        // fragment f1 across two writes
        asm.extend(&f1[..f1.len() - 1]);
        assert!(asm.next_frame().unwrap().is_none());
        asm.extend(&f1[f1.len() - 1..]);
        // and coalesce f2 right after
        asm.extend(&f2);

        let (a1, p1) = asm.next_frame().unwrap().unwrap();
        assert_eq!(a1, addr);
        assert_eq!(p1, b"one");

        let (a2, p2) = asm.next_frame().unwrap().unwrap();
        assert_eq!(a2, addr);
        assert_eq!(p2, b"two");

        assert!(asm.next_frame().unwrap().is_none());
    }

    #[test]
    fn encode_into_lays_address_immediately_before_length() {
        let addr = AddressSpec::Ipv4(Ipv4Addr::new(127, 0, 0, 1), 9);
        let mut buf = [0u8; MAX_ADDR_LEN + 4 + 5];
        let range = UdpPacket::encode_into(&mut buf, &addr, b"hello");
        let slice = &buf[range];
        let (packet, consumed) = UdpPacket::parse(slice).unwrap().unwrap();
        assert_eq!(consumed, slice.len());
        assert_eq!(packet.addr, addr);
        assert_eq!(packet.payload, b"hello");
    }
}
