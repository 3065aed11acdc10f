// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! gRPC-over-HTTP/2 transport: a single bidirectional stream carrying the TLV framing
//! gRPC uses for a stream of protobuf messages — 1-byte compression flag, 4-byte
//! big-endian message length, then one protobuf field (tag `0x0A`, varint length,
//! payload) per message. Each message's payload is one chunk of the Trojan byte
//! stream; message boundaries carry no other meaning.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use http::HeaderMap;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::error::Error;

const PROTOBUF_TAG: u8 = 0x0A;

/// Encode one payload as a complete gRPC message frame.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let mut varint = Vec::new();
    write_uvarint(payload.len() as u64, &mut varint);
    let msg_len = 1 + varint.len() + payload.len();

    let mut buf = Vec::with_capacity(5 + msg_len);
    buf.push(0); // uncompressed
    buf.extend((msg_len as u32).to_be_bytes());
    buf.push(PROTOBUF_TAG);
    buf.extend(varint);
    buf.extend(payload);
    buf
}

/// Incrementally assembles gRPC message frames out of a byte stream, yielding each
/// message's payload in order.
#[derive(Default)]
pub struct FrameAssembler {
    buf: Vec<u8>,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pull the next complete message's payload out of the buffer, if any.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let msg_len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        let total = 5 + msg_len;
        if self.buf.len() < total {
            return Ok(None);
        }
        if self.buf[5] != PROTOBUF_TAG {
            return Err(Error::MalformedRequest);
        }
        let (payload_len, varint_size) = read_uvarint(&self.buf[6..total])?;
        let payload_start = 6 + varint_size;
        if payload_start + payload_len as usize != total {
            return Err(Error::MalformedRequest);
        }

        let payload = self.buf[payload_start..total].to_vec();
        self.buf.drain(..total);
        Ok(Some(payload))
    }
}

fn write_uvarint(mut value: u64, out: &mut Vec<u8>) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

fn read_uvarint(bytes: &[u8]) -> Result<(u64, usize), Error> {
    let mut value = 0u64;
    for (i, &byte) in bytes.iter().enumerate() {
        value |= ((byte & 0x7f) as u64) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        if i == 9 {
            return Err(Error::MalformedRequest);
        }
    }
    Err(Error::MalformedRequest)
}

/// Wraps a single `h2` request/response stream, presenting it as a plain byte duplex.
pub struct GrpcDuplex {
    recv: h2::RecvStream,
    send: h2::SendStream<Bytes>,
    assembler: FrameAssembler,
    eof: bool,
}

impl GrpcDuplex {
    pub fn new(recv: h2::RecvStream, send: h2::SendStream<Bytes>) -> Self {
        GrpcDuplex {
            recv,
            send,
            assembler: FrameAssembler::new(),
            eof: false,
        }
    }
}

impl AsyncRead for GrpcDuplex {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        loop {
            match this.assembler.next_frame() {
                Ok(Some(payload)) => {
                    buf.put_slice(&payload);
                    return Poll::Ready(Ok(()));
                }
                Ok(None) => {}
                Err(e) => return Poll::Ready(Err(e.into())),
            }
            if this.eof {
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.recv).poll_data(cx)) {
                Some(Ok(chunk)) => {
                    let _ = this.recv.flow_control().release_capacity(chunk.len());
                    this.assembler.extend(&chunk);
                }
                Some(Err(e)) => return Poll::Ready(Err(io::Error::new(io::ErrorKind::Other, e))),
                None => this.eof = true,
            }
        }
    }
}

impl AsyncWrite for GrpcDuplex {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let frame = encode_frame(buf);

        this.send.reserve_capacity(frame.len());
        let available = ready!(this.send.poll_capacity(cx))
            .transpose()
            .map_err(to_io_error)?
            .unwrap_or(0);
        if available < frame.len() {
            // Not enough flow-control window yet for a whole message; try again once
            // more capacity is granted rather than fragment the frame.
            cx.waker().wake_by_ref();
            return Poll::Pending;
        }

        this.send
            .send_data(Bytes::from(frame), false)
            .map_err(to_io_error)?;
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let mut trailers = HeaderMap::new();
        trailers.insert("grpc-status", http::HeaderValue::from_static("0"));
        this.send.send_trailers(trailers).map_err(to_io_error)?;
        Poll::Ready(Ok(()))
    }
}

fn to_io_error(e: h2::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_round_trip() {
        let payload = b"hello trojan".to_vec();
        let bytes = encode_frame(&payload);

        let mut asm = FrameAssembler::new();
        asm.extend(&bytes);
        let decoded = asm.next_frame().unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert!(asm.next_frame().unwrap().is_none());
    }

    #[test]
    fn frame_round_trip_large_payload() {
        let payload = vec![0x42u8; 300]; // forces a multi-byte varint
        let bytes = encode_frame(&payload);
        let mut asm = FrameAssembler::new();
        asm.extend(&bytes);
        assert_eq!(asm.next_frame().unwrap().unwrap(), payload);
    }

    #[test]
    fn assembler_handles_fragmentation() {
        let f1 = encode_frame(b"one");
        let f2 = encode_frame(b"two");

        let mut asm = FrameAssembler::new();
        asm.extend(&f1[..f1.len() - 2]);
        assert!(asm.next_frame().unwrap().is_none());
        asm.extend(&f1[f1.len() - 2..]);
        asm.extend(&f2);

        assert_eq!(asm.next_frame().unwrap().unwrap(), b"one");
        assert_eq!(asm.next_frame().unwrap().unwrap(), b"two");
    }

    #[test]
    fn rejects_wrong_tag() {
        let mut bytes = encode_frame(b"x");
        bytes[5] = 0x12;
        let mut asm = FrameAssembler::new();
        asm.extend(&bytes);
        assert!(matches!(asm.next_frame(), Err(Error::MalformedRequest)));
    }
}
