// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Alternate transports that carry the same Trojan preamble/command/data stream as
//! raw TCP, but arrive wrapped in a different protocol. Each adapter presents a plain
//! `AsyncRead + AsyncWrite` so the session engine never needs to know which one is
//! underneath: the 56-byte token, command byte, address, and payload are identical
//! regardless of transport. Half-close is carried by each adapter's own
//! `poll_shutdown` (a WS close frame, gRPC trailers, or dropping the HTTP CONNECT
//! response sender), driven by `copy_bidirectional` the same way a TCP `shutdown`
//! would be.

pub mod grpc;
pub mod http_connect;
pub mod ws;

pub use grpc::GrpcDuplex;
pub use http_connect::HttpConnectDuplex;
pub use ws::WsDuplex;

use base64::Engine;

use crate::error::Error;
use crate::proto::Token;

/// Length of `Basic <base64>` once the 56-byte token is base64-encoded with padding.
const BASIC_TOKEN_LEN: usize = 76;

/// Extract the 56-byte token out of an HTTP CONNECT `Proxy-Authorization` header
/// value. Never touches the directory with the transport-specific encoding — only the
/// raw token ever becomes a lookup key.
pub fn token_from_proxy_authorization(header: &str) -> Result<Token, Error> {
    let b64 = header.strip_prefix("Basic ").ok_or(Error::MalformedRequest)?;
    if b64.len() != BASIC_TOKEN_LEN {
        return Err(Error::MalformedRequest);
    }
    let raw = base64::engine::general_purpose::STANDARD
        .decode(b64)
        .map_err(|_| Error::MalformedRequest)?;
    Token::from_hex(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_authorization_round_trip() {
        let token = Token::from_password("hunter2");
        let hex = token.to_hex();
        let b64 = base64::engine::general_purpose::STANDARD.encode(hex);
        assert_eq!(b64.len(), BASIC_TOKEN_LEN);
        let header = format!("Basic {b64}");
        let parsed = token_from_proxy_authorization(&header).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn rejects_missing_basic_prefix() {
        let err = token_from_proxy_authorization("Bearer xyz");
        assert!(matches!(err, Err(Error::MalformedRequest)));
    }

    #[test]
    fn rejects_wrong_length() {
        let err = token_from_proxy_authorization("Basic dG9vc2hvcnQ=");
        assert!(matches!(err, Err(Error::MalformedRequest)));
    }
}
