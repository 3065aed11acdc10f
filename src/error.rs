// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Error kinds shared across the proxy core.
//!
//! Everything that crosses an `async fn` boundary collapses to [`std::io::Error`],
//! matching the convention already used for wire parsing in [`crate::proto`]. This
//! module defines the vocabulary of [`io::ErrorKind::Other`] payloads the rest of the
//! crate produces, so callers can match on [`Error::downcast`] when they need to.

use std::error::Error as StdError;
use std::fmt::{self, Display, Formatter};
use std::io;

/// A proxy-core error, convertible to [`io::Error`] at any await point.
#[derive(Debug)]
pub enum Error {
    /// The connection did not present a valid Trojan preamble; the detection listener
    /// recovers from this locally by handing the connection back to the host HTTP
    /// server. It should rarely escape [`crate::detect`].
    NotTrojan,
    /// The address type byte was not one of `{0x01, 0x03, 0x04}`.
    InvalidAddressType(u8),
    /// The buffer was shorter than the address shape implied by its type byte.
    InvalidAddressLength,
    /// The command byte was not `0x01` (Connect) or `0x03` (UdpAssociate).
    InvalidCommand(u8),
    /// A `CRLF` separator was expected but not found.
    MalformedRequest,
    /// `Domain` resolution failed for the given host.
    ResolutionFailed(String),
    /// The active [`crate::dialer::Dialer`] cannot open a UDP socket.
    UdpUnsupported,
    /// The persistent directory backend failed; the in-memory state is still
    /// authoritative and the session is not torn down because of this.
    DirectoryBackendError(String),
    /// The wrapping listener was closed; further `accept` calls observe this.
    ListenerClosed,
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotTrojan => write!(f, "not a trojan request"),
            Error::InvalidAddressType(b) => write!(f, "invalid address type: {:#04x}", b),
            Error::InvalidAddressLength => write!(f, "truncated address"),
            Error::InvalidCommand(b) => write!(f, "invalid command: {:#04x}", b),
            Error::MalformedRequest => write!(f, "malformed trojan request"),
            Error::ResolutionFailed(host) => write!(f, "failed to resolve {}", host),
            Error::UdpUnsupported => write!(f, "dialer does not support udp"),
            Error::DirectoryBackendError(msg) => write!(f, "directory backend error: {}", msg),
            Error::ListenerClosed => write!(f, "listener closed"),
        }
    }
}

impl StdError for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        let kind = match &e {
            Error::ListenerClosed => io::ErrorKind::NotConnected,
            Error::InvalidAddressType(_)
            | Error::InvalidAddressLength
            | Error::InvalidCommand(_)
            | Error::MalformedRequest
            | Error::NotTrojan => io::ErrorKind::InvalidData,
            Error::ResolutionFailed(_) => io::ErrorKind::NotFound,
            Error::UdpUnsupported => io::ErrorKind::Unsupported,
            Error::DirectoryBackendError(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, e)
    }
}
