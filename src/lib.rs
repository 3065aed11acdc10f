// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2022 irohaede <irohaede@proton.me>

//! Trojan
//!
//! A TLS-camouflaged proxy: clients that present a valid token are relayed to
//! arbitrary TCP/UDP destinations; everyone else is handed, byte-for-byte, to a
//! fallback HTTP handler. See [`detect`] for the discriminator and [`session`] for the
//! relay engine.

pub mod error;
pub mod proto;
pub mod utils;

pub mod dialer;
pub mod directory;
pub mod session;

pub mod detect;
pub mod transport;

pub mod admin;
pub mod config;
pub mod tls;

pub use error::Error;
