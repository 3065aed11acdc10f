// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The credential directory: a concurrent mapping from authentication tokens to
//! per-user traffic counters.
//!
//! [`MemoryDirectory`] is the hot path every accepted connection validates against: a
//! single concurrent map from token to a mutex-guarded traffic pair, with no nested
//! per-IP bookkeeping. [`write_behind::WriteBehindDirectory`] layers asynchronous
//! persistence on top without slowing down `validate`.

pub mod backend;
pub mod write_behind;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;

use crate::proto::Token;

/// A snapshot of one user's accumulated traffic, in bytes.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct TrafficCounter {
    /// Bytes read from the client (sent toward the internet).
    pub up: i64,
    /// Bytes written to the client (received from the internet).
    pub down: i64,
}

/// The credential directory contract.
///
/// `validate` is called on every accepted connection and must stay cheap and
/// reader-parallel. `consume` is called once per completed session. `add`/`delete`/
/// `range` are admin operations and may be comparatively expensive.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Register `password`'s token with a zeroed counter. A no-op if the token is
    /// already present — the existing counter is never reset.
    async fn add(&self, password: &str);

    /// Remove `password`'s token and its counter, if present.
    async fn delete(&self, password: &str);

    /// Membership test. Must be lock-free or reader-parallel: this runs on every
    /// accepted connection.
    fn validate(&self, token: &Token) -> bool;

    /// Atomically add `up_delta`/`down_delta` to `token`'s counter. A no-op — it must
    /// not implicitly create a record — if `token` is unknown.
    async fn consume(&self, token: &Token, up_delta: i64, down_delta: i64);

    /// Visit every `(token, up, down)` record. Each per-user pair is observed
    /// atomically; the snapshot need not be consistent across different users.
    fn range(&self, visitor: &mut dyn FnMut(&Token, TrafficCounter));

    /// Flush and stop any background work started by this directory, so a graceful
    /// process shutdown can rely on every mutation up to this point having reached
    /// persistent storage. A no-op for directories with no background worker.
    async fn shutdown(&self) {}
}

/// In-memory [`Directory`]: one concurrent map, atomic-pair counter values.
///
/// `validate` takes only a read lock on the map structure (insertion/removal is rare);
/// counter updates never block a concurrent `validate`.
pub struct MemoryDirectory {
    users: RwLock<HashMap<[u8; 28], Arc<Mutex<TrafficCounter>>>>,
}

impl Default for MemoryDirectory {
    fn default() -> Self {
        MemoryDirectory {
            users: RwLock::new(HashMap::new()),
        }
    }
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a token directly with the given starting counter, used by
    /// [`write_behind::WriteBehindDirectory`] to preload from a persistent backend
    /// without re-deriving tokens from passwords.
    pub fn insert_raw(&self, raw: [u8; 28], counter: TrafficCounter) {
        let mut users = self.users.write().unwrap();
        users.entry(raw).or_insert_with(|| Arc::new(Mutex::new(counter)));
    }

    fn add_raw(&self, raw: [u8; 28]) {
        let mut users = self.users.write().unwrap();
        users
            .entry(raw)
            .or_insert_with(|| Arc::new(Mutex::new(TrafficCounter::default())));
    }

    fn delete_raw(&self, raw: &[u8; 28]) {
        self.users.write().unwrap().remove(raw);
    }

    /// Current counter value for `token`, if registered.
    pub fn get(&self, token: &Token) -> Option<TrafficCounter> {
        let users = self.users.read().unwrap();
        users.get(&token.raw).map(|c| *c.lock().unwrap())
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn add(&self, password: &str) {
        let token = Token::from_password(password);
        self.add_raw(token.raw);
    }

    async fn delete(&self, password: &str) {
        let token = Token::from_password(password);
        self.delete_raw(&token.raw);
    }

    fn validate(&self, token: &Token) -> bool {
        self.users.read().unwrap().contains_key(&token.raw)
    }

    async fn consume(&self, token: &Token, up_delta: i64, down_delta: i64) {
        let counter = {
            let users = self.users.read().unwrap();
            match users.get(&token.raw) {
                Some(c) => c.clone(),
                None => return,
            }
        };
        let mut counter = counter.lock().unwrap();
        counter.up += up_delta;
        counter.down += down_delta;
    }

    fn range(&self, visitor: &mut dyn FnMut(&Token, TrafficCounter)) {
        let users = self.users.read().unwrap();
        for (raw, counter) in users.iter() {
            let token = Token { raw: *raw };
            let snapshot = *counter.lock().unwrap();
            visitor(&token, snapshot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn add_then_validate() {
        let dir = MemoryDirectory::new();
        dir.add("test1234").await;
        let token = Token::from_password("test1234");
        assert!(dir.validate(&token));

        let mut seen = Vec::new();
        dir.range(&mut |_t, c| seen.push(c));
        assert_eq!(seen, vec![TrafficCounter::default()]);
    }

    #[tokio::test]
    async fn delete_revokes() {
        let dir = MemoryDirectory::new();
        dir.add("test1234").await;
        dir.delete("test1234").await;
        let token = Token::from_password("test1234");
        assert!(!dir.validate(&token));
    }

    #[tokio::test]
    async fn add_twice_preserves_counter() {
        let dir = MemoryDirectory::new();
        dir.add("test1234").await;
        let token = Token::from_password("test1234");
        dir.consume(&token, 10, 20).await;
        dir.add("test1234").await;

        let mut seen = Vec::new();
        dir.range(&mut |_t, c| seen.push(c));
        assert_eq!(seen, vec![TrafficCounter { up: 10, down: 20 }]);
    }

    #[tokio::test]
    async fn consume_unknown_token_is_noop() {
        let dir = MemoryDirectory::new();
        let token = Token::from_password("nobody");
        dir.consume(&token, 5, 5).await;
        let mut seen = Vec::new();
        dir.range(&mut |_t, c| seen.push(c));
        assert!(seen.is_empty());
    }

    #[tokio::test]
    async fn counters_are_monotonic() {
        let dir = MemoryDirectory::new();
        dir.add("u").await;
        let token = Token::from_password("u");
        for _ in 0..5 {
            dir.consume(&token, 3, 7).await;
        }
        let mut seen = Vec::new();
        dir.range(&mut |_t, c| seen.push(c));
        assert_eq!(seen[0], TrafficCounter { up: 15, down: 35 });
    }
}
