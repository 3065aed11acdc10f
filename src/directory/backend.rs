// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Persistent storage for the credential directory: a durable key-value contract
//! (`get`/`put`/`delete`/`exists`/`list`/`lock`/`unlock`) matching what an external KV
//! store exposes, with [`JsonFileBackend`] implementing it against a plain directory of
//! JSON files.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use super::TrafficCounter;
use crate::proto::Token;

/// Namespace every key stored by a [`PersistentBackend`] falls under. Real external
/// KV stores (etcd, Redis, a cloud table) expect every key scoped under some prefix
/// rather than sharing a flat namespace with unrelated data; this crate only ever
/// lists under this one prefix, but the contract takes an arbitrary prefix so a
/// backend can be handed a sub-scope without the directory layer knowing about it.
pub const KEY_PREFIX: &str = "trojan/";

/// A durable key-value store for traffic records, keyed by the 56-character hex token.
///
/// This mirrors the surface an external KV store actually exposes — `get`/`put`/
/// `delete`/`exists`/`list(prefix)` plus per-key `lock`/`unlock` — rather than the
/// narrower `put`/`delete`/`load_all` surface a single in-process map would need, so a
/// real network-backed store could stand in for [`JsonFileBackend`] without this trait
/// changing shape.
///
/// `lock`/`unlock` are a courtesy for backends that front a store with no native
/// per-key locking. [`WriteBehindDirectory`](super::write_behind::WriteBehindDirectory)
/// already serializes every write through one worker task, so no two `put`/`delete`
/// calls for the *same* token ever race within this process; the pair exists so a
/// backend can still offer a real mutual-exclusion primitive to callers (future admin
/// tooling, multi-process deployments) that bypass that worker.
#[async_trait]
pub trait PersistentBackend: Send + Sync {
    /// Load the stored record for `token`, if any.
    async fn get(&self, token: &Token) -> std::io::Result<Option<TrafficCounter>>;

    /// Persist `counter` for `token`, creating the record if absent.
    async fn put(&self, token: &Token, counter: TrafficCounter) -> std::io::Result<()>;

    /// Remove `token`'s record, if present.
    async fn delete(&self, token: &Token) -> std::io::Result<()>;

    /// Membership test, independent of reading the full record.
    async fn exists(&self, token: &Token) -> std::io::Result<bool> {
        Ok(self.get(token).await?.is_some())
    }

    /// List every token whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> std::io::Result<Vec<Token>>;

    /// Acquire an exclusive lock on `token`'s record. Blocks until available.
    async fn lock(&self, token: &Token);

    /// Release a lock on `token` previously acquired with [`lock`](Self::lock).
    ///
    /// Calling this without a matching `lock` call, or more than once per `lock`
    /// call, is a logic error; implementations may panic.
    async fn unlock(&self, token: &Token);

    /// Load every stored record. Used once at startup to preload the in-memory
    /// directory. The default implementation composes [`list`](Self::list) and
    /// [`get`](Self::get); backends with a bulk-read primitive may override this for
    /// efficiency.
    async fn load_all(&self) -> std::io::Result<HashMap<Token, TrafficCounter>> {
        let mut out = HashMap::new();
        for token in self.list(KEY_PREFIX).await? {
            if let Some(counter) = self.get(&token).await? {
                out.insert(token, counter);
            }
        }
        Ok(out)
    }
}

/// A [`PersistentBackend`] that stores one JSON file per token under `root`, named by
/// the token's hex representation.
///
/// There is no real external KV store in the dependency stack to front `lock`/
/// `unlock` with, so this backend stands in a per-token `tokio::sync::Mutex` map: a
/// `lock` call reserves (or waits for) the token's mutex and parks the guard in a
/// side table; `unlock` looks the guard up and drops it. This only serializes
/// *within this process* — it is not a substitute for a real distributed lock.
pub struct JsonFileBackend {
    root: PathBuf,
    locks: StdMutex<HashMap<[u8; 28], Arc<AsyncMutex<()>>>>,
    held: StdMutex<HashMap<[u8; 28], OwnedMutexGuard<()>>>,
}

#[derive(Serialize, Deserialize)]
struct Record {
    up: i64,
    down: i64,
}

impl JsonFileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        JsonFileBackend {
            root: root.into(),
            locks: StdMutex::new(HashMap::new()),
            held: StdMutex::new(HashMap::new()),
        }
    }

    fn path_for(&self, token: &Token) -> PathBuf {
        let hex = token.to_hex();
        // Token::to_hex only ever emits ASCII hex digits.
        let name = std::str::from_utf8(&hex).unwrap();
        self.root.join(name).with_extension("json")
    }

    fn key_for(&self, token: &Token) -> String {
        let hex = token.to_hex();
        format!("{KEY_PREFIX}{}", std::str::from_utf8(&hex).unwrap())
    }

    fn mutex_for(&self, token: &Token) -> Arc<AsyncMutex<()>> {
        self.locks
            .lock()
            .unwrap()
            .entry(token.raw)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl PersistentBackend for JsonFileBackend {
    async fn get(&self, token: &Token) -> std::io::Result<Option<TrafficCounter>> {
        let bytes = match tokio::fs::read(self.path_for(token)).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        let record: Record = serde_json::from_slice(&bytes)?;
        Ok(Some(TrafficCounter {
            up: record.up,
            down: record.down,
        }))
    }

    async fn put(&self, token: &Token, counter: TrafficCounter) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.root).await?;
        let record = Record {
            up: counter.up,
            down: counter.down,
        };
        let bytes = serde_json::to_vec(&record)?;
        tokio::fs::write(self.path_for(token), bytes).await
    }

    async fn delete(&self, token: &Token) -> std::io::Result<()> {
        match tokio::fs::remove_file(self.path_for(token)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn exists(&self, token: &Token) -> std::io::Result<bool> {
        tokio::fs::try_exists(self.path_for(token)).await
    }

    async fn list(&self, prefix: &str) -> std::io::Result<Vec<Token>> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
            Err(e) => return Err(e),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(token) = Token::from_hex(stem.as_bytes()) else {
                continue;
            };
            if self.key_for(&token).starts_with(prefix) {
                out.push(token);
            }
        }
        Ok(out)
    }

    async fn lock(&self, token: &Token) {
        let mutex = self.mutex_for(token);
        let guard = mutex.lock_owned().await;
        self.held.lock().unwrap().insert(token.raw, guard);
    }

    async fn unlock(&self, token: &Token) {
        self.held.lock().unwrap().remove(&token.raw);
    }
}
