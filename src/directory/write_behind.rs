// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Asynchronous persistence for the credential directory: an in-memory map answers
//! every `validate` call directly, while `add`/`delete`/`consume` additionally enqueue
//! a task onto a bounded channel drained by one worker that mirrors the change to a
//! durable backend.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::backend::PersistentBackend;
use super::{Directory, MemoryDirectory, TrafficCounter};
use crate::proto::Token;

const CHANNEL_CAPACITY: usize = 16;

enum Task {
    Put(Token, TrafficCounter),
    Delete(Token),
}

/// A [`Directory`] that answers reads from an in-memory map and mirrors writes to a
/// [`PersistentBackend`] on a dedicated worker task.
///
/// `validate` never touches the backend, so a slow or unavailable store cannot stall
/// connection acceptance. Writes back-pressure the caller once the channel fills,
/// rather than buffering unboundedly in memory.
///
/// `tx`/`worker` sit behind a plain `std::sync::Mutex` rather than the struct's own
/// fields directly, so [`Directory::shutdown`] can drain them through a shared `&self`
/// — this type is normally held as `Arc<dyn Directory>`, and a consuming shutdown
/// method can't be called through that.
pub struct WriteBehindDirectory {
    memory: Arc<MemoryDirectory>,
    tx: StdMutex<Option<mpsc::Sender<Task>>>,
    worker: StdMutex<Option<JoinHandle<()>>>,
}

impl WriteBehindDirectory {
    /// Preload from `backend` and spawn the mirroring worker.
    pub async fn new(backend: Arc<dyn PersistentBackend>) -> std::io::Result<Self> {
        let memory = Arc::new(MemoryDirectory::new());

        let preload = backend.load_all().await?;
        for (token, counter) in preload {
            memory.insert_raw(token.raw, counter);
        }

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = tokio::spawn(run_worker(backend, rx));

        Ok(WriteBehindDirectory {
            memory,
            tx: StdMutex::new(Some(tx)),
            worker: StdMutex::new(Some(worker)),
        })
    }

    fn clone_tx(&self) -> Option<mpsc::Sender<Task>> {
        self.tx.lock().unwrap().clone()
    }

    async fn enqueue(&self, task: Task) {
        let Some(tx) = self.clone_tx() else {
            error!("write-behind directory already shut down; persistence task dropped");
            return;
        };
        if tx.send(task).await.is_err() {
            error!("write-behind worker gone; persistence task dropped");
        }
    }
}

#[async_trait]
impl Directory for WriteBehindDirectory {
    async fn add(&self, password: &str) {
        self.memory.add(password).await;
        let token = Token::from_password(password);
        let counter = self.memory.get(&token).unwrap_or_default();
        self.enqueue(Task::Put(token, counter)).await;
    }

    async fn delete(&self, password: &str) {
        self.memory.delete(password).await;
        let token = Token::from_password(password);
        self.enqueue(Task::Delete(token)).await;
    }

    fn validate(&self, token: &Token) -> bool {
        self.memory.validate(token)
    }

    async fn consume(&self, token: &Token, up_delta: i64, down_delta: i64) {
        self.memory.consume(token, up_delta, down_delta).await;
        if let Some(counter) = self.memory.get(token) {
            self.enqueue(Task::Put(*token, counter)).await;
        }
    }

    fn range(&self, visitor: &mut dyn FnMut(&Token, TrafficCounter)) {
        self.memory.range(visitor);
    }

    /// Stop accepting new writes and wait for the worker to drain the channel.
    async fn shutdown(&self) {
        self.tx.lock().unwrap().take();
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!("write-behind worker panicked: {e}");
            }
        }
    }
}

async fn run_worker(backend: Arc<dyn PersistentBackend>, mut rx: mpsc::Receiver<Task>) {
    while let Some(task) = rx.recv().await {
        let result = match task {
            Task::Put(token, counter) => {
                backend.lock(&token).await;
                let result = backend.put(&token, counter).await;
                backend.unlock(&token).await;
                result
            }
            Task::Delete(token) => backend.delete(&token).await,
        };
        if let Err(e) = result {
            warn!("persistent directory backend write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    use super::*;

    #[derive(Default)]
    struct FakeBackend {
        puts: StdMutex<Vec<(Token, TrafficCounter)>>,
        store: StdMutex<HashMap<Token, TrafficCounter>>,
    }

    #[async_trait]
    impl PersistentBackend for FakeBackend {
        async fn get(&self, token: &Token) -> std::io::Result<Option<TrafficCounter>> {
            Ok(self.store.lock().unwrap().get(token).copied())
        }

        async fn put(&self, token: &Token, counter: TrafficCounter) -> std::io::Result<()> {
            self.puts.lock().unwrap().push((*token, counter));
            self.store.lock().unwrap().insert(*token, counter);
            Ok(())
        }

        async fn delete(&self, token: &Token) -> std::io::Result<()> {
            self.store.lock().unwrap().remove(token);
            Ok(())
        }

        async fn list(&self, _prefix: &str) -> std::io::Result<Vec<Token>> {
            Ok(self.store.lock().unwrap().keys().copied().collect())
        }

        async fn lock(&self, _token: &Token) {}
        async fn unlock(&self, _token: &Token) {}
    }

    #[tokio::test]
    async fn add_validates_immediately_and_mirrors_eventually() {
        let backend = Arc::new(FakeBackend::default());
        let dir = WriteBehindDirectory::new(backend.clone()).await.unwrap();

        dir.add("alice").await;
        let token = Token::from_password("alice");
        assert!(dir.validate(&token));

        dir.shutdown().await;
        assert_eq!(backend.puts.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn preload_seeds_memory_from_backend() {
        struct Seeded;
        #[async_trait]
        impl PersistentBackend for Seeded {
            async fn get(&self, token: &Token) -> std::io::Result<Option<TrafficCounter>> {
                if *token == Token::from_password("bob") {
                    Ok(Some(TrafficCounter { up: 1, down: 2 }))
                } else {
                    Ok(None)
                }
            }
            async fn put(&self, _t: &Token, _c: TrafficCounter) -> std::io::Result<()> {
                Ok(())
            }
            async fn delete(&self, _t: &Token) -> std::io::Result<()> {
                Ok(())
            }
            async fn list(&self, _prefix: &str) -> std::io::Result<Vec<Token>> {
                Ok(vec![Token::from_password("bob")])
            }
            async fn lock(&self, _token: &Token) {}
            async fn unlock(&self, _token: &Token) {}
        }

        let dir = WriteBehindDirectory::new(Arc::new(Seeded)).await.unwrap();
        let token = Token::from_password("bob");
        assert!(dir.validate(&token));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent_through_shared_reference() {
        let backend = Arc::new(FakeBackend::default());
        let dir: Arc<dyn Directory> = Arc::new(WriteBehindDirectory::new(backend.clone()).await.unwrap());

        dir.add("alice").await;
        dir.shutdown().await;
        dir.shutdown().await;
        assert_eq!(backend.puts.lock().unwrap().len(), 1);
    }
}
