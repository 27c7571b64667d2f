//! Best-effort persistence on top of a [`Repository`].
//!
//! Writes go onto a bounded queue drained by a single writer task, so they
//! reach the repository in the order they were made and callers never wait
//! on storage. A full queue drops the write with a warning. Write errors are
//! logged and swallowed, and undecodable documents are skipped on load.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

use db::{Collection, InMemoryRepository, Repository};

const WRITE_QUEUE_CAPACITY: usize = 1_024;

enum Write {
    Upsert {
        collection: Collection,
        id: Uuid,
        document: Value,
    },
    Delete {
        collection: Collection,
        id: Uuid,
    },
    Flush(oneshot::Sender<()>),
}

struct Writer {
    tx: mpsc::Sender<Write>,
    /// Taken by the first write made inside a runtime.
    rx: Mutex<Option<mpsc::Receiver<Write>>>,
}

#[derive(Clone)]
pub struct Store {
    repo: Arc<dyn Repository>,
    writer: Arc<Writer>,
}

impl Store {
    pub fn new(repo: Arc<dyn Repository>) -> Self {
        let (tx, rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        Self {
            repo,
            writer: Arc::new(Writer {
                tx,
                rx: Mutex::new(Some(rx)),
            }),
        }
    }

    pub fn repository(&self) -> &Arc<dyn Repository> {
        &self.repo
    }

    /// Queue an upsert of `value`. Returns immediately.
    pub fn save<T: Serialize>(&self, collection: Collection, id: Uuid, value: &T) {
        match serde_json::to_value(value) {
            Ok(document) => self.send(Write::Upsert {
                collection,
                id,
                document,
            }),
            Err(e) => warn!("cannot serialise {} document {}: {}", collection, id, e),
        }
    }

    /// Queue a delete. Returns immediately.
    pub fn remove(&self, collection: Collection, id: Uuid) {
        self.send(Write::Delete { collection, id });
    }

    /// Wait until every write queued so far has been applied.
    pub async fn flush(&self) {
        self.start_writer();
        let (done, applied) = oneshot::channel();
        if self.writer.tx.send(Write::Flush(done)).await.is_ok() {
            let _ = applied.await;
        }
    }

    /// One document, after pending writes land. `None` when it is missing or
    /// cannot be read.
    pub async fn load<T: DeserializeOwned>(&self, collection: Collection, id: Uuid) -> Option<T> {
        self.flush().await;
        match self.repo.get(collection, id).await {
            Ok(row) => match serde_json::from_value(row.document) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("undecodable {} document {}: {}", collection, id, e);
                    None
                }
            },
            Err(db::DbError::NotFound) => None,
            Err(e) => {
                warn!("failed to load {} document {}: {}", collection, id, e);
                None
            }
        }
    }

    /// Every decodable document in `collection`, after pending writes land.
    pub async fn load_all<T: DeserializeOwned>(&self, collection: Collection) -> Vec<T> {
        self.flush().await;
        let rows = match self.repo.list(collection).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("failed to list {} documents: {}", collection, e);
                return Vec::new();
            }
        };
        rows.into_iter()
            .filter_map(|row| match serde_json::from_value(row.document) {
                Ok(value) => Some(value),
                Err(e) => {
                    warn!("skipping undecodable {} document {}: {}", collection, row.id, e);
                    None
                }
            })
            .collect()
    }

    fn send(&self, write: Write) {
        self.start_writer();
        match self.writer.tx.try_send(write) {
            Ok(()) => {}
            Err(TrySendError::Full(Write::Upsert { collection, id, .. }))
            | Err(TrySendError::Full(Write::Delete { collection, id })) => {
                warn!("write queue full; dropping write of {} document {}", collection, id);
            }
            Err(TrySendError::Full(Write::Flush(_))) => {}
            Err(TrySendError::Closed(_)) => warn!("store writer has stopped; dropping write"),
        }
    }

    fn start_writer(&self) {
        let mut rx = self.writer.rx.lock();
        if rx.is_none() {
            return;
        }
        // Outside a runtime the write stays queued until the next call from inside one.
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if let Some(rx) = rx.take() {
            handle.spawn(write_loop(Arc::clone(&self.repo), rx));
        }
    }
}

/// Applies queued writes in order until every `Store` clone is dropped.
async fn write_loop(repo: Arc<dyn Repository>, mut rx: mpsc::Receiver<Write>) {
    while let Some(write) = rx.recv().await {
        match write {
            Write::Upsert {
                collection,
                id,
                document,
            } => {
                let mut outcome = repo.upsert(collection, id, document.clone()).await;
                if matches!(&outcome, Err(e) if e.is_transient()) {
                    debug!("retrying write of {} document {}", collection, id);
                    outcome = repo.upsert(collection, id, document).await;
                }
                if let Err(e) = outcome {
                    warn!("failed to persist {} document {}: {}", collection, id, e);
                }
            }
            Write::Delete { collection, id } => match repo.delete(collection, id).await {
                Ok(()) | Err(db::DbError::NotFound) => {}
                Err(e) => warn!("failed to delete {} document {}: {}", collection, id, e),
            },
            Write::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("store writer stopped");
}

impl Default for Store {
    fn default() -> Self {
        Self::new(Arc::new(InMemoryRepository::new()))
    }
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}
