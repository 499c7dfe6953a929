//! KeySpace: a consistent, in-memory mirror of the coordination store's
//! contents under a root prefix.
//!
//! A KeySpace is fed by a watch stream of revisioned event batches and
//! maintains a sorted sequence of decoded key/values plus the latest
//! observed store header. Consumers take the read side of its lock and
//! are notified of revision advances through a broadcast signal; the
//! watch loop is the only writer.

mod keyvalue;

pub use keyvalue::{prefixed, prefixed_range, search, KeyValue};

use std::sync::Arc;

use tokio::sync::{mpsc, watch, RwLock, RwLockReadGuard};
use tracing::warn;

use crate::coordination::{ClusterStore, Event, StoreHeader, WatchBatch};
use crate::error::{Error, Result};
use crate::types::Revision;

/// Decoder of raw values into the KeySpace's decoded representation.
/// Decode failures are logged and the offending key is skipped; they are
/// not fatal to the KeySpace.
pub type Decoder<T> = Arc<dyn Fn(&crate::coordination::RawKeyValue) -> Result<T> + Send + Sync>;

/// Observed state: the latest store header and the sorted decoded keys.
#[derive(Debug)]
pub struct Snapshot<T> {
    pub header: StoreHeader,
    pub kvs: Vec<KeyValue<T>>,
}

pub struct KeySpace<T> {
    /// Root prefix under which all mirrored keys live.
    pub root: String,
    decoder: Decoder<T>,
    state: RwLock<Snapshot<T>>,
    signal: watch::Sender<Revision>,
}

impl<T: Clone + Send + Sync + 'static> KeySpace<T> {
    pub fn new(root: impl Into<String>, decoder: Decoder<T>) -> KeySpace<T> {
        let (signal, _) = watch::channel(0);
        KeySpace {
            root: root.into(),
            decoder,
            state: RwLock::new(Snapshot {
                header: StoreHeader::default(),
                kvs: Vec::new(),
            }),
            signal,
        }
    }

    /// Take the read side of the KeySpace lock.
    pub async fn read(&self) -> RwLockReadGuard<'_, Snapshot<T>> {
        self.state.read().await
    }

    /// The latest observed revision.
    pub fn revision(&self) -> Revision {
        *self.signal.borrow()
    }

    /// Wait until the observed revision is at least `revision`, returning
    /// the revision actually observed.
    pub async fn await_revision(&self, revision: Revision) -> Revision {
        let mut rx = self.signal.subscribe();
        loop {
            let cur = *rx.borrow_and_update();
            if cur >= revision {
                return cur;
            }
            if rx.changed().await.is_err() {
                return cur;
            }
        }
    }

    /// Range-read all keys under the root and establish the initial
    /// snapshot and header.
    pub async fn load<S: ClusterStore>(&self, store: &S, revision: Revision) -> Result<()> {
        let resp = store.range(&self.root, revision).await?;

        let mut kvs = Vec::with_capacity(resp.kvs.len());
        for raw in resp.kvs {
            match (self.decoder)(&raw) {
                Ok(decoded) => kvs.push(KeyValue { raw, decoded }),
                Err(err) => {
                    warn!(key = %raw.key, error = %err, "skipping undecodable key");
                }
            }
        }

        let mut state = self.state.write().await;
        state.header = resp.header;
        state.kvs = kvs;
        let revision = state.header.revision;
        drop(state);

        self.signal.send_replace(revision);
        Ok(())
    }

    /// Watch the root prefix from the revision after the current header,
    /// applying each batch of events and delivering a non-blocking tick on
    /// `signal` after each apply. Runs until the watch stream closes.
    pub async fn watch_loop<S: ClusterStore>(
        &self,
        store: &S,
        signal: mpsc::Sender<()>,
    ) -> Result<()> {
        let from = self.state.read().await.header.revision + 1;
        let mut rx = store.watch(&self.root, from).await?;

        loop {
            let Some(first) = rx.recv().await else {
                return Err(Error::WatchClosed);
            };
            // Drain whatever else is immediately available, amortizing one
            // write-lock acquisition over the batches.
            let mut batches = vec![first];
            while let Ok(batch) = rx.try_recv() {
                batches.push(batch);
            }
            self.apply_batches(batches).await?;

            // Drop the tick if one is already pending.
            let _ = signal.try_send(());
        }
    }

    /// Validate and merge a sequence of watch batches into the snapshot.
    ///
    /// The header's cluster ID must never change and its revision must
    /// strictly increase across batches; events within a batch share its
    /// revision. Multiple updates of one key within the sequence collapse
    /// to the final value by the mod-revision check.
    pub async fn apply_batches(&self, batches: Vec<WatchBatch>) -> Result<()> {
        let mut state = self.state.write().await;

        for batch in batches {
            state.header.consistent_with_store(&batch.header)?;
            state.header = batch.header;

            for event in batch.events {
                apply_event(&mut state.kvs, &self.decoder, event);
            }
        }
        let revision = state.header.revision;
        drop(state);

        self.signal.send_replace(revision);
        Ok(())
    }
}

impl<T> Snapshot<T> {
    /// Binary-search the sorted keys. `Ok(index)` when found.
    pub fn search(&self, key: &str) -> std::result::Result<usize, usize> {
        search(&self.kvs, key)
    }

    /// The contiguous slice of keys with `prefix`.
    pub fn prefixed(&self, prefix: &str) -> &[KeyValue<T>] {
        prefixed(&self.kvs, prefix)
    }
}

trait HeaderExt {
    fn consistent_with_store(&self, other: &StoreHeader) -> Result<()>;
}

impl HeaderExt for StoreHeader {
    fn consistent_with_store(&self, other: &StoreHeader) -> Result<()> {
        if self.cluster_id != 0 && self.cluster_id != other.cluster_id {
            return Err(Error::HeaderMismatch(format!(
                "ClusterID mismatch (expected {}, got {})",
                self.cluster_id, other.cluster_id
            )));
        }
        if other.revision <= self.revision {
            return Err(Error::HeaderMismatch(format!(
                "revision mismatch (expected > {}, got {})",
                self.revision, other.revision
            )));
        }
        Ok(())
    }
}

fn apply_event<T>(kvs: &mut Vec<KeyValue<T>>, decoder: &Decoder<T>, event: Event) {
    match event {
        Event::Put(raw) => {
            match search(kvs, &raw.key) {
                Ok(i) => {
                    // Re-applying an already-observed batch is a no-op.
                    if kvs[i].raw.mod_revision >= raw.mod_revision {
                        return;
                    }
                    match decoder(&raw) {
                        Ok(decoded) => kvs[i] = KeyValue { raw, decoded },
                        Err(err) => {
                            // The prior value no longer reflects the store;
                            // evict it and continue.
                            warn!(key = %raw.key, error = %err,
                                "evicting key with undecodable update");
                            kvs.remove(i);
                        }
                    }
                }
                Err(i) => match decoder(&raw) {
                    Ok(decoded) => kvs.insert(i, KeyValue { raw, decoded }),
                    Err(err) => {
                        warn!(key = %raw.key, error = %err, "skipping undecodable key");
                    }
                },
            }
        }
        Event::Delete { key, .. } => {
            if let Ok(i) = search(kvs, &key) {
                kvs.remove(i);
            }
        }
    }
}
