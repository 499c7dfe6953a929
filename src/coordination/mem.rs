//! In-memory coordination store.
//!
//! A full-featured single-process implementation of [`ClusterStore`]:
//! monotonic revisions, per-key create/mod/version bookkeeping, watch
//! replay from any past revision, and multi-key CAS transactions. Every
//! integration test and the deploy simulator run against this store.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::{
    ClusterStore, Cmp, Event, Op, RangeResponse, RawKeyValue, StoreHeader, TxnResponse, WatchBatch,
};
use crate::error::{Error, Result};
use crate::types::Revision;

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<WatchBatch>,
}

struct Inner {
    kvs: BTreeMap<String, RawKeyValue>,
    revision: Revision,
    raft_term: u64,
    /// Complete history of applied batches, for watch replay.
    log: Vec<WatchBatch>,
    watchers: Vec<Watcher>,
}

/// Shared-handle in-memory store. Cloning yields another handle onto the
/// same state, so a test cluster of N brokers shares one `MemStore`.
#[derive(Clone)]
pub struct MemStore {
    cluster_id: u64,
    member_id: u64,
    inner: Arc<Mutex<Inner>>,
}

impl MemStore {
    pub fn new(cluster_id: u64) -> MemStore {
        MemStore {
            cluster_id,
            member_id: 1,
            inner: Arc::new(Mutex::new(Inner {
                kvs: BTreeMap::new(),
                revision: 0,
                raft_term: 1,
                log: Vec::new(),
                watchers: Vec::new(),
            })),
        }
    }

    fn header(&self, inner: &Inner) -> StoreHeader {
        StoreHeader {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision: inner.revision,
            raft_term: inner.raft_term,
        }
    }

    /// Current store revision.
    pub async fn revision(&self) -> Revision {
        self.inner.lock().await.revision
    }

    fn eval(inner: &Inner, cmp: &Cmp) -> bool {
        let lookup = |key: &str| inner.kvs.get(key);
        match cmp {
            Cmp::ModRevision { key, equals } => {
                lookup(key).map(|kv| kv.mod_revision).unwrap_or(0) == *equals
            }
            Cmp::CreateRevision { key, equals } => {
                lookup(key).map(|kv| kv.create_revision).unwrap_or(0) == *equals
            }
            Cmp::Version { key, equals } => {
                lookup(key).map(|kv| kv.version).unwrap_or(0) == *equals
            }
        }
    }

    fn apply(inner: &mut Inner, revision: Revision, op: Op) -> Option<Event> {
        match op {
            Op::Put { key, value } => {
                let prior = inner.kvs.get(&key);
                let kv = RawKeyValue {
                    create_revision: prior.map(|p| p.create_revision).unwrap_or(revision),
                    version: prior.map(|p| p.version).unwrap_or(0) + 1,
                    mod_revision: revision,
                    lease: 0,
                    key: key.clone(),
                    value,
                };
                inner.kvs.insert(key, kv.clone());
                Some(Event::Put(kv))
            }
            Op::Delete { key } => {
                // Deleting an absent key is a no-op with no event.
                inner.kvs.remove(&key).map(|_| Event::Delete {
                    key,
                    mod_revision: revision,
                })
            }
        }
    }

    fn broadcast(inner: &mut Inner, batch: &WatchBatch) {
        // Retain only watchers whose receivers are still alive, filtering
        // each batch down to the watcher's prefix.
        inner.watchers.retain(|w| {
            let filtered: Vec<Event> = batch
                .events
                .iter()
                .filter(|ev| ev.key().starts_with(&w.prefix))
                .cloned()
                .collect();
            if filtered.is_empty() {
                return true;
            }
            w.tx
                .send(WatchBatch {
                    header: batch.header,
                    events: filtered,
                })
                .is_ok()
        });
    }
}

#[async_trait]
impl ClusterStore for MemStore {
    async fn range(&self, prefix: &str, revision: Revision) -> Result<RangeResponse> {
        let inner = self.inner.lock().await;
        if revision != 0 && revision != inner.revision {
            return Err(Error::Validation(format!(
                "historical range reads are not supported (requested {}, at {})",
                revision, inner.revision
            )));
        }
        let kvs = inner
            .kvs
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(_, v)| v.clone())
            .collect();
        Ok(RangeResponse {
            header: self.header(&inner),
            kvs,
        })
    }

    async fn watch(
        &self,
        prefix: &str,
        from: Revision,
    ) -> Result<mpsc::UnboundedReceiver<WatchBatch>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().await;

        // Replay history at or beyond `from` before registering for live
        // batches, so no revision is skipped between load and watch.
        for batch in &inner.log {
            if batch.header.revision < from {
                continue;
            }
            let filtered: Vec<Event> = batch
                .events
                .iter()
                .filter(|ev| ev.key().starts_with(prefix))
                .cloned()
                .collect();
            if filtered.is_empty() {
                continue;
            }
            tx.send(WatchBatch {
                header: batch.header,
                events: filtered,
            })
            .map_err(|_| Error::WatchClosed)?;
        }

        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(rx)
    }

    async fn txn(&self, cmps: Vec<Cmp>, ops: Vec<Op>) -> Result<TxnResponse> {
        let mut inner = self.inner.lock().await;

        if !cmps.iter().all(|c| Self::eval(&inner, c)) {
            return Ok(TxnResponse {
                succeeded: false,
                header: self.header(&inner),
            });
        }

        // All ops of a transaction share a single new revision. A
        // transaction with no effect (empty ops, or deletes of absent
        // keys) leaves the revision unchanged.
        let revision = inner.revision + 1;
        let mut events = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(ev) = Self::apply(&mut inner, revision, op) {
                events.push(ev);
            }
        }
        if events.is_empty() {
            return Ok(TxnResponse {
                succeeded: true,
                header: self.header(&inner),
            });
        }
        inner.revision = revision;

        let header = self.header(&inner);
        let batch = WatchBatch { header, events };
        inner.log.push(batch.clone());
        Self::broadcast(&mut inner, &batch);

        Ok(TxnResponse {
            succeeded: true,
            header,
        })
    }
}
