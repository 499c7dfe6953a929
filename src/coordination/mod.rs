//! Abstraction over the coordination store.
//!
//! The broker requires only a small surface from its store: ordered range
//! reads, watch-from-revision with batched events, and multi-key compare-
//! and-swap transactions. [`ClusterStore`] captures that surface so the
//! keyspace and allocator are backend-agnostic; [`MemStore`] is the
//! in-process implementation used by tests and single-node deployments.

mod mem;

pub use mem::MemStore;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::protocol::Header;
use crate::types::Revision;

/// Header attached by the store to every read, watch batch, and
/// transaction response.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StoreHeader {
    pub cluster_id: u64,
    pub member_id: u64,
    pub revision: Revision,
    pub raft_term: u64,
}

impl StoreHeader {
    /// The equivalent wire-protocol header.
    pub fn to_protocol(self) -> Header {
        Header {
            cluster_id: self.cluster_id,
            member_id: self.member_id,
            revision: self.revision,
            raft_term: self.raft_term,
        }
    }
}

/// A raw key/value pair with store revision bookkeeping.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RawKeyValue {
    pub key: String,
    pub value: Bytes,
    /// Revision at which the key was created.
    pub create_revision: Revision,
    /// Revision of the key's most recent modification.
    pub mod_revision: Revision,
    /// Number of modifications since creation (1 on create).
    pub version: i64,
    /// Attached lease, or 0.
    pub lease: i64,
}

/// A single mutation observed through a watch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Put(RawKeyValue),
    Delete { key: String, mod_revision: Revision },
}

impl Event {
    pub fn key(&self) -> &str {
        match self {
            Event::Put(kv) => &kv.key,
            Event::Delete { key, .. } => key,
        }
    }

    pub fn mod_revision(&self) -> Revision {
        match self {
            Event::Put(kv) => kv.mod_revision,
            Event::Delete { mod_revision, .. } => *mod_revision,
        }
    }
}

/// A batch of events sharing one store revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchBatch {
    pub header: StoreHeader,
    pub events: Vec<Event>,
}

/// A transaction compare predicate. All predicates are equality tests, the
/// minimum required for leader fencing and create/remove guards.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Cmp {
    /// `mod_revision(key) == equals`; 0 asserts the key is absent or
    /// unmodified-since-absent.
    ModRevision { key: String, equals: Revision },
    /// `create_revision(key) == equals`; 0 asserts the key is absent.
    CreateRevision { key: String, equals: Revision },
    /// `version(key) == equals`.
    Version { key: String, equals: i64 },
}

/// A transaction mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Op {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl Op {
    pub fn put(key: impl Into<String>, value: impl Into<Bytes>) -> Op {
        Op::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>) -> Op {
        Op::Delete { key: key.into() }
    }
}

/// Result of a transaction: whether its compares held, and the store
/// header at evaluation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TxnResponse {
    pub succeeded: bool,
    pub header: StoreHeader,
}

/// Result of a range read.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RangeResponse {
    pub header: StoreHeader,
    pub kvs: Vec<RawKeyValue>,
}

/// The ordered-KV coordination store surface required by the broker.
#[async_trait]
pub trait ClusterStore: Send + Sync + 'static {
    /// Read all keys under `prefix`, sorted by key. `revision` 0 reads at
    /// the store's current revision.
    async fn range(&self, prefix: &str, revision: Revision) -> Result<RangeResponse>;

    /// Watch all keys under `prefix` for changes at revisions >= `from`.
    /// Batches arrive in strict revision order, replaying history as
    /// needed. The stream ends when the store shuts down or the receiver
    /// is dropped.
    async fn watch(&self, prefix: &str, from: Revision)
        -> Result<mpsc::UnboundedReceiver<WatchBatch>>;

    /// Atomically evaluate `cmps` and, if all hold, apply `ops` at a
    /// single new revision.
    async fn txn(&self, cmps: Vec<Cmp>, ops: Vec<Op>) -> Result<TxnResponse>;

    /// Unconditional single-key put.
    async fn put<K, V>(&self, key: K, value: V) -> Result<TxnResponse>
    where
        K: Into<String> + Send,
        V: Into<Bytes> + Send,
        Self: Sized,
    {
        self.txn(vec![], vec![Op::put(key, value)]).await
    }

    /// Unconditional single-key delete.
    async fn delete<K>(&self, key: K) -> Result<TxnResponse>
    where
        K: Into<String> + Send,
        Self: Sized,
    {
        self.txn(vec![], vec![Op::delete(key)]).await
    }
}
