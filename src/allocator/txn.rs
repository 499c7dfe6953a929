//! Batched, checkpointed coordination-store transactions.
//!
//! The converger emits many small all-or-nothing units ("checkpoints"):
//! the compares and operations of one checkpoint must land in the same
//! underlying transaction. Checkpoints are concatenated into one larger
//! transaction to amortize store round trips, flushing when an operation
//! cap is reached. Every underlying transaction additionally asserts a
//! fixed set of compares, which the allocator uses as a leader fence.

use crate::constants::MAX_TXN_OPS;
use crate::coordination::{ClusterStore, Cmp, Op, RawKeyValue, TxnResponse};
use crate::error::{Error, Result};

/// Compare that `kv` has not been modified since it was observed.
pub fn mod_revision_unchanged(kv: &RawKeyValue) -> Cmp {
    Cmp::ModRevision {
        key: kv.key.clone(),
        equals: kv.mod_revision,
    }
}

pub struct BatchedTxn<'a, S: ClusterStore> {
    store: &'a S,
    /// Compares asserted on every underlying transaction.
    fixed_cmps: Vec<Cmp>,
    /// Completed checkpoints ready to flush.
    cmps: Vec<Cmp>,
    ops: Vec<Op>,
    /// Checkpoint currently being built.
    next_cmps: Vec<Cmp>,
    next_ops: Vec<Op>,
}

impl<'a, S: ClusterStore> BatchedTxn<'a, S> {
    pub fn new(store: &'a S, fixed_cmps: Vec<Cmp>) -> BatchedTxn<'a, S> {
        BatchedTxn {
            store,
            fixed_cmps,
            cmps: Vec::new(),
            ops: Vec::new(),
            next_cmps: Vec::new(),
            next_ops: Vec::new(),
        }
    }

    /// Add a compare to the current checkpoint.
    pub fn if_cmp(&mut self, cmp: Cmp) -> &mut Self {
        self.next_cmps.push(cmp);
        self
    }

    /// Add an operation to the current checkpoint.
    pub fn then_op(&mut self, op: Op) -> &mut Self {
        self.next_ops.push(op);
        self
    }

    /// Seal the current checkpoint. Its compares and operations are
    /// guaranteed to be issued within a single underlying transaction;
    /// earlier checkpoints may be flushed to make room.
    pub async fn checkpoint(&mut self) -> Result<()> {
        if self.cmps.is_empty() {
            self.cmps.extend(self.fixed_cmps.iter().cloned());
        }

        let nc = std::mem::take(&mut self.next_cmps);
        let no = std::mem::take(&mut self.next_ops);

        if self.cmps.len() + nc.len() > MAX_TXN_OPS || self.ops.len() + no.len() > MAX_TXN_OPS {
            self.flush().await?;
            self.cmps.extend(self.fixed_cmps.iter().cloned());
        }

        self.cmps.extend(nc);
        self.ops.extend(no);
        Ok(())
    }

    /// Flush all sealed checkpoints. A transaction whose compares do not
    /// hold is [`Error::TxnFailed`], which callers treat as retryable on
    /// the next keyspace revision.
    pub async fn commit(&mut self) -> Result<TxnResponse> {
        if !self.next_cmps.is_empty() || !self.next_ops.is_empty() {
            return Err(Error::Validation(
                "checkpoint must be called before commit".to_string(),
            ));
        }
        if self.cmps.is_empty() && self.ops.is_empty() {
            self.cmps.extend(self.fixed_cmps.iter().cloned());
        }
        self.flush().await
    }

    async fn flush(&mut self) -> Result<TxnResponse> {
        let cmps = std::mem::take(&mut self.cmps);
        let ops = std::mem::take(&mut self.ops);

        let resp = self.store.txn(cmps, ops).await?;
        if !resp.succeeded {
            return Err(Error::TxnFailed);
        }
        Ok(resp)
    }
}
