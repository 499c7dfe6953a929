//! Replica: per-journal broker state.
//!
//! A replica owns the journal's fragment index and two depth-1 hand-off
//! channels: one moving the spool between the RPC currently entitled to
//! it, and one moving the replication pipeline's send half between
//! consecutive Append RPCs. At any instant at most one task holds each.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use super::pipeline::Pipeline;
use crate::error::{Error, Result};
use crate::fragment::{FragmentIndex, Spool};
use crate::types::Journal;

pub struct Replica {
    pub journal: Journal,
    pub index: Arc<FragmentIndex>,

    spool_tx: mpsc::Sender<Spool>,
    spool_rx: Mutex<mpsc::Receiver<Spool>>,

    pipeline_tx: mpsc::Sender<Option<Pipeline>>,
    pipeline_rx: Mutex<mpsc::Receiver<Option<Pipeline>>>,
}

impl Replica {
    /// Create a replica with an empty spool at journal offset zero. The
    /// spool synchronizes to the true write head on first contact with
    /// the route's other replicas.
    pub fn new(journal: Journal) -> Result<Arc<Replica>> {
        let (spool_tx, spool_rx) = mpsc::channel(1);
        let (pipeline_tx, pipeline_rx) = mpsc::channel(1);

        let spool = Spool::new(journal.clone(), 0)?;
        spool_tx
            .try_send(spool)
            .map_err(|_| Error::Unavailable("spool channel rejected seed".to_string()))?;
        pipeline_tx
            .try_send(None)
            .map_err(|_| Error::Unavailable("pipeline channel rejected seed".to_string()))?;

        Ok(Arc::new(Replica {
            index: Arc::new(FragmentIndex::new(journal.clone())),
            journal,
            spool_tx,
            spool_rx: Mutex::new(spool_rx),
            pipeline_tx,
            pipeline_rx: Mutex::new(pipeline_rx),
        }))
    }

    /// Take sole ownership of the spool, blocking until the current
    /// holder releases it.
    pub async fn acquire_spool(&self) -> Result<Spool> {
        let mut rx = self.spool_rx.lock().await;
        rx.recv().await.ok_or(Error::Cancelled)
    }

    /// Release the spool to the next waiting task.
    pub fn release_spool(&self, spool: Spool) {
        // The channel has depth 1 and ownership is exclusive, so the
        // slot is empty whenever a holder releases.
        let _ = self.spool_tx.try_send(spool);
    }

    /// Take ownership of the pipeline send half. `None` means no pipeline
    /// is built, or the last holder tore it down.
    pub async fn acquire_pipeline_slot(&self) -> Result<Option<Pipeline>> {
        let mut rx = self.pipeline_rx.lock().await;
        rx.recv().await.ok_or(Error::Cancelled)
    }

    /// Release the pipeline send half (or `None` to signal teardown).
    pub fn release_pipeline_slot(&self, pipeline: Option<Pipeline>) {
        let _ = self.pipeline_tx.try_send(pipeline);
    }

    /// Take the pipeline slot only if it is immediately available. Used
    /// by an arriving Replicate stream to recover the spool from a
    /// pipeline this broker built while it was primary under an older
    /// route.
    pub async fn try_acquire_pipeline_slot(&self) -> Option<Option<Pipeline>> {
        let mut rx = self.pipeline_rx.lock().await;
        rx.try_recv().ok()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("journal", &self.journal)
            .field("end_offset", &self.index.end_offset())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn spool_handoff_is_exclusive() {
        let replica = Replica::new(Journal::from("a/journal")).unwrap();

        let spool = replica.acquire_spool().await.unwrap();
        assert_eq!(spool.fragment.begin, 0);

        // A second acquire blocks until release.
        let contender = {
            let replica = replica.clone();
            tokio::spawn(async move { replica.acquire_spool().await })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished());

        replica.release_spool(spool);
        let spool = contender.await.unwrap().unwrap();
        replica.release_spool(spool);
    }

    #[tokio::test]
    async fn pipeline_slot_starts_empty() {
        let replica = Replica::new(Journal::from("a/journal")).unwrap();
        let slot = replica.acquire_pipeline_slot().await.unwrap();
        assert!(slot.is_none());
        replica.release_pipeline_slot(None);
    }
}
