//! Background persistence of sealed spools.
//!
//! Commits never gate on persistence: a sealed spool is queued here and
//! drained by a background task which copies its content to the fragment's
//! backing store. Transient failures are logged and retried with a delay;
//! malformed store configuration drops the spool with an error.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::{Spool, StoreRegistry};
use crate::constants::PERSIST_RETRY_DELAY_MS;
use crate::error::Error;

pub struct Persister {
    tx: mpsc::UnboundedSender<Spool>,
}

impl Persister {
    /// Spawn the persister task draining sealed spools against `registry`.
    /// The task exits once every `Persister` handle is dropped and the
    /// queue is drained.
    pub fn spawn(registry: StoreRegistry) -> (Persister, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<Spool>();

        let handle = tokio::spawn(async move {
            while let Some(spool) = rx.recv().await {
                let fragment = spool.fragment.clone();
                loop {
                    let result = match registry.store_for(&fragment) {
                        Ok(store) => match spool.committed_content() {
                            Ok(content) => store.persist(&fragment, content).await,
                            Err(err) => Err(err),
                        },
                        Err(err) => Err(err),
                    };

                    match result {
                        Ok(()) => {
                            debug!(fragment = %fragment.content_name(), "persisted fragment");
                            break;
                        }
                        // A store misconfiguration will not heal with
                        // retries; surface it and move on.
                        Err(Error::Validation(detail)) => {
                            error!(fragment = %fragment.content_name(), %detail,
                                "dropping unpersistable fragment");
                            break;
                        }
                        Err(err) => {
                            warn!(fragment = %fragment.content_name(), error = %err,
                                "fragment persist failed (will retry)");
                            tokio::time::sleep(Duration::from_millis(PERSIST_RETRY_DELAY_MS))
                                .await;
                        }
                    }
                }
            }
        });

        (Persister { tx }, handle)
    }

    /// Queue a sealed spool. Spools with no backing store are dropped;
    /// their content remains available from replica spools until the
    /// journal is reassigned.
    pub fn queue(&self, spool: Spool) {
        if spool.fragment.backing_store.is_empty() {
            debug!(fragment = %spool.fragment.content_name(),
                "dropping sealed spool with no backing store");
            return;
        }
        // A send fails only at shutdown, when the persister is gone.
        let _ = self.tx.send(spool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Fragment, FragmentStore, MemoryStore, ProposalOutcome, Spool};
    use crate::types::Journal;
    use std::sync::Arc;

    /// Build a spool with committed content "foobarbazbing" and roll it,
    /// returning the sealed spool. `backing` is adopted at creation, as
    /// the first roll proposal of a live journal would.
    fn sealed_spool(backing: &str) -> Spool {
        let journal = Journal::from("a/journal");
        let mut spool = Spool::new(journal.clone(), 0).unwrap();

        let mut adopt = Fragment::zero(journal.clone());
        adopt.backing_store = backing.to_string();
        spool.apply_proposal(&adopt).unwrap();

        spool.apply_content(b"foobarbazbing", 0).unwrap();
        spool.apply_proposal(&spool.next()).unwrap();

        let mut roll = Fragment::zero(journal);
        roll.begin = 13;
        roll.end = 13;
        roll.backing_store = backing.to_string();
        match spool.apply_proposal(&roll).unwrap() {
            ProposalOutcome::Rolled(Some(sealed)) => sealed,
            other => panic!("expected sealed spool, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn persists_sealed_spools() {
        let mem = Arc::new(MemoryStore::new());
        let registry = StoreRegistry::new().register("mem", mem.clone());
        let (persister, handle) = Persister::spawn(registry);

        let sealed = sealed_spool("mem://stores/test");
        let fragment = sealed.fragment.clone();
        persister.queue(sealed);

        // Drain: drop the queue handle and wait for the task.
        drop(persister);
        handle.await.unwrap();

        assert!(mem.contains(&fragment));
        assert_eq!(
            mem.open(&fragment, 0).await.unwrap(),
            bytes::Bytes::from_static(b"foobarbazbing")
        );
    }

    #[tokio::test]
    async fn storeless_spools_are_dropped() {
        let registry = StoreRegistry::new();
        let (persister, handle) = Persister::spawn(registry);

        persister.queue(sealed_spool(""));
        drop(persister);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_scheme_is_dropped_not_retried() {
        let registry = StoreRegistry::new();
        let (persister, handle) = Persister::spawn(registry);

        persister.queue(sealed_spool("s3://bucket/prefix"));
        drop(persister);
        // Completes because the misconfigured spool is dropped.
        handle.await.unwrap();
    }
}
