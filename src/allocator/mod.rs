//! Distributed journal allocator.
//!
//! Every broker runs an [`Allocator`] over a shared keyspace of Members,
//! Items, and Assignments. All members observe their local assignments
//! through a callback; the elected leader additionally runs scheduling
//! rounds, solving a prioritized maximum flow over the member/item
//! topology and converging the keyspace toward the solution with fenced,
//! batched transactions.

mod converge;
mod keys;
mod network;
mod push_relabel;
mod state;
mod txn;

pub use converge::converge;
pub use keys::{
    alloc_decoder, assignment_key, item_key, member_key, parse_assignment_key, parse_item_key,
    parse_member_key, AllocEntity, AssignmentKey, AssignmentSpec, FragmentSpec, JournalSpec,
    MemberSpec, ASSIGNMENTS_PREFIX, ITEMS_PREFIX, MEMBERS_PREFIX,
};
pub use network::{DesiredAssignment, FlowNetwork};
pub use push_relabel::Graph;
pub use state::{
    assignment_at, group_assignments, item_at, member_at, AllocatorState, AssignmentGroup,
    LocalItem,
};
pub use txn::{mod_revision_unchanged, BatchedTxn};

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::constants::KEYSPACE_SIGNAL_DEPTH;
use crate::coordination::{ClusterStore, Cmp, Op};
use crate::error::Result;
use crate::keyspace::KeySpace;
use crate::types::Revision;

/// Callback invoked with the local member's current item assignments on
/// every observed keyspace change, under the keyspace read lock.
pub type LocalItemsCallback = Box<dyn for<'a> Fn(&[LocalItem<'a>]) + Send + Sync>;

/// Hook invoked after each leader convergence round with the round number
/// and whether the round was idle (proposed no changes).
pub type RoundHook = Box<dyn FnMut(usize, bool) + Send>;

/// The keyspace type mirrored by the allocator.
pub type AllocKeySpace = KeySpace<AllocEntity>;

/// Construct the allocator's KeySpace rooted at `root`.
pub fn new_alloc_keyspace(root: impl Into<String>) -> AllocKeySpace {
    let root = root.into();
    let decoder = alloc_decoder(&root);
    KeySpace::new(root, decoder)
}

pub struct Allocator {
    pub keyspace: Arc<AllocKeySpace>,
    /// Member key of this allocator instance.
    pub local_key: String,
    /// Callback invoked with local assignments each round.
    pub local_items_callback: LocalItemsCallback,
    /// Optional testing hook observing convergence rounds.
    pub round_hook: Option<RoundHook>,
}

impl Allocator {
    /// Load and watch the keyspace and, while this member is leader, run
    /// scheduling rounds until the local member drains.
    ///
    /// Exits cleanly once the local member's item limit is zero and no
    /// assignments reference it. A graceful shutdown therefore writes an
    /// item limit of zero and waits for `serve` to return.
    pub async fn serve<S: ClusterStore + Clone>(&mut self, store: S) -> Result<()> {
        self.keyspace.load(&store, 0).await?;

        let (signal_tx, mut signal_rx) = mpsc::channel(KEYSPACE_SIGNAL_DEPTH);
        let watch = {
            let keyspace = self.keyspace.clone();
            let store = store.clone();
            tokio::spawn(async move { keyspace.watch_loop(&store, signal_tx).await })
        };

        // The leader re-solves for a maximum flow only when the topology
        // fingerprint changes; otherwise it continues converging toward
        // the prior solution, which remains a valid maximum assignment.
        let mut desired: Vec<DesiredAssignment> = Vec::new();
        let mut last_network_hash = 0u64;
        let mut last_txn_revision: Revision = 0;
        let mut round = 0;

        let result = loop {
            {
                let snapshot = self.keyspace.read().await;
                let state =
                    match AllocatorState::new(&self.keyspace.root, &snapshot, &self.local_key) {
                        Ok(state) => state,
                        // The local member key is gone: unrecoverable.
                        Err(err) => break Err(err),
                    };

                if state.should_exit() {
                    info!(member = %self.local_key, "local member drained; exiting");
                    break Ok(());
                }
                (self.local_items_callback)(&state.local_items);

                let revision = state.header.revision;
                if state.is_leader() && revision >= last_txn_revision {
                    if state.network_hash != last_network_hash {
                        last_network_hash = state.network_hash;

                        let mut network = FlowNetwork::init(&state);
                        network.solve();

                        desired.clear();
                        for i in 0..state.items.len() {
                            network.extract_item_flow(&state, i, &mut desired);
                        }
                    }

                    // Fence every transaction on the local member key, so
                    // a deposed leader's writes cannot land.
                    let fence = mod_revision_unchanged(
                        &state.members[state.local_member_ind].raw,
                    );
                    let mut txn = BatchedTxn::new(&store, vec![fence]);

                    let committed = match converge(&mut txn, &state, &desired).await {
                        Ok(()) => txn.commit().await,
                        Err(err) => Err(err),
                    };
                    match committed {
                        Ok(resp) => {
                            let idle = resp.header.revision == revision;
                            last_txn_revision = resp.header.revision;
                            if let Some(hook) = &mut self.round_hook {
                                hook(round, idle);
                            }
                            round += 1;
                        }
                        Err(err) => {
                            warn!(error = %err, round, revision,
                                "converge iteration failed (will retry)");
                        }
                    }
                }
            }

            // Await the next keyspace change.
            if signal_rx.recv().await.is_none() {
                break match watch.is_finished() {
                    true => Err(crate::error::Error::WatchClosed),
                    false => Ok(()),
                };
            }
        };

        watch.abort();
        result
    }

    /// Flip `consistent: false` assignments of the local member to true,
    /// one guarded transaction per assignment. Invoked by the member once
    /// its replicas for the named items are initialized.
    pub async fn acknowledge_assignments<S: ClusterStore>(
        store: &S,
        assignments: &[(String, Revision)],
    ) -> Result<()> {
        for (key, mod_revision) in assignments {
            let resp = store
                .txn(
                    vec![Cmp::ModRevision {
                        key: key.clone(),
                        equals: *mod_revision,
                    }],
                    vec![Op::put(
                        key.clone(),
                        converge::spec_value(AssignmentSpec { consistent: true }),
                    )],
                )
                .await?;
            if !resp.succeeded {
                // The assignment moved on; the next observation retries.
                warn!(key = %key, "assignment changed before acknowledgement");
            }
        }
        Ok(())
    }
}
