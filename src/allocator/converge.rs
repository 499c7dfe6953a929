//! Convergence of current assignments toward a desired assignment set.
//!
//! The converger walks items joined with their current assignments and the
//! solver's desired assignments, and emits checkpointed transaction
//! operations which advance the keyspace one safe step at a time:
//!
//! - New placements are created immediately, marked `consistent: false`.
//!   The assigned member flips them to true once its replica initializes.
//! - A member keeping an item under a different slot is re-keyed in a
//!   single checkpoint, carrying its consistency over.
//! - Surplus assignments are removed only while the item retains at least
//!   its replication in consistent assignments, so capacity never drops
//!   below target within a single step. Assignments of deleted members
//!   are removed unconditionally.
//! - Assignments whose item no longer exists are garbage-collected under
//!   a compare that the item key is still absent.

use std::collections::HashMap;

use super::keys::{
    assignment_key, item_key, member_key, AllocEntity, AssignmentKey, AssignmentSpec,
};
use super::network::DesiredAssignment;
use super::state::{assignment_at, item_at, AllocatorState, AssignmentGroup};
use super::txn::{mod_revision_unchanged, BatchedTxn};
use crate::coordination::{ClusterStore, Cmp, Op};
use crate::error::Result;
use crate::keyspace::{search, KeyValue};

/// Identify and apply incremental changes bringing current state closer
/// to `desired`, which must be sorted by (item, slot).
pub async fn converge<S: ClusterStore>(
    txn: &mut BatchedTxn<'_, S>,
    state: &AllocatorState<'_>,
    mut desired: &[DesiredAssignment],
) -> Result<()> {
    let mut groups = state.grouped.iter().peekable();

    for item_kv in state.items {
        let (id, _) = item_at(item_kv);

        // Groups sorting before this item have no item; remove them.
        while let Some(group) = groups.peek() {
            if group.item < id.as_str() {
                remove_dead_assignments(txn, state, group).await?;
                groups.next();
            } else {
                break;
            }
        }

        let current: &[&KeyValue<AllocEntity>] =
            match groups.next_if(|group| group.item == id.as_str()) {
                Some(group) => &group.assignments,
                None => &[],
            };

        let limit = desired
            .iter()
            .take_while(|d| d.item == id.as_str())
            .count();
        item_ops(txn, state, item_kv, current, &desired[..limit]).await?;
        desired = &desired[limit..];
    }

    // Remove any trailing dead groups.
    for group in groups {
        remove_dead_assignments(txn, state, group).await?;
    }
    Ok(())
}

/// Emit one checkpoint converging a single item.
async fn item_ops<S: ClusterStore>(
    txn: &mut BatchedTxn<'_, S>,
    state: &AllocatorState<'_>,
    item_kv: &KeyValue<AllocEntity>,
    current: &[&KeyValue<AllocEntity>],
    desired: &[DesiredAssignment],
) -> Result<()> {
    let (_, spec) = item_at(item_kv);
    let replication = spec.replication as usize;

    let desired_slots: HashMap<_, u32> =
        desired.iter().map(|d| (&d.member, d.slot)).collect();

    // Partition current assignments: kept in place, re-slotted, or surplus.
    let mut surviving_consistent = 0;
    let mut reslots: Vec<(&KeyValue<AllocEntity>, u32)> = Vec::new();
    let mut removes: Vec<&KeyValue<AllocEntity>> = Vec::new();

    for kv in current {
        let (ak, consistent) = assignment_at(kv);
        match desired_slots.get(&ak.member) {
            Some(&slot) => {
                if slot != ak.slot {
                    reslots.push((kv, slot));
                }
                if consistent {
                    surviving_consistent += 1;
                }
            }
            None => removes.push(kv),
        }
    }

    let mut dirty = false;

    // Create new placements, inconsistent until their member reports in.
    for d in desired {
        let held = current
            .iter()
            .any(|kv| assignment_at(kv).0.member == d.member);
        if held {
            continue;
        }
        let key = assignment_key(
            state.root,
            &AssignmentKey {
                item: d.item.clone(),
                member: d.member.clone(),
                slot: d.slot,
            },
        );
        txn.if_cmp(Cmp::CreateRevision {
            key: key.clone(),
            equals: 0,
        });
        txn.then_op(Op::put(key, spec_value(AssignmentSpec { consistent: false })));
        dirty = true;
    }

    // Re-key members whose slot moved, preserving their consistency.
    for (kv, slot) in reslots {
        let (ak, _) = assignment_at(kv);
        let next = assignment_key(
            state.root,
            &AssignmentKey {
                item: ak.item.clone(),
                member: ak.member.clone(),
                slot,
            },
        );
        txn.if_cmp(mod_revision_unchanged(&kv.raw));
        txn.then_op(Op::delete(kv.raw.key.clone()));
        txn.if_cmp(Cmp::CreateRevision {
            key: next.clone(),
            equals: 0,
        });
        txn.then_op(Op::put(next, kv.raw.value.clone()));
        dirty = true;
    }

    // Remove surplus assignments, highest slot first, while the item
    // retains `replication` consistent assignments. Assignments of
    // deleted members cannot be preserved and are removed outright.
    removes.sort_by_key(|kv| std::cmp::Reverse(assignment_at(kv).0.slot));
    for kv in removes {
        let (ak, _) = assignment_at(kv);
        let member_exists = search(state.members, &member_key(state.root, &ak.member)).is_ok();
        if member_exists && surviving_consistent < replication {
            continue;
        }
        txn.if_cmp(mod_revision_unchanged(&kv.raw));
        txn.then_op(Op::delete(kv.raw.key.clone()));
        dirty = true;
    }

    if dirty {
        txn.checkpoint().await?;
    }
    Ok(())
}

/// Remove a group of assignments whose item has been deleted, guarded by
/// a compare that the item key remains absent.
async fn remove_dead_assignments<S: ClusterStore>(
    txn: &mut BatchedTxn<'_, S>,
    state: &AllocatorState<'_>,
    group: &AssignmentGroup<'_>,
) -> Result<()> {
    txn.if_cmp(Cmp::CreateRevision {
        key: item_key(state.root, group.item),
        equals: 0,
    });
    for kv in &group.assignments {
        txn.if_cmp(mod_revision_unchanged(&kv.raw));
        txn.then_op(Op::delete(kv.raw.key.clone()));
    }
    txn.checkpoint().await
}

/// Serialized assignment value.
pub fn spec_value(spec: AssignmentSpec) -> Vec<u8> {
    // AssignmentSpec serialization cannot fail.
    serde_json::to_vec(&spec).expect("AssignmentSpec serializes")
}
