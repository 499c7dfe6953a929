//! AllocatorState: a derived projection over a KeySpace snapshot.
//!
//! Partitions the sorted keys into Members, Items, and Assignments, and
//! precomputes the aggregates every scheduling round needs: per-member
//! assignment counts, the sorted zone set, total slot counts, leadership,
//! and a stable fingerprint of the flow-network inputs.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use super::keys::{
    item_key, member_key, AllocEntity, AssignmentKey, JournalSpec, MemberSpec,
    ASSIGNMENTS_PREFIX, ITEMS_PREFIX, MEMBERS_PREFIX,
};
use crate::coordination::StoreHeader;
use crate::error::{Error, Result};
use crate::keyspace::{search, KeyValue, Snapshot};
use crate::types::{BrokerId, Journal};

/// Assignments of a single item, ordered by (zone, suffix, slot).
///
/// Item IDs may contain `/`, so one item's assignment keys are not
/// guaranteed contiguous in raw key order; groups are built from parsed
/// keys instead.
#[derive(Clone, Debug)]
pub struct AssignmentGroup<'a> {
    pub item: &'a str,
    pub assignments: Vec<&'a KeyValue<AllocEntity>>,
}

/// An Item with an Assignment to the local member.
#[derive(Clone, Debug)]
pub struct LocalItem<'a> {
    /// The Item itself.
    pub item: &'a KeyValue<AllocEntity>,
    /// All Assignments of the Item, across all members.
    pub assignments: Vec<&'a KeyValue<AllocEntity>>,
    /// Index of the local member's Assignment within `assignments`.
    pub index: usize,
}

pub struct AllocatorState<'a> {
    pub root: &'a str,
    pub header: StoreHeader,

    pub members: &'a [KeyValue<AllocEntity>],
    pub items: &'a [KeyValue<AllocEntity>],
    pub assignments: &'a [KeyValue<AllocEntity>],
    /// Assignments grouped by item ID, groups in item-ID order.
    pub grouped: Vec<AssignmentGroup<'a>>,

    pub local_key: &'a str,
    pub local_member_ind: usize,
    pub local_items: Vec<LocalItem<'a>>,

    /// Sorted distinct member zones.
    pub zones: Vec<&'a str>,
    /// Sum of member item limits.
    pub member_slots: usize,
    /// Sum of item replications.
    pub item_slots: usize,
    /// Number of Assignments of each member, by member index. Assignments
    /// of missing Items are not counted.
    pub member_total_count: Vec<usize>,
    /// Number of slot-0 Assignments of each member, by member index.
    pub member_primary_count: Vec<usize>,
    /// Fingerprint of the (Items, Members, zones) flow-network inputs.
    pub network_hash: u64,
}

/// Accessor for a member entity known to be under the members prefix.
pub fn member_at(kv: &KeyValue<AllocEntity>) -> (&BrokerId, &MemberSpec) {
    match &kv.decoded {
        AllocEntity::Member { id, spec } => (id, spec),
        other => unreachable!("member slice holds non-member entity: {other:?}"),
    }
}

/// Accessor for an item entity known to be under the items prefix.
pub fn item_at(kv: &KeyValue<AllocEntity>) -> (&Journal, &JournalSpec) {
    match &kv.decoded {
        AllocEntity::Item { id, spec } => (id, spec),
        other => unreachable!("item slice holds non-item entity: {other:?}"),
    }
}

/// Accessor for an assignment entity known to be under the assign prefix.
pub fn assignment_at(kv: &KeyValue<AllocEntity>) -> (&AssignmentKey, bool) {
    match &kv.decoded {
        AllocEntity::Assignment { key, spec } => (key, spec.consistent),
        other => unreachable!("assignment slice holds non-assignment entity: {other:?}"),
    }
}

impl<'a> AllocatorState<'a> {
    /// Extract state from a KeySpace snapshot. Fails if `local_key` is not
    /// present among the members.
    pub fn new(
        root: &'a str,
        snapshot: &'a Snapshot<AllocEntity>,
        local_key: &'a str,
    ) -> Result<AllocatorState<'a>> {
        let members = snapshot.prefixed(&format!("{root}{MEMBERS_PREFIX}"));
        let items = snapshot.prefixed(&format!("{root}{ITEMS_PREFIX}"));
        let assignments = snapshot.prefixed(&format!("{root}{ASSIGNMENTS_PREFIX}"));

        let local_member_ind = search(members, local_key)
            .map_err(|_| Error::MemberKeyNotFound(local_key.to_string()))?;

        let mut zones: Vec<&str> = Vec::new();
        let mut member_slots = 0;
        for kv in members {
            let (id, spec) = member_at(kv);
            member_slots += spec.item_limit as usize;
            if let Err(i) = zones.binary_search(&id.zone.as_str()) {
                zones.insert(i, &id.zone);
            }
        }

        let item_slots = items
            .iter()
            .map(|kv| item_at(kv).1.replication as usize)
            .sum();

        let grouped = group_assignments(assignments);

        let mut member_total_count = vec![0; members.len()];
        let mut member_primary_count = vec![0; members.len()];
        let mut local_items = Vec::new();

        for group in &grouped {
            let item = match search(items, &item_key(root, group.item)) {
                Ok(i) => &items[i],
                // Assignments of missing Items contribute no counts and
                // no local items.
                Err(_) => continue,
            };
            for (offset, kv) in group.assignments.iter().enumerate() {
                let (ak, _) = assignment_at(kv);
                if let Ok(m) = search(members, &member_key(root, &ak.member)) {
                    member_total_count[m] += 1;
                    if ak.slot == 0 {
                        member_primary_count[m] += 1;
                    }
                }
                if member_key(root, &ak.member) == local_key {
                    local_items.push(LocalItem {
                        item,
                        assignments: group.assignments.clone(),
                        index: offset,
                    });
                }
            }
        }

        let network_hash = Self::hash_network(members, items);

        Ok(AllocatorState {
            root,
            header: snapshot.header,
            members,
            items,
            assignments,
            grouped,
            local_key,
            local_member_ind,
            local_items,
            zones,
            member_slots,
            item_slots,
            member_total_count,
            member_primary_count,
            network_hash,
        })
    }

    /// Stable fingerprint over sorted (Item, replication) and (Member,
    /// limit, zone) tuples. Changes iff the flow-network topology changes.
    fn hash_network(members: &[KeyValue<AllocEntity>], items: &[KeyValue<AllocEntity>]) -> u64 {
        let mut h = DefaultHasher::new();
        items.len().hash(&mut h);
        for kv in items {
            let (id, spec) = item_at(kv);
            id.as_str().hash(&mut h);
            spec.replication.hash(&mut h);
        }
        members.len().hash(&mut h);
        for kv in members {
            let (id, spec) = member_at(kv);
            id.zone.hash(&mut h);
            id.suffix.hash(&mut h);
            spec.item_limit.hash(&mut h);
        }
        h.finish()
    }

    /// The leader is the member with the smallest create revision,
    /// tie-broken by key.
    pub fn is_leader(&self) -> bool {
        let local = &self.members[self.local_member_ind].raw;
        for kv in self.members {
            let other = &kv.raw;
            if (other.create_revision, other.key.as_str())
                < (local.create_revision, local.key.as_str())
            {
                return false;
            }
        }
        true
    }

    /// The local member may exit once it is draining and nothing
    /// references it.
    pub fn should_exit(&self) -> bool {
        let (local_id, spec) = member_at(&self.members[self.local_member_ind]);
        if spec.item_limit != 0 {
            return false;
        }
        // Consider every assignment, including those of deleted Items
        // which are not yet garbage-collected.
        !self
            .assignments
            .iter()
            .any(|kv| assignment_at(kv).0.member == *local_id)
    }

    /// Load ratio of the member of `assignment`: its count (total or
    /// primary) over its item limit. A missing or zero-limit member ranks
    /// as infinitely loaded.
    pub fn member_load_ratio(&self, assignment: &KeyValue<AllocEntity>, counts: &[usize]) -> f32 {
        let (ak, _) = assignment_at(assignment);
        match search(self.members, &member_key(self.root, &ak.member)) {
            Ok(m) => {
                let (_, spec) = member_at(&self.members[m]);
                if spec.item_limit == 0 {
                    f32::MAX
                } else {
                    counts[m] as f32 / spec.item_limit as f32
                }
            }
            Err(_) => f32::MAX,
        }
    }
}

/// Group assignments by parsed item ID. Groups are ordered by item ID and
/// assignments within a group by (zone, suffix, slot).
pub fn group_assignments(assignments: &[KeyValue<AllocEntity>]) -> Vec<AssignmentGroup<'_>> {
    let mut refs: Vec<&KeyValue<AllocEntity>> = assignments.iter().collect();
    refs.sort_by(|a, b| assignment_at(a).0.cmp(assignment_at(b).0));

    let mut groups: Vec<AssignmentGroup> = Vec::new();
    for kv in refs {
        let (ak, _) = assignment_at(kv);
        match groups.last_mut() {
            Some(group) if group.item == ak.item => group.assignments.push(kv),
            _ => groups.push(AssignmentGroup {
                item: &ak.item,
                assignments: vec![kv],
            }),
        }
    }
    groups
}
