//! Flow-network construction over allocator state, and extraction of the
//! desired assignment set from a solved maximum flow.
//!
//! The graph is source → Item → (Item, Zone) → Member → sink. Zone nodes
//! cap the flow any single zone may carry for an item, forcing replicas of
//! multi-replica items across at least two zones whenever the cluster
//! spans more than one. Arc priorities preserve current assignments:
//! existing item/member edges outrank new ones, so re-solving after small
//! topology changes moves as few assignments as possible.

use std::collections::{HashMap, HashSet};

use super::keys::member_key;
use super::push_relabel::{Graph, NodeId};
use super::state::{assignment_at, item_at, member_at, AllocatorState};
use crate::types::BrokerId;

/// Priority of arcs reflecting a current assignment.
const PRIORITY_CURRENT: i32 = 2;
/// Priority of arcs into zones already holding the item.
const PRIORITY_ZONE: i32 = 1;
/// Priority of arcs proposing a new placement.
const PRIORITY_NEW: i32 = 0;

/// A scheduling decision produced by the solver: place `item` on `member`
/// at `slot`.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DesiredAssignment {
    pub item: String,
    pub member: BrokerId,
    pub slot: u32,
}

pub struct FlowNetwork {
    pub graph: Graph,
    source: NodeId,
    sink: NodeId,
    /// Per item index: (member index, arc index) of each candidate edge.
    item_member_arcs: Vec<Vec<(usize, usize)>>,
}

impl FlowNetwork {
    /// Build the prioritized network for `state`.
    pub fn init(state: &AllocatorState) -> FlowNetwork {
        let mut graph = Graph::new();
        let source = graph.add_node();
        let sink = graph.add_node();

        // Index current assignments for priority decisions.
        let mut current: HashSet<(usize, usize)> = HashSet::new();
        let mut current_zones: HashSet<(usize, String)> = HashSet::new();
        let member_index: HashMap<String, usize> = state
            .members
            .iter()
            .enumerate()
            .map(|(m, kv)| (kv.raw.key.clone(), m))
            .collect();
        let item_index: HashMap<&str, usize> = state
            .items
            .iter()
            .enumerate()
            .map(|(i, kv)| (item_at(kv).0.as_str(), i))
            .collect();

        for group in &state.grouped {
            let Some(&i) = item_index.get(group.item) else {
                continue;
            };
            for kv in &group.assignments {
                let (ak, _) = assignment_at(kv);
                if let Some(&m) = member_index.get(&member_key(state.root, &ak.member)) {
                    current.insert((i, m));
                    current_zones.insert((i, ak.member.zone.clone()));
                }
            }
        }

        // Member nodes, each draining to the sink at its item limit.
        let members: Vec<NodeId> = state
            .members
            .iter()
            .map(|kv| {
                let node = graph.add_node();
                let (_, spec) = member_at(kv);
                graph.add_arc(node, sink, spec.item_limit as i64, PRIORITY_NEW);
                node
            })
            .collect();

        let mut item_member_arcs = Vec::with_capacity(state.items.len());

        for (i, kv) in state.items.iter().enumerate() {
            let (_, spec) = item_at(kv);
            let replication = spec.replication as i64;

            let item_node = graph.add_node();
            graph.add_arc(source, item_node, replication, PRIORITY_NEW);

            let mut arcs = Vec::new();
            for zone in &state.zones {
                let zone_node = graph.add_node();
                let zone_priority = if current_zones.contains(&(i, zone.to_string())) {
                    PRIORITY_ZONE
                } else {
                    PRIORITY_NEW
                };
                graph.add_arc(
                    item_node,
                    zone_node,
                    zone_capacity(replication, state.zones.len()),
                    zone_priority,
                );

                for (m, member_kv) in state.members.iter().enumerate() {
                    let (id, spec) = member_at(member_kv);
                    if id.zone != *zone || spec.item_limit == 0 {
                        continue;
                    }
                    let priority = if current.contains(&(i, m)) {
                        PRIORITY_CURRENT
                    } else {
                        PRIORITY_NEW
                    };
                    let arc = graph.add_arc(zone_node, members[m], 1, priority);
                    arcs.push((m, arc));
                }
            }
            item_member_arcs.push(arcs);
        }

        FlowNetwork {
            graph,
            source,
            sink,
            item_member_arcs,
        }
    }

    /// Run the solver to a global maximum flow.
    pub fn solve(&mut self) {
        self.graph.find_max_flow(self.source, self.sink);
    }

    /// Extract the desired assignments of item `i`, appending to `out`.
    ///
    /// The item's current primary, if it still carries flow, keeps slot 0;
    /// remaining slots order by (zone, member key).
    pub fn extract_item_flow(
        &self,
        state: &AllocatorState,
        i: usize,
        out: &mut Vec<DesiredAssignment>,
    ) {
        let (item_id, _) = item_at(&state.items[i]);

        let mut placed: Vec<usize> = self.item_member_arcs[i]
            .iter()
            .filter(|(_, arc)| self.graph.arc(*arc).flow == 1)
            .map(|(m, _)| *m)
            .collect();
        placed.sort_by(|&a, &b| {
            let (ida, _) = member_at(&state.members[a]);
            let (idb, _) = member_at(&state.members[b]);
            ida.cmp(idb)
        });

        // Hold the current primary at slot 0 when the solution retains it.
        if let Some(primary) = current_primary(state, item_id.as_str()) {
            if let Some(pos) = placed.iter().position(|&m| {
                let (id, _) = member_at(&state.members[m]);
                *id == primary
            }) {
                let m = placed.remove(pos);
                placed.insert(0, m);
            }
        }

        for (slot, m) in placed.into_iter().enumerate() {
            let (id, _) = member_at(&state.members[m]);
            out.push(DesiredAssignment {
                item: item_id.as_str().to_string(),
                member: id.clone(),
                slot: slot as u32,
            });
        }
    }
}

/// Capacity of an item → zone arc: replication, reduced by one when both
/// the item and the cluster span multiple zones. A single zone can then
/// never satisfy the item alone, forcing at least two distinct zones.
fn zone_capacity(replication: i64, zones: usize) -> i64 {
    if replication > 1 && zones > 1 {
        replication - 1
    } else {
        replication
    }
}

/// The member currently holding slot 0 of `item`, if any.
fn current_primary(state: &AllocatorState, item: &str) -> Option<BrokerId> {
    for group in &state.grouped {
        if group.item != item {
            continue;
        }
        for kv in &group.assignments {
            let (ak, _) = assignment_at(kv);
            if ak.slot == 0 {
                return Some(ak.member.clone());
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_capacity_forces_spread() {
        // Multi-replica items across a multi-zone cluster leave headroom
        // for at most R-1 replicas in any one zone.
        assert_eq!(zone_capacity(3, 2), 2);
        assert_eq!(zone_capacity(2, 3), 1);
        // Single zone, or single replica: no reduction is possible.
        assert_eq!(zone_capacity(3, 1), 3);
        assert_eq!(zone_capacity(1, 2), 1);
    }

}
