//! Resolver: maps a (journal, revision, requirements) tuple to a route
//! and either a local replica handle or a peer to proxy to.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};

use super::replica::Replica;
use crate::allocator::{
    assignment_at, item_key, member_at, member_key, AllocEntity, AllocKeySpace,
    ASSIGNMENTS_PREFIX,
};
use crate::error::{Result, Status};
use crate::keyspace::Snapshot;
use crate::protocol::{Header, Route};
use crate::types::{BrokerId, Journal, Revision};

/// Arguments of a resolution.
#[derive(Clone, Debug, Default)]
pub struct ResolveArgs {
    pub journal: Journal,
    /// Do not resolve until the observed keyspace revision reaches this.
    pub min_revision: Revision,
    /// The RPC requires the journal's primary (slot 0).
    pub require_primary: bool,
    /// The RPC requires the route to carry the journal's full replication.
    pub require_full_assignment: bool,
    /// The RPC may be served by proxying to an assigned peer.
    pub may_proxy: bool,
    /// Header of the proxying broker's resolution, when the request was
    /// forwarded.
    pub proxy_header: Option<Header>,
    /// Route under which a forwarded request was built. A proxied request
    /// whose route no longer matches is answered `WrongRoute`.
    pub proxy_route: Option<Route>,
}

/// Outcome of a resolution.
#[derive(Debug)]
pub struct Resolution {
    pub status: Status,
    /// Header observed at resolution, for response embedding.
    pub header: Header,
    pub route: Route,
    /// The journal's specification, when the journal exists.
    pub spec: Option<crate::allocator::JournalSpec>,
    /// Local replica handle, when the local broker is in the route.
    pub replica: Option<Arc<Replica>>,
    /// Peer to forward the request to, when proxying applies.
    pub proxy_to: Option<(BrokerId, String)>,
}

pub struct Resolver {
    keyspace: Arc<AllocKeySpace>,
    local: BrokerId,
    replicas: DashMap<Journal, Arc<Replica>>,
}

impl Resolver {
    pub fn new(keyspace: Arc<AllocKeySpace>, local: BrokerId) -> Resolver {
        Resolver {
            keyspace,
            local,
            replicas: DashMap::new(),
        }
    }

    #[inline]
    pub fn local_id(&self) -> &BrokerId {
        &self.local
    }

    /// The replica of `journal`, if one is active on this broker.
    pub fn replica_of(&self, journal: &Journal) -> Option<Arc<Replica>> {
        self.replicas.get(journal).map(|r| r.clone())
    }

    pub async fn resolve(&self, args: ResolveArgs) -> Result<Resolution> {
        let min_revision = args
            .min_revision
            .max(args.proxy_header.as_ref().map(|h| h.revision).unwrap_or(0));
        self.keyspace.await_revision(min_revision).await;

        let snapshot = self.keyspace.read().await;
        let header = snapshot.header.to_protocol();
        let root = &self.keyspace.root;

        let spec = match snapshot.search(&item_key(root, args.journal.as_str())) {
            Ok(i) => snapshot.kvs[i].decoded.as_item().map(|(_, s)| s.clone()),
            Err(_) => None,
        };
        let route = route_of(&snapshot, root, &args.journal);

        let resolution = |status: Status, replica, proxy_to| Resolution {
            status,
            header: header.clone(),
            route: route.clone(),
            spec: spec.clone(),
            replica,
            proxy_to,
        };

        if spec.is_none() {
            return Ok(resolution(Status::JournalNotFound, None, None));
        }

        // A forwarded request built under a route we no longer observe is
        // answered with our newer route.
        if let Some(proxy_route) = &args.proxy_route {
            if !proxy_route.equivalent(&route) {
                return Ok(resolution(Status::WrongRoute, None, None));
            }
        }

        if args.require_full_assignment {
            let replication = spec.as_ref().map(|s| s.replication).unwrap_or(0) as usize;
            if route.members.len() < replication {
                return Ok(resolution(Status::InsufficientJournalBrokers, None, None));
            }
        }

        let local_index = route.index_of(&self.local);

        if args.require_primary && local_index != Some(0) {
            if args.may_proxy {
                if let Some(primary) = route.primary() {
                    let endpoint = route.endpoint_for(0).unwrap_or("").to_string();
                    return Ok(resolution(Status::Ok, None, Some((primary.clone(), endpoint))));
                }
            }
            return Ok(resolution(Status::NotJournalPrimaryBroker, None, None));
        }

        match local_index {
            Some(_) => {
                let replica = self.get_or_create_replica(&args.journal)?;
                Ok(resolution(Status::Ok, Some(replica), None))
            }
            None if args.may_proxy && !route.members.is_empty() => {
                let endpoint = route.endpoint_for(0).unwrap_or("").to_string();
                let primary = route.members[0].clone();
                Ok(resolution(Status::Ok, None, Some((primary, endpoint))))
            }
            None => Ok(resolution(Status::NotJournalBroker, None, None)),
        }
    }

    fn get_or_create_replica(&self, journal: &Journal) -> Result<Arc<Replica>> {
        if let Some(replica) = self.replicas.get(journal) {
            return Ok(replica.clone());
        }
        let replica = Replica::new(journal.clone())?;
        let entry = self
            .replicas
            .entry(journal.clone())
            .or_insert_with(|| replica);
        Ok(entry.clone())
    }

    /// Reconcile active replicas against the journals currently assigned
    /// to this broker: create missing replicas, drop unassigned ones.
    pub fn update_local_replicas(&self, assigned: &[Journal]) {
        for journal in assigned {
            if !self.replicas.contains_key(journal) {
                match Replica::new(journal.clone()) {
                    Ok(replica) => {
                        info!(journal = %journal, "starting local replica");
                        self.replicas.insert(journal.clone(), replica);
                    }
                    Err(err) => {
                        warn!(journal = %journal, error = %err, "failed to start replica")
                    }
                }
            }
        }
        self.replicas.retain(|journal, _| {
            let keep = assigned.contains(journal);
            if !keep {
                info!(journal = %journal, "stopping unassigned replica");
            }
            keep
        });
    }
}

/// Derive the route of `journal` from its assignments: members in slot
/// order, with endpoints from their member specs.
pub fn route_of(snapshot: &Snapshot<AllocEntity>, root: &str, journal: &Journal) -> Route {
    let prefix = format!("{root}{ASSIGNMENTS_PREFIX}{}/", journal.as_str());

    let mut slots: Vec<(u32, BrokerId)> = snapshot
        .prefixed(&prefix)
        .iter()
        .filter_map(|kv| {
            let (ak, _) = assignment_at(kv);
            // Prefix scans over-match nested journal names; bind exactly.
            (ak.item == journal.as_str()).then(|| (ak.slot, ak.member.clone()))
        })
        .collect();
    slots.sort();

    let mut route = Route::default();
    for (_, member) in slots {
        let endpoint = match snapshot.search(&member_key(root, &member)) {
            Ok(i) => member_at(&snapshot.kvs[i]).1.endpoint.clone(),
            Err(_) => String::new(),
        };
        route.members.push(member);
        route.endpoints.push(endpoint);
    }
    route
}
