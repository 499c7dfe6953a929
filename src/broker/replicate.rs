//! Peer-side Replicate service loop.
//!
//! A journal primary drives this stream for each replica of its route.
//! The first request synchronizes the replica against the primary's route
//! and fragment; subsequent requests spool content and commit, roll, or
//! roll back via proposals. The replica owns its spool for the lifetime
//! of the stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use super::resolver::{ResolveArgs, Resolver};
use crate::error::{Error, Result, Status};
use crate::fragment::{Persister, ProposalOutcome, Spool};
use crate::protocol::{ReplicateRequest, ReplicateResponse};

pub(super) async fn serve_replicate(
    resolver: &Resolver,
    persister: &Arc<Persister>,
    mut rx: mpsc::Receiver<ReplicateRequest>,
    tx: mpsc::Sender<ReplicateResponse>,
) -> Result<()> {
    let Some(first) = rx.recv().await else {
        return Ok(());
    };
    first.validate()?;

    // Validated initial requests carry journal, header, route, proposal.
    let (journal, header, route, proposal) =
        match (&first.journal, &first.header, &first.route, &first.proposal) {
            (Some(j), Some(h), Some(r), Some(p)) => (j.clone(), h.clone(), r.clone(), p),
            _ => return Err(Error::Validation("malformed initial request".to_string())),
        };

    let resolution = resolver
        .resolve(ResolveArgs {
            journal: journal.clone(),
            proxy_header: Some(header),
            proxy_route: Some(route),
            ..Default::default()
        })
        .await?;

    let replica = match resolution.replica.clone() {
        Some(replica) if resolution.status == Status::Ok => replica,
        _ => {
            // Either our observed route disagrees with the primary's, or
            // the local broker is not (yet) a member of it.
            let status = match resolution.status {
                Status::Ok => Status::WrongRoute,
                other => other,
            };
            let resp = match status {
                Status::WrongRoute => ReplicateResponse {
                    status,
                    header: Some(resolution.header.clone()),
                    route: Some(resolution.route.clone()),
                    ..Default::default()
                },
                _ => ReplicateResponse {
                    status,
                    ..Default::default()
                },
            };
            let _ = tx.send(resp).await;
            return Ok(());
        }
    };

    // A stale pipeline from this broker's own primary tenure under an
    // older route may still hold the spool; recover it first.
    if let Some(slot) = replica.try_acquire_pipeline_slot().await {
        match slot {
            Some(pipeline) if !pipeline.route.equivalent(&resolution.route) => {
                let spool = pipeline.close_send();
                replica.release_spool(spool);
                replica.release_pipeline_slot(None);
            }
            other => replica.release_pipeline_slot(other),
        }
    }

    let mut spool = replica.acquire_spool().await?;

    // Synchronize against the primary's proposal. A mismatch is not
    // fatal: the primary adopts our fragment and re-proposes on this
    // same stream.
    let resp = apply_proposal(&replica, persister, &mut spool, proposal);
    if tx.send(resp).await.is_err() {
        replica.release_spool(spool);
        return Ok(());
    }

    loop {
        let Some(req) = rx.recv().await else {
            // The primary closed the stream.
            replica.release_spool(spool);
            return Ok(());
        };
        if let Err(err) = req.validate() {
            replica.release_spool(spool);
            return Err(err);
        }

        if !req.content.is_empty() {
            if let Err(err) = spool.apply_content(&req.content, req.content_delta) {
                warn!(journal = %journal, error = %err, "replica content apply failed");
                let resp = ReplicateResponse {
                    status: Status::FragmentMismatch,
                    fragment: Some(spool.next()),
                    ..Default::default()
                };
                let _ = tx.send(resp).await;
                replica.release_spool(spool);
                return Ok(());
            }
            continue;
        }

        if let Some(proposal) = &req.proposal {
            let resp = apply_proposal(&replica, persister, &mut spool, proposal);
            let ok = resp.status == Status::Ok;
            if req.acknowledge {
                if tx.send(resp).await.is_err() {
                    replica.release_spool(spool);
                    return Ok(());
                }
            } else if !ok {
                // An unacknowledged proposal (a fragment roll) must always
                // apply; divergence here poisons the stream.
                let _ = tx.send(resp).await;
                replica.release_spool(spool);
                return Ok(());
            }
            if !ok {
                // The primary observed the mismatch and may re-propose.
                continue;
            }
        }
    }
}

fn apply_proposal(
    replica: &Arc<super::replica::Replica>,
    persister: &Arc<Persister>,
    spool: &mut Spool,
    proposal: &crate::fragment::Fragment,
) -> ReplicateResponse {
    match spool.apply_proposal(proposal) {
        Ok(ProposalOutcome::Committed) => {
            replica
                .index
                .add(spool.fragment.clone(), Some(spool.shared_file()));
            ReplicateResponse::ok()
        }
        Ok(ProposalOutcome::RolledBack) => ReplicateResponse::ok(),
        Ok(ProposalOutcome::Rolled(sealed)) => {
            if let Some(sealed) = sealed {
                persister.queue(sealed);
            }
            ReplicateResponse::ok()
        }
        Ok(ProposalOutcome::Mismatch) => ReplicateResponse {
            status: Status::FragmentMismatch,
            fragment: Some(spool.next()),
            ..Default::default()
        },
        Err(err) => {
            warn!(error = %err, "proposal apply failed");
            ReplicateResponse {
                status: Status::FragmentMismatch,
                fragment: Some(spool.next()),
                ..Default::default()
            }
        }
    }
}
