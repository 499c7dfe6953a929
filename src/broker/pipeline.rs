//! Replication pipeline: a primary's fan-out of streaming connections to
//! every replica of a route.
//!
//! Ownership is split in two. The [`Pipeline`] value is the *send half*:
//! it owns the local spool, the per-peer request senders, and the tail of
//! the barrier chain, and moves between consecutive Append RPCs through
//! the replica's depth-1 pipeline channel. The [`RecvHalf`] owns the
//! per-peer response receivers and travels the barrier chain itself: each
//! appender receives it from its predecessor, gathers exactly its own
//! responses, and forwards it. Responses are therefore read in the same
//! order sends were issued, with no head-of-line blocking on sends.
//!
//! The local replica participates as a loop-back peer: scatter applies
//! requests to the owned spool directly and queues its responses for the
//! receive half to gather alongside remote ones.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::warn;

use super::Dialer;
use crate::error::{Error, Status};
use crate::fragment::{FragmentIndex, Persister, ProposalOutcome, Spool};
use crate::protocol::{Header, ReplicateRequest, ReplicateResponse, Route};
use crate::types::{BrokerId, Revision};

/// Handshake attempts before a build is abandoned.
const MAX_BUILD_ATTEMPTS: usize = 8;

struct PeerTx {
    id: BrokerId,
    tx: mpsc::Sender<ReplicateRequest>,
    broken: bool,
}

enum PeerRx {
    Remote {
        rx: mpsc::Receiver<ReplicateResponse>,
    },
    Local {
        rx: mpsc::UnboundedReceiver<ReplicateResponse>,
    },
}

impl PeerRx {
    async fn recv(&mut self) -> Option<ReplicateResponse> {
        match self {
            PeerRx::Remote { rx, .. } => rx.recv().await,
            PeerRx::Local { rx } => rx.recv().await,
        }
    }
}

/// The receive half: gathers one response per route member per
/// acknowledged request.
pub struct RecvHalf {
    peers: Vec<PeerRx>,
    /// First receive-side failure observed.
    pub recv_err: Option<Error>,
    /// First non-OK response observed, carrying the peer's corrective
    /// route or fragment.
    pub first_rejection: Option<ReplicateResponse>,
}

impl RecvHalf {
    /// Collect one response from every peer, requiring `Status::Ok`.
    pub async fn gather_ok(&mut self) {
        for peer in &mut self.peers {
            match peer.recv().await {
                Some(resp) if resp.status == Status::Ok => {}
                Some(resp) => {
                    if self.recv_err.is_none() {
                        self.recv_err =
                            Some(Error::Unavailable(format!("peer status {}", resp.status)));
                    }
                    if self.first_rejection.is_none() {
                        self.first_rejection = Some(resp);
                    }
                }
                None => {
                    if self.recv_err.is_none() {
                        self.recv_err = Some(Error::Unavailable("peer stream closed".to_string()));
                    }
                }
            }
        }
    }

    /// Drain every remote stream through end-of-stream, after a send-side
    /// failure closed them.
    pub async fn gather_eof(&mut self) {
        for peer in &mut self.peers {
            if let PeerRx::Remote { rx, .. } = peer {
                while rx.recv().await.is_some() {}
            }
        }
    }
}

/// The send half of a built pipeline.
pub struct Pipeline {
    /// Resolution header under which the pipeline was built.
    pub header: Header,
    pub route: Route,
    spool: Spool,
    peers: Vec<PeerTx>,
    local_ack_tx: mpsc::UnboundedSender<ReplicateResponse>,
    index: Arc<FragmentIndex>,
    persister: Arc<Persister>,
    send_err: Option<Error>,
    /// Tail of the barrier chain: where the RecvHalf arrives for the next
    /// appender.
    tail: oneshot::Receiver<RecvHalf>,
}

/// Result of building a pipeline. Non-ready outcomes return the spool so
/// the replica retains it.
pub enum BuildOutcome {
    Ready(Box<Pipeline>),
    /// A peer is operating under a newer route; re-resolve at `revision`.
    WrongRoute { revision: Revision, spool: Spool },
    Failed { error: Error, spool: Spool },
}

impl Pipeline {
    /// Dial each peer of `route` and synchronize spools: the initial
    /// proposal is re-driven until every replica accepts it, adopting the
    /// greatest peer offset on fragment mismatches.
    pub async fn build(
        dialer: &Arc<dyn Dialer>,
        header: Header,
        route: Route,
        local: &BrokerId,
        spool: Spool,
        index: Arc<FragmentIndex>,
        persister: Arc<Persister>,
    ) -> BuildOutcome {
        let journal = spool.fragment.journal.clone();

        // Dial every non-local member, preserving route order across the
        // send and receive sides. The local member participates through
        // the loop-back acknowledgement channel at its route slot.
        let mut peers = Vec::new();
        let (local_ack_tx, local_ack_rx) = mpsc::unbounded_channel();
        let mut local_ack_rx = Some(local_ack_rx);
        let mut rx_entries = Vec::new();

        for (i, member) in route.members.iter().enumerate() {
            if member == local {
                if let Some(rx) = local_ack_rx.take() {
                    rx_entries.push(PeerRx::Local { rx });
                }
                continue;
            }
            let endpoint = route.endpoint_for(i).unwrap_or("");
            match dialer.replicate(member, endpoint).await {
                Ok(stream) => {
                    peers.push(PeerTx {
                        id: member.clone(),
                        tx: stream.tx,
                        broken: false,
                    });
                    rx_entries.push(PeerRx::Remote { rx: stream.rx });
                }
                Err(error) => return BuildOutcome::Failed { error, spool },
            }
        }

        let mut pipeline = Pipeline {
            header,
            route,
            spool,
            peers,
            local_ack_tx,
            index,
            persister,
            send_err: None,
            tail: oneshot::channel().1, // replaced below
        };
        let mut recv = RecvHalf {
            peers: rx_entries,
            recv_err: None,
            first_rejection: None,
        };

        // Synchronization handshake.
        for _ in 0..MAX_BUILD_ATTEMPTS {
            let sync = ReplicateRequest {
                journal: Some(journal.clone()),
                header: Some(pipeline.header.clone()),
                route: Some(pipeline.route.clone()),
                proposal: Some(pipeline.spool.next()),
                acknowledge: true,
                ..Default::default()
            };
            pipeline.scatter(&sync).await;
            if let Some(error) = pipeline.send_err.take() {
                return BuildOutcome::Failed {
                    error,
                    spool: pipeline.into_spool(),
                };
            }

            let mut max_end = pipeline.spool.fragment.end;
            let mut wrong_route: Option<Revision> = None;
            let mut mismatch = false;
            let mut failed: Option<Error> = None;

            for peer in &mut recv.peers {
                match peer.recv().await {
                    Some(resp) => match resp.status {
                        Status::Ok => {}
                        Status::WrongRoute => {
                            let revision =
                                resp.header.as_ref().map(|h| h.revision).unwrap_or(0);
                            if revision > pipeline.header.revision {
                                wrong_route = Some(revision);
                            } else {
                                failed = Some(Error::Unavailable(
                                    "peer rejected route without newer revision".to_string(),
                                ));
                            }
                        }
                        Status::FragmentMismatch => {
                            if let Some(fragment) = &resp.fragment {
                                max_end = max_end.max(fragment.end);
                            }
                            mismatch = true;
                        }
                        other => {
                            failed = Some(Error::Unavailable(format!("peer status {other}")));
                        }
                    },
                    None => failed = Some(Error::Unavailable("peer stream closed".to_string())),
                }
            }

            if let Some(error) = failed {
                return BuildOutcome::Failed {
                    error,
                    spool: pipeline.into_spool(),
                };
            }
            if let Some(revision) = wrong_route {
                return BuildOutcome::WrongRoute {
                    revision,
                    spool: pipeline.into_spool(),
                };
            }
            if mismatch {
                // Adopt the greatest peer offset and re-propose.
                if let Err(error) = pipeline.roll_spool_to(max_end) {
                    return BuildOutcome::Failed {
                        error,
                        spool: pipeline.into_spool(),
                    };
                }
                continue;
            }

            // Every replica accepted; seed the barrier chain with the
            // receive half.
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(recv);
            pipeline.tail = rx;
            return BuildOutcome::Ready(Box::new(pipeline));
        }

        BuildOutcome::Failed {
            error: Error::Unavailable("pipeline synchronization did not converge".to_string()),
            spool: pipeline.into_spool(),
        }
    }

    #[inline]
    pub fn spool(&self) -> &Spool {
        &self.spool
    }

    #[inline]
    pub fn send_err(&self) -> Option<&Error> {
        self.send_err.as_ref()
    }

    /// Fan a request out to every peer and apply it to the local spool.
    /// Send failures poison the pipeline; the faulted peer is skipped for
    /// the remainder of its life.
    pub async fn scatter(&mut self, req: &ReplicateRequest) {
        for peer in &mut self.peers {
            if peer.broken {
                continue;
            }
            if peer.tx.send(req.clone()).await.is_err() {
                peer.broken = true;
                if self.send_err.is_none() {
                    self.send_err =
                        Some(Error::Unavailable(format!("send to peer {} failed", peer.id)));
                }
            }
        }

        let response = self.apply_local(req);
        if req.acknowledge {
            let _ = self.local_ack_tx.send(response);
        }
    }

    fn apply_local(&mut self, req: &ReplicateRequest) -> ReplicateResponse {
        if !req.content.is_empty() {
            if let Err(err) = self.spool.apply_content(&req.content, req.content_delta) {
                // The primary drives its own deltas; divergence here is a
                // pipeline fault.
                if self.send_err.is_none() {
                    self.send_err = Some(err);
                }
            }
            return ReplicateResponse::ok();
        }

        let Some(proposal) = &req.proposal else {
            return ReplicateResponse::ok();
        };
        match self.spool.apply_proposal(proposal) {
            Ok(ProposalOutcome::Committed) => {
                self.index.add(
                    self.spool.fragment.clone(),
                    Some(self.spool.shared_file()),
                );
                ReplicateResponse::ok()
            }
            Ok(ProposalOutcome::RolledBack) => ReplicateResponse::ok(),
            Ok(ProposalOutcome::Rolled(sealed)) => {
                if let Some(sealed) = sealed {
                    self.persister.queue(sealed);
                }
                ReplicateResponse::ok()
            }
            Ok(ProposalOutcome::Mismatch) => ReplicateResponse {
                status: Status::FragmentMismatch,
                fragment: Some(self.spool.next()),
                ..Default::default()
            },
            Err(err) => {
                if self.send_err.is_none() {
                    self.send_err = Some(err);
                }
                ReplicateResponse {
                    status: Status::FragmentMismatch,
                    fragment: Some(self.spool.next()),
                    ..Default::default()
                }
            }
        }
    }

    /// Chain a barrier: returns the predecessor's hand-off to await, and
    /// the sender with which to pass the receive half onward.
    pub fn barrier(&mut self) -> (oneshot::Receiver<RecvHalf>, oneshot::Sender<RecvHalf>) {
        let (tx, rx) = oneshot::channel();
        let wait_for = std::mem::replace(&mut self.tail, rx);
        (wait_for, tx)
    }

    /// Close the send side, rolling back any uncommitted spool content,
    /// and return the spool to the caller. Peer streams observe
    /// end-of-stream and shut down.
    pub fn close_send(self) -> Spool {
        let mut spool = self.into_spool();
        let committed = spool.fragment.clone();
        match spool.apply_proposal(&committed) {
            Ok(_) => {}
            Err(err) => warn!(error = %err, "spool rollback during teardown failed"),
        }
        spool
    }

    fn into_spool(self) -> Spool {
        self.spool
    }

    fn roll_spool_to(&mut self, offset: i64) -> crate::error::Result<()> {
        let mut roll = crate::fragment::Fragment::zero(self.spool.fragment.journal.clone());
        roll.begin = offset;
        roll.end = offset;
        roll.compression_codec = self.spool.fragment.compression_codec;
        roll.backing_store = self.spool.fragment.backing_store.clone();

        match self.spool.apply_proposal(&roll)? {
            ProposalOutcome::Rolled(Some(sealed)) => {
                self.persister.queue(sealed);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
