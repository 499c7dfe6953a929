//! The journal broker: resolution, append, replication, and read serving.
//!
//! Transport code generation is out of scope; each RPC is a task bound to
//! an input stream and an output stream of protocol messages, and peers
//! are reached through the [`Dialer`] seam. [`LoopbackDialer`] wires
//! brokers of one process together, which is also how the integration
//! suites assemble multi-broker clusters.

mod appender;
mod loopback;
mod pipeline;
mod read;
mod replica;
mod replicate;
mod resolver;

pub use appender::Appender;
pub use loopback::LoopbackDialer;
pub use pipeline::{BuildOutcome, Pipeline, RecvHalf};
pub use replica::Replica;
pub use resolver::{route_of, Resolution, ResolveArgs, Resolver};

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::allocator::{
    assignment_at, item_at, Allocator, AllocKeySpace, LocalItemsCallback, MemberSpec,
};
use crate::coordination::ClusterStore;
use crate::error::{Error, Result, Status};
use crate::fragment::{Persister, StoreRegistry};
use crate::keyspace::prefixed;
use crate::protocol::{
    AppendRequest, AppendResponse, ListRequest, ListResponse, ListedJournal, ReadRequest,
    ReadResponse, ReplicateRequest, ReplicateResponse,
};
use crate::types::{BrokerId, Journal, Revision};

/// A dialed bidirectional Replicate stream.
pub struct ReplicateStream {
    pub tx: mpsc::Sender<ReplicateRequest>,
    pub rx: mpsc::Receiver<ReplicateResponse>,
}

/// A dialed client-streaming Append call.
pub struct AppendStream {
    pub tx: mpsc::Sender<Result<AppendRequest>>,
    pub response: oneshot::Receiver<Result<AppendResponse>>,
}

/// Opens RPC streams to peer brokers.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn replicate(&self, id: &BrokerId, endpoint: &str) -> Result<ReplicateStream>;
    async fn append(&self, id: &BrokerId, endpoint: &str) -> Result<AppendStream>;
    async fn read(
        &self,
        id: &BrokerId,
        endpoint: &str,
        req: ReadRequest,
    ) -> Result<mpsc::Receiver<ReadResponse>>;
}

/// Broker identity and keyspace placement.
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    pub id: BrokerId,
    /// Dialable endpoint advertised through the member spec.
    pub endpoint: String,
    /// Coordination-store root prefix.
    pub root: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            id: BrokerId::new("local", "broker"),
            endpoint: "127.0.0.1:8080".to_string(),
            root: "/broadsheet".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn new(id: BrokerId, endpoint: impl Into<String>, root: impl Into<String>) -> Self {
        BrokerConfig {
            id,
            endpoint: endpoint.into(),
            root: root.into(),
        }
    }

    /// Read configuration from environment variables, falling back to the
    /// defaults: `BROKER_ZONE`, `BROKER_SUFFIX`, `BROKER_ENDPOINT`, and
    /// `KEYSPACE_ROOT`.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let var = |name: &str, default: String| std::env::var(name).unwrap_or(default);

        let id = BrokerId::new(
            var("BROKER_ZONE", defaults.id.zone),
            var("BROKER_SUFFIX", defaults.id.suffix),
        );
        id.validate()?;
        Ok(BrokerConfig {
            id,
            endpoint: var("BROKER_ENDPOINT", defaults.endpoint),
            root: var("KEYSPACE_ROOT", defaults.root),
        })
    }
}

pub struct Broker {
    pub config: BrokerConfig,
    pub keyspace: Arc<AllocKeySpace>,
    pub resolver: Resolver,
    pub persister: Arc<Persister>,
    registry: StoreRegistry,
    dialer: Arc<dyn Dialer>,
}

impl Broker {
    pub fn new(
        config: BrokerConfig,
        keyspace: Arc<AllocKeySpace>,
        dialer: Arc<dyn Dialer>,
        registry: StoreRegistry,
    ) -> Arc<Broker> {
        let (persister, _task) = Persister::spawn(registry.clone());
        let resolver = Resolver::new(keyspace.clone(), config.id.clone());
        Arc::new(Broker {
            config,
            keyspace,
            resolver,
            persister: Arc::new(persister),
            registry,
            dialer,
        })
    }

    /// The member spec this broker announces.
    pub fn member_spec(&self, item_limit: u32) -> MemberSpec {
        MemberSpec {
            item_limit,
            endpoint: self.config.endpoint.clone(),
        }
    }

    /// Build this broker's allocator, wired so local assignments create
    /// and tear down replicas and are acknowledged as consistent. The
    /// returned task drains acknowledgements and runs until the broker
    /// is dropped.
    pub fn allocator<S: ClusterStore + Clone>(
        self: &Arc<Broker>,
        store: S,
    ) -> (Allocator, JoinHandle<()>) {
        let (callback, task) = self.local_items_hook(store);
        let allocator = Allocator {
            keyspace: self.keyspace.clone(),
            local_key: crate::allocator::member_key(&self.config.root, &self.config.id),
            local_items_callback: callback,
            round_hook: None,
        };
        (allocator, task)
    }

    /// The local-items callback plus its acknowledgement task.
    pub fn local_items_hook<S: ClusterStore + Clone>(
        self: &Arc<Broker>,
        store: S,
    ) -> (LocalItemsCallback, JoinHandle<()>) {
        let (ack_tx, mut ack_rx) = mpsc::unbounded_channel::<Vec<(String, Revision)>>();
        let task = tokio::spawn(async move {
            while let Some(batch) = ack_rx.recv().await {
                if let Err(err) = Allocator::acknowledge_assignments(&store, &batch).await {
                    warn!(error = %err, "assignment acknowledgement failed");
                }
            }
        });

        let broker = self.clone();
        let callback: LocalItemsCallback = Box::new(move |items| {
            let journals: Vec<Journal> =
                items.iter().map(|li| item_at(li.item).0.clone()).collect();
            broker.resolver.update_local_replicas(&journals);

            let pending: Vec<(String, Revision)> = items
                .iter()
                .filter_map(|li| {
                    let kv = li.assignments[li.index];
                    let (_, consistent) = assignment_at(kv);
                    if consistent {
                        None
                    } else {
                        Some((kv.raw.key.clone(), kv.raw.mod_revision))
                    }
                })
                .collect();
            if !pending.is_empty() {
                let _ = ack_tx.send(pending);
            }
        });
        (callback, task)
    }

    // ========================================================================
    // Append
    // ========================================================================

    /// Serve one Append RPC from its request stream.
    pub async fn serve_append(
        self: &Arc<Broker>,
        mut rx: mpsc::Receiver<Result<AppendRequest>>,
    ) -> Result<AppendResponse> {
        let first = match rx.recv().await {
            Some(first) => first?,
            None => return Err(Error::Validation("empty Append stream".to_string())),
        };
        first.validate()?;
        let journal = first
            .journal
            .clone()
            .ok_or_else(|| Error::Validation("expected Journal".to_string()))?;

        let mut min_revision: Revision = 0;
        loop {
            let res = self
                .resolver
                .resolve(ResolveArgs {
                    journal: journal.clone(),
                    min_revision,
                    require_primary: true,
                    require_full_assignment: true,
                    may_proxy: first.header.is_none(),
                    proxy_header: first.header.clone(),
                    ..Default::default()
                })
                .await?;

            if res.status != Status::Ok {
                return Ok(AppendResponse {
                    status: res.status,
                    header: res.header,
                    route: res.route,
                    commit: None,
                });
            }

            if let Some((id, endpoint)) = res.proxy_to.clone() {
                return self
                    .proxy_append(&id, &endpoint, first, rx, res)
                    .await;
            }

            let Some(replica) = res.replica.clone() else {
                return Err(Error::Unavailable("resolution without replica".to_string()));
            };

            match self.acquire_pipeline(&replica, &res).await? {
                Acquired::Ready(pipeline) => {
                    return self.append_through(pipeline, &replica, &res, rx).await;
                }
                Acquired::Resolve(revision) => {
                    // A peer told us of a future, non-equivalent route.
                    // Retry the resolution at that revision.
                    min_revision = revision;
                }
            }
        }
    }

    async fn proxy_append(
        self: &Arc<Broker>,
        id: &BrokerId,
        endpoint: &str,
        mut first: AppendRequest,
        mut rx: mpsc::Receiver<Result<AppendRequest>>,
        res: Resolution,
    ) -> Result<AppendResponse> {
        let stream = self.dialer.append(id, endpoint).await?;
        first.header = Some(res.header);
        stream
            .tx
            .send(Ok(first))
            .await
            .map_err(|_| Error::Unavailable("proxy stream closed".to_string()))?;

        while let Some(msg) = rx.recv().await {
            if stream.tx.send(msg).await.is_err() {
                return Err(Error::Unavailable("proxy stream closed".to_string()));
            }
        }
        drop(stream.tx);

        stream
            .response
            .await
            .map_err(|_| Error::Unavailable("proxy response dropped".to_string()))?
    }

    /// Take the replica's pipeline, building or rebuilding it as needed.
    async fn acquire_pipeline(
        self: &Arc<Broker>,
        replica: &Arc<Replica>,
        res: &Resolution,
    ) -> Result<Acquired> {
        let slot = replica.acquire_pipeline_slot().await?;

        let spool = match slot {
            Some(pipeline) if pipeline.route.equivalent(&res.route) => {
                return Ok(Acquired::Ready(Box::new(pipeline)));
            }
            // The route changed; tear the stale pipeline down and reuse
            // its spool.
            Some(pipeline) => pipeline.close_send(),
            None => replica.acquire_spool().await?,
        };

        match Pipeline::build(
            &self.dialer,
            res.header.clone(),
            res.route.clone(),
            &self.config.id,
            spool,
            replica.index.clone(),
            self.persister.clone(),
        )
        .await
        {
            BuildOutcome::Ready(pipeline) => Ok(Acquired::Ready(pipeline)),
            BuildOutcome::WrongRoute { revision, spool } => {
                replica.release_spool(spool);
                replica.release_pipeline_slot(None);
                Ok(Acquired::Resolve(revision))
            }
            BuildOutcome::Failed { error, spool } => {
                replica.release_spool(spool);
                replica.release_pipeline_slot(None);
                Err(error)
            }
        }
    }

    async fn append_through(
        self: &Arc<Broker>,
        mut pipeline: Box<Pipeline>,
        replica: &Arc<Replica>,
        res: &Resolution,
        mut rx: mpsc::Receiver<Result<AppendRequest>>,
    ) -> Result<AppendResponse> {
        let fragment_spec = res
            .spec
            .as_ref()
            .map(|s| s.fragment.clone())
            .unwrap_or_default();

        // We hold sole ownership of the pipeline's send half.
        let mut appender = Appender::begin(&mut pipeline, &fragment_spec).await;
        loop {
            let msg = rx.recv().await;
            if !appender.on_recv(&mut pipeline, msg).await {
                break;
            }
        }

        let (wait_for, close_after) = pipeline.barrier();
        let header = pipeline.header.clone();
        let route = pipeline.route.clone();
        let send_err = pipeline.send_err().cloned();

        if let Some(err) = &send_err {
            // Tear down; a subsequent appender builds a fresh pipeline.
            warn!(journal = %replica.journal, error = %err, "pipeline send failed");
            let spool = pipeline.close_send();
            replica.release_spool(spool);
            replica.release_pipeline_slot(None);
        } else {
            // Release the send half to the next appender.
            replica.release_pipeline_slot(Some(*pipeline));
        }

        // Pipelined appends before this one have not yet read their
        // responses. Wait until ours are next, gather them, then open the
        // chain for the next appender.
        let mut recv = wait_for
            .await
            .map_err(|_| Error::Unavailable("pipeline receive chain broken".to_string()))?;
        recv.gather_ok().await;
        if send_err.is_some() {
            recv.gather_eof().await;
        }
        let recv_err = recv.recv_err.take();
        let rejection = recv.first_rejection.take();
        let _ = close_after.send(recv);

        if let Some(err) = appender.error.take() {
            return Err(err);
        }
        if let Some(err) = send_err {
            return Err(err);
        }
        if let Some(rejection) = rejection {
            if rejection.status == Status::WrongRoute {
                return Ok(AppendResponse {
                    status: Status::WrongRoute,
                    header: rejection.header.unwrap_or(header),
                    route: rejection.route.unwrap_or(route),
                    commit: None,
                });
            }
            return Err(recv_err
                .unwrap_or_else(|| Error::Unavailable(format!("peer status {}", rejection.status))));
        }
        if let Some(err) = recv_err {
            return Err(err);
        }

        Ok(AppendResponse {
            status: Status::Ok,
            header,
            route,
            commit: appender.fragment.take(),
        })
    }

    // ========================================================================
    // Replicate & Read
    // ========================================================================

    /// Serve one Replicate RPC from its request stream.
    pub async fn serve_replicate(
        self: &Arc<Broker>,
        rx: mpsc::Receiver<ReplicateRequest>,
        tx: mpsc::Sender<ReplicateResponse>,
    ) -> Result<()> {
        replicate::serve_replicate(&self.resolver, &self.persister, rx, tx).await
    }

    /// Serve one Read RPC onto its response stream.
    pub async fn serve_read(
        self: &Arc<Broker>,
        req: ReadRequest,
        tx: mpsc::Sender<ReadResponse>,
    ) -> Result<()> {
        read::serve_read(&self.resolver, &self.registry, &self.dialer, req, tx).await
    }

    // ========================================================================
    // List
    // ========================================================================

    /// Enumerate journals and their routes from the observed keyspace.
    pub async fn list_journals(&self, req: &ListRequest) -> Result<ListResponse> {
        req.validate()?;
        let snapshot = self.keyspace.read().await;
        let root = &self.keyspace.root;

        let prefix = format!(
            "{root}{}{}",
            crate::allocator::ITEMS_PREFIX,
            req.prefix
        );
        let journals = prefixed(&snapshot.kvs, &prefix)
            .iter()
            .map(|kv| {
                let (journal, spec) = item_at(kv);
                ListedJournal {
                    journal: journal.clone(),
                    replication: spec.replication,
                    route: route_of(&snapshot, root, journal),
                }
            })
            .collect();

        Ok(ListResponse {
            status: Status::Ok,
            header: snapshot.header.to_protocol(),
            journals,
        })
    }
}

enum Acquired {
    Ready(Box<Pipeline>),
    Resolve(Revision),
}
