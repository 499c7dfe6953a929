//! Shared fixtures for integration suites: an in-process cluster over the
//! in-memory coordination store, keyspace seeding helpers, and stream
//! clients for the broker RPCs.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use broadsheet::allocator::{
    assignment_key, item_key, member_key, new_alloc_keyspace, AssignmentKey, AssignmentSpec,
    FragmentSpec, JournalSpec, MemberSpec, ASSIGNMENTS_PREFIX,
};
use broadsheet::broker::{Broker, BrokerConfig, LoopbackDialer};
use broadsheet::coordination::{ClusterStore, Cmp, MemStore, Op};
use broadsheet::error::Result;
use broadsheet::fragment::{MemoryStore, StoreRegistry};
use broadsheet::protocol::{AppendRequest, AppendResponse, ReadRequest, ReadResponse};
use broadsheet::types::{BrokerId, Journal};

pub const ROOT: &str = "/broadsheet";

/// Wall-clock bound on any awaited step, so a regression fails instead of
/// hanging the suite.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .expect("step timed out")
}

// ============================================================================
// Keyspace seeding
// ============================================================================

pub async fn put_member(store: &MemStore, zone: &str, suffix: &str, item_limit: u32) {
    let id = BrokerId::new(zone, suffix);
    let spec = MemberSpec {
        item_limit,
        endpoint: format!("{zone}-{suffix}:8080"),
    };
    store
        .put(
            member_key(ROOT, &id),
            serde_json::to_vec(&spec).expect("member spec serializes"),
        )
        .await
        .expect("put member");
}

pub async fn delete_member(store: &MemStore, zone: &str, suffix: &str) {
    store
        .delete(member_key(ROOT, &BrokerId::new(zone, suffix)))
        .await
        .expect("delete member");
}

pub async fn put_journal_spec(store: &MemStore, journal: &str, spec: &JournalSpec) {
    store
        .put(
            item_key(ROOT, journal),
            serde_json::to_vec(spec).expect("journal spec serializes"),
        )
        .await
        .expect("put journal");
}

pub async fn put_journal(store: &MemStore, journal: &str, replication: u32) {
    put_journal_spec(
        store,
        journal,
        &JournalSpec {
            replication,
            fragment: FragmentSpec::default(),
        },
    )
    .await;
}

pub async fn put_assignment(
    store: &MemStore,
    journal: &str,
    zone: &str,
    suffix: &str,
    slot: u32,
    consistent: bool,
) {
    let key = AssignmentKey {
        item: journal.to_string(),
        member: BrokerId::new(zone, suffix),
        slot,
    };
    store
        .put(
            assignment_key(ROOT, &key),
            serde_json::to_vec(&AssignmentSpec { consistent }).expect("spec serializes"),
        )
        .await
        .expect("put assignment");
}

/// All assignment keys under the root, with their parsed (item, member,
/// slot) and consistency.
pub async fn assignments(store: &MemStore) -> Vec<(AssignmentKey, bool)> {
    let resp = store
        .range(&format!("{ROOT}{ASSIGNMENTS_PREFIX}"), 0)
        .await
        .expect("range assignments");
    resp.kvs
        .iter()
        .map(|kv| {
            let key = broadsheet::allocator::parse_assignment_key(ROOT, &kv.key)
                .expect("assignment key parses");
            let spec: AssignmentSpec =
                serde_json::from_slice(&kv.value).expect("assignment spec parses");
            (key, spec.consistent)
        })
        .collect()
}

/// Background task standing in for assigned members: flips any
/// inconsistent assignment to consistent, as a member does once its
/// replica initializes.
pub fn spawn_auto_acknowledger(store: MemStore) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let resp = match store.range(&format!("{ROOT}{ASSIGNMENTS_PREFIX}"), 0).await {
                Ok(resp) => resp,
                Err(_) => return,
            };
            for kv in resp.kvs {
                let consistent = serde_json::from_slice::<AssignmentSpec>(&kv.value)
                    .map(|s| s.consistent)
                    .unwrap_or(true);
                if consistent {
                    continue;
                }
                let _ = store
                    .txn(
                        vec![Cmp::ModRevision {
                            key: kv.key.clone(),
                            equals: kv.mod_revision,
                        }],
                        vec![Op::put(
                            kv.key.clone(),
                            serde_json::to_vec(&AssignmentSpec { consistent: true })
                                .expect("spec serializes"),
                        )],
                    )
                    .await;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
}

// ============================================================================
// Broker cluster
// ============================================================================

pub struct TestBroker {
    pub broker: Arc<Broker>,
    pub watch: Option<JoinHandle<Result<()>>>,
}

pub struct TestCluster {
    pub store: MemStore,
    pub dialer: Arc<LoopbackDialer>,
    pub fragments: Arc<MemoryStore>,
    pub brokers: Vec<TestBroker>,
}

impl TestCluster {
    pub fn new() -> TestCluster {
        TestCluster {
            store: MemStore::new(0xFEED),
            dialer: LoopbackDialer::new(),
            fragments: Arc::new(MemoryStore::new()),
            brokers: Vec::new(),
        }
    }

    /// Create a broker without loading its keyspace; callers control when
    /// (and through which revision) each broker observes the store.
    pub fn add_broker(&mut self, zone: &str, suffix: &str) -> Arc<Broker> {
        let id = BrokerId::new(zone, suffix);
        let config = BrokerConfig::new(id, format!("{zone}-{suffix}:8080"), ROOT);
        let keyspace = Arc::new(new_alloc_keyspace(ROOT));
        let registry = StoreRegistry::new().register("mem", self.fragments.clone());
        let broker = Broker::new(config, keyspace, self.dialer.clone(), registry);
        self.dialer.register(&broker);
        self.brokers.push(TestBroker {
            broker: broker.clone(),
            watch: None,
        });
        broker
    }

    /// Load a broker's keyspace at the store's current revision and keep
    /// it observing through a watch loop.
    pub async fn start(&mut self, broker: &Arc<Broker>) {
        broker
            .keyspace
            .load(&self.store, 0)
            .await
            .expect("keyspace load");

        let entry = self
            .brokers
            .iter_mut()
            .find(|tb| Arc::ptr_eq(&tb.broker, broker))
            .expect("broker is registered");
        let keyspace = broker.keyspace.clone();
        let store = self.store.clone();
        let (signal_tx, _signal_rx) = mpsc::channel(1);
        entry.watch = Some(tokio::spawn(async move {
            keyspace.watch_loop(&store, signal_tx).await
        }));
    }

    pub async fn start_all(&mut self) {
        let brokers: Vec<_> = self.brokers.iter().map(|tb| tb.broker.clone()).collect();
        for broker in brokers {
            self.start(&broker).await;
        }
    }

    pub async fn shutdown(self) {
        for tb in self.brokers {
            if let Some(watch) = tb.watch {
                watch.abort();
            }
        }
    }
}

// ============================================================================
// RPC clients
// ============================================================================

/// Drive one Append RPC against `broker`, streaming `chunks`.
pub async fn append(
    broker: &Arc<Broker>,
    journal: &str,
    chunks: &[&str],
) -> Result<AppendResponse> {
    let (tx, rx) = mpsc::channel(8);
    let task = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve_append(rx).await })
    };

    tx.send(Ok(AppendRequest::open(Journal::from(journal))))
        .await
        .expect("open send");
    for chunk in chunks {
        tx.send(Ok(AppendRequest::chunk(chunk.as_bytes().to_vec())))
            .await
            .expect("chunk send");
    }
    drop(tx);

    within(task).await.expect("append task")
}

/// Drive an Append RPC which fails client-side after `chunks`.
pub async fn append_with_client_error(
    broker: &Arc<Broker>,
    journal: &str,
    chunks: &[&str],
) -> Result<AppendResponse> {
    let (tx, rx) = mpsc::channel(8);
    let task = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve_append(rx).await })
    };

    tx.send(Ok(AppendRequest::open(Journal::from(journal))))
        .await
        .expect("open send");
    for chunk in chunks {
        tx.send(Ok(AppendRequest::chunk(chunk.as_bytes().to_vec())))
            .await
            .expect("chunk send");
    }
    tx.send(Err(broadsheet::error::Error::IoError(
        std::io::ErrorKind::ConnectionReset,
    )))
    .await
    .expect("error send");
    drop(tx);

    within(task).await.expect("append task")
}

/// Drive one Read RPC, collecting every response.
pub async fn read(broker: &Arc<Broker>, req: ReadRequest) -> Vec<ReadResponse> {
    let (tx, mut rx) = mpsc::channel(64);
    let task = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve_read(req, tx).await })
    };

    let mut responses = Vec::new();
    while let Some(resp) = rx.recv().await {
        responses.push(resp);
    }
    within(task).await.expect("read task").expect("read serves");
    responses
}

/// Concatenated content of a collected Read response stream.
pub fn read_content(responses: &[ReadResponse]) -> Vec<u8> {
    responses
        .iter()
        .flat_map(|r| r.content.iter().copied())
        .collect()
}
