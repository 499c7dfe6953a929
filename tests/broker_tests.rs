//! Integration tests of the broker: replicated appends, pipelined
//! ordering, proposal-driven rollback and mismatch handling, route
//! re-drives, proxying, reads, and fragment persistence.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use broadsheet::allocator::{FragmentSpec, JournalSpec};
use broadsheet::coordination::ClusterStore;
use broadsheet::error::Status;
use broadsheet::fragment::{CompressionCodec, Fragment, Sum};
use broadsheet::protocol::{Header, ReadRequest, ReplicateRequest, ReplicateResponse, Route};
use broadsheet::types::{BrokerId, Journal};

use common::{
    append, append_with_client_error, put_assignment, put_journal, put_journal_spec, put_member,
    read, read_content, within, TestCluster, ROOT,
};

/// A single-broker cluster with one fully-assigned journal.
async fn single_broker_cluster(journal: &str) -> (TestCluster, Arc<broadsheet::broker::Broker>) {
    let mut cluster = TestCluster::new();
    let broker = cluster.add_broker("us-east", "a");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_journal(&cluster.store, journal, 1).await;
    put_assignment(&cluster.store, journal, "us-east", "a", 0, true).await;

    cluster.start_all().await;
    (cluster, broker)
}

#[tokio::test]
async fn stream_and_commit() {
    let (cluster, broker) = single_broker_cluster("peer/journal").await;

    let resp = append(&broker, "peer/journal", &["foobar", "bazbing"])
        .await
        .expect("append serves");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.route.members, vec![BrokerId::new("us-east", "a")]);

    let commit = resp.commit.expect("commit fragment");
    assert_eq!(commit.begin, 0);
    assert_eq!(commit.end, 13);
    assert_eq!(commit.sum, Sum::of(b"foobarbazbing"));

    let replica = broker
        .resolver
        .replica_of(&Journal::from("peer/journal"))
        .expect("replica exists");
    assert_eq!(replica.index.end_offset(), 13);

    cluster.shutdown().await;
}

#[tokio::test]
async fn replicated_append_reaches_every_replica() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");
    let b = cluster.add_broker("us-west", "b");
    let c = cluster.add_broker("us-central", "c");

    for (zone, suffix) in [("us-east", "a"), ("us-west", "b"), ("us-central", "c")] {
        put_member(&cluster.store, zone, suffix, 4).await;
    }
    put_journal(&cluster.store, "a/journal", 3).await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;
    put_assignment(&cluster.store, "a/journal", "us-west", "b", 1, true).await;
    put_assignment(&cluster.store, "a/journal", "us-central", "c", 2, true).await;

    cluster.start_all().await;

    let resp = append(&a, "a/journal", &["foobarbazbing"])
        .await
        .expect("append serves");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.commit.as_ref().map(|f| f.end), Some(13));

    // The commit was acknowledged by every replica before the response,
    // so each peer's index already covers it.
    for peer in [&b, &c] {
        let replica = peer
            .resolver
            .replica_of(&Journal::from("a/journal"))
            .expect("replica exists");
        assert_eq!(replica.index.end_offset(), 13);
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn pipelined_appends_commit_in_order() {
    let (cluster, broker) = single_broker_cluster("a/journal").await;

    // First appender opens and streams, holding the pipeline.
    let (tx1, rx1) = mpsc::channel(8);
    let task1 = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve_append(rx1).await })
    };
    tx1.send(Ok(broadsheet::protocol::AppendRequest::open(Journal::from(
        "a/journal",
    ))))
    .await
    .expect("open");
    tx1.send(Ok(broadsheet::protocol::AppendRequest::chunk(
        &b"AAA"[..],
    )))
    .await
    .expect("chunk");
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Second appender queues behind the first.
    let (tx2, rx2) = mpsc::channel(8);
    let task2 = {
        let broker = broker.clone();
        tokio::spawn(async move { broker.serve_append(rx2).await })
    };
    tx2.send(Ok(broadsheet::protocol::AppendRequest::open(Journal::from(
        "a/journal",
    ))))
    .await
    .expect("open");
    tx2.send(Ok(broadsheet::protocol::AppendRequest::chunk(
        &b"BBB"[..],
    )))
    .await
    .expect("chunk");
    drop(tx2);
    tokio::time::sleep(Duration::from_millis(50)).await;
    drop(tx1);

    let resp1 = within(task1).await.expect("join").expect("append 1");
    let resp2 = within(task2).await.expect("join").expect("append 2");

    let commit1 = resp1.commit.expect("commit 1");
    assert_eq!((commit1.begin, commit1.end), (0, 3));
    assert_eq!(commit1.sum, Sum::of(b"AAA"));

    let commit2 = resp2.commit.expect("commit 2");
    assert_eq!((commit2.begin, commit2.end), (3, 6));
    assert_eq!(commit2.sum, Sum::of(b"BBB"));

    // Both clients observed the same route.
    assert_eq!(resp1.route, resp2.route);

    cluster.shutdown().await;
}

#[tokio::test]
async fn client_error_rolls_back_partial_content() {
    let (cluster, broker) = single_broker_cluster("a/journal").await;

    let resp = append(&broker, "a/journal", &["foobar"]).await.expect("append");
    assert_eq!(resp.commit.as_ref().map(|f| f.end), Some(6));

    // A client failure mid-append surfaces as an error, and its partial
    // content is rolled back on every replica.
    let result = append_with_client_error(&broker, "a/journal", &["junk"]).await;
    assert!(result.is_err());

    let resp = append(&broker, "a/journal", &["bazbing"]).await.expect("append");
    let commit = resp.commit.expect("commit");
    assert_eq!((commit.begin, commit.end), (6, 13));
    assert_eq!(commit.sum, Sum::of(b"bazbing"));

    // The journal reads as though the failed append never happened.
    let responses = read(
        &broker,
        ReadRequest {
            journal: Journal::from("a/journal"),
            offset: 0,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(read_content(&responses), b"foobarbazbing");

    cluster.shutdown().await;
}

// ============================================================================
// Replicate protocol
// ============================================================================

/// Open a raw Replicate stream against `broker`.
async fn replicate_stream(
    cluster: &TestCluster,
    id: &BrokerId,
) -> (
    mpsc::Sender<ReplicateRequest>,
    mpsc::Receiver<ReplicateResponse>,
) {
    use broadsheet::broker::Dialer;
    let stream = cluster
        .dialer
        .replicate(id, "")
        .await
        .expect("peer dialable");
    (stream.tx, stream.rx)
}

fn sync_request(journal: &str, route: Route, revision: i64, proposal: Fragment) -> ReplicateRequest {
    ReplicateRequest {
        journal: Some(Journal::from(journal)),
        header: Some(Header {
            cluster_id: 0xFEED,
            member_id: 1,
            revision,
            raft_term: 1,
        }),
        route: Some(route),
        proposal: Some(proposal),
        acknowledge: true,
        ..Default::default()
    }
}

fn content_request(content: &str, delta: i64) -> ReplicateRequest {
    ReplicateRequest {
        content: content.as_bytes().to_vec().into(),
        content_delta: delta,
        ..Default::default()
    }
}

fn proposal_request(proposal: Fragment) -> ReplicateRequest {
    ReplicateRequest {
        proposal: Some(proposal),
        acknowledge: true,
        ..Default::default()
    }
}

fn fragment(journal: &str, begin: i64, end: i64, sum: Sum) -> Fragment {
    let mut f = Fragment::zero(Journal::from(journal));
    f.begin = begin;
    f.end = end;
    f.sum = sum;
    f
}

/// Two-member cluster where `a` is primary of "peer/journal" but only
/// `b` is backed by a live broker; `a` is driven by the test.
async fn peer_cluster() -> (TestCluster, Route, i64) {
    let mut cluster = TestCluster::new();
    let b = cluster.add_broker("us-west", "b");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_member(&cluster.store, "us-west", "b", 4).await;
    put_journal(&cluster.store, "peer/journal", 2).await;
    put_assignment(&cluster.store, "peer/journal", "us-east", "a", 0, true).await;
    put_assignment(&cluster.store, "peer/journal", "us-west", "b", 1, true).await;

    cluster.start(&b).await;

    let route = Route {
        members: vec![BrokerId::new("us-east", "a"), BrokerId::new("us-west", "b")],
        endpoints: vec!["us-east-a:8080".to_string(), "us-west-b:8080".to_string()],
    };
    let revision = cluster.store.revision().await;
    (cluster, route, revision)
}

#[tokio::test]
async fn replicate_stream_and_commit() {
    let (cluster, route, revision) = peer_cluster().await;
    let b_id = BrokerId::new("us-west", "b");
    let (tx, mut rx) = replicate_stream(&cluster, &b_id).await;

    tx.send(sync_request(
        "peer/journal",
        route,
        revision,
        Fragment::zero(Journal::from("peer/journal")),
    ))
    .await
    .expect("sync");
    let resp = within(rx.recv()).await.expect("sync response");
    assert_eq!(resp.status, Status::Ok);

    tx.send(content_request("foobar", 0)).await.expect("content");
    tx.send(content_request("bazbing", 6)).await.expect("content");

    let b = &cluster.brokers[0].broker;
    let replica = b
        .resolver
        .replica_of(&Journal::from("peer/journal"))
        .expect("replica exists");
    assert_eq!(replica.index.end_offset(), 0);

    tx.send(proposal_request(fragment(
        "peer/journal",
        0,
        13,
        Sum::of(b"foobarbazbing"),
    )))
    .await
    .expect("commit");
    let resp = within(rx.recv()).await.expect("commit response");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(replica.index.end_offset(), 13);

    // Closing the send side cleanly ends the stream.
    drop(tx);
    assert!(within(rx.recv()).await.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn replicate_rejects_mismatched_proposal() {
    let (cluster, route, revision) = peer_cluster().await;
    let b_id = BrokerId::new("us-west", "b");
    let (tx, mut rx) = replicate_stream(&cluster, &b_id).await;

    tx.send(sync_request(
        "peer/journal",
        route,
        revision,
        Fragment::zero(Journal::from("peer/journal")),
    ))
    .await
    .expect("sync");
    assert_eq!(within(rx.recv()).await.expect("resp").status, Status::Ok);

    tx.send(content_request("foobar", 0)).await.expect("content");
    tx.send(proposal_request(fragment(
        "peer/journal",
        0,
        6,
        Sum::of(b"foobar"),
    )))
    .await
    .expect("commit");
    assert_eq!(within(rx.recv()).await.expect("resp").status, Status::Ok);

    // A proposal inconsistent with the spool is rejected, carrying the
    // replica's actual fragment.
    tx.send(proposal_request(fragment(
        "peer/journal",
        0,
        13,
        Sum::of(b"not the content"),
    )))
    .await
    .expect("bad commit");
    let resp = within(rx.recv()).await.expect("resp");
    assert_eq!(resp.status, Status::FragmentMismatch);
    let peer_fragment = resp.fragment.expect("peer fragment");
    assert_eq!((peer_fragment.begin, peer_fragment.end), (0, 6));
    assert_eq!(peer_fragment.sum, Sum::of(b"foobar"));

    // The replica remains usable: a rollback to its fragment is an Ok.
    tx.send(proposal_request(peer_fragment)).await.expect("rollback");
    assert_eq!(within(rx.recv()).await.expect("resp").status, Status::Ok);

    cluster.shutdown().await;
}

#[tokio::test]
async fn replicate_rejects_wrong_content_delta() {
    let (cluster, route, revision) = peer_cluster().await;
    let b_id = BrokerId::new("us-west", "b");
    let (tx, mut rx) = replicate_stream(&cluster, &b_id).await;

    tx.send(sync_request(
        "peer/journal",
        route,
        revision,
        Fragment::zero(Journal::from("peer/journal")),
    ))
    .await
    .expect("sync");
    assert_eq!(within(rx.recv()).await.expect("resp").status, Status::Ok);

    tx.send(content_request("foobar", 3)).await.expect("content");
    let resp = within(rx.recv()).await.expect("resp");
    assert_eq!(resp.status, Status::FragmentMismatch);
    // The stream is closed after the fault.
    assert!(within(rx.recv()).await.is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn replicate_rejects_stale_route() {
    let (cluster, _route, revision) = peer_cluster().await;
    let b_id = BrokerId::new("us-west", "b");
    let (tx, mut rx) = replicate_stream(&cluster, &b_id).await;

    // A route omitting member b's slot is not what b observes.
    let stale = Route {
        members: vec![BrokerId::new("us-east", "a")],
        endpoints: vec![],
    };
    tx.send(sync_request(
        "peer/journal",
        stale,
        revision,
        Fragment::zero(Journal::from("peer/journal")),
    ))
    .await
    .expect("sync");

    let resp = within(rx.recv()).await.expect("resp");
    assert_eq!(resp.status, Status::WrongRoute);
    let corrected = resp.route.expect("corrected route");
    assert_eq!(
        corrected.members,
        vec![BrokerId::new("us-east", "a"), BrokerId::new("us-west", "b")]
    );
    assert!(resp.header.expect("header").revision >= revision);

    cluster.shutdown().await;
}

// ============================================================================
// Route re-drives & proxying
// ============================================================================

#[tokio::test]
async fn wrong_route_re_drives_through_new_primary() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");
    let b = cluster.add_broker("us-west", "b");
    let c = cluster.add_broker("us-central", "c");

    for (zone, suffix) in [("us-east", "a"), ("us-west", "b"), ("us-central", "c")] {
        put_member(&cluster.store, zone, suffix, 4).await;
    }
    put_journal(&cluster.store, "a/journal", 2).await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;
    put_assignment(&cluster.store, "a/journal", "us-west", "b", 1, true).await;

    // Broker a loads and stays stale: it still believes it is primary.
    a.keyspace.load(&cluster.store, 0).await.expect("load a");

    // The journal re-routes from [a, b] to [c, b].
    cluster
        .store
        .delete(broadsheet::allocator::assignment_key(
            ROOT,
            &broadsheet::allocator::AssignmentKey {
                item: "a/journal".to_string(),
                member: BrokerId::new("us-east", "a"),
                slot: 0,
            },
        ))
        .await
        .expect("delete assignment");
    put_assignment(&cluster.store, "a/journal", "us-central", "c", 0, true).await;

    // Brokers b and c observe the new route; a does not, yet.
    cluster.start(&b).await;
    cluster.start(&c).await;

    // The append lands on stale a, which dials b and learns of the newer
    // route; it blocks re-resolving until its keyspace catches up.
    let append_task = {
        let a = a.clone();
        tokio::spawn(async move { append(&a, "a/journal", &["foobarbazbing"]).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!append_task.is_finished());

    // Once a observes the re-route it is no longer primary, and proxies
    // through the new primary c.
    cluster.start(&a).await;

    let resp = within(append_task).await.expect("join").expect("append");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(
        resp.route.members,
        vec![
            BrokerId::new("us-central", "c"),
            BrokerId::new("us-west", "b")
        ]
    );
    let commit = resp.commit.expect("commit");
    assert_eq!((commit.begin, commit.end), (0, 13));

    cluster.shutdown().await;
}

#[tokio::test]
async fn append_proxies_to_primary() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");
    let b = cluster.add_broker("us-west", "b");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_member(&cluster.store, "us-west", "b", 4).await;
    put_journal(&cluster.store, "a/journal", 1).await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;

    cluster.start_all().await;

    // b is not in the route and forwards to primary a.
    let resp = append(&b, "a/journal", &["foobar"]).await.expect("append");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.commit.as_ref().map(|f| f.end), Some(6));

    let replica = a
        .resolver
        .replica_of(&Journal::from("a/journal"))
        .expect("replica on primary");
    assert_eq!(replica.index.end_offset(), 6);

    cluster.shutdown().await;
}

#[tokio::test]
async fn append_statuses_for_unserved_journals() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_journal(&cluster.store, "underassigned", 3).await;
    put_assignment(&cluster.store, "underassigned", "us-east", "a", 0, true).await;

    cluster.start_all().await;

    let resp = append(&a, "missing/journal", &["x"]).await.expect("serves");
    assert_eq!(resp.status, Status::JournalNotFound);

    let resp = append(&a, "underassigned", &["x"]).await.expect("serves");
    assert_eq!(resp.status, Status::InsufficientJournalBrokers);

    cluster.shutdown().await;
}

// ============================================================================
// Reads & persistence
// ============================================================================

#[tokio::test]
async fn read_streams_metadata_then_content() {
    let (cluster, broker) = single_broker_cluster("a/journal").await;

    append(&broker, "a/journal", &["foobar"]).await.expect("append");
    append(&broker, "a/journal", &["bazbing"]).await.expect("append");

    let responses = read(
        &broker,
        ReadRequest {
            journal: Journal::from("a/journal"),
            offset: 0,
            ..Default::default()
        },
    )
    .await;

    // Metadata first, covering the open fragment.
    let metadata = &responses[0];
    assert_eq!(metadata.status, Status::Ok);
    assert_eq!(metadata.offset, 0);
    assert_eq!(metadata.write_head, 13);
    let frag = metadata.fragment.as_ref().expect("fragment");
    assert_eq!((frag.begin, frag.end), (0, 13));

    assert_eq!(read_content(&responses), b"foobarbazbing");

    // The final response reports the write head is reached.
    let last = responses.last().expect("responses");
    assert_eq!(last.status, Status::OffsetNotYetAvailable);
    assert_eq!(last.write_head, 13);

    cluster.shutdown().await;
}

#[tokio::test]
async fn read_at_write_head_and_metadata_only() {
    let (cluster, broker) = single_broker_cluster("a/journal").await;
    append(&broker, "a/journal", &["foobar"]).await.expect("append");

    // Offset -1 addresses the write head; nothing is there yet.
    let responses = read(
        &broker,
        ReadRequest {
            journal: Journal::from("a/journal"),
            offset: -1,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Status::OffsetNotYetAvailable);

    // metadata_only returns the covering fragment without content.
    let responses = read(
        &broker,
        ReadRequest {
            journal: Journal::from("a/journal"),
            offset: 2,
            metadata_only: true,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(responses.len(), 1);
    assert_eq!(responses[0].status, Status::Ok);
    assert_eq!(responses[0].offset, 2);
    assert!(responses[0].content.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn blocking_read_waits_for_commit() {
    let (cluster, broker) = single_broker_cluster("a/journal").await;

    let (tx, mut rx) = mpsc::channel(8);
    let reader = {
        let broker = broker.clone();
        tokio::spawn(async move {
            broker
                .serve_read(
                    ReadRequest {
                        journal: Journal::from("a/journal"),
                        offset: 0,
                        block: true,
                        ..Default::default()
                    },
                    tx,
                )
                .await
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    append(&broker, "a/journal", &["foobar"]).await.expect("append");

    // The blocked read wakes with metadata and the appended content.
    let metadata = within(rx.recv()).await.expect("metadata");
    assert_eq!(metadata.status, Status::Ok);
    let chunk = within(rx.recv()).await.expect("content");
    assert_eq!(&chunk.content[..], b"foobar");

    reader.abort();
    cluster.shutdown().await;
}

#[tokio::test]
async fn rolled_fragments_persist_to_backing_store() {
    let mut cluster = TestCluster::new();
    let broker = cluster.add_broker("us-east", "a");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_journal_spec(
        &cluster.store,
        "a/journal",
        &JournalSpec {
            replication: 1,
            fragment: FragmentSpec {
                length: 4,
                compression_codec: CompressionCodec::None,
                stores: vec!["mem://fragments".to_string()],
            },
        },
    )
    .await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;

    cluster.start_all().await;

    append(&broker, "a/journal", &["AAA"]).await.expect("append");
    append(&broker, "a/journal", &["BBB"]).await.expect("append");
    // The spool reached its target length; this append rolls it, sealing
    // [0, 6) for persistence.
    append(&broker, "a/journal", &["CC"]).await.expect("append");

    let sealed = fragment("a/journal", 0, 6, Sum::of(b"AAABBB"));
    within(async {
        while !cluster.fragments.contains(&sealed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;

    // Reads span the sealed fragment and the new spool.
    let responses = read(
        &broker,
        ReadRequest {
            journal: Journal::from("a/journal"),
            offset: 0,
            ..Default::default()
        },
    )
    .await;
    assert_eq!(read_content(&responses), b"AAABBBCC");

    cluster.shutdown().await;
}

#[tokio::test]
async fn unreachable_peer_fails_append_until_it_joins() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");

    put_member(&cluster.store, "us-east", "a", 4).await;
    put_member(&cluster.store, "us-west", "b", 4).await;
    put_journal(&cluster.store, "a/journal", 2).await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;
    put_assignment(&cluster.store, "a/journal", "us-west", "b", 1, true).await;

    cluster.start_all().await;

    // Member b is assigned but no broker answers for it: the pipeline
    // cannot build, and the append fails as unavailable.
    let result = append(&a, "a/journal", &["lost"]).await;
    assert!(result.is_err());

    // Once b joins, a fresh pipeline builds and appends flow again.
    let b = cluster.add_broker("us-west", "b");
    cluster.start(&b).await;

    let resp = append(&a, "a/journal", &["foobar"]).await.expect("append");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(resp.commit.as_ref().map(|f| f.end), Some(6));

    let replica = b
        .resolver
        .replica_of(&Journal::from("a/journal"))
        .expect("replica exists");
    assert_eq!(replica.index.end_offset(), 6);

    cluster.shutdown().await;
}

#[tokio::test]
async fn route_change_rebuilds_pipeline() {
    let mut cluster = TestCluster::new();
    let a = cluster.add_broker("us-east", "a");
    let _b = cluster.add_broker("us-west", "b");
    let c = cluster.add_broker("us-central", "c");

    for (zone, suffix) in [("us-east", "a"), ("us-west", "b"), ("us-central", "c")] {
        put_member(&cluster.store, zone, suffix, 4).await;
    }
    put_journal(&cluster.store, "a/journal", 2).await;
    put_assignment(&cluster.store, "a/journal", "us-east", "a", 0, true).await;
    put_assignment(&cluster.store, "a/journal", "us-west", "b", 1, true).await;

    cluster.start_all().await;

    let resp = append(&a, "a/journal", &["foobar"]).await.expect("append");
    assert_eq!(resp.route.members[1], BrokerId::new("us-west", "b"));

    // The replica set rotates from [a, b] to [a, c].
    cluster
        .store
        .delete(broadsheet::allocator::assignment_key(
            ROOT,
            &broadsheet::allocator::AssignmentKey {
                item: "a/journal".to_string(),
                member: BrokerId::new("us-west", "b"),
                slot: 1,
            },
        ))
        .await
        .expect("delete assignment");
    put_assignment(&cluster.store, "a/journal", "us-central", "c", 1, true).await;

    let target = cluster.store.revision().await;
    within(a.keyspace.await_revision(target)).await;

    // The next append tears down the stale pipeline and synchronizes c,
    // which adopts the journal's write head.
    let resp = append(&a, "a/journal", &["bazbing"]).await.expect("append");
    assert_eq!(resp.status, Status::Ok);
    assert_eq!(
        resp.route.members,
        vec![
            BrokerId::new("us-east", "a"),
            BrokerId::new("us-central", "c")
        ]
    );
    let commit = resp.commit.expect("commit");
    assert_eq!((commit.begin, commit.end), (6, 13));
    assert_eq!(commit.sum, Sum::of(b"bazbing"));

    let replica = c
        .resolver
        .replica_of(&Journal::from("a/journal"))
        .expect("replica exists");
    assert_eq!(replica.index.end_offset(), 13);

    cluster.shutdown().await;
}
