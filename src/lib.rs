//! # Broadsheet
//! A distributed, append-only journal broker core.
//!
//! Clients append byte content to named journals; each append replicates
//! synchronously across a configurable number of broker replicas placed
//! in distinct failure zones, lands at a journal-wide byte offset, and is
//! eventually persisted as a sealed, content-addressed fragment in an
//! external store.
//!
//! # Architecture
//!
//! ```text
//!            ┌──────────┐   Append / Read / Replicate
//!            │  Client  │────────────────┐
//!            └──────────┘                ▼
//!      ┌─────────┐    ┌─────────┐    ┌─────────┐
//!      │ Broker A│◄──►│ Broker B│◄──►│ Broker C│   replication pipelines
//!      └────┬────┘    └────┬────┘    └────┬────┘
//!           │              │              │
//!           └──────────────┼──────────────┘
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ Coordination KV │  members / items / assignments
//!                 └─────────────────┘
//!                          │
//!                          ▼
//!                 ┌─────────────────┐
//!                 │ Fragment stores │  sealed, content-addressed
//!                 └─────────────────┘
//! ```
//!
//! Every broker mirrors the coordination store into a [`keyspace::KeySpace`]
//! and runs an [`allocator::Allocator`] over it; the elected leader assigns
//! journals to brokers across failure zones with a prioritized max-flow
//! solver. The [`broker::Resolver`] maps each RPC to a route; a journal's
//! primary drives a pipelined, two-phase replication protocol whose commits
//! advance the journal's [`fragment::Spool`].
//!
//! # In-process cluster
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use broadsheet::broker::{Broker, BrokerConfig, LoopbackDialer};
//! use broadsheet::coordination::MemStore;
//! use broadsheet::fragment::StoreRegistry;
//! use broadsheet::types::BrokerId;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = MemStore::new(1);
//!     let dialer = LoopbackDialer::new();
//!
//!     let config = BrokerConfig::new(
//!         BrokerId::new("us-east", "broker-0"),
//!         "127.0.0.1:8080",
//!         "/brokers",
//!     );
//!     let keyspace = Arc::new(broadsheet::allocator::new_alloc_keyspace("/brokers"));
//!     let broker = Broker::new(config, keyspace, dialer.clone(), StoreRegistry::new());
//!     dialer.register(&broker);
//!
//!     let (mut allocator, _ack_task) = broker.allocator(store.clone());
//!     allocator.serve(store).await?;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]

pub mod allocator;
pub mod broker;
pub mod constants;
pub mod coordination;
pub mod error;
pub mod fragment;
pub mod keyspace;
pub mod protocol;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Common imports for embedding the broker.
    pub use crate::broker::{Broker, BrokerConfig, Dialer, LoopbackDialer};
    pub use crate::coordination::{ClusterStore, MemStore};
    pub use crate::error::{Error, Result, Status};
    pub use crate::fragment::{Fragment, FragmentStore, StoreRegistry, Sum};
    pub use crate::protocol::{
        AppendRequest, AppendResponse, Header, ReadRequest, ReadResponse, ReplicateRequest,
        ReplicateResponse, Route,
    };
    pub use crate::types::{BrokerId, Journal, Revision};

    pub use bytes;
}
