//! Crate & wire-protocol level errors.
//!
//! The crate uses a two-layer error hierarchy:
//!
//! - [`Error`]: process-local failures (I/O, validation, coordination-store
//!   transactions, cancellation). These propagate through `Result` and
//!   terminate or retry the operation that hit them.
//! - [`Status`]: wire protocol status codes carried in RPC responses.
//!   These are not errors in the Rust sense; they tell the *client* how to
//!   retry (refresh its route, adopt a peer fragment, redirect to the
//!   primary).
//!
//! The resolver converts most conditions into a [`Status`]; only transport
//! and validation failures surface as [`Error`].

use num_derive::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::{io, result};
use thiserror::Error as ThisError;

pub type Result<T> = result::Result<T, Error>;

/// Process-local errors.
#[derive(Clone, Debug, ThisError)]
pub enum Error {
    /// An error in the network or local filesystem.
    #[error("IO error: {0:?}")]
    IoError(io::ErrorKind),

    /// Malformed request or specification. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// A keyspace value failed to decode. Logged and skipped by the
    /// keyspace apply loop; fatal only when returned from a direct decode.
    #[error("decoding key {key}: {detail}")]
    Decode { key: String, detail: String },

    /// Observed coordination-store headers are inconsistent (ClusterID
    /// changed, or revisions regressed).
    #[error("store header mismatch: {0}")]
    HeaderMismatch(String),

    /// A multi-key compare-and-swap transaction did not succeed.
    /// Retryable: the converger re-drives on the next keyspace revision.
    #[error("transaction checks did not succeed")]
    TxnFailed,

    /// The local member key is absent from the keyspace.
    #[error("member key not found: {0}")]
    MemberKeyNotFound(String),

    /// A peer is unreachable or its stream closed mid-RPC.
    #[error("peer unavailable: {0}")]
    Unavailable(String),

    /// The surrounding context was cancelled.
    #[error("cancelled")]
    Cancelled,

    /// The watch stream ended without cancellation.
    #[error("watch stream closed unexpectedly")]
    WatchClosed,
}

impl PartialEq for Error {
    fn eq(&self, other: &Self) -> bool {
        use Error::*;
        match (self, other) {
            (IoError(a), IoError(b)) => a == b,
            (Validation(a), Validation(b)) => a == b,
            (Decode { key: ak, detail: ad }, Decode { key: bk, detail: bd }) => {
                ak == bk && ad == bd
            }
            (HeaderMismatch(a), HeaderMismatch(b)) => a == b,
            (TxnFailed, TxnFailed) => true,
            (MemberKeyNotFound(a), MemberKeyNotFound(b)) => a == b,
            (Unavailable(a), Unavailable(b)) => a == b,
            (Cancelled, Cancelled) => true,
            (WatchClosed, WatchClosed) => true,
            _ => false,
        }
    }
}

impl Eq for Error {}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::IoError(e.kind())
    }
}

impl Error {
    /// True if the operation may succeed when re-driven against a newer
    /// keyspace revision or a rebuilt pipeline.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TxnFailed | Error::Unavailable(_))
    }
}

/// Wire protocol status codes, carried in Read, Append, and Replicate
/// responses. A non-`Ok` status is accompanied by the routing or fragment
/// state the client needs in order to retry correctly.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default, Serialize, Deserialize)]
pub enum Status {
    #[default]
    Ok = 0,
    /// The named journal does not exist in the keyspace.
    JournalNotFound = 1,
    /// This broker is not assigned to the journal, and proxying was not
    /// permitted.
    NotJournalBroker = 2,
    /// The RPC requires the primary (slot 0) replica, and this broker
    /// is not it.
    NotJournalPrimaryBroker = 3,
    /// The journal's route has fewer assignments than its required
    /// replication.
    InsufficientJournalBrokers = 4,
    /// The caller's route header is stale or inconsistent with the
    /// broker's observed route. The response carries the newer route.
    WrongRoute = 5,
    /// A replication proposal did not match the replica's local fragment.
    /// The response carries the replica's fragment.
    FragmentMismatch = 6,
    /// The requested read offset is beyond the journal write head and the
    /// request did not ask to block.
    OffsetNotYetAvailable = 7,
}

impl Status {
    /// Returns an error if the status value is not a known code.
    pub fn validate(self) -> Result<()> {
        // All inhabitants of the enum are valid; this mirrors the wire
        // decode path where an unknown discriminant fails FromPrimitive.
        Ok(())
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
