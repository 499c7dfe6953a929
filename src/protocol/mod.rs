//! Wire protocol messages for the broker's Read, Append, Replicate, and
//! List RPCs.
//!
//! Transport code generation is out of scope: each RPC is modeled as a
//! task with an input stream and an output stream of these messages.
//! Every message carries a `validate()` method enforcing its well-
//! formedness constraints; services validate at the boundary and never
//! again internally.

mod append;
mod list;
mod read;
mod replicate;

pub use append::{AppendRequest, AppendResponse};
pub use list::{ListRequest, ListResponse, ListedJournal};
pub use read::{ReadRequest, ReadResponse};
pub use replicate::{ReplicateRequest, ReplicateResponse};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result, Status};
use crate::types::{BrokerId, Revision};

/// Header describes the coordination-store state under which a broker
/// produced a response, letting clients converge on up-to-date routes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// ID of the coordination-store cluster.
    pub cluster_id: u64,
    /// Store member which served the observation.
    pub member_id: u64,
    /// Revision at which the response's route was observed.
    pub revision: Revision,
    /// Raft term of the store leader at observation.
    pub raft_term: u64,
}

impl Header {
    /// Returns an error if the header is not well-formed.
    pub fn validate(&self) -> Result<()> {
        if self.revision < 0 {
            return Err(Error::Validation(format!(
                "invalid header revision ({})",
                self.revision
            )));
        }
        Ok(())
    }

    /// Two headers are consistent when their cluster IDs match and, under
    /// `strict`, revisions are equal; otherwise `other` must not regress.
    pub fn consistent_with(&self, other: &Header, strict: bool) -> Result<()> {
        if self.cluster_id != 0 && self.cluster_id != other.cluster_id {
            return Err(Error::HeaderMismatch(format!(
                "ClusterID mismatch (expected {}, got {})",
                self.cluster_id, other.cluster_id
            )));
        }
        if strict && self.revision != 0 && self.revision != other.revision {
            return Err(Error::HeaderMismatch(format!(
                "revision mismatch (expected = {}, got {})",
                self.revision, other.revision
            )));
        }
        if !strict && other.revision <= self.revision {
            return Err(Error::HeaderMismatch(format!(
                "revision mismatch (expected > {}, got {})",
                self.revision, other.revision
            )));
        }
        Ok(())
    }
}

/// The ordered set of brokers assigned to a journal. Index 0 is the
/// primary; remaining entries are replicas in slot order.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub members: Vec<BrokerId>,
    /// Dialable endpoint of each member, parallel to `members`. May be
    /// empty when endpoints are not known (eg in tests).
    pub endpoints: Vec<String>,
}

impl Route {
    /// Returns an error if the route is not well-formed.
    pub fn validate(&self) -> Result<()> {
        for m in &self.members {
            m.validate()?;
        }
        if !self.endpoints.is_empty() && self.endpoints.len() != self.members.len() {
            return Err(Error::Validation(format!(
                "route endpoints length mismatch ({} members, {} endpoints)",
                self.members.len(),
                self.endpoints.len()
            )));
        }
        Ok(())
    }

    /// The primary broker, if the route has any members.
    pub fn primary(&self) -> Option<&BrokerId> {
        self.members.first()
    }

    /// Index of `id` within the route, if assigned.
    pub fn index_of(&self, id: &BrokerId) -> Option<usize> {
        self.members.iter().position(|m| m == id)
    }

    /// Endpoint of the member at `index`, if known.
    pub fn endpoint_for(&self, index: usize) -> Option<&str> {
        self.endpoints.get(index).map(String::as_str)
    }

    /// Routes are equivalent when they name the same members in the same
    /// order; endpoints are advisory and not compared.
    pub fn equivalent(&self, other: &Route) -> bool {
        self.members == other.members
    }
}

/// Statuses paired with routing metadata, shared by response types.
pub(crate) fn validate_status_route(status: Status, route: Option<&Route>) -> Result<()> {
    status.validate()?;
    if status == Status::WrongRoute {
        match route {
            None => return Err(Error::Validation("expected Route".to_string())),
            Some(r) => r.validate()?,
        }
    } else if let Some(r) = route {
        return Err(Error::Validation(format!(
            "unexpected Route ({:?})",
            r.members
        )));
    }
    Ok(())
}
