//! Replicate RPC messages.
//!
//! Replicate is the broker-to-broker stream driven by a journal's primary.
//! The first request of a stream synchronizes the peer: it names the
//! journal, the route under which the primary is operating, and a fragment
//! proposal, and demands acknowledgement. Subsequent requests are either
//! content chunks (never acknowledged individually) or fragment proposals
//! (acknowledged when `acknowledge` is set).

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::append::serde_bytes_compat;
use super::{validate_status_route, Header, Route};
use crate::error::{Error, Result, Status};
use crate::fragment::Fragment;
use crate::types::Journal;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateRequest {
    /// Journal under replication. Set on the first request only.
    pub journal: Option<Journal>,
    /// Header of the primary's resolution. Set with `journal`.
    pub header: Option<Header>,
    /// Route under which the primary is replicating. Set with `journal`.
    pub route: Option<Route>,
    /// Fragment proposal: the peer commits, rolls, or rejects it.
    pub proposal: Option<Fragment>,
    /// Content chunk to spool.
    #[serde(with = "serde_bytes_compat")]
    pub content: Bytes,
    /// Byte offset of `content` within the current append, validated
    /// against the peer's spooled delta.
    pub content_delta: i64,
    /// Whether the peer must respond to this request.
    pub acknowledge: bool,
}

impl ReplicateRequest {
    /// Returns an error if the request is not well-formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(journal) = &self.journal {
            // Initial synchronization request.
            journal.validate()?;
            match &self.route {
                None => return Err(Error::Validation("expected Route with Journal".to_string())),
                Some(r) => r.validate()?,
            }
            match &self.header {
                None => {
                    return Err(Error::Validation(
                        "expected Header with Journal".to_string(),
                    ))
                }
                Some(h) => h.validate()?,
            }
            let proposal = self
                .proposal
                .as_ref()
                .ok_or_else(|| Error::Validation("expected Proposal with Journal".to_string()))?;
            proposal.validate()?;
            if proposal.journal != *journal {
                return Err(Error::Validation(format!(
                    "Journal and Proposal.journal mismatch ({} vs {})",
                    journal, proposal.journal
                )));
            }
            if !self.content.is_empty() {
                return Err(Error::Validation(format!(
                    "unexpected Content with Journal (len {})",
                    self.content.len()
                )));
            }
            if self.content_delta != 0 {
                return Err(Error::Validation(format!(
                    "unexpected ContentDelta with Journal ({})",
                    self.content_delta
                )));
            }
            if !self.acknowledge {
                return Err(Error::Validation(
                    "expected Acknowledge with Journal".to_string(),
                ));
            }
            return Ok(());
        }

        if let Some(r) = &self.route {
            return Err(Error::Validation(format!(
                "unexpected Route without Journal ({:?})",
                r.members
            )));
        }
        if let Some(h) = &self.header {
            return Err(Error::Validation(format!(
                "unexpected Header without Journal (revision {})",
                h.revision
            )));
        }

        if let Some(proposal) = &self.proposal {
            proposal.validate()?;
            if !self.content.is_empty() {
                return Err(Error::Validation(format!(
                    "unexpected Content with Proposal (len {})",
                    self.content.len()
                )));
            }
            if self.content_delta != 0 {
                return Err(Error::Validation(format!(
                    "unexpected ContentDelta with Proposal ({})",
                    self.content_delta
                )));
            }
            return Ok(());
        }

        if self.content.is_empty() {
            return Err(Error::Validation(
                "expected Content or Proposal".to_string(),
            ));
        }
        if self.acknowledge {
            return Err(Error::Validation(
                "unexpected Acknowledge with Content".to_string(),
            ));
        }
        if self.content_delta < 0 {
            return Err(Error::Validation(format!(
                "invalid ContentDelta ({}; expected >= 0)",
                self.content_delta
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicateResponse {
    pub status: Status,
    /// Header of the peer's resolution. Set only on `WrongRoute`.
    pub header: Option<Header>,
    /// The peer's route. Set only on `WrongRoute`.
    pub route: Option<Route>,
    /// The peer's current fragment. Set only on `FragmentMismatch`.
    pub fragment: Option<Fragment>,
}

impl ReplicateResponse {
    pub fn ok() -> ReplicateResponse {
        ReplicateResponse::default()
    }

    /// Returns an error if the response is not well-formed.
    pub fn validate(&self) -> Result<()> {
        validate_status_route(self.status, self.route.as_ref())?;

        if self.status == Status::FragmentMismatch {
            match &self.fragment {
                None => return Err(Error::Validation("expected Fragment".to_string())),
                Some(f) => f.validate()?,
            }
        } else if let Some(f) = &self.fragment {
            return Err(Error::Validation(format!(
                "unexpected Fragment ({})",
                f.content_name()
            )));
        }
        Ok(())
    }
}
