//! List RPC messages.
//!
//! List enumerates journals and their routes from the broker's observed
//! keyspace. It sits outside the replication critical path.

use serde::{Deserialize, Serialize};

use super::{Header, Route};
use crate::error::{Result, Status};
use crate::types::Journal;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListRequest {
    /// Restrict results to journals with this name prefix. Empty lists all.
    pub prefix: String,
}

impl ListRequest {
    pub fn validate(&self) -> Result<()> {
        // Any prefix (including empty) is permitted.
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListedJournal {
    pub journal: Journal,
    pub replication: u32,
    pub route: Route,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub status: Status,
    pub header: Header,
    pub journals: Vec<ListedJournal>,
}

impl ListResponse {
    pub fn validate(&self) -> Result<()> {
        self.status.validate()?;
        self.header.validate()?;
        for j in &self.journals {
            j.journal.validate()?;
            j.route.validate()?;
        }
        Ok(())
    }
}
