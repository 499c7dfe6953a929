//! Append RPC messages.
//!
//! An Append is a client-streamed RPC: the first request names the journal
//! and carries no content; every following request carries content only.
//! The single response reports the committed fragment covering exactly the
//! appended bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::{Header, Route};
use crate::constants::MAX_APPEND_CHUNK;
use crate::error::{Error, Result, Status};
use crate::fragment::Fragment;
use crate::types::Journal;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendRequest {
    /// Header of a prior resolution, set when the request is proxied
    /// from another broker.
    pub header: Option<Header>,
    /// Journal to append to. Set on the first request only.
    pub journal: Option<Journal>,
    /// Content chunk. Set on every request but the first.
    #[serde(with = "serde_bytes_compat")]
    pub content: Bytes,
}

impl AppendRequest {
    /// Open an Append stream to `journal`.
    pub fn open(journal: Journal) -> AppendRequest {
        AppendRequest {
            header: None,
            journal: Some(journal),
            ..Default::default()
        }
    }

    /// A content chunk of an open Append stream.
    pub fn chunk(content: impl Into<Bytes>) -> AppendRequest {
        AppendRequest {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Returns an error if the request is not well-formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(h) = &self.header {
            h.validate()?;
        }
        match &self.journal {
            Some(journal) => {
                journal.validate()?;
                if !self.content.is_empty() {
                    return Err(Error::Validation("unexpected Content".to_string()));
                }
            }
            None => {
                if self.content.is_empty() {
                    return Err(Error::Validation("expected Content".to_string()));
                } else if self.content.len() > MAX_APPEND_CHUNK {
                    return Err(Error::Validation(format!(
                        "Content too large ({} bytes; max {})",
                        self.content.len(),
                        MAX_APPEND_CHUNK
                    )));
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub status: Status,
    /// Header under which the append was resolved.
    pub header: Header,
    /// The route the serving broker observed for the journal.
    pub route: Route,
    /// The fragment covering exactly the appended content. Set iff the
    /// status is Ok.
    pub commit: Option<Fragment>,
}

impl AppendResponse {
    /// Returns an error if the response is not well-formed.
    pub fn validate(&self) -> Result<()> {
        self.status.validate()?;
        self.header.validate()?;
        self.route.validate()?;
        match (&self.commit, self.status) {
            (Some(commit), Status::Ok) => commit.validate(),
            (None, Status::Ok) => Err(Error::Validation("expected Commit".to_string())),
            (Some(_), _) => Err(Error::Validation("unexpected Commit".to_string())),
            (None, _) => Ok(()),
        }
    }
}

/// Bytes <-> serde bridge so message fixtures round-trip through JSON in
/// tests without a custom codec.
pub(crate) mod serde_bytes_compat {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(b: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(b)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let v = Vec::<u8>::deserialize(d)?;
        Ok(Bytes::from(v))
    }
}
