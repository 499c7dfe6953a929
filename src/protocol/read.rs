//! Read RPC messages.
//!
//! A Read is server-streamed: the broker first sends a metadata response
//! describing the fragment which covers the requested offset, then streams
//! content chunks from it. Content-bearing responses carry content only;
//! metadata responses carry everything else.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::append::serde_bytes_compat;
use super::{Header, Route};
use crate::error::{Error, Result, Status};
use crate::fragment::Fragment;
use crate::types::Journal;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    /// Header of a prior resolution, set when the request is proxied.
    pub header: Option<Header>,
    pub journal: Journal,
    /// Byte offset to read from. -1 reads from the current write head.
    pub offset: i64,
    /// Block until content becomes available, rather than returning
    /// `OffsetNotYetAvailable`.
    pub block: bool,
    /// Fail with `NotJournalBroker` rather than proxying to an assigned
    /// broker.
    pub do_not_proxy: bool,
    /// Send only the metadata response, no content.
    pub metadata_only: bool,
}

impl ReadRequest {
    /// Returns an error if the request is not well-formed.
    pub fn validate(&self) -> Result<()> {
        if let Some(h) = &self.header {
            h.validate()?;
        }
        self.journal.validate()?;
        if self.offset < -1 {
            return Err(Error::Validation(format!(
                "invalid Offset ({}; expected -1 <= Offset <= MaxInt64)",
                self.offset
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadResponse {
    pub status: Status,
    /// Header under which the read was resolved. Metadata responses only.
    pub header: Option<Header>,
    /// Offset this metadata response speaks to.
    pub offset: i64,
    /// Journal write head: the next offset to be written.
    pub write_head: i64,
    /// Route observed for the journal. Metadata responses only.
    pub route: Option<Route>,
    /// Fragment covering `offset`. Metadata responses only.
    pub fragment: Option<Fragment>,
    /// Pre-signed URL from which the fragment may be fetched directly.
    pub fragment_url: String,
    /// Content chunk. Content responses only.
    #[serde(with = "serde_bytes_compat")]
    pub content: Bytes,
}

impl ReadResponse {
    /// A content-bearing response.
    pub fn chunk(content: impl Into<Bytes>) -> ReadResponse {
        ReadResponse {
            content: content.into(),
            ..Default::default()
        }
    }

    /// Returns an error if the response is not well-formed.
    pub fn validate(&self) -> Result<()> {
        self.status.validate()?;

        if !self.content.is_empty() {
            // Content responses must carry no other fields.
            if self.status != Status::Ok {
                return Err(Error::Validation(format!(
                    "unexpected Status with Content ({})",
                    self.status
                )));
            } else if self.offset != 0 || self.write_head != 0 {
                return Err(Error::Validation(
                    "unexpected Offset or WriteHead with Content".to_string(),
                ));
            } else if self.route.is_some() || self.fragment.is_some() {
                return Err(Error::Validation(
                    "unexpected Route or Fragment with Content".to_string(),
                ));
            } else if !self.fragment_url.is_empty() {
                return Err(Error::Validation(format!(
                    "unexpected FragmentUrl with Content ({})",
                    self.fragment_url
                )));
            }
            return Ok(());
        }

        if let Some(r) = &self.route {
            r.validate()?;
        }
        if self.write_head < 0 {
            return Err(Error::Validation(format!(
                "invalid WriteHead ({}; expected >= 0)",
                self.write_head
            )));
        }

        match &self.fragment {
            Some(fragment) => {
                fragment.validate()?;
                if self.offset < fragment.begin || self.offset >= fragment.end {
                    return Err(Error::Validation(format!(
                        "invalid Offset ({}; expected {} <= offset < {})",
                        self.offset, fragment.begin, fragment.end
                    )));
                }
                if self.write_head < fragment.end {
                    return Err(Error::Validation(format!(
                        "invalid WriteHead ({}; expected >= {})",
                        self.write_head, fragment.end
                    )));
                }
            }
            None => {
                if self.offset != 0 {
                    return Err(Error::Validation(format!(
                        "unexpected Offset without Fragment ({})",
                        self.offset
                    )));
                }
                if !self.fragment_url.is_empty() {
                    return Err(Error::Validation(format!(
                        "unexpected FragmentUrl without Fragment ({})",
                        self.fragment_url
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::Sum;

    #[test]
    fn request_offsets() {
        let mut req = ReadRequest {
            journal: Journal::from("a/journal"),
            offset: -1,
            ..Default::default()
        };
        assert!(req.validate().is_ok());
        req.offset = 0;
        assert!(req.validate().is_ok());
        req.offset = -2;
        assert!(req.validate().is_err());
    }

    #[test]
    fn content_response_is_exclusive() {
        assert!(ReadResponse::chunk(&b"data"[..]).validate().is_ok());

        let mut resp = ReadResponse::chunk(&b"data"[..]);
        resp.write_head = 10;
        assert!(resp.validate().is_err());

        let mut resp = ReadResponse::chunk(&b"data"[..]);
        resp.status = Status::OffsetNotYetAvailable;
        assert!(resp.validate().is_err());

        let mut resp = ReadResponse::chunk(&b"data"[..]);
        resp.fragment_url = "file:///x".to_string();
        assert!(resp.validate().is_err());
    }

    #[test]
    fn metadata_response_offset_window() {
        let mut fragment = Fragment::zero(Journal::from("a/journal"));
        fragment.begin = 100;
        fragment.end = 200;
        fragment.sum = Sum::of(b"whatever");

        let mut resp = ReadResponse {
            offset: 150,
            write_head: 200,
            fragment: Some(fragment),
            ..Default::default()
        };
        assert!(resp.validate().is_ok());

        resp.offset = 200; // past fragment end
        assert!(resp.validate().is_err());

        resp.offset = 99; // before fragment begin
        assert!(resp.validate().is_err());

        resp.offset = 150;
        resp.write_head = 199; // behind fragment end
        assert!(resp.validate().is_err());
    }

    #[test]
    fn metadata_response_without_fragment() {
        // Offset must be zero iff no fragment is present.
        let resp = ReadResponse {
            status: Status::OffsetNotYetAvailable,
            write_head: 10,
            ..Default::default()
        };
        assert!(resp.validate().is_ok());

        let resp = ReadResponse {
            offset: 5,
            ..Default::default()
        };
        assert!(resp.validate().is_err());

        let resp = ReadResponse {
            fragment_url: "file:///x".to_string(),
            ..Default::default()
        };
        assert!(resp.validate().is_err());
    }
}
