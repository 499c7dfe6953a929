//! Fragments: immutable, content-addressed byte ranges of a journal.
//!
//! A fragment covers the half-open range `[begin, end)` of its journal and
//! carries the SHA-1 digest of exactly those bytes. Once a replica has
//! committed content past a byte offset, every fragment covering that
//! offset is immutable.

mod index;
mod persister;
mod spool;
mod store;

pub use index::{FragmentIndex, IndexedFragment};
pub use persister::Persister;
pub use spool::{ProposalOutcome, Spool};
pub use store::{FragmentStore, FsStore, MemoryStore, StoreRegistry};

use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::constants::SUM_LENGTH;
use crate::error::{Error, Result};
use crate::types::Journal;

/// SHA-1 digest of a fragment's content.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Sum(pub [u8; SUM_LENGTH]);

impl Sum {
    /// The zero digest, used by empty fragments.
    pub const ZERO: Sum = Sum([0; SUM_LENGTH]);

    /// Digest of a complete byte slice.
    pub fn of(content: &[u8]) -> Sum {
        let mut h = Sha1::new();
        h.update(content);
        Sum::from_digest(h)
    }

    /// Finalize a running digest into a Sum.
    pub fn from_digest(digest: Sha1) -> Sum {
        let out = digest.finalize();
        let mut sum = [0u8; SUM_LENGTH];
        sum.copy_from_slice(&out);
        Sum(sum)
    }

    pub fn is_zero(&self) -> bool {
        *self == Sum::ZERO
    }

    /// Lowercase hex rendering, as used in fragment content names.
    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(SUM_LENGTH * 2);
        for b in self.0 {
            s.push_str(&format!("{b:02x}"));
        }
        s
    }
}

impl fmt::Debug for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Sum({})", self.to_hex())
    }
}

impl fmt::Display for Sum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Compression applied to a fragment when persisted to its backing store.
/// The open spool is always uncompressed; codecs apply at persist time.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompressionCodec {
    #[default]
    None,
    Gzip,
    Zstandard,
}

/// An immutable, contiguous byte range of a journal with a content digest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub journal: Journal,
    /// Inclusive first byte offset.
    pub begin: i64,
    /// Exclusive last byte offset.
    pub end: i64,
    /// SHA-1 over journal bytes `[begin, end)`.
    pub sum: Sum,
    pub compression_codec: CompressionCodec,
    /// URL of the store this fragment is (or will be) persisted to.
    /// Empty for fragments not yet associated with a store.
    pub backing_store: String,
}

impl Fragment {
    /// An empty fragment at offset zero of the journal.
    pub fn zero(journal: Journal) -> Fragment {
        Fragment {
            journal,
            begin: 0,
            end: 0,
            sum: Sum::ZERO,
            compression_codec: CompressionCodec::None,
            backing_store: String::new(),
        }
    }

    #[inline]
    pub fn content_length(&self) -> i64 {
        self.end - self.begin
    }

    /// Content-addressed name of the fragment within its journal's prefix:
    /// `<begin>-<end>-<sha1hex>`, offsets in fixed-width hex so names sort
    /// in offset order.
    pub fn content_name(&self) -> String {
        format!("{:016x}-{:016x}-{}", self.begin, self.end, self.sum.to_hex())
    }

    /// Store path of the persisted fragment: `<journal>/<content_name>`.
    pub fn content_path(&self) -> String {
        format!("{}/{}", self.journal, self.content_name())
    }

    /// Returns an error if the fragment is not well-formed.
    pub fn validate(&self) -> Result<()> {
        self.journal.validate()?;
        if self.begin < 0 || self.end < self.begin {
            return Err(Error::Validation(format!(
                "invalid fragment range [{}, {})",
                self.begin, self.end
            )));
        }
        if self.content_length() == 0 && !self.sum.is_zero() {
            return Err(Error::Validation(
                "empty fragment must have zero sum".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sum_of_known_content() {
        // SHA-1("foobarbazbing").
        assert_eq!(
            Sum::of(b"foobarbazbing").to_hex(),
            "f999ff70ca73dab4ff4f05342d26e44746ce56f6"
        );
        assert_eq!(Sum::of(b""), {
            let h = Sha1::new();
            Sum::from_digest(h)
        });
    }

    #[test]
    fn sum_zero_and_display() {
        assert!(Sum::ZERO.is_zero());
        assert!(!Sum::of(b"x").is_zero());
        assert_eq!(Sum::ZERO.to_hex().len(), SUM_LENGTH * 2);
    }

    #[test]
    fn fragment_content_name_sorts_by_offset() {
        let mut a = Fragment::zero(Journal::from("a/journal"));
        a.end = 0x100;
        a.sum = Sum::of(b"aaa");

        let mut b = Fragment::zero(Journal::from("a/journal"));
        b.begin = 0x100;
        b.end = 0x200;
        b.sum = Sum::of(b"bbb");

        assert!(a.content_name() < b.content_name());
        assert!(b.content_path().starts_with("a/journal/"));
    }

    #[test]
    fn fragment_validation() {
        let journal = Journal::from("j");

        let frag = Fragment::zero(journal.clone());
        assert!(frag.validate().is_ok());

        let mut frag = Fragment::zero(journal.clone());
        frag.begin = 10;
        frag.end = 5;
        assert!(frag.validate().is_err());

        let mut frag = Fragment::zero(journal.clone());
        frag.sum = Sum::of(b"non-empty sum on empty range");
        assert!(frag.validate().is_err());

        let mut frag = Fragment::zero(journal);
        frag.end = 3;
        frag.sum = Sum::of(b"abc");
        assert!(frag.validate().is_ok());
    }
}
